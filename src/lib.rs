pub mod config; // Configuration and the device registry
pub mod discovery; // UDP discovery of devices on the local network
pub mod envertech; // Envertech wire protocol and per-device clients
pub mod options; // Command line options parsing
pub mod prelude; // Common imports and types
pub mod snapshot; // Aggregated per-device readings
pub mod utils; // Utility functions

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use log::LevelFilter;
use std::time::Duration;

/// Installs the process-wide logger. Everything is let through to the
/// formatter; `set_loglevel` decides what actually gets emitted.
pub fn init_logging() {
    if let Err(e) = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
    {
        eprintln!("Failed to initialise logging: {}", e);
    }

    log::set_max_level(LevelFilter::Info);
}

pub fn set_loglevel(level: &str) {
    match LevelFilter::from_str(level) {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("Unknown log level {}, keeping {}", level, log::max_level()),
    }
}

/// Running device clients, keyed by registry name.
#[derive(Clone, Default)]
pub struct Components {
    pub clients: Vec<(String, DeviceClient)>,
}

impl Components {
    pub fn new(config: &ConfigWrapper) -> Self {
        let clients = config
            .enabled_devices()
            .iter()
            .map(|device| {
                let name = device.name().to_string();
                let client = DeviceClient::new(device.identity(), device.settings(), {
                    let name = name.clone();
                    move |snapshot: &Snapshot| log_snapshot(&name, snapshot)
                });
                (name, client)
            })
            .collect();

        Self { clients }
    }

    pub fn start(&self) -> Result<()> {
        for (name, client) in &self.clients {
            info!("  Starting device {} ({})...", name, client.identity());
            client.start()?;
        }
        Ok(())
    }

    pub fn client(&self, name: &str) -> Option<&DeviceClient> {
        self.clients.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Stops every client and waits for their supervisors to exit.
    pub async fn stop(&self) {
        info!("Stopping all components...");

        for (_, client) in &self.clients {
            client.stop();
        }
        futures::future::join_all(self.clients.iter().map(|(_, client)| client.join())).await;

        info!("Shutdown complete");
    }
}

fn log_snapshot(name: &str, snapshot: &Snapshot) {
    info!(
        "{}: {} modules, firmware {}, power {:?} W, energy {:?} kWh",
        name,
        snapshot.module_count(),
        snapshot.firmware_version.as_deref().unwrap_or("unknown"),
        snapshot.totals.total_power,
        snapshot.totals.total_energy
    );

    match serde_json::to_string(snapshot) {
        Ok(json) => debug!("{}: {}", name, json),
        Err(e) => warn!("{}: failed to serialize snapshot: {}", name, e),
    }
}

/// Main application loop: one client per enabled device until shutdown.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: ConfigWrapper) -> Result<()> {
    info!("Initializing components...");
    let components = Components::new(&config);
    if components.clients.is_empty() {
        warn!("No enabled devices configured");
    }
    components.start()?;

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    info!("Shutdown signal received, stopping components...");
    components.stop().await;

    info!("Application shutdown complete");
    Ok(())
}

pub async fn discover(config: &ConfigWrapper) -> Result<()> {
    let devices = discovery::discover(&config.discovery()).await?;

    for device in devices {
        if config.device_with_serial(&device.serial).is_some() {
            info!("{} is already configured", device.serial);
        }
        println!("{}", serde_json::to_string(&device)?);
    }

    Ok(())
}

/// Application entry point
pub async fn run(options: Options) -> Result<()> {
    init_logging();

    info!("envertech-bridge {} starting with config file {}", CARGO_PKG_VERSION, options.config_file);

    let config = ConfigWrapper::new(options.config_file.clone())?;
    set_loglevel(&config.loglevel());

    if options.discover {
        return discover(&config).await;
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Set up signal handlers for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        let _ = shutdown_tx_clone.send(());
    });

    if let Some(runtime) = options.runtime {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(runtime)).await;
            info!("Runtime limit of {}s reached", runtime);
            let _ = shutdown_tx_clone.send(());
        });
    }

    app(shutdown_rx, config).await
}
