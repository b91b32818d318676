use crate::prelude::*;
use crate::envertech::inverter::DEFAULT_PORT;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use serde_yaml;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Vec::new")]
    pub devices: Vec<Device>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default)]
    pub discovery: Discovery,
}

// Device {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    pub name: Option<String>,

    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,
    pub serial: String,

    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub read_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub reconnect_delay: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub connect_timeout: Option<Duration>,

    pub use_tcp_nodelay: Option<bool>,
    pub strict_frame_check: Option<bool>,
    pub firmware_offsets: Option<[usize; 2]>,
}
impl Device {
    /// Registry key; falls back to the serial when no name is configured.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.host.clone(), self.port, self.serial.clone())
    }

    pub fn settings(&self) -> DeviceSettings {
        let defaults = DeviceSettings::default();

        DeviceSettings {
            read_timeout: self.read_timeout.unwrap_or(defaults.read_timeout),
            reconnect_delay: self.reconnect_delay.unwrap_or(defaults.reconnect_delay),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            use_tcp_nodelay: self.use_tcp_nodelay.unwrap_or(defaults.use_tcp_nodelay),
            strict_frame_check: self.strict_frame_check.unwrap_or(defaults.strict_frame_check),
            firmware: self.firmware_offsets.map(FirmwareLayout::from).unwrap_or(defaults.firmware),
            ..defaults
        }
    }
} // }}}

// Discovery {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Discovery {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_discovery_timeout")]
    pub timeout: Duration,

    #[serde(default = "Config::default_broadcast_address")]
    pub broadcast_address: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            timeout: Config::default_discovery_timeout(),
            broadcast_address: Config::default_broadcast_address(),
        }
    }
}

impl Discovery {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn broadcast_address(&self) -> &str {
        &self.broadcast_address
    }
} // }}}

/// The device registry. Owned by the application and handed to whoever
/// needs it; there is no global instance.
#[derive(Clone)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn config(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.config().devices.clone()
    }

    pub fn enabled_devices(&self) -> Vec<Device> {
        self.devices().into_iter().filter(|d| d.enabled()).collect()
    }

    pub fn device_with_name(&self, name: &str) -> Option<Device> {
        self.devices().into_iter().find(|d| d.name() == name)
    }

    pub fn device_with_serial(&self, serial: &str) -> Option<Device> {
        self.devices()
            .into_iter()
            .find(|d| d.serial().eq_ignore_ascii_case(serial))
    }

    /// Adds a device, e.g. one found by discovery. Names stay unique.
    pub fn add_device(&self, device: Device) -> Result<()> {
        let mut config = self.config();

        if config.devices.iter().any(|d| d.name() == device.name()) {
            bail!("device {} already configured", device.name());
        }
        Config::validate_device(config.devices.len(), &device)?;

        info!("Adding device {} at {}:{}", device.name(), device.host(), device.port());
        config.devices.push(device);
        Ok(())
    }

    pub fn remove_device(&self, name: &str) -> Option<Device> {
        let mut config = self.config();
        let index = config.devices.iter().position(|d| d.name() == name)?;
        Some(config.devices.remove(index))
    }

    pub fn loglevel(&self) -> String {
        self.config().loglevel.clone()
    }

    pub fn discovery(&self) -> Discovery {
        self.config().discovery.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;

        info!("Configuration loaded successfully:");
        info!(
            "  Devices: {} configured, {} enabled",
            config.devices.len(),
            config.devices.iter().filter(|d| d.enabled).count()
        );
        for (i, device) in config.devices.iter().enumerate() {
            let settings = device.settings();
            info!("    Device[{}]: {}", i, device.name());
            info!("      Enabled: {}", device.enabled);
            info!("      Host: {}", device.host);
            info!("      Port: {}", device.port);
            info!("      Serial: {}", device.serial);
            info!("      Read Timeout: {}s", settings.read_timeout.as_secs());
            info!("      Reconnect Delay: {}s", settings.reconnect_delay.as_secs());
            info!("      TCP NoDelay: {}", settings.use_tcp_nodelay);
            info!("      Strict Frame Check: {}", settings.strict_frame_check);
        }
        info!("  Discovery Timeout: {}s", config.discovery.timeout.as_secs());
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for (i, device) in self.devices.iter().enumerate() {
            Self::validate_device(i, device)?;

            if !names.insert(device.name()) {
                bail!("device[{}]: duplicate name {}", i, device.name());
            }
        }

        if self.discovery.timeout.is_zero() {
            bail!("discovery.timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_device(i: usize, device: &Device) -> Result<()> {
        if device.host.is_empty() {
            bail!("device[{}].host cannot be empty", i);
        }
        if device.port == 0 {
            bail!("device[{}].port must be between 1 and 65535", i);
        }
        if let Err(e) = Serial::from_str(&device.serial) {
            bail!("device[{}]: {}", i, e);
        }

        let settings = device.settings();
        for (key, value) in [
            ("read_timeout", settings.read_timeout),
            ("reconnect_delay", settings.reconnect_delay),
            ("connect_timeout", settings.connect_timeout),
        ] {
            if value.is_zero() {
                bail!("device[{}].{} must be greater than 0", i, key);
            }
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_discovery_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_broadcast_address() -> String {
        "255.255.255.255".to_string()
    }
}
