use crate::prelude::*;
use crate::envertech::session::{CloseCause, ConnectionSession};

use {
    serde::{Serialize, Serializer},
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::task::JoinHandle,
};

pub const DEFAULT_PORT: u16 = 14889;

const READ_TIMEOUT_SECS: u64 = 300; // a silent inverter is a dead inverter
const RECONNECT_DELAY_SECS: u64 = 10; // Delay before reconnection attempts
const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60; // TCP keepalive interval

pub type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

// Serial {{{
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("serial {0:?} must be exactly 8 hex characters")]
pub struct MalformedSerial(pub String);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Serial([u8; 4]);

impl Serial {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<[u8; 4]> for Serial {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl std::str::FromStr for Serial {
    type Err = MalformedSerial;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MalformedSerial(s.to_string()));
        }

        let mut r = [0u8; 4];
        for (i, byte) in r.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MalformedSerial(s.to_string()))?;
        }
        Ok(Self(r))
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Utils::hex(&self.0))
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Utils::hex(&self.0))
    }
}

impl Serialize for Serial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}

// DeviceIdentity {{{
/// Which device a client talks to. The serial is sent back verbatim in the
/// handshake reply, so it is kept as configured and only checked there.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceIdentity {
    pub host: String,
    pub port: u16,
    pub serial_hex: String,
}

impl DeviceIdentity {
    pub fn new(host: impl Into<String>, port: u16, serial_hex: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            serial_hex: serial_hex.into(),
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.serial_hex, self.host, self.port)
    }
} // }}}

// DeviceSettings {{{
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub use_tcp_nodelay: bool,
    pub strict_frame_check: bool,
    pub firmware: FirmwareLayout,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            tcp_keepalive: Duration::from_secs(TCP_KEEPALIVE_SECS),
            use_tcp_nodelay: true,
            strict_frame_check: true,
            firmware: FirmwareLayout::default(),
        }
    }
} // }}}

/// Supervises one device: keeps a session running, reconnecting after a
/// fixed delay, and owns the device's snapshot for its whole lifetime.
#[derive(Clone)]
pub struct DeviceClient {
    identity: Arc<DeviceIdentity>,
    settings: DeviceSettings,
    aggregator: SnapshotAggregator,
    on_snapshot_changed: SnapshotCallback,
    stop_tx: Arc<watch::Sender<bool>>,
    connected: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DeviceClient {
    pub fn new<F>(identity: DeviceIdentity, settings: DeviceSettings, on_snapshot_changed: F) -> Self
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let (stop_tx, _) = watch::channel(false);

        Self {
            identity: Arc::new(identity),
            aggregator: SnapshotAggregator::new(settings.firmware),
            settings,
            on_snapshot_changed: Arc::new(on_snapshot_changed),
            stop_tx: Arc::new(stop_tx),
            connected: Arc::new(AtomicBool::new(false)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Spawns the supervisor loop onto the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| anyhow!("inverter {}: handle lock poisoned", self.identity))?;

        if handle.is_some() {
            bail!("inverter {}: already started", self.identity);
        }

        let client = self.clone();
        *handle = Some(tokio::spawn(async move { client.run().await }));

        Ok(())
    }

    async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();

        while !*stop_rx.borrow() {
            let mut session = ConnectionSession::new(
                self.identity.clone(),
                self.settings.clone(),
                self.aggregator.clone(),
                self.on_snapshot_changed.clone(),
                stop_rx.clone(),
                self.connected.clone(),
            );

            match session.run().await {
                CloseCause::Stopped => break,
                cause => warn!("inverter {}: session closed: {}", self.identity, cause),
            }

            info!(
                "inverter {}: reconnecting in {}s",
                self.identity,
                self.settings.reconnect_delay.as_secs_f64()
            );

            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                _ = stop_rx.wait_for(|stop| *stop) => break,
            }
        }

        info!("inverter {}: supervisor exiting", self.identity);
    }

    /// Idempotent. The running session and any pending backoff end promptly.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("Stopping inverter {}...", self.identity);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Waits for the supervisor task spawned by `start()` to exit.
    pub async fn join(&self) {
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("inverter {}: supervisor task failed: {}", self.identity, e);
            }
        }
    }

    /// True while a session holds an open connection, whether or not it has
    /// streamed data yet.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.aggregator.is_ready()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.aggregator.wait_ready(timeout).await
    }

    pub fn current_snapshot(&self) -> Snapshot {
        self.aggregator.snapshot()
    }

    pub fn module_count(&self) -> usize {
        self.aggregator.module_count()
    }
}
