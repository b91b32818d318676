use crate::prelude::*;

use {
    serde::Serialize,
    std::net::IpAddr,
    std::time::Duration,
    tokio::net::UdpSocket,
    tokio::time::{timeout_at, Instant},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Probe {
    pub message: &'static str,
    pub port: u16,
}

/// Wired units answer on 48889, wifi sticks on 48899.
pub const PROBES: [Probe; 2] = [
    Probe {
        message: "LOCALCON-1508-READ",
        port: 48889,
    },
    Probe {
        message: "www.usr.cn",
        port: 48899,
    },
];

const MAX_REPLY_LEN: usize = 1024;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub mac: String,
    pub serial: String,
}

impl DiscoveredDevice {
    /// Replies look like `IP,MAC,SN`; anything else is not a device.
    pub fn parse(reply: &[u8]) -> Option<Self> {
        let reply = String::from_utf8_lossy(reply);
        let parts: Vec<&str> = reply.trim().split(',').map(str::trim).collect();

        match parts[..] {
            [ip, mac, serial] if !ip.is_empty() => Some(Self {
                ip: ip.to_string(),
                mac: mac.to_string(),
                serial: serial.to_string(),
            }),
            _ => None,
        }
    }

    /// A registry entry for this device with every optional setting left at
    /// its default.
    pub fn to_device(&self) -> config::Device {
        config::Device {
            name: None,
            enabled: true,
            host: self.ip.clone(),
            port: envertech::inverter::DEFAULT_PORT,
            serial: self.serial.clone(),
            read_timeout: None,
            reconnect_delay: None,
            connect_timeout: None,
            use_tcp_nodelay: None,
            strict_frame_check: None,
            firmware_offsets: None,
        }
    }
}

pub async fn discover(config: &config::Discovery) -> Result<Vec<DiscoveredDevice>> {
    let target: IpAddr = config
        .broadcast_address()
        .parse()
        .map_err(|err| anyhow!("invalid broadcast address {}: {}", config.broadcast_address(), err))?;

    discover_on(target, &PROBES, config.timeout()).await
}

/// Sends every probe to `target` and collects replies until `window` has
/// passed. Devices answering more than once are reported once, keyed by IP.
pub async fn discover_on(target: IpAddr, probes: &[Probe], window: Duration) -> Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    for probe in probes {
        info!("Sending broadcast message: {} to {}:{}", probe.message, target, probe.port);
        if let Err(e) = socket.send_to(probe.message.as_bytes(), (target, probe.port)).await {
            warn!("Failed to send discovery probe to {}:{}: {}", target, probe.port, e);
        }
    }

    let deadline = Instant::now() + window;
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = [0u8; MAX_REPLY_LEN];

    loop {
        let (len, addr) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!("Discovery receive error: {}", e);
                continue;
            }
            Err(_) => break,
        };

        debug!("Received data from {}: {:?}", addr, String::from_utf8_lossy(&buf[..len]));

        match DiscoveredDevice::parse(&buf[..len]) {
            Some(device) if devices.iter().any(|d| d.ip == device.ip) => {
                debug!("Ignoring repeated reply from {}", device.ip);
            }
            Some(device) => {
                info!("Discovered {} at {} ({})", device.serial, device.ip, device.mac);
                devices.push(device);
            }
            None => warn!("Ignoring malformed discovery reply from {}", addr),
        }
    }

    info!("Discovery finished, {} device(s) found", devices.len());

    Ok(devices)
}
