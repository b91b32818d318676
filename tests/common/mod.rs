#![allow(dead_code)]

pub use envertech_bridge::envertech::frame::FrameFactory;
pub use std::time::Duration;

use envertech_bridge::prelude::*;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;
impl Factory {
    pub const SERIAL: &'static str = "1a2b3c4d";

    pub fn identity(port: u16) -> DeviceIdentity {
        DeviceIdentity::new("127.0.0.1", port, Self::SERIAL)
    }

    // short enough that tests do not crawl
    pub fn settings() -> DeviceSettings {
        DeviceSettings {
            read_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            ..DeviceSettings::default()
        }
    }

    pub fn challenge() -> Vec<u8> {
        FrameFactory::build(0x1001, &[0u8; 24])
    }

    pub fn handshake_reply() -> Vec<u8> {
        let mut r = vec![0x68, 0x00, 0x20, 0x68, 0x10, 0x77, 0x1a, 0x2b, 0x3c, 0x4d];
        r.extend_from_slice(&[0u8; 20]);
        r.extend_from_slice(&[0x9a, 0x16]);
        r
    }

    /// One 32 byte module block: serial, input voltage, power, energy,
    /// temperature, grid voltage and frequency as raw register values.
    pub fn module_block(sn: u32, raw: [u16; 4], energy: u32, frequency: u16) -> Vec<u8> {
        let mut r = sn.to_be_bytes().to_vec();
        r.extend_from_slice(&[0, 0]);
        r.extend_from_slice(&raw[0].to_be_bytes());
        r.extend_from_slice(&raw[1].to_be_bytes());
        r.extend_from_slice(&energy.to_be_bytes());
        r.extend_from_slice(&raw[2].to_be_bytes());
        r.extend_from_slice(&raw[3].to_be_bytes());
        r.extend_from_slice(&frequency.to_be_bytes());
        r.resize(32, 0);
        r
    }

    /// 32 V in, 32 W, 10 kWh, 24 °C, 240 V grid, 50 Hz
    pub fn typical_module(sn: u32) -> Vec<u8> {
        Self::module_block(sn, [16384, 2048, 8192, 15360], 81920, 12800)
    }

    /// A data frame carrying `blocks`, firmware 1.2 at the default offsets.
    pub fn data_frame(blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut body = vec![0u8; 14];
        body[4] = 1;
        body[6] = 2;
        for block in blocks {
            body.extend_from_slice(block);
        }
        FrameFactory::build(ControlCode::Data.into(), &body)
    }
}
