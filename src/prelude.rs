pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, watch};

pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::envertech::{
    self,
    frame::{ControlCode, Frame, FrameError, ParsedFrame},
    inverter::{DeviceClient, DeviceIdentity, DeviceSettings, Serial},
    registers::{FirmwareLayout, ModuleReading},
};
pub use crate::options::Options;
pub use crate::snapshot::{Snapshot, SnapshotAggregator, Totals};
pub use crate::utils::Utils;
