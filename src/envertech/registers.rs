use crate::prelude::*;

use nom_derive::{Nom, Parse};
use serde::Serialize;

/// Offset of module 0's register block within a data frame.
pub const FIRST_MODULE_OFFSET: usize = 20;
pub const MODULE_STRIDE: usize = 32;
/// Bytes of a module block that carry registers; the rest is padding.
pub const MODULE_REGISTER_LEN: usize = 20;

// header and trailer bytes of a data frame that never belong to a module
const DATA_FRAME_OVERHEAD: usize = 22;

// ModuleRegisters {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
struct ModuleRegisters {
    sn: u32,
    #[nom(SkipBefore(2))] // unknown, always seen as zero
    input_voltage: u16,
    power: u16,
    energy: u32,
    temperature: u16,
    grid_voltage: u16,
    frequency: u16,
}
// }}}

// ModuleReading {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModuleReading {
    pub mi_sn: String,
    pub input_voltage: f64, // V
    pub power: f64,         // W
    pub energy: f64,        // kWh, cumulative
    pub temperature: f64,   // °C
    pub grid_voltage: f64,  // V
    pub frequency: f64,     // Hz
}

impl From<ModuleRegisters> for ModuleReading {
    fn from(r: ModuleRegisters) -> Self {
        let value = |raw: u32, numerator: f64| Utils::round(Utils::scale(raw, numerator), 2);

        Self {
            mi_sn: format!("{:08x}", r.sn),
            input_voltage: value(r.input_voltage.into(), 64.0),
            power: value(r.power.into(), 512.0),
            energy: value(r.energy, 4.0),
            temperature: Utils::round(Utils::scale(r.temperature.into(), 256.0) - 40.0, 2),
            grid_voltage: value(r.grid_voltage.into(), 512.0),
            frequency: value(r.frequency.into(), 128.0),
        }
    }
} // }}}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("module block at offset {offset} needs {needed} bytes, frame has {available}")]
pub struct OutOfRange {
    pub offset: usize,
    pub needed: usize,
    pub available: usize,
}

pub fn decode_module(data: &[u8], base_offset: usize) -> Result<ModuleReading, OutOfRange> {
    let out_of_range = OutOfRange {
        offset: base_offset,
        needed: MODULE_REGISTER_LEN,
        available: data.len(),
    };

    let end = base_offset
        .checked_add(MODULE_REGISTER_LEN)
        .filter(|end| *end <= data.len())
        .ok_or(out_of_range)?;

    let (_, registers) = ModuleRegisters::parse(&data[base_offset..end]).map_err(|_| out_of_range)?;

    Ok(registers.into())
}

pub fn module_count(frame_length: usize) -> usize {
    frame_length.saturating_sub(DATA_FRAME_OVERHEAD) / MODULE_STRIDE
}

pub fn module_offset(index: usize) -> usize {
    FIRST_MODULE_OFFSET + MODULE_STRIDE * index
}

// FirmwareLayout {{{
/// Where a data frame keeps its two firmware version bytes. Units in the
/// field disagree on this, so it is configurable per device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FirmwareLayout {
    pub major: usize,
    pub minor: usize,
}

impl Default for FirmwareLayout {
    fn default() -> Self {
        Self { major: 10, minor: 12 }
    }
}

impl From<[usize; 2]> for FirmwareLayout {
    fn from(offsets: [usize; 2]) -> Self {
        Self {
            major: offsets[0],
            minor: offsets[1],
        }
    }
}

impl FirmwareLayout {
    pub fn version(&self, data: &[u8]) -> Option<String> {
        let major = data.get(self.major)?;
        let minor = data.get(self.minor)?;
        Some(format!("{}.{}", major, minor))
    }
} // }}}
