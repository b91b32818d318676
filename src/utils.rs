pub struct Utils;

impl Utils {
    pub fn round(value: f64, precision: i32) -> f64 {
        let factor = 10f64.powi(precision);
        (value * factor).round() / factor
    }

    // fixed-point register value scaled as `raw * numerator / 32768`
    pub fn scale(raw: u32, numerator: f64) -> f64 {
        raw as f64 * numerator / 32768.0
    }

    pub fn be_u16ify(array: &[u8], offset: usize) -> Option<u16> {
        let bytes = array.get(offset..offset.checked_add(2)?)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
