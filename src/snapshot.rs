use crate::prelude::*;
use crate::envertech::registers;

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    std::collections::BTreeMap,
    std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    std::time::Duration,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Totals {
    pub total_power: Option<f64>,  // W
    pub total_energy: Option<f64>, // kWh
}

/// Everything known about one device. Modules absent from the latest frame
/// keep their previous readings.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub firmware_version: Option<String>,
    pub modules: BTreeMap<usize, ModuleReading>,
    #[serde(flatten)]
    pub totals: Totals,
    pub ready: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Number of distinct module indices ever decoded.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module(&self, index: usize) -> Option<&ModuleReading> {
        self.modules.get(&index)
    }

    fn recompute_totals(&mut self) {
        if self.modules.is_empty() {
            self.totals = Totals::default();
            return;
        }

        let power = self.modules.values().map(|m| m.power).sum();
        let energy = self.modules.values().map(|m| m.energy).sum();

        self.totals = Totals {
            total_power: Some(Utils::round(power, 2)),
            total_energy: Some(Utils::round(energy, 2)),
        };
    }
}

#[derive(Clone)]
pub struct SnapshotAggregator {
    snapshot: Arc<RwLock<Snapshot>>,
    ready_tx: Arc<watch::Sender<bool>>,
    firmware: FirmwareLayout,
}

impl SnapshotAggregator {
    pub fn new(firmware: FirmwareLayout) -> Self {
        let (ready_tx, _) = watch::channel(false);

        Self {
            snapshot: Arc::new(RwLock::new(Snapshot::default())),
            ready_tx: Arc::new(ready_tx),
            firmware,
        }
    }

    // readers never see a half-applied frame, so a poisoned lock still holds
    // a consistent snapshot
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Merges one data frame. All modules are decoded before the snapshot is
    /// touched, so concurrent readers see either the old or the new state.
    pub fn apply_data_frame(&self, frame: &Frame) {
        let data = frame.data();
        let firmware_version = self.firmware.version(data);

        let count = registers::module_count(frame.len());
        let mut decoded = Vec::with_capacity(count);
        for index in 0..count {
            match registers::decode_module(data, registers::module_offset(index)) {
                Ok(reading) => decoded.push((index, reading)),
                Err(e) => debug!("module {} skipped: {}", index, e),
            }
        }

        trace!("firmware={:?} modules={:?}", firmware_version, decoded);

        {
            let mut snapshot = self.write();
            if firmware_version.is_some() {
                snapshot.firmware_version = firmware_version;
            }
            snapshot.modules.extend(decoded);
            snapshot.recompute_totals();
            snapshot.ready = true;
            snapshot.updated_at = Some(Utc::now());
        }

        self.ready_tx.send_replace(true);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.read().ready
    }

    pub fn module_count(&self) -> usize {
        self.read().module_count()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Resolves true as soon as the first data frame has been applied, false
    /// if that does not happen within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready_rx = self.subscribe_ready();

        let ready = matches!(
            tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envertech::frame::{try_parse_frame, FrameFactory};

    // module blocks with the given raw power registers, serials 1..=n
    fn data_frame(powers: &[u16]) -> Frame {
        let mut body = vec![0u8; 14];
        body[4] = 1; // firmware major at frame offset 10
        body[6] = 9; // firmware minor at frame offset 12
        for (i, power) in powers.iter().enumerate() {
            let mut block = vec![0u8; 32];
            block[0..4].copy_from_slice(&(i as u32 + 1).to_be_bytes());
            block[8..10].copy_from_slice(&power.to_be_bytes());
            block[10..14].copy_from_slice(&8192u32.to_be_bytes()); // 1 kWh
            body.extend(block);
        }

        match try_parse_frame(&FrameFactory::build(ControlCode::Data.into(), &body)) {
            ParsedFrame::Frame(frame) => frame,
            other => panic!("bad test frame: {:?}", other),
        }
    }

    #[test]
    fn starts_empty() {
        let aggregator = SnapshotAggregator::new(FirmwareLayout::default());
        let snapshot = aggregator.snapshot();

        assert!(!snapshot.ready);
        assert_eq!(snapshot.module_count(), 0);
        assert_eq!(snapshot.totals, Totals::default());
        assert_eq!(snapshot.firmware_version, None);
        assert_eq!(snapshot.updated_at, None);
    }

    #[test]
    fn applies_frame() {
        let aggregator = SnapshotAggregator::new(FirmwareLayout::default());
        aggregator.apply_data_frame(&data_frame(&[2048, 1024]));

        let snapshot = aggregator.snapshot();
        assert!(snapshot.ready);
        assert!(aggregator.is_ready());
        assert_eq!(aggregator.module_count(), 2);
        assert_eq!(snapshot.firmware_version, Some("1.9".to_string()));
        assert_eq!(snapshot.module(0).unwrap().mi_sn, "00000001");
        assert_eq!(snapshot.module(1).unwrap().power, 16.0);
        assert_eq!(snapshot.totals.total_power, Some(48.0));
        assert_eq!(snapshot.totals.total_energy, Some(2.0));
        assert!(snapshot.updated_at.is_some());
    }

    #[test]
    fn keeps_stale_modules() {
        let aggregator = SnapshotAggregator::new(FirmwareLayout::default());
        aggregator.apply_data_frame(&data_frame(&[2048, 1024]));
        aggregator.apply_data_frame(&data_frame(&[512]));

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.module_count(), 2);
        assert_eq!(snapshot.module(0).unwrap().power, 8.0);
        assert_eq!(snapshot.module(1).unwrap().power, 16.0);
        assert_eq!(snapshot.totals.total_power, Some(24.0));
    }

    #[test]
    fn serializes_flat_totals() {
        let aggregator = SnapshotAggregator::new(FirmwareLayout::default());
        aggregator.apply_data_frame(&data_frame(&[2048]));

        let json = serde_json::to_value(aggregator.snapshot()).unwrap();
        assert_eq!(json["total_power"], 32.0);
        assert_eq!(json["modules"]["0"]["mi_sn"], "00000001");
    }

    #[tokio::test]
    async fn wait_ready() {
        let aggregator = SnapshotAggregator::new(FirmwareLayout::default());
        assert!(!aggregator.wait_ready(Duration::from_millis(10)).await);

        let waiter = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.wait_ready(Duration::from_secs(5)).await })
        };
        aggregator.apply_data_frame(&data_frame(&[0]));

        assert!(waiter.await.unwrap());
        assert!(aggregator.wait_ready(Duration::ZERO).await);
    }
}
