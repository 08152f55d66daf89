//! Registry of gimbals seen during scanning.
//!
//! Keyed by advertised name. Discoveries outside the accepted RSSI band
//! never enter the registry; records not rediscovered within the
//! staleness ceiling drop out of the active list until seen again.

use std::collections::HashMap;

use crate::transport::protocol::{MAX_DBM, MIN_DBM, RSSI_GARBAGE, STALENESS_TIMEOUT_TICKS};

/// One scanned gimbal. Generic over the peripheral handle so the registry
/// can be exercised without a BLE stack.
#[derive(Debug, Clone)]
pub struct DeviceRecord<P> {
    pub name: String,
    pub peripheral: P,
    pub rssi: i16,
    /// Watchdog ticks since last rediscovery, clamped at the ceiling.
    pub staleness_ticks: u8,
}

impl<P> DeviceRecord<P> {
    pub fn is_active(&self) -> bool {
        self.staleness_ticks < STALENESS_TIMEOUT_TICKS
    }

    pub fn is_timing_out(&self) -> bool {
        self.staleness_ticks == STALENESS_TIMEOUT_TICKS
    }

    /// Map RSSI onto `0..=scale_max` for display.
    pub fn rssi_scale(&self, scale_max: u8) -> u8 {
        let span = i32::from(MAX_DBM - MIN_DBM);
        let offset = i32::from(self.rssi - MIN_DBM);
        let scaled = offset * i32::from(scale_max) / span;
        scaled.clamp(0, i32::from(scale_max)) as u8
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry<P> {
    devices: HashMap<String, DeviceRecord<P>>,
}

impl<P: Clone> DeviceRegistry<P> {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    /// Record a discovery. Returns false (and stores nothing) when the
    /// RSSI is below the floor or an implausible garbage reading.
    pub fn on_discovered(&mut self, name: &str, peripheral: P, rssi: i16) -> bool {
        if rssi < MIN_DBM || rssi >= RSSI_GARBAGE {
            return false;
        }
        self.devices.insert(
            name.to_string(),
            DeviceRecord {
                name: name.to_string(),
                peripheral,
                rssi,
                staleness_ticks: 0,
            },
        );
        true
    }

    /// Snapshot of records still within the staleness ceiling.
    pub fn active_devices(&self) -> HashMap<String, DeviceRecord<P>> {
        self.devices
            .iter()
            .filter(|(_, record)| record.is_active())
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Age every record one tick. Returns true when any record crossed
    /// the timeout boundary on this call, so the caller can raise a
    /// list-changed event.
    pub fn age_all(&mut self) -> bool {
        let mut crossed = false;
        for record in self.devices.values_mut() {
            if record.staleness_ticks < STALENESS_TIMEOUT_TICKS {
                record.staleness_ticks += 1;
                if record.is_timing_out() {
                    crossed = true;
                }
            }
        }
        crossed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn peripheral_for(&self, name: &str) -> Option<P> {
        self.devices.get(name).map(|record| record.peripheral.clone())
    }

    /// Drop every record. Used when the BLE stack is rebuilt: peripheral
    /// handles are tied to the adapter that produced them, so after a
    /// restart they are all dead and must be rediscovered.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rssi_filter() {
        let mut registry: DeviceRegistry<u32> = DeviceRegistry::new();
        assert!(!registry.on_discovered("weak", 1, -71));
        assert!(!registry.contains("weak"));

        assert!(registry.on_discovered("ok", 2, -60));
        assert!(registry.contains("ok"));

        assert!(!registry.on_discovered("garbage", 3, 127));
        assert!(!registry.contains("garbage"));
    }

    #[test]
    fn test_staleness_ages_out_and_rediscovery_resets() {
        let mut registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.on_discovered("movi", 7, -55);

        for _ in 0..3 {
            assert!(!registry.age_all());
            assert!(registry.active_devices().contains_key("movi"));
        }
        // Fourth tick crosses the timeout boundary.
        assert!(registry.age_all());
        assert!(registry.active_devices().is_empty());
        // Further aging stays clamped and raises nothing new.
        assert!(!registry.age_all());

        registry.on_discovered("movi", 7, -52);
        let active = registry.active_devices();
        assert_eq!(active["movi"].staleness_ticks, 0);
        assert_eq!(active["movi"].rssi, -52);
    }

    #[test]
    fn test_rediscovery_replaces_record() {
        let mut registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.on_discovered("movi", 1, -65);
        registry.age_all();
        registry.on_discovered("movi", 2, -58);

        let active = registry.active_devices();
        assert_eq!(active.len(), 1);
        assert_eq!(active["movi"].peripheral, 2);
        assert_eq!(active["movi"].staleness_ticks, 0);
    }

    #[test]
    fn test_clear_forces_rediscovery() {
        let mut registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.on_discovered("movi", 1, -55);
        registry.clear();
        assert!(!registry.contains("movi"));
        assert_eq!(registry.peripheral_for("movi"), None);

        // A record from the new stack replaces the dead handle.
        registry.on_discovered("movi", 2, -58);
        assert_eq!(registry.peripheral_for("movi"), Some(2));
    }

    #[test]
    fn test_rssi_scale_bounds() {
        let record = DeviceRecord {
            name: "movi".into(),
            peripheral: 0u32,
            rssi: -50,
            staleness_ticks: 0,
        };
        assert_eq!(record.rssi_scale(100), 100);
        let weak = DeviceRecord { rssi: -70, ..record.clone() };
        assert_eq!(weak.rssi_scale(100), 0);
        let mid = DeviceRecord { rssi: -60, ..record };
        assert_eq!(mid.rssi_scale(100), 50);
    }
}
