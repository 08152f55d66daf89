//! Connection watchdog bookkeeping.
//!
//! Pure second-granularity state, driven by the service loop's one-second
//! interval and consulted only while no connection is up. It decides when
//! to toggle scanning (forcing the platform to refresh RSSI values, and
//! pacing registry aging) and when a connection attempt has stalled long
//! enough that the underlying BLE manager should be rebuilt — some
//! platforms otherwise sit on a connect for minutes.

use crate::transport::protocol::CONNECT_STALL_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Idle,
    /// Toggle scanning off/on and age the device registry.
    RefreshScan,
    /// Discard and reinitialize the BLE manager, then retry the connect.
    RestartManager,
}

#[derive(Debug, Default)]
pub struct Watchdog {
    seconds: u32,
    connecting: bool,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection attempt just started; arm the stall deadline.
    pub fn connect_started(&mut self) {
        self.connecting = true;
        self.seconds = 0;
    }

    /// The attempt resolved (either way); back to scan pacing.
    pub fn connect_ended(&mut self) {
        self.connecting = false;
        self.seconds = 0;
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Advance one second and report what the service loop should do.
    pub fn on_tick(&mut self) -> WatchdogAction {
        self.seconds += 1;
        if self.connecting {
            if self.seconds > CONNECT_STALL_SECS {
                self.seconds = 0;
                return WatchdogAction::RestartManager;
            }
            WatchdogAction::Idle
        } else {
            self.seconds = 0;
            WatchdogAction::RefreshScan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refreshes_scan_every_tick_while_idle() {
        let mut watchdog = Watchdog::new();
        for _ in 0..5 {
            assert_eq!(watchdog.on_tick(), WatchdogAction::RefreshScan);
        }
    }

    #[test]
    fn test_connect_stall_fires_after_deadline() {
        let mut watchdog = Watchdog::new();
        watchdog.connect_started();
        for _ in 0..CONNECT_STALL_SECS {
            assert_eq!(watchdog.on_tick(), WatchdogAction::Idle);
        }
        assert_eq!(watchdog.on_tick(), WatchdogAction::RestartManager);
        // The deadline re-arms rather than firing every tick.
        assert_eq!(watchdog.on_tick(), WatchdogAction::Idle);
    }

    #[test]
    fn test_connect_ended_disarms_deadline() {
        let mut watchdog = Watchdog::new();
        watchdog.connect_started();
        watchdog.on_tick();
        watchdog.connect_ended();
        assert!(!watchdog.is_connecting());
        assert_eq!(watchdog.on_tick(), WatchdogAction::RefreshScan);
    }
}
