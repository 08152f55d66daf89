//! Wire constants for the six-channel serial-over-BLE link.
//!
//! The gimbal exposes one custom GATT service with six characteristics,
//! each mapped 1:1 to a channel index 0-5. Every characteristic supports
//! write-without-response and notify, and carries at most 20 bytes per
//! operation. Channel 0 is distinguished: its first payload byte encodes
//! how many channels the current round uses (1-6).

use std::time::Duration;

use uuid::Uuid;

/// Number of logical channels (and characteristics).
pub const NUM_CHANNELS: usize = 6;

/// Maximum bytes per characteristic write or notification.
pub const MAX_PAYLOAD: usize = 20;

/// Data capacity of channel 0; its first byte carries the channel count.
pub const CH0_DATA_CAPACITY: usize = MAX_PAYLOAD - 1;

/// Serial service advertised by the gimbal.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xffff0001_0c0b_0a09_0807_060504030201);

/// Channel characteristics, indexed by channel.
pub const CHANNEL_UUIDS: [Uuid; NUM_CHANNELS] = [
    Uuid::from_u128(0xffff0002_0c0b_0a09_0807_060504030201),
    Uuid::from_u128(0xffff0003_0c0b_0a09_0807_060504030201),
    Uuid::from_u128(0xffff0004_0c0b_0a09_0807_060504030201),
    Uuid::from_u128(0xffff0005_0c0b_0a09_0807_060504030201),
    Uuid::from_u128(0xffff0006_0c0b_0a09_0807_060504030201),
    Uuid::from_u128(0xffff0007_0c0b_0a09_0807_060504030201),
];

/// Minimum accepted signal strength; weaker discoveries are discarded.
pub const MIN_DBM: i16 = -70;

/// Strongest expected signal, used to scale RSSI for display.
pub const MAX_DBM: i16 = -50;

/// RSSI readings at or above this are garbage and discarded.
pub const RSSI_GARBAGE: i16 = 127;

/// Framing state machine call rate.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Watchdog period: scan toggle, registry aging, stall checks.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// Watchdog ticks without rediscovery before a device is considered stale.
pub const STALENESS_TIMEOUT_TICKS: u8 = 4;

/// Seconds a connection attempt may run before the manager is rebuilt.
pub const CONNECT_STALL_SECS: u32 = 3;

/// Delay before rescanning after a disconnect, to avoid UI races.
pub const RESCAN_GRACE: Duration = Duration::from_secs(3);

/// Channel index for a characteristic UUID, if it belongs to the link.
pub fn channel_for_uuid(uuid: &Uuid) -> Option<usize> {
    CHANNEL_UUIDS.iter().position(|candidate| candidate == uuid)
}

pub fn uuid_for_channel(channel: usize) -> Option<Uuid> {
    CHANNEL_UUIDS.get(channel).copied()
}
