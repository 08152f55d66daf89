/// Lifecycle events raised to external observers (UI, the attribute
/// protocol layer above the byte streams). No payload beyond the flavor
/// is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    DeviceListChanged,
}

/// Connection state, owned exclusively by the service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only snapshot of a discovered gimbal, for device-selection UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub rssi: i16,
    /// Signal strength mapped onto 0-100 for display.
    pub signal_scale: u8,
}
