//! Multiplexed serial-over-BLE transport for motorized camera gimbals.
//!
//! A single characteristic cannot carry enough payload for the gimbal's
//! message rate, so an outbound byte stream is split across up to six
//! 20-byte GATT characteristics per round and reassembled on the way
//! back, driven by a fixed-rate state machine with no blocking I/O.
//!
//! Typical use: spawn a [`LinkService`], push command bytes through the
//! returned [`LinkHandle`], and drain reassembled response bytes for the
//! attribute-protocol decoder above.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod transport;

pub use domain::models::{ConnectionStatus, DiscoveredDevice, LinkEvent};
pub use domain::settings::{LogSettings, Settings, SettingsService};
pub use error::LinkError;
pub use infrastructure::bluetooth::{LinkHandle, LinkService};
pub use transport::framing::{ChannelWriter, FrameEngine, LinkState};
pub use transport::queue::ByteQueue;
