use thiserror::Error;

/// Transport-layer failures.
///
/// These never cross the application boundary: the service loop absorbs
/// them and reports only lifecycle events. They exist so the framing
/// engine and session can signal "abandon this round" explicitly.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected to a peripheral")]
    NotConnected,

    #[error("no bluetooth adapter available")]
    NoAdapter,

    #[error("characteristic for channel {0} was not discovered")]
    MissingCharacteristic(usize),

    #[error("channel index {0} out of range")]
    InvalidChannel(usize),

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}
