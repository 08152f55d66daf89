//! Link session: the one active peripheral connection and its six bound
//! channel characteristics.

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::transport::protocol::{self, NUM_CHANNELS};

/// An established connection with all six channels bound and subscribed.
///
/// Cloning is cheap; the peripheral handle is reference counted.
#[derive(Debug, Clone)]
pub struct LinkSession {
    peripheral: Peripheral,
    channels: Vec<Characteristic>,
}

/// Connect, discover the serial service's characteristics, bind each of
/// the six channel UUIDs, and subscribe to notifications on all of them.
///
/// The protocol is only enabled once every channel is bound; any failure
/// along the way disconnects the peripheral and surfaces as an error, so
/// the link is never left half-open. A dangling connection would also
/// stop the gimbal from advertising and keep it out of the registry.
pub async fn establish(peripheral: Peripheral) -> Result<LinkSession, LinkError> {
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }

    match bind_channels(&peripheral).await {
        Ok(channels) => {
            info!("all channel characteristics bound and subscribed");
            Ok(LinkSession {
                peripheral,
                channels,
            })
        }
        Err(error) => {
            let _ = peripheral.disconnect().await;
            Err(error)
        }
    }
}

async fn bind_channels(peripheral: &Peripheral) -> Result<Vec<Characteristic>, LinkError> {
    peripheral.discover_services().await?;

    let mut bound: Vec<Option<Characteristic>> = vec![None; NUM_CHANNELS];
    for characteristic in peripheral.characteristics() {
        if let Some(channel) = protocol::channel_for_uuid(&characteristic.uuid) {
            debug!(channel, uuid = %characteristic.uuid, "bound channel characteristic");
            bound[channel] = Some(characteristic);
        }
    }

    let mut channels = Vec::with_capacity(NUM_CHANNELS);
    for (channel, slot) in bound.into_iter().enumerate() {
        channels.push(slot.ok_or(LinkError::MissingCharacteristic(channel))?);
    }

    for characteristic in &channels {
        peripheral.subscribe(characteristic).await?;
    }

    Ok(channels)
}

impl LinkSession {
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Fire-and-forget write of one channel payload.
    pub async fn write(&self, channel: usize, payload: &[u8]) -> Result<(), LinkError> {
        let characteristic = self
            .channels
            .get(channel)
            .ok_or(LinkError::InvalidChannel(channel))?;
        self.peripheral
            .write(characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Silently drop notifications and cancel the connection. Errors are
    /// ignored; the peripheral may already be gone.
    pub async fn teardown(&self) {
        for characteristic in &self.channels {
            let _ = self.peripheral.unsubscribe(characteristic).await;
        }
        let _ = self.peripheral.disconnect().await;
        debug!("session torn down");
    }
}
