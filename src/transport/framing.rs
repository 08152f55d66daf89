//! Framing state machine: serial byte streams multiplexed across six
//! 20-byte characteristics.
//!
//! The engine is pure and tick-driven. One call to [`FrameEngine::tick`]
//! performs at most one state transition and never blocks: outbound
//! payloads are handed to a [`ChannelWriter`] (fire-and-forget), and
//! inbound notifications are recorded asynchronously via
//! [`FrameEngine::on_notification`] and picked up on a later tick once
//! every expected channel has arrived.
//!
//! There is no acknowledgment or retransmission. A write failure or a
//! dropped connection abandons the round and forces `Reset`; bytes in
//! flight at that point are lost.

use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::transport::protocol::{CH0_DATA_CAPACITY, MAX_PAYLOAD, NUM_CHANNELS};
use crate::transport::queue::ByteQueue;

/// Sink for one round's outbound channel payloads.
///
/// Implementations must not block; the real writer queues payloads for an
/// async task performing the characteristic writes without response.
pub trait ChannelWriter {
    fn write(&mut self, channel: usize, payload: &[u8]) -> Result<(), LinkError>;
}

/// Protocol state, one instance per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Reset,
    WaitForConnect,
    Tx,
    RxWaitForChannels,
    RxAssemble,
}

/// One channel's per-round buffer, length, and received flag.
#[derive(Debug, Clone, Copy)]
struct ChannelSlot {
    buf: [u8; MAX_PAYLOAD],
    len: usize,
    received: bool,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            buf: [0; MAX_PAYLOAD],
            len: 0,
            received: false,
        }
    }
}

impl ChannelSlot {
    fn clear(&mut self) {
        self.len = 0;
        self.received = false;
    }
}

/// The multiplexing engine.
///
/// The application-facing byte queues are passed in per tick and survive
/// disconnects; only the per-round slots below are cleared on `Reset`.
#[derive(Debug)]
pub struct FrameEngine {
    state: LinkState,
    tx: [ChannelSlot; NUM_CHANNELS],
    tx_channel_count: usize,
    rx: [ChannelSlot; NUM_CHANNELS],
    /// First byte of channel 0's payload; 0 means "not yet known".
    rx_expected: usize,
}

impl Default for FrameEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEngine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Reset,
            tx: [ChannelSlot::default(); NUM_CHANNELS],
            tx_channel_count: 0,
            rx: [ChannelSlot::default(); NUM_CHANNELS],
            rx_expected: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Record an inbound characteristic notification for this round.
    ///
    /// Runs on the same logical owner as `tick` (the service loop), so no
    /// further synchronization is needed here. Payloads longer than the
    /// characteristic limit are truncated; an empty channel-0 payload is
    /// ignored since it cannot carry the channel-count header.
    pub fn on_notification(&mut self, channel: usize, data: &[u8]) {
        if channel >= NUM_CHANNELS {
            warn!(channel, "notification for unknown channel dropped");
            return;
        }
        if channel == 0 && data.is_empty() {
            warn!("empty channel-0 notification dropped");
            return;
        }

        let len = data.len().min(MAX_PAYLOAD);
        let slot = &mut self.rx[channel];
        slot.buf[..len].copy_from_slice(&data[..len]);
        slot.len = len;
        slot.received = true;

        if channel == 0 {
            // Header byte; counts above the channel limit are clamped.
            self.rx_expected = (data[0] as usize).min(NUM_CHANNELS);
            trace!(expected = self.rx_expected, "round header received");
        }
    }

    /// Run one state-machine step.
    ///
    /// `connected` reflects the link session's state; any tick observing it
    /// false abandons the current round and returns to `Reset`.
    pub fn tick(
        &mut self,
        connected: bool,
        outbound: &mut ByteQueue,
        inbound: &mut ByteQueue,
        writer: &mut dyn ChannelWriter,
    ) {
        match self.state {
            LinkState::Reset => {
                self.clear_round_state();
                self.state = LinkState::WaitForConnect;
            }

            LinkState::WaitForConnect => {
                if connected {
                    self.state = LinkState::Tx;
                }
            }

            LinkState::Tx => {
                if !connected {
                    self.state = LinkState::Reset;
                    return;
                }
                self.build_tx_round(outbound);
                match self.send_tx_round(writer) {
                    Ok(()) => self.state = LinkState::RxWaitForChannels,
                    Err(error) => {
                        // Abandoned round; the queue is not rolled back.
                        debug!(%error, "tx round abandoned");
                        self.state = LinkState::Reset;
                    }
                }
            }

            LinkState::RxWaitForChannels => {
                if !connected {
                    self.state = LinkState::Reset;
                    return;
                }
                if self.all_channels_received() {
                    self.state = LinkState::RxAssemble;
                }
            }

            LinkState::RxAssemble => {
                if !connected {
                    // Partial round is discarded, never assembled.
                    self.state = LinkState::Reset;
                    return;
                }
                self.assemble_rx_round(inbound);
                self.state = LinkState::Tx;
            }
        }
    }

    fn clear_round_state(&mut self) {
        for slot in &mut self.tx {
            slot.clear();
        }
        for slot in &mut self.rx {
            slot.clear();
        }
        self.tx_channel_count = 0;
        self.rx_expected = 0;
    }

    /// Drain the outbound queue into up to six channel payloads.
    ///
    /// Channel 0 reserves byte 0 for the channel count and takes up to 19
    /// data bytes; channels 1-5 take up to 20 each, in order, stopping as
    /// soon as the queue empties. Channel 0 is always sent, so the count
    /// is at least 1 even for an empty queue.
    fn build_tx_round(&mut self, outbound: &mut ByteQueue) {
        // Stray flags from the previous round must not leak forward.
        for slot in &mut self.tx {
            slot.clear();
        }
        for slot in &mut self.rx {
            slot.clear();
        }
        self.rx_expected = 0;

        self.tx[0].len = 1; // header
        while self.tx[0].len <= CH0_DATA_CAPACITY {
            match outbound.pop() {
                Some(byte) => {
                    let len = self.tx[0].len;
                    self.tx[0].buf[len] = byte;
                    self.tx[0].len = len + 1;
                }
                None => break,
            }
        }

        let mut channel_count = 1;
        if !outbound.is_empty() {
            for channel in 1..NUM_CHANNELS {
                while self.tx[channel].len < MAX_PAYLOAD {
                    match outbound.pop() {
                        Some(byte) => {
                            let len = self.tx[channel].len;
                            self.tx[channel].buf[len] = byte;
                            self.tx[channel].len = len + 1;
                        }
                        None => break,
                    }
                }
                if self.tx[channel].len > 0 {
                    channel_count += 1;
                }
                if outbound.is_empty() {
                    break;
                }
            }
        }

        self.tx[0].buf[0] = channel_count as u8;
        self.tx_channel_count = channel_count;
        trace!(
            channels = channel_count,
            remaining = outbound.len(),
            "tx round built"
        );
    }

    fn send_tx_round(&mut self, writer: &mut dyn ChannelWriter) -> Result<(), LinkError> {
        for channel in 0..self.tx_channel_count {
            let slot = &self.tx[channel];
            writer.write(channel, &slot.buf[..slot.len])?;
        }
        Ok(())
    }

    /// Whether every channel of the announced round has arrived.
    ///
    /// An unknown count (channel 0 not yet seen) never gates as complete.
    fn all_channels_received(&self) -> bool {
        if self.rx_expected == 0 {
            return false;
        }
        self.rx[..self.rx_expected].iter().all(|slot| slot.received)
    }

    /// Reassemble the round back into a serial stream: channel 0 minus its
    /// header byte, then channels 1..expected in order.
    fn assemble_rx_round(&mut self, inbound: &mut ByteQueue) {
        let ch0 = &self.rx[0];
        for i in 1..ch0.len {
            inbound.push(ch0.buf[i]);
        }
        for channel in 1..self.rx_expected {
            let slot = &self.rx[channel];
            for i in 0..slot.len {
                inbound.push(slot.buf[i]);
            }
        }

        for slot in &mut self.rx {
            slot.clear();
        }
        self.rx_expected = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Captures one round's writes, optionally failing every write.
    #[derive(Default)]
    struct CapturingWriter {
        rounds: Vec<(usize, Vec<u8>)>,
        fail: bool,
    }

    impl ChannelWriter for CapturingWriter {
        fn write(&mut self, channel: usize, payload: &[u8]) -> Result<(), LinkError> {
            if self.fail {
                return Err(LinkError::NotConnected);
            }
            self.rounds.push((channel, payload.to_vec()));
            Ok(())
        }
    }

    /// Advance a fresh engine to the Tx state.
    fn engine_at_tx() -> (FrameEngine, ByteQueue, ByteQueue, CapturingWriter) {
        let mut engine = FrameEngine::new();
        let mut outbound = ByteQueue::new();
        let mut inbound = ByteQueue::new();
        let mut writer = CapturingWriter::default();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer); // Reset -> WaitForConnect
        engine.tick(true, &mut outbound, &mut inbound, &mut writer); // WaitForConnect -> Tx
        assert_eq!(engine.state(), LinkState::Tx);
        (engine, outbound, inbound, writer)
    }

    /// Run one Tx round and return the captured channel payloads.
    fn run_tx_round(data: &[u8]) -> (FrameEngine, Vec<(usize, Vec<u8>)>) {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        outbound.extend(data);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);
        (engine, writer.rounds)
    }

    #[test]
    fn test_empty_round_sends_header_only() {
        let (_, rounds) = run_tx_round(&[]);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].0, 0);
        assert_eq!(rounds[0].1, vec![1]); // channel count, no data
    }

    #[test]
    fn test_channel_count_matches_transmitted_channels() {
        // 19 bytes fit entirely in channel 0.
        let (_, rounds) = run_tx_round(&[0xAA; 19]);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].1[0], 1);

        // One more byte spills into channel 1.
        let (_, rounds) = run_tx_round(&[0xAA; 20]);
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].1[0], 2);
        assert_eq!(rounds[1].1.len(), 1);

        // Full envelope: 19 + 5 * 20 = 119 bytes over 6 channels.
        let (_, rounds) = run_tx_round(&[0xAA; 119]);
        assert_eq!(rounds.len(), 6);
        assert_eq!(rounds[0].1[0], 6);
    }

    #[test]
    fn test_capacity_law() {
        for size in [0usize, 1, 18, 19, 20, 39, 40, 119, 200, 500] {
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let (_, rounds) = run_tx_round(&data);
            let declared = rounds[0].1[0] as usize;
            assert!((1..=6).contains(&declared));
            assert_eq!(declared, rounds.len());
            for (channel, payload) in &rounds {
                assert!(payload.len() <= MAX_PAYLOAD);
                if *channel == 0 {
                    assert!(payload.len() - 1 <= CH0_DATA_CAPACITY);
                } else {
                    // Trailing channels are only sent when they carry data.
                    assert!(!payload.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_oversized_stream_leaves_remainder_queued() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        outbound.extend(&[0x55; 150]);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        // One full round of 119 bytes; the rest waits for the next round.
        assert_eq!(outbound.len(), 150 - 119);
        assert_eq!(writer.rounds.len(), 6);
    }

    #[test]
    fn test_round_trip_integrity() {
        // Push an arbitrary stream through a sender engine, deliver its
        // rounds losslessly to a receiver engine, and compare streams.
        let original: Vec<u8> = (0..300u16).map(|i| (i * 7 % 251) as u8).collect();

        let (mut sender, mut s_out, mut s_in, _) = engine_at_tx();
        let (mut receiver, mut r_out, mut r_in, mut sink) = engine_at_tx();
        // Park the receiver in RxWaitForChannels with an empty round of its own.
        receiver.tick(true, &mut r_out, &mut r_in, &mut sink);
        assert_eq!(receiver.state(), LinkState::RxWaitForChannels);

        s_out.extend(&original);
        let mut received = Vec::new();
        while !s_out.is_empty() {
            let mut writer = CapturingWriter::default();
            sender.tick(true, &mut s_out, &mut s_in, &mut writer); // Tx round
            assert_eq!(sender.state(), LinkState::RxWaitForChannels);

            for (channel, payload) in &writer.rounds {
                receiver.on_notification(*channel, payload);
            }
            receiver.tick(true, &mut r_out, &mut r_in, &mut sink); // -> RxAssemble
            assert_eq!(receiver.state(), LinkState::RxAssemble);
            receiver.tick(true, &mut r_out, &mut r_in, &mut sink); // assemble -> Tx
            while let Some(byte) = r_in.pop() {
                received.push(byte);
            }

            // Fake the peer's reply so the sender returns to Tx.
            sender.on_notification(0, &[1]);
            sender.tick(true, &mut s_out, &mut s_in, &mut sink); // -> RxAssemble
            sender.tick(true, &mut s_out, &mut s_in, &mut sink); // -> Tx

            // Receiver sends its own (empty) round and waits again.
            receiver.tick(true, &mut r_out, &mut r_in, &mut sink);
            assert_eq!(receiver.state(), LinkState::RxWaitForChannels);
        }

        assert_eq!(received, original);
    }

    #[test]
    fn test_rx_gating_requires_header_and_all_flags() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);

        // No header yet: zero channels must not count as "all received".
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);

        // Header announces 3 channels; only 2 have arrived.
        engine.on_notification(0, &[3, 0x10, 0x11]);
        engine.on_notification(1, &[0x20]);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);

        // Final channel closes the round.
        engine.on_notification(2, &[0x30, 0x31]);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxAssemble);

        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Tx);
        let assembled: Vec<u8> = std::iter::from_fn(|| inbound.pop()).collect();
        // Channel 0's header byte is excluded from the stream.
        assert_eq!(assembled, vec![0x10, 0x11, 0x20, 0x30, 0x31]);
    }

    #[test]
    fn test_empty_channel_zero_notification_ignored() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        engine.on_notification(0, &[]);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);
    }

    #[test]
    fn test_disconnect_discards_partial_rx_round() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        engine.on_notification(0, &[2, 0xAB]);

        // Link drops while waiting for channel 1.
        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Reset);
        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::WaitForConnect);
        assert!(inbound.is_empty());

        // Reconnect: the stale header must not leak into the new round.
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxWaitForChannels);
    }

    #[test]
    fn test_disconnect_in_rx_assemble_discards_round() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        engine.on_notification(0, &[1, 0xDE, 0xAD]);
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxAssemble);

        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Reset);
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_disconnect_in_tx_resets() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        outbound.extend(&[1, 2, 3]);
        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Reset);
        assert!(writer.rounds.is_empty());
    }

    #[test]
    fn test_failed_write_abandons_round() {
        let (mut engine, mut outbound, mut inbound, _) = engine_at_tx();
        outbound.extend(&[9, 8, 7]);
        let mut writer = CapturingWriter {
            fail: true,
            ..Default::default()
        };
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Reset);
        // No retransmission: the drained bytes are gone.
        assert!(outbound.is_empty());
    }

    #[test]
    fn test_queues_survive_reset() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        inbound.push(0x42);
        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::Reset);
        engine.tick(false, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(inbound.pop(), Some(0x42));
    }

    #[test]
    fn test_excessive_announced_count_is_clamped() {
        let (mut engine, mut outbound, mut inbound, mut writer) = engine_at_tx();
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        engine.on_notification(0, &[9, 0x01]);
        for channel in 1..NUM_CHANNELS {
            engine.on_notification(channel, &[channel as u8]);
        }
        engine.tick(true, &mut outbound, &mut inbound, &mut writer);
        assert_eq!(engine.state(), LinkState::RxAssemble);
    }
}
