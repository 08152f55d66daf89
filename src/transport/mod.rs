//! The multiplexed serial transport: byte queues, wire constants, and
//! the framing state machine.

pub mod framing;
pub mod protocol;
pub mod queue;
