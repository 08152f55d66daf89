//! Bluetooth Module
//!
//! Serial-over-BLE link to the gimbal.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │   (single-owner event loop - public API via LinkHandle)  │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌────────────┐
//! │  Registry  │  │  Session   │  │  Watchdog  │
//! │            │  │            │  │            │
//! │ - scanned  │  │ - connect  │  │ - scan     │
//! │   devices  │  │ - channel  │  │   pacing   │
//! │ - staleness│  │   I/O      │  │ - stall    │
//! │ - RSSI     │  │ - notify   │  │   recovery │
//! └────────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`] - Scanned-device bookkeeping with RSSI filtering
//! - [`session`] - Peripheral connection and characteristic binding
//! - [`watchdog`] - Scan toggling and connection-stall recovery
//! - [`service`] - The event loop coordinating everything

pub mod registry;
pub mod service;
pub mod session;
pub mod watchdog;

// Re-export the public surface for convenience
pub use service::{LinkHandle, LinkService};
