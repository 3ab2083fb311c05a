//! Bluetooth Module
//!
//! Radio access for WED devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BackendChannel                        │
//! │  (fleet-wide gate, one radio operation at a time)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ RadioBackend / RadioLink
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌────────────────┐          ┌────────────────┐
//! │  WinRtBackend  │          │   Simulated    │
//! │                │          │    Backend     │
//! │ - Scanner      │          │ - in-memory    │
//! │ - Connection   │          │   firmware     │
//! └────────────────┘          └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Register handles and layouts, commands, notification framing
//! - [`backend`] - The radio seam and its error type
//! - [`channel`] - Mutual exclusion and timeouts around the backend
//! - [`simulator`] - In-memory devices for tests and `--simulate`
//! - `scanner`, `connection`, `service` - Windows BLE binding

pub mod backend;
pub mod channel;
pub mod protocol;
pub mod simulator;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod service;

pub use backend::{RadioBackend, RadioError, RadioLink};
pub use channel::BackendChannel;
#[cfg(windows)]
pub use service::WinRtBackend;
