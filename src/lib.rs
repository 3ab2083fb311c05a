//! WED fleet manager.
//!
//! Connects to WED wearable sensors over BLE, reads their status, flashes
//! their LED and downloads their stored logs, either on demand or by
//! continuously cycling through a configured fleet.
//!
//! - [`domain`] - device sessions, download accounting, checkpoints, scheduling
//! - [`infrastructure`] - radio backends, the WED log codec, logging setup
//! - [`presentation`] - command line and console output

pub mod domain;
pub mod infrastructure;
pub mod presentation;
