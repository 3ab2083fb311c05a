//! Radio Backend Seam
//!
//! The radio binding is an external collaborator. A [`RadioBackend`] opens
//! [`RadioLink`]s to devices and performs discovery; links carry register
//! reads and writes and push inbound notifications into a channel.
//!
//! Notifications are delivered framed, i.e. with the 3-byte ATT header in
//! front of the characteristic value, in arrival order.

use crate::domain::models::{MacAddress, ScannedDevice};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sink for framed notification payloads
pub type NotificationSender = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("failed to connect to {mac}: {reason}")]
    Connection { mac: MacAddress, reason: String },

    #[error("{operation} on handle {handle:#06x} failed: {reason}")]
    Operation {
        operation: &'static str,
        handle: u16,
        reason: String,
    },

    #[error("unexpected {register} register size: expected {expected} bytes, got {actual}")]
    Protocol {
        register: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("radio operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("link to {0} is not connected")]
    NotConnected(MacAddress),

    #[error("radio backend unavailable: {0}")]
    Unavailable(String),
}

impl RadioError {
    /// Register content did not have the expected shape
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

/// An open connection to one device
pub trait RadioLink: Send + 'static {
    fn read_handle(
        &mut self,
        handle: u16,
    ) -> impl Future<Output = Result<Vec<u8>, RadioError>> + Send;

    fn write_handle(
        &mut self,
        handle: u16,
        data: &[u8],
    ) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn is_connected(&self) -> bool;
}

/// Fleet-wide radio binding
pub trait RadioBackend: Send + Sync + 'static {
    type Link: RadioLink;

    /// Open a link; notifications from the device go to `notifications`
    fn connect(
        &self,
        mac: MacAddress,
        notifications: NotificationSender,
    ) -> impl Future<Output = Result<Self::Link, RadioError>> + Send;

    /// Scan for nearby devices for at most `duration`
    fn discover(
        &self,
        duration: Duration,
    ) -> impl Future<Output = Result<Vec<ScannedDevice>, RadioError>> + Send;
}
