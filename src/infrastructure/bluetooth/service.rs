//! Bluetooth Service Module
//!
//! The Windows radio binding: ties the scanner and GATT connections together
//! behind the [`RadioBackend`] seam.

use crate::domain::models::{MacAddress, ScannedDevice};
use crate::infrastructure::bluetooth::backend::{NotificationSender, RadioBackend, RadioError};
use crate::infrastructure::bluetooth::connection::WinRtLink;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct WinRtBackend;

impl WinRtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl RadioBackend for WinRtBackend {
    type Link = WinRtLink;

    async fn connect(
        &self,
        mac: MacAddress,
        notifications: NotificationSender,
    ) -> Result<WinRtLink, RadioError> {
        WinRtLink::open(mac, notifications).await
    }

    async fn discover(&self, duration: Duration) -> Result<Vec<ScannedDevice>, RadioError> {
        BleScanner::new().scan(duration).await
    }
}
