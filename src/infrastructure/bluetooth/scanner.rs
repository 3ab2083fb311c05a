//! BLE Scanner Module
//!
//! Listens to advertisements for a fixed window and reports each advertiser
//! once, with its strongest signal.

use crate::domain::models::{MacAddress, ScannedDevice};
use crate::infrastructure::bluetooth::backend::RadioError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

fn scan_err(e: windows::core::Error) -> RadioError {
    RadioError::Unavailable(e.message().to_string())
}

/// Octets of a 48-bit address held in the low bits of `address`
fn mac_from_u64(address: u64) -> MacAddress {
    let bytes = address.to_be_bytes();
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&bytes[2..]);
    MacAddress::new(octets)
}

pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    found: Arc<Mutex<HashMap<MacAddress, ScannedDevice>>>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self {
            watcher: None,
            found: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start(&mut self) -> Result<(), RadioError> {
        self.stop()?;
        info!("Starting BLE scan");

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(scan_err)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(scan_err)?;

        let found = Arc::clone(&self.found);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = mac_from_u64(args.BluetoothAddress()?);
                    let rssi = args.RawSignalStrengthInDBm()?;

                    let mut found = found.lock().unwrap_or_else(|p| p.into_inner());
                    let entry = found.entry(address).or_insert_with(|| ScannedDevice {
                        name: String::new(),
                        address,
                        signal_strength: rssi,
                    });
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.signal_strength = entry.signal_strength.max(rssi);
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(scan_err)?;
        watcher.Start().map_err(scan_err)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), RadioError> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan");
            watcher.Stop().map_err(scan_err)?;
        }
        Ok(())
    }

    /// Scan for `duration` and return what was heard, strongest first
    pub async fn scan(mut self, duration: Duration) -> Result<Vec<ScannedDevice>, RadioError> {
        self.start()?;
        tokio::time::sleep(duration).await;
        self.stop()?;

        let found = self.found.lock().unwrap_or_else(|p| p.into_inner());
        let mut devices: Vec<ScannedDevice> = found
            .values()
            .cloned()
            .map(|mut d| {
                if d.name.is_empty() {
                    d.name = "Unknown".to_string();
                }
                d
            })
            .collect();
        devices.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        Ok(devices)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
