//! BLE Connection Module
//!
//! Opens a GATT connection to one device and exposes its attributes by
//! handle. Every characteristic that supports notifications is subscribed and
//! its values are forwarded, framed with the ATT header, to the session.

use crate::domain::models::MacAddress;
use crate::infrastructure::bluetooth::backend::{NotificationSender, RadioError, RadioLink};
use crate::infrastructure::bluetooth::protocol::frame_notification;
use tracing::{debug, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

fn op_err(operation: &'static str, handle: u16) -> impl Fn(windows::core::Error) -> RadioError {
    move |e| RadioError::Operation {
        operation,
        handle,
        reason: e.message().to_string(),
    }
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// Characteristic plus the handle its value lives at
struct Attribute {
    characteristic: GattCharacteristic,
    value_handle: u16,
}

/// Open GATT connection to one WED device
pub struct WinRtLink {
    mac: MacAddress,
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    attributes: Vec<Attribute>,
    subscriptions: Vec<(GattCharacteristic, i64)>,
}

impl WinRtLink {
    /// Connect to `mac` and subscribe every notifying characteristic
    pub async fn open(mac: MacAddress, notifications: NotificationSender) -> Result<Self, RadioError> {
        let conn_err = |e: windows::core::Error| RadioError::Connection {
            mac,
            reason: e.message().to_string(),
        };

        info!(mac = %mac, "Opening GATT connection");
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(mac.as_u64())
            .map_err(conn_err)?
            .await
            .map_err(conn_err)?;

        // Keeps Windows from dropping the link between our requests
        let session = match Self::maintain_connection(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(mac = %mac, "Failed to create GattSession: {}", e.message());
                None
            }
        };

        let mut link = Self {
            mac,
            device: Some(device),
            session,
            attributes: Vec::new(),
            subscriptions: Vec::new(),
        };
        link.load_attributes().await?;
        link.subscribe_all(notifications).await;
        Ok(link)
    }

    async fn maintain_connection(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn load_attributes(&mut self) -> Result<(), RadioError> {
        let mac = self.mac;
        let conn_err = |e: windows::core::Error| RadioError::Connection {
            mac,
            reason: e.message().to_string(),
        };
        let device = self.device.as_ref().ok_or(RadioError::NotConnected(mac))?;

        let services_result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(conn_err)?
            .await
            .map_err(conn_err)?;
        let status = services_result.Status().map_err(conn_err)?;
        if status != GattCommunicationStatus::Success {
            return Err(RadioError::Connection {
                mac,
                reason: format!("GATT service discovery returned {:?}", status),
            });
        }

        let services = services_result.Services().map_err(conn_err)?;
        for i in 0..services.Size().map_err(conn_err)? {
            let service = services.GetAt(i).map_err(conn_err)?;
            let chars_result = match service.GetCharacteristicsAsync() {
                Ok(op) => op.await.map_err(conn_err)?,
                Err(e) => {
                    debug!(mac = %mac, "Skipping service {}: {}", i, e.message());
                    continue;
                }
            };
            if chars_result.Status().map_err(conn_err)? != GattCommunicationStatus::Success {
                continue;
            }
            let characteristics = chars_result.Characteristics().map_err(conn_err)?;
            for j in 0..characteristics.Size().map_err(conn_err)? {
                let characteristic = characteristics.GetAt(j).map_err(conn_err)?;
                // WinRT reports the declaration handle; the value follows it
                let declaration = characteristic.AttributeHandle().map_err(conn_err)?;
                self.attributes.push(Attribute {
                    characteristic,
                    value_handle: declaration.wrapping_add(1),
                });
            }
        }

        info!(mac = %mac, "Found {} characteristics", self.attributes.len());
        Ok(())
    }

    async fn subscribe_all(&mut self, notifications: NotificationSender) {
        for attribute in &self.attributes {
            let notifies = attribute
                .characteristic
                .CharacteristicProperties()
                .map(|p| p.contains(GattCharacteristicProperties::Notify))
                .unwrap_or(false);
            if !notifies {
                continue;
            }

            let handle = attribute.value_handle;
            let sender = notifications.clone();
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let value = buffer_to_vec(&args.CharacteristicValue()?)?;
                        let _ = sender.send(frame_notification(handle, &value));
                    }
                    Ok(())
                },
            );

            let characteristic = &attribute.characteristic;
            let token = match characteristic.ValueChanged(&handler) {
                Ok(token) => token,
                Err(e) => {
                    warn!(mac = %self.mac, "Handler on {:#06x} failed: {}", handle, e.message());
                    continue;
                }
            };
            let status = match characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                ) {
                Ok(op) => op.await.ok(),
                Err(_) => None,
            };
            if status != Some(GattCommunicationStatus::Success) {
                warn!(
                    mac = %self.mac,
                    "Notification subscription on {:#06x} returned {:?}", handle, status
                );
            }
            self.subscriptions.push((characteristic.clone(), token));
        }
    }

    /// The characteristic whose value or declaration sits at `handle`
    fn attribute(&self, handle: u16) -> Result<&GattCharacteristic, RadioError> {
        self.attributes
            .iter()
            .find(|a| a.value_handle == handle)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|a| a.value_handle.wrapping_sub(1) == handle)
            })
            .map(|a| &a.characteristic)
            .ok_or(RadioError::Operation {
                operation: "lookup",
                handle,
                reason: "no characteristic at this handle".into(),
            })
    }
}

impl RadioLink for WinRtLink {
    async fn read_handle(&mut self, handle: u16) -> Result<Vec<u8>, RadioError> {
        let characteristic = self.attribute(handle)?.clone();
        let err = op_err("read", handle);
        let result = characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(&err)?
            .await
            .map_err(&err)?;
        let status = result.Status().map_err(&err)?;
        if status != GattCommunicationStatus::Success {
            return Err(RadioError::Operation {
                operation: "read",
                handle,
                reason: format!("status {:?}", status),
            });
        }
        buffer_to_vec(&result.Value().map_err(&err)?).map_err(&err)
    }

    async fn write_handle(&mut self, handle: u16, data: &[u8]) -> Result<(), RadioError> {
        let characteristic = self.attribute(handle)?.clone();
        let err = op_err("write", handle);
        let writer = DataWriter::new().map_err(&err)?;
        writer.WriteBytes(data).map_err(&err)?;
        let buffer = writer.DetachBuffer().map_err(&err)?;
        let status = characteristic
            .WriteValueAsync(&buffer)
            .map_err(&err)?
            .await
            .map_err(&err)?;
        if status != GattCommunicationStatus::Success {
            return Err(RadioError::Operation {
                operation: "write",
                handle,
                reason: format!("status {:?}", status),
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        for (characteristic, token) in self.subscriptions.drain(..) {
            let _ = characteristic.RemoveValueChanged(token);
        }
        self.attributes.clear();
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            device.Close().map_err(|e| RadioError::Connection {
                mac: self.mac,
                reason: e.message().to_string(),
            })?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device
            .as_ref()
            .and_then(|d| d.ConnectionStatus().ok())
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }
}

impl Drop for WinRtLink {
    fn drop(&mut self) {
        for (characteristic, token) in self.subscriptions.drain(..) {
            let _ = characteristic.RemoveValueChanged(token);
        }
        if let Some(device) = self.device.take() {
            let _ = device.Close();
        }
    }
}
