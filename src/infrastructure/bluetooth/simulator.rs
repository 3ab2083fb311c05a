//! Simulated Radio Backend
//!
//! In-memory WED firmware. Devices answer register reads from their
//! configured status/config, obey blink and broadcast commands, and stream
//! their stored logs as framed notifications while broadcasting. Every radio
//! operation is recorded so tests can check ordering and exclusivity.

use crate::domain::models::{DeviceConfig, DeviceStatus, MacAddress, ScannedDevice};
use crate::infrastructure::bluetooth::backend::{
    NotificationSender, RadioBackend, RadioError, RadioLink,
};
use crate::infrastructure::bluetooth::protocol::{self, DeviceCommand, StatusLayout};
use crate::infrastructure::codec::{LOG_ACCEL, LOG_COUNT, LOG_COUNT_LEN};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Behaviour of one simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub name: String,
    pub status: DeviceStatus,
    pub config: DeviceConfig,
    pub layout: StatusLayout,
    pub records_per_notification: usize,
    pub notification_interval: Duration,
    /// First broadcast goes silent after this many records
    pub stall_after: Option<u64>,
    /// Every broadcast goes silent immediately
    pub mute: bool,
    pub refuse_connection: bool,
    pub read_delay: Option<Duration>,
    /// Answer status reads with a truncated register
    pub short_status: bool,
}

impl SimulatedDevice {
    /// Slow mode device at 50 ms sampling holding `total_logs` records
    pub fn with_logs(total_logs: u32) -> Self {
        Self {
            name: "WED".to_string(),
            status: DeviceStatus {
                total_logs,
                battery_percent: 80,
                mode_flags: 0,
                reboot_count: 0,
                trailing: vec![0; 5],
            },
            config: DeviceConfig {
                timings: [100, 5, 100, 2, 100, 50, 0],
                flags: [0, 0, 0],
            },
            layout: StatusLayout::Wed,
            records_per_notification: 4,
            notification_interval: Duration::from_millis(1),
            stall_after: None,
            mute: false,
            refuse_connection: false,
            read_delay: None,
            short_status: false,
        }
    }
}

/// One recorded radio operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    Connect(MacAddress),
    Disconnect(MacAddress),
    Read(MacAddress, u16),
    Write(MacAddress, u16, Vec<u8>),
}

struct DeviceState {
    profile: SimulatedDevice,
    delivered: u64,
    broadcasts: u32,
    blinks: u32,
    last_verbosity: Option<u8>,
    stream: Option<JoinHandle<()>>,
}

impl DeviceState {
    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
        // Streamed records are gone from device memory
        let drained = self.delivered.min(self.profile.status.total_logs as u64) as u32;
        self.profile.status.total_logs -= drained;
        self.delivered = 0;
    }
}

#[derive(Default)]
struct SimInner {
    devices: Mutex<HashMap<MacAddress, Arc<Mutex<DeviceState>>>>,
    ops: Mutex<Vec<RadioOp>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    links: Mutex<HashMap<MacAddress, usize>>,
    max_links: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks operations in flight; dropping it (even on cancellation) ends the op
struct OpGuard<'a>(&'a SimInner);

impl<'a> OpGuard<'a> {
    fn enter(inner: &'a SimInner, op: RadioOp) -> Self {
        lock(&inner.ops).push(op);
        let now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_active.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, mac: MacAddress, device: SimulatedDevice) {
        let state = DeviceState {
            profile: device,
            delivered: 0,
            broadcasts: 0,
            blinks: 0,
            last_verbosity: None,
            stream: None,
        };
        lock(&self.inner.devices).insert(mac, Arc::new(Mutex::new(state)));
    }

    fn device(&self, mac: &MacAddress) -> Option<Arc<Mutex<DeviceState>>> {
        lock(&self.inner.devices).get(mac).cloned()
    }

    pub fn ops(&self) -> Vec<RadioOp> {
        lock(&self.inner.ops).clone()
    }

    /// Payloads written by the host to `mac`, in order
    pub fn writes_to(&self, mac: MacAddress) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                RadioOp::Write(m, _, data) if m == mac => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Highest number of radio operations ever observed at once
    pub fn max_concurrent_ops(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous links ever held to a single device
    pub fn max_links_per_device(&self) -> usize {
        self.inner.max_links.load(Ordering::SeqCst)
    }

    /// Links to `mac` currently held open
    pub fn open_links(&self, mac: MacAddress) -> usize {
        lock(&self.inner.links).get(&mac).copied().unwrap_or(0)
    }

    pub fn broadcast_count(&self, mac: MacAddress) -> u32 {
        self.device(&mac).map(|d| lock(&d).broadcasts).unwrap_or(0)
    }

    pub fn blink_count(&self, mac: MacAddress) -> u32 {
        self.device(&mac).map(|d| lock(&d).blinks).unwrap_or(0)
    }

    pub fn last_verbosity(&self, mac: MacAddress) -> Option<u8> {
        self.device(&mac).and_then(|d| lock(&d).last_verbosity)
    }

    pub fn remaining_logs(&self, mac: MacAddress) -> Option<u32> {
        self.device(&mac).map(|d| lock(&d).profile.status.total_logs)
    }
}

impl RadioBackend for SimulatedBackend {
    type Link = SimulatedLink;

    async fn connect(
        &self,
        mac: MacAddress,
        notifications: NotificationSender,
    ) -> Result<SimulatedLink, RadioError> {
        let _op = OpGuard::enter(&self.inner, RadioOp::Connect(mac));
        let device = self.device(&mac).ok_or_else(|| RadioError::Connection {
            mac,
            reason: "device not in range".to_string(),
        })?;
        if lock(&device).profile.refuse_connection {
            return Err(RadioError::Connection {
                mac,
                reason: "connection refused".to_string(),
            });
        }

        {
            let mut links = lock(&self.inner.links);
            let count = links.entry(mac).or_insert(0);
            *count += 1;
            self.inner.max_links.fetch_max(*count, Ordering::SeqCst);
        }

        Ok(SimulatedLink {
            mac,
            device,
            inner: Arc::clone(&self.inner),
            notifications,
            connected: true,
        })
    }

    async fn discover(&self, _duration: Duration) -> Result<Vec<ScannedDevice>, RadioError> {
        let devices = lock(&self.inner.devices);
        let mut found: Vec<ScannedDevice> = devices
            .iter()
            .map(|(mac, state)| ScannedDevice {
                name: lock(state).profile.name.clone(),
                address: *mac,
                signal_strength: -60,
            })
            .collect();
        found.sort_by_key(|d| d.address);
        Ok(found)
    }
}

pub struct SimulatedLink {
    mac: MacAddress,
    device: Arc<Mutex<DeviceState>>,
    inner: Arc<SimInner>,
    notifications: NotificationSender,
    connected: bool,
}

impl SimulatedLink {
    fn ensure_connected(&self) -> Result<(), RadioError> {
        if self.connected {
            Ok(())
        } else {
            Err(RadioError::NotConnected(self.mac))
        }
    }

    fn start_stream(&self, state: &mut DeviceState) {
        state.stop_stream();
        state.broadcasts += 1;
        if state.profile.mute {
            return;
        }

        let device = Arc::clone(&self.device);
        let tx = self.notifications.clone();
        let first_broadcast = state.broadcasts == 1;
        let interval = state.profile.notification_interval;
        state.stream = Some(tokio::spawn(async move {
            loop {
                let payload = {
                    let mut st = lock(&device);
                    next_notification(&mut st, first_broadcast)
                };
                match payload {
                    Some(p) => {
                        if tx.send(p).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }
}

/// Build the next framed notification, or `None` when the stream is over
fn next_notification(state: &mut DeviceState, first_broadcast: bool) -> Option<Vec<u8>> {
    let total = state.profile.status.total_logs as u64;
    // Trailing count record closes the stream
    let entries = total + 1;
    if state.delivered >= entries {
        return None;
    }
    if first_broadcast {
        if let Some(limit) = state.profile.stall_after {
            if state.delivered >= limit {
                return None;
            }
        }
    }

    let mut body = Vec::new();
    let mut n = 0;
    while n < state.profile.records_per_notification.max(1) && state.delivered < entries {
        if state.delivered < total {
            let v = (state.delivered % 64) as u8;
            body.extend_from_slice(&[LOG_ACCEL, v, v.wrapping_add(1), v.wrapping_add(2)]);
        } else {
            let mut count = vec![0u8; LOG_COUNT_LEN];
            count[0] = LOG_COUNT;
            body.extend_from_slice(&count);
        }
        state.delivered += 1;
        n += 1;
    }
    Some(protocol::frame_notification(protocol::CONFIG_HANDLE, &body))
}

impl RadioLink for SimulatedLink {
    async fn read_handle(&mut self, handle: u16) -> Result<Vec<u8>, RadioError> {
        let _op = OpGuard::enter(&self.inner, RadioOp::Read(self.mac, handle));
        self.ensure_connected()?;
        let delay = lock(&self.device).profile.read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.device);
        let profile = &state.profile;
        match handle {
            protocol::STATUS_HANDLE => {
                let mut bytes = protocol::encode_status(profile.layout, &profile.status);
                if profile.short_status {
                    bytes.truncate(bytes.len() - 1);
                }
                Ok(bytes)
            }
            protocol::CONFIG_HANDLE => Ok(protocol::encode_config(&profile.config)),
            other => Err(RadioError::Operation {
                operation: "read",
                handle: other,
                reason: "no such attribute".to_string(),
            }),
        }
    }

    async fn write_handle(&mut self, handle: u16, data: &[u8]) -> Result<(), RadioError> {
        let _op = OpGuard::enter(&self.inner, RadioOp::Write(self.mac, handle, data.to_vec()));
        self.ensure_connected()?;
        if handle != protocol::CONFIG_HANDLE {
            return Err(RadioError::Operation {
                operation: "write",
                handle,
                reason: "attribute is read-only".to_string(),
            });
        }

        let mut state = lock(&self.device);
        if data == DeviceCommand::Blink.encode().as_slice() {
            state.blinks += 1;
        } else if data == DeviceCommand::StopBroadcast.encode().as_slice() {
            state.stop_stream();
        } else if data.len() == 2 && data[0] == 6 {
            state.last_verbosity = Some(data[1]);
            self.start_stream(&mut state);
        } else {
            debug!(mac = %self.mac, "ignoring unknown command {:02X?}", data);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        let _op = OpGuard::enter(&self.inner, RadioOp::Disconnect(self.mac));
        if self.connected {
            self.connected = false;
            if let Some(stream) = lock(&self.device).stream.take() {
                stream.abort();
            }
            let mut links = lock(&self.inner.links);
            if let Some(count) = links.get_mut(&self.mac) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        if self.connected {
            if let Some(stream) = lock(&self.device).stream.take() {
                stream.abort();
            }
            if let Some(count) = lock(&self.inner.links).get_mut(&self.mac) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn mac() -> MacAddress {
        MacAddress::new([1, 2, 3, 4, 5, 6])
    }

    #[tokio::test]
    async fn test_broadcast_streams_all_records_then_count() {
        let backend = SimulatedBackend::new();
        backend.add_device(mac(), SimulatedDevice::with_logs(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = backend.connect(mac(), tx).await.unwrap();
        link.write_handle(protocol::CONFIG_HANDLE, &[6, 1]).await.unwrap();

        let mut bodies = Vec::new();
        // 10 accel records + 1 count record at 4 per notification
        for _ in 0..3 {
            let payload = rx.recv().await.unwrap();
            assert_eq!(payload[0], protocol::ATT_NOTIFICATION_OPCODE);
            bodies.extend_from_slice(&payload[3..]);
        }
        assert_eq!(bodies.len(), 10 * 4 + LOG_COUNT_LEN);
        assert_eq!(backend.last_verbosity(mac()), Some(1));

        link.write_handle(protocol::CONFIG_HANDLE, &[6, 0]).await.unwrap();
        assert_eq!(backend.remaining_logs(mac()), Some(0));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1);
        device.refuse_connection = true;
        backend.add_device(mac(), device);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = backend.connect(mac(), tx).await.err().unwrap();
        assert!(matches!(err, RadioError::Connection { .. }));
    }
}
