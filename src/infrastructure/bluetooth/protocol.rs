//! WED Device Protocol
//!
//! Register handles, fixed binary layouts and command packets understood by
//! the WED firmware. Every layout is a packed sequence of little-endian
//! unsigned integers; field widths and order must match the firmware byte
//! for byte.

use crate::domain::models::{DeviceConfig, DeviceStatus};
use crate::infrastructure::bluetooth::backend::RadioError;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Status register handle
pub const STATUS_HANDLE: u16 = 0x0025;

/// Config register handle, also the command sink
pub const CONFIG_HANDLE: u16 = 0x0027;

/// ATT notification header preceding every payload (opcode + 16-bit handle)
pub const NOTIFICATION_HEADER_LEN: usize = 3;

/// ATT "handle value notification" opcode
pub const ATT_NOTIFICATION_OPCODE: u8 = 0x1B;

/// Config timing entries are in units of 10 ms
pub const SAMPLE_PERIOD_SCALE: u32 = 10;

/// Size of the config register: seven u16 followed by three u8
pub const CONFIG_LEN: usize = 7 * 2 + 3;

/// Device commands written to the config handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Blink the red LED
    Blink,
    /// Start streaming stored logs; `raw` selects uncompressed records
    StartBroadcast { raw: bool },
    /// Stop streaming
    StopBroadcast,
}

impl DeviceCommand {
    /// Serialize this command into its wire packet
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Blink => vec![5, 4, 6, 1, 5],
            Self::StartBroadcast { raw } => vec![6, verbosity_flag(*raw)],
            Self::StopBroadcast => vec![6, 0],
        }
    }
}

/// Download flag: bit 0 enables streaming, bit 1 requests compression
pub fn verbosity_flag(raw: bool) -> u8 {
    if raw {
        0x01
    } else {
        0x03
    }
}

/// Status register layout, one per firmware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLayout {
    /// `u32 u8 u8 u32 u8 u8 u8 u8 u8`
    Wed,
    /// `u32 u8 u8 u32 u32 u8`
    Amiigo,
}

impl StatusLayout {
    /// Width in bytes of each field, in wire order
    pub fn field_widths(&self) -> &'static [usize] {
        match self {
            Self::Wed => &[4, 1, 1, 4, 1, 1, 1, 1, 1],
            Self::Amiigo => &[4, 1, 1, 4, 4, 1],
        }
    }

    pub fn len(&self) -> usize {
        self.field_widths().iter().sum()
    }
}

/// Firmware families known to the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Wed,
    Amiigo,
}

/// Immutable protocol description shared by every session of a device type
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub status_handle: u16,
    pub config_handle: u16,
    pub notification_header_len: usize,
    pub status_layout: StatusLayout,
    pub config_len: usize,
    pub sample_period_scale: u32,
    pub mode_names: [&'static str; 3],
}

impl DeviceSettings {
    pub fn for_type(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Wed => Self::wed(),
            DeviceType::Amiigo => Self::amiigo(),
        }
    }

    pub fn wed() -> Self {
        Self {
            status_handle: STATUS_HANDLE,
            config_handle: CONFIG_HANDLE,
            notification_header_len: NOTIFICATION_HEADER_LEN,
            status_layout: StatusLayout::Wed,
            config_len: CONFIG_LEN,
            sample_period_scale: SAMPLE_PERIOD_SCALE,
            mode_names: ["Slow Mode", "Fast Mode", "Sleep Mode"],
        }
    }

    pub fn amiigo() -> Self {
        Self {
            status_layout: StatusLayout::Amiigo,
            mode_names: ["Slow", "Fast", "Sleep"],
            ..Self::wed()
        }
    }

    pub fn mode_name(&self, mode: usize) -> &'static str {
        self.mode_names.get(mode).copied().unwrap_or("Unknown Mode")
    }

    /// Parse a raw status register read
    pub fn decode_status(&self, bytes: &[u8]) -> Result<DeviceStatus, RadioError> {
        let expected = self.status_layout.len();
        if bytes.len() != expected {
            return Err(RadioError::Protocol {
                register: "status",
                expected,
                actual: bytes.len(),
            });
        }

        #[cfg(debug_assertions)]
        trace!("Raw status: {:02X?}", bytes);

        Ok(DeviceStatus {
            total_logs: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            battery_percent: bytes[4],
            mode_flags: bytes[5],
            reboot_count: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            trailing: bytes[10..].to_vec(),
        })
    }

    /// Parse a raw config register read
    pub fn decode_config(&self, bytes: &[u8]) -> Result<DeviceConfig, RadioError> {
        if bytes.len() != self.config_len {
            return Err(RadioError::Protocol {
                register: "config",
                expected: self.config_len,
                actual: bytes.len(),
            });
        }

        let mut timings = [0u16; 7];
        for (i, t) in timings.iter_mut().enumerate() {
            *t = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        }
        Ok(DeviceConfig {
            timings,
            flags: [bytes[14], bytes[15], bytes[16]],
        })
    }

    /// Sampling period in milliseconds for the given mode
    pub fn sample_period_ms(&self, config: &DeviceConfig, mode: usize) -> u32 {
        let raw = config.timings.get(2 * mode + 1).copied().unwrap_or(0);
        raw as u32 * self.sample_period_scale
    }

    /// Strip the notification header, returning the log bytes
    pub fn notification_body<'a>(&self, payload: &'a [u8]) -> Option<&'a [u8]> {
        payload.get(self.notification_header_len..)
    }
}

/// Prepend the ATT notification header to a characteristic value
pub fn frame_notification(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(NOTIFICATION_HEADER_LEN + value.len());
    framed.push(ATT_NOTIFICATION_OPCODE);
    framed.extend_from_slice(&handle.to_le_bytes());
    framed.extend_from_slice(value);
    framed
}

/// Encode a status register, the inverse of [`DeviceSettings::decode_status`]
pub fn encode_status(layout: StatusLayout, status: &DeviceStatus) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(layout.len());
    bytes.extend_from_slice(&status.total_logs.to_le_bytes());
    bytes.push(status.battery_percent);
    bytes.push(status.mode_flags);
    bytes.extend_from_slice(&status.reboot_count.to_le_bytes());
    bytes.extend_from_slice(&status.trailing);
    bytes.resize(layout.len(), 0);
    bytes
}

/// Encode a config register
pub fn encode_config(config: &DeviceConfig) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CONFIG_LEN);
    for t in config.timings {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    bytes.extend_from_slice(&config.flags);
    bytes
}
