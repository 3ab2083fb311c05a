use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bluetooth device address of a WED device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed MAC address '{0}': expected six two-digit hex octets separated by ':' or '-'")]
pub struct MacParseError(pub String);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Address packed into the low 48 bits, most significant octet first.
    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    /// Upper-case hex without separators, used in file names.
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_string());
        let trimmed = s.trim();
        // Mixing separators ("aa:bb-cc...") is rejected
        let sep = if trimmed.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = trimmed.split(sep).collect();
        if parts.len() != 6 {
            return Err(err());
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(err());
            }
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decoded status register.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Number of log entries waiting on the device
    pub total_logs: u32,
    pub battery_percent: u8,
    pub mode_flags: u8,
    pub reboot_count: u32,
    /// Remaining firmware fields, kept as read
    pub trailing: Vec<u8>,
}

impl DeviceStatus {
    /// Operating mode index: 0 slow, 1 fast, 2 sleep.
    pub fn mode(&self) -> usize {
        if self.mode_flags & 0x02 != 0 {
            return 1;
        }
        if self.mode_flags & 0x10 != 0 {
            return 2;
        }
        0
    }
}

/// Decoded config register.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceConfig {
    /// Per-mode timing table; odd entries hold the sampling period
    pub timings: [u16; 7],
    pub flags: [u8; 3],
}

/// Command a session carries out once the registers are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Blink,
    Download,
}

/// Protocol states of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    StatusKnown,
    Broadcasting,
    Watchdog,
    Draining,
    Closed,
}

/// What a finished session did to the device's checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Unchanged,
    Set(i64),
}

/// How the download loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEnd {
    Completed,
    Cancelled,
    Failed,
}

/// Final report of one session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub mac: MacAddress,
    pub final_state: SessionState,
    pub status: Option<DeviceStatus>,
    pub records_received: u64,
    pub records_expected: u64,
    pub download: Option<DownloadEnd>,
    pub watchdog_restarts: u32,
    pub checkpoint: CheckpointDecision,
    pub error: Option<String>,
}

impl SessionOutcome {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            final_state: SessionState::Idle,
            status: None,
            records_received: 0,
            records_expected: 0,
            download: None,
            watchdog_restarts: 0,
            checkpoint: CheckpointDecision::Unchanged,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.download != Some(DownloadEnd::Failed)
    }
}

/// Queue entry of the fleet scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub mac: MacAddress,
    /// Epoch seconds of the last checkpoint; smaller is served first
    pub priority: i64,
    /// Consecutive sessions that left the checkpoint unchanged
    pub retry_count: u32,
    /// Earliest epoch second the entry may be dequeued
    pub not_before: i64,
}

impl ScheduleEntry {
    pub fn new(mac: MacAddress, priority: i64) -> Self {
        Self {
            mac,
            priority,
            retry_count: 0,
            not_before: i64::MIN,
        }
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: MacAddress,
    pub signal_strength: i16,
}

/// Events published by sessions and the scheduler for the presentation layer.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    StateChanged(MacAddress, SessionState),
    StatusRead(MacAddress, DeviceStatus, u32),
    BatteryLow(MacAddress, u8),
    Progress {
        mac: MacAddress,
        received: u64,
        expected: u64,
    },
    SessionStarted {
        mac: MacAddress,
        live: usize,
    },
    SessionFinished {
        outcome: SessionOutcome,
        live: usize,
    },
    Rescheduled(ScheduleEntry),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_separators_and_case() {
        let a: MacAddress = "c4:be:84:70:2b:01".parse().unwrap();
        let b: MacAddress = "C4-BE-84-70-2B-01".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "C4:BE:84:70:2B:01");
        assert_eq!(a.compact(), "C4BE84702B01");
        assert_eq!(a.as_u64(), 0xC4BE_8470_2B01);
    }

    #[test]
    fn test_parse_mac_rejects_malformed() {
        for bad in [
            "",
            "c4:be:84:70:2b",
            "c4:be:84:70:2b:01:02",
            "c4:be:84:70:2b:1",
            "c4:be:84:70:2b:0g",
            "c4:be-84:70:2b:01",
            "c4be84702b01",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_mode_from_flags() {
        let mut status = DeviceStatus::default();
        assert_eq!(status.mode(), 0);
        status.mode_flags = 0x02;
        assert_eq!(status.mode(), 1);
        status.mode_flags = 0x10;
        assert_eq!(status.mode(), 2);
        // Fast wins when both bits are set
        status.mode_flags = 0x12;
        assert_eq!(status.mode(), 1);
    }
}
