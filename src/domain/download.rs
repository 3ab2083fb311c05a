//! Download files.
//!
//! Three text header lines followed by the concatenated log payloads:
//!
//! ```text
//! compressed
//! start_time: 2024-03-01T12:00:00.000000
//! sample_period: 50
//! <binary log stream>
//! ```

use crate::domain::codec::{CodecError, LogCodec, Sample};
use crate::domain::models::MacAddress;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Error)]
pub enum DownloadFileError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed download header line {line}: {reason}")]
    Header { line: usize, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// `<prefix>_<%m-%d-%y_%H-%M-%S>_<MAC>.dat`
pub fn download_path(prefix: &Path, start: DateTime<Local>, mac: MacAddress) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(start.format("_%m-%d-%y_%H-%M-%S").to_string());
    name.push(format!("_{}.dat", mac.compact()));
    PathBuf::from(name)
}

/// Create the download file and write its three header lines
pub fn open_download_file(
    path: &Path,
    raw: bool,
    start: DateTime<Local>,
    sample_period_ms: u32,
) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "{}", if raw { "raw" } else { "compressed" })?;
    writeln!(file, "start_time: {}", start.format(START_TIME_FORMAT))?;
    writeln!(file, "sample_period: {}", sample_period_ms)?;
    Ok(file)
}

/// A parsed download file
#[derive(Debug, Clone)]
pub struct DownloadFile {
    pub raw: bool,
    pub start_time: NaiveDateTime,
    pub sample_period_ms: u32,
    pub payload: Vec<u8>,
}

fn split_line(bytes: &[u8], line: usize) -> Result<(&str, &[u8]), DownloadFileError> {
    let end = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| DownloadFileError::Header {
            line,
            reason: "missing line break".into(),
        })?;
    let text = std::str::from_utf8(&bytes[..end]).map_err(|_| DownloadFileError::Header {
        line,
        reason: "not text".into(),
    })?;
    Ok((text.trim_end_matches('\r'), &bytes[end + 1..]))
}

impl DownloadFile {
    pub fn read(path: &Path) -> Result<Self, DownloadFileError> {
        Self::parse(&fs::read(path)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DownloadFileError> {
        let (format, rest) = split_line(bytes, 1)?;
        let raw = match format {
            "raw" => true,
            "compressed" => false,
            other => {
                return Err(DownloadFileError::Header {
                    line: 1,
                    reason: format!("unknown format '{}'", other),
                })
            }
        };

        let (start_line, rest) = split_line(rest, 2)?;
        let start_time = start_line
            .strip_prefix("start_time: ")
            .and_then(|s| NaiveDateTime::parse_from_str(s, START_TIME_FORMAT).ok())
            .ok_or_else(|| DownloadFileError::Header {
                line: 2,
                reason: format!("bad start time '{}'", start_line),
            })?;

        let (period_line, payload) = split_line(rest, 3)?;
        let sample_period_ms = period_line
            .strip_prefix("sample_period: ")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DownloadFileError::Header {
                line: 3,
                reason: format!("bad sample period '{}'", period_line),
            })?;

        Ok(Self {
            raw,
            start_time,
            sample_period_ms,
            payload: payload.to_vec(),
        })
    }

    /// Decode every record, expanding compressed runs first
    pub fn samples(&self, codec: &dyn LogCodec) -> Result<Vec<Sample>, DownloadFileError> {
        let expanded;
        let bytes = if self.raw {
            &self.payload
        } else {
            expanded = codec.decompress(&self.payload)?;
            &expanded
        };
        Ok(codec.decode(bytes)?)
    }
}

/// Record counts of a download file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub counts: BTreeMap<&'static str, usize>,
    /// Time of the oldest accelerometer sample; the newest is at the start time
    pub first_sample: NaiveDateTime,
}

pub fn summarize(file: &DownloadFile, samples: &[Sample]) -> DownloadSummary {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for sample in samples {
        *counts.entry(sample.name).or_insert(0) += 1;
    }
    let accel = counts.get("accel").copied().unwrap_or(0);
    let span = file.sample_period_ms as i64 * accel.saturating_sub(1) as i64;
    DownloadSummary {
        counts,
        first_sample: file.start_time - ChronoDuration::milliseconds(span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::codec::{WedCodec, LOG_ACCEL, LOG_ACCEL_CMP, LOG_TEMP};

    fn mac() -> MacAddress {
        MacAddress::new([0xC4, 0xBE, 0x84, 0x70, 0x2B, 0x01])
    }

    #[test]
    fn test_download_path_format() {
        let path = download_path(Path::new("/tmp/WED_data"), Local::now(), mac());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("WED_data_"));
        assert!(name.ends_with("_C4BE84702B01.dat"));
    }

    #[test]
    fn test_written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let start = Local::now();
        let path = download_path(&dir.path().join("out").join("WED_data"), start, mac());

        let mut file = open_download_file(&path, false, start, 50).unwrap();
        file.write_all(&[LOG_ACCEL, 10, 20, 30, LOG_ACCEL_CMP, 0x52, LOG_TEMP, 0x10, 0x00])
            .unwrap();
        drop(file);

        let parsed = DownloadFile::read(&path).unwrap();
        assert!(!parsed.raw);
        assert_eq!(parsed.sample_period_ms, 50);
        // microsecond precision on disk
        let drift = start.naive_local() - parsed.start_time;
        assert!(drift.num_microseconds().unwrap().abs() < 1);

        let samples = parsed.samples(&WedCodec::new()).unwrap();
        let summary = summarize(&parsed, &samples);
        // seed plus a still run of three
        assert_eq!(summary.counts.get("accel"), Some(&4));
        assert_eq!(summary.counts.get("temp"), Some(&1));
        assert_eq!(
            parsed.start_time - summary.first_sample,
            ChronoDuration::milliseconds(150)
        );
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(matches!(
            DownloadFile::parse(b"zipped\nstart_time: x\nsample_period: 1\n"),
            Err(DownloadFileError::Header { line: 1, .. })
        ));
        assert!(matches!(
            DownloadFile::parse(b"raw\nstart_time: yesterday\nsample_period: 1\n"),
            Err(DownloadFileError::Header { line: 2, .. })
        ));
        assert!(matches!(
            DownloadFile::parse(b"raw\nstart_time: 2024-03-01T12:00:00.000000\nsample_period: x\n"),
            Err(DownloadFileError::Header { line: 3, .. })
        ));
        assert!(DownloadFile::parse(b"raw").is_err());
    }
}
