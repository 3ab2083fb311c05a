//! Log codec contract.
//!
//! Sessions only need `count_records` while downloading; `decode` and
//! `decompress` are used when inspecting finished download files.

use thiserror::Error;

/// One decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: &'static str,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown log packet tag {tag:#04x} at offset {offset}")]
    UnknownPacket { tag: u8, offset: usize },

    #[error("truncated log packet at offset {offset}: need {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid compressed packet at offset {0}")]
    InvalidCompressed(usize),
}

pub trait LogCodec: Send + Sync {
    /// Number of complete log records in `buffer`
    fn count_records(&self, buffer: &[u8]) -> usize;

    fn decode(&self, buffer: &[u8]) -> Result<Vec<Sample>, CodecError>;

    /// Expand compressed records into their uncompressed form
    fn decompress(&self, buffer: &[u8]) -> Result<Vec<u8>, CodecError>;
}
