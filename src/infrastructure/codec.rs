//! WED Log Codec
//!
//! Walks the firmware's packed log stream. Each packet starts with a type
//! byte whose low five bits select the packet kind; the kind fixes the packet
//! length except for light-sensor data (length from the channel bits) and
//! compressed accelerometer runs (length from the count/width byte).

use crate::domain::codec::{CodecError, LogCodec, Sample};

pub const LOG_TIME: u8 = 0;
pub const LOG_ACCEL: u8 = 1;
pub const LOG_LS_CONFIG: u8 = 2;
pub const LOG_LS_DATA: u8 = 3;
pub const LOG_TEMP: u8 = 4;
pub const LOG_TAG: u8 = 5;
pub const LOG_ACCEL_CMP: u8 = 6;
pub const LOG_COUNT: u8 = 7;
pub const LOG_EVENT: u8 = 8;

const TAG_BITS: u8 = 0x1F;

/// type, u32 log timestamp, u16 accel count, u32 old timestamp, u32 timestamp
pub const LOG_COUNT_LEN: usize = 15;

/// Compressed accelerometer run widths, indexed by bits 4..6 of the count byte
const CMP_STILL: u8 = 5;
const CMP_WIDTHS: [usize; 5] = [3, 4, 5, 6, 8];
const CMP_MAX_BITS: usize = 144;

#[derive(Debug, Clone, Copy, Default)]
pub struct WedCodec;

impl WedCodec {
    pub fn new() -> Self {
        Self
    }

    /// Length of the packet at `offset`
    fn packet_len(buf: &[u8], offset: usize) -> Result<usize, CodecError> {
        let head = buf[offset];
        let len = match head & TAG_BITS {
            LOG_TIME => 6,
            LOG_ACCEL => 4,
            LOG_LS_CONFIG => 6,
            LOG_LS_DATA => 1 + 2 * (head & 0xE0).count_ones() as usize,
            LOG_TEMP => 3,
            LOG_TAG => 5,
            LOG_ACCEL_CMP => {
                let count_bits = *buf.get(offset + 1).ok_or(CodecError::Truncated {
                    offset,
                    needed: 2,
                    available: buf.len() - offset,
                })?;
                Self::accel_cmp_len(count_bits).ok_or(CodecError::InvalidCompressed(offset))?
            }
            LOG_COUNT => LOG_COUNT_LEN,
            LOG_EVENT => 2,
            tag => return Err(CodecError::UnknownPacket { tag, offset }),
        };

        let available = buf.len() - offset;
        if len > available {
            return Err(CodecError::Truncated {
                offset,
                needed: len,
                available,
            });
        }
        Ok(len)
    }

    fn accel_cmp_len(count_bits: u8) -> Option<usize> {
        let mode = (count_bits >> 4) & 0x7;
        if mode == CMP_STILL {
            return Some(2);
        }
        let bits_per_sample = CMP_WIDTHS.get(mode as usize).map_or(8, |w| w * 3);
        let bits = ((count_bits & 0xF) as usize + 1) * bits_per_sample;
        if bits > CMP_MAX_BITS {
            return None;
        }
        Some(2 + (bits - 1) / 8 + 1)
    }

    /// Iterate `(offset, len)` over complete packets, stopping at the first error
    fn packets(buf: &[u8]) -> impl Iterator<Item = Result<(usize, usize), CodecError>> + '_ {
        let mut offset = 0;
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed || offset >= buf.len() {
                return None;
            }
            match Self::packet_len(buf, offset) {
                Ok(len) => {
                    let item = (offset, len);
                    offset += len;
                    Some(Ok(item))
                }
                Err(e) => {
                    failed = true;
                    Some(Err(e))
                }
            }
        })
    }
}

fn read_bits(data: &[u8], start: usize, width: usize) -> u32 {
    let mut value = 0u32;
    for i in 0..width {
        let bit = start + i;
        if (data[bit / 8] >> (bit % 8)) & 1 == 1 {
            value |= 1 << i;
        }
    }
    value
}

fn sign_extend(value: u32, width: usize) -> i32 {
    let shift = 32 - width as u32;
    ((value << shift) as i32) >> shift
}

impl LogCodec for WedCodec {
    fn count_records(&self, buffer: &[u8]) -> usize {
        Self::packets(buffer).take_while(|p| p.is_ok()).count()
    }

    fn decode(&self, buffer: &[u8]) -> Result<Vec<Sample>, CodecError> {
        let mut samples = Vec::new();
        for packet in Self::packets(buffer) {
            let (offset, len) = packet?;
            let p = &buffer[offset..offset + len];
            let sample = match p[0] & TAG_BITS {
                LOG_ACCEL => Sample {
                    name: "accel",
                    x: p[1] as i8 as i32,
                    y: p[2] as i8 as i32,
                    z: p[3] as i8 as i32,
                },
                LOG_TEMP => Sample {
                    name: "temp",
                    x: i16::from_le_bytes([p[1], p[2]]) as i32,
                    y: 0,
                    z: 0,
                },
                LOG_TIME => Sample {
                    name: "time",
                    x: u32::from_le_bytes([p[1], p[2], p[3], p[4]]) as i32,
                    y: p[5] as i32,
                    z: 0,
                },
                LOG_LS_DATA => {
                    let mut vals = [0i32; 3];
                    for (i, chunk) in p[1..].chunks_exact(2).enumerate().take(3) {
                        vals[i] = u16::from_le_bytes([chunk[0], chunk[1]]) as i32;
                    }
                    Sample {
                        name: "light",
                        x: vals[0],
                        y: vals[1],
                        z: vals[2],
                    }
                }
                LOG_EVENT => Sample {
                    name: "event",
                    x: p[1] as i32,
                    y: 0,
                    z: 0,
                },
                LOG_COUNT => Sample {
                    name: "count",
                    x: u16::from_le_bytes([p[5], p[6]]) as i32,
                    y: 0,
                    z: 0,
                },
                _ => continue,
            };
            samples.push(sample);
        }
        Ok(samples)
    }

    fn decompress(&self, buffer: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(buffer.len() * 2);
        let mut last: Option<[i32; 3]> = None;

        for packet in Self::packets(buffer) {
            let (offset, len) = packet?;
            let p = &buffer[offset..offset + len];
            match p[0] & TAG_BITS {
                LOG_ACCEL => {
                    last = Some([p[1] as i8 as i32, p[2] as i8 as i32, p[3] as i8 as i32]);
                    out.extend_from_slice(p);
                }
                LOG_ACCEL_CMP => {
                    let count = (p[1] & 0xF) as usize + 1;
                    let mode = (p[1] >> 4) & 0x7;
                    let mut accel = last.ok_or(CodecError::InvalidCompressed(offset))?;
                    let width = if mode == CMP_STILL {
                        0
                    } else {
                        *CMP_WIDTHS
                            .get(mode as usize)
                            .ok_or(CodecError::InvalidCompressed(offset))?
                    };

                    let data = &p[2..];
                    for s in 0..count {
                        for (axis, value) in accel.iter_mut().enumerate() {
                            if width > 0 {
                                let raw = read_bits(data, (s * 3 + axis) * width, width);
                                *value += sign_extend(raw, width);
                            }
                        }
                        out.extend_from_slice(&[
                            LOG_ACCEL,
                            accel[0] as i8 as u8,
                            accel[1] as i8 as u8,
                            accel[2] as i8 as u8,
                        ]);
                    }
                    last = Some(accel);
                }
                _ => out.extend_from_slice(p),
            }
        }
        Ok(out)
    }
}
