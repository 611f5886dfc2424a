//! Binary format of spill files.
//!
//! All multi-byte integers are stored in little-endian.
//!
//! File layout:
//! ```text
//! [message_count: 4B i32][data_start: 8B i64][zero padding up to data_start]
//! [records...]
//! ```
//!
//! Each record:
//! ```text
//! [len: 4B][bincode SerializedMessage][crc32: 4B]
//! ```
//! The header is written when the file is created and rewritten each time
//! the writer lets go of the file, so `message_count` always matches the
//! records that were fully flushed.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use relay_core::SerializedMessage;
use thiserror::Error;

/// Offset of the first record in a freshly created spill file.
pub const DEFAULT_DATA_START: i64 = 64;

/// Largest record we'll allocate for. A corrupt length prefix fails fast
/// instead of requesting gigabytes.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Errors that can occur when reading or writing spill files.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid spill header: {0}")]
    InvalidHeader(String),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The fixed-size header at the start of every spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillHeader {
    pub message_count: i32,
    pub data_start: i64,
}

impl Default for SpillHeader {
    fn default() -> Self {
        Self {
            message_count: 0,
            data_start: DEFAULT_DATA_START,
        }
    }
}

impl SpillHeader {
    /// Writes the header padded out to `data_start`.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        write_i32(w, self.message_count)?;
        write_i64(w, self.data_start)?;
        let pad = (self.data_start - 12).max(0) as usize;
        w.write_all(&vec![0u8; pad])
    }

    /// Reads and validates a header. Leaves the reader positioned just
    /// after the two header fields, not at `data_start`.
    pub fn read_from(r: &mut impl Read) -> Result<Self, FormatError> {
        let message_count = read_i32(r)?;
        let data_start = read_i64(r)?;
        if message_count < 0 {
            return Err(FormatError::InvalidHeader(format!(
                "negative message count {message_count}"
            )));
        }
        if data_start < 12 {
            return Err(FormatError::InvalidHeader(format!(
                "data start {data_start} overlaps the header"
            )));
        }
        Ok(Self {
            message_count,
            data_start,
        })
    }
}

/// Computes a CRC32 checksum over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Verifies that `data` matches the expected CRC32 checksum.
pub fn verify_crc32(data: &[u8], expected: u32) -> Result<(), FormatError> {
    let actual = crc32(data);
    if actual != expected {
        return Err(FormatError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Appends one message record. Returns the number of bytes written.
pub fn write_record(w: &mut impl Write, message: &SerializedMessage) -> Result<u64, FormatError> {
    let body = bincode::serialize(message).map_err(|e| FormatError::Codec(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| {
        FormatError::InvalidData(format!("record length {} exceeds u32::MAX", body.len()))
    })?;
    write_u32(w, len)?;
    w.write_all(&body)?;
    write_u32(w, crc32(&body))?;
    Ok(body.len() as u64 + 8)
}

/// Reads one message record, verifying its checksum.
pub fn read_record(r: &mut impl Read) -> Result<SerializedMessage, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_RECORD_LEN {
        return Err(FormatError::InvalidData(format!(
            "record length {len} exceeds maximum of {MAX_RECORD_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    read_exact(r, &mut body)?;
    let stored = read_u32(r)?;
    verify_crc32(&body, stored)?;
    bincode::deserialize(&body).map_err(|e| FormatError::Codec(e.to_string()))
}

/// Caps pre-allocation so a bogus count can't exhaust memory.
pub fn capped_capacity(count: i32) -> usize {
    (count.max(0) as usize).min(65_536)
}

pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i32(w: &mut impl Write, val: i32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i64(w: &mut impl Write, val: i64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32(r: &mut impl Read) -> Result<i32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Reads exactly `buf.len()` bytes, returning `UnexpectedEof` on short read.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}
