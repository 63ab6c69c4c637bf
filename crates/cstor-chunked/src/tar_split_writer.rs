//! Tar-split generation for converted layers.
//!
//! When a plain tar layer is converted into chunked form, the converter cuts the
//! original stream into header/padding segments and file bodies and records them
//! here, so the layer digest can later be reproduced from the staged tree. This
//! is the inverse of [`parse_tar_split`](crate::tar_split::parse_tar_split).
//!
//! # Example
//!
//! ```
//! use cstor_chunked::tar_split_writer::{TarSplitWriter, crc64_of};
//!
//! # fn main() -> cstor_chunked::Result<()> {
//! let mut writer = TarSplitWriter::new();
//! writer.add_segment(&[0u8; 512])?;
//! writer.add_file("hello.txt", 5, crc64_of(&mut &b"hello"[..])?)?;
//! let ndjson = writer.finish();
//! assert_eq!(ndjson.iter().filter(|&&b| b == b'\n').count(), 2);
//! # Ok(())
//! # }
//! ```

use std::io::Read;

use base64::prelude::*;
use serde::Serialize;

use crate::error::Result;
use crate::tar_split::CRC64_ISO;

/// A tar-split record for serialization.
#[derive(Debug, Serialize)]
struct Record<'a> {
    /// 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,

    /// Segment bytes, or the big-endian CRC-64 of a file body; base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,

    position: u64,
}

/// Writer for tar-split metadata.
///
/// Produces uncompressed NDJSON; callers compress it as their storage requires.
#[derive(Debug, Default)]
pub struct TarSplitWriter {
    out: Vec<u8>,
    position: u64,
}

impl TarSplitWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.push(b'\n');
        self.position += 1;
        Ok(())
    }

    /// Add raw stream bytes (headers, padding, the end-of-archive marker).
    ///
    /// Empty segments are skipped.
    pub fn add_segment(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.push(&Record {
            type_id: 2,
            name: None,
            size: None,
            payload: Some(BASE64_STANDARD.encode(bytes)),
            position: self.position,
        })
    }

    /// Add a reference to a file body of `size` bytes.
    ///
    /// Every tar member gets one of these, including those without a body.
    pub fn add_file(&mut self, name: &str, size: u64, crc64: u64) -> Result<()> {
        let payload = (size > 0).then(|| BASE64_STANDARD.encode(crc64.to_be_bytes()));
        self.push(&Record {
            type_id: 1,
            name: Some(name),
            size: Some(size),
            payload,
            position: self.position,
        })
    }

    /// Number of records written so far.
    pub fn entry_count(&self) -> u64 {
        self.position
    }

    /// Return the NDJSON stream.
    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// CRC-64 of everything `reader` yields.
pub fn crc64_of<R: Read>(reader: &mut R) -> Result<u64> {
    let mut digest = CRC64_ISO.digest();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
    }
    Ok(digest.finalize())
}

/// Zero bytes needed after a body of `size` bytes to reach a block boundary.
pub fn tar_padding(size: u64) -> usize {
    ((512 - size % 512) % 512) as usize
}
