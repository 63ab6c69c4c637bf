//! Reading tar-split streams.
//!
//! A tar-split stream records how a layer's sequential tar stream was cut into
//! pieces: raw header and padding bytes are kept verbatim as segments, while file
//! bodies are only referenced by name, size and CRC-64. Combined with a staged
//! tree this is enough to regenerate the exact tar stream, and with it the
//! digest a full pull would have computed.
//!
//! The format is NDJSON, optionally gzip-compressed:
//! ```json
//! {"type":2,"payload":"<base64 header bytes>","position":0}
//! {"type":1,"name":"etc/hosts","size":123,"payload":"<base64 crc64>","position":1}
//! ```
//! Older writers put the checksum in a `crc64` field; both are accepted.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};

use base64::prelude::*;
use cap_std::fs::Dir;
use crc::{CRC_64_GO_ISO, Crc};
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::error::{ChunkedError, Result};
use crate::fsutil::clean_rel_path;
use crate::toc::{EntryType, FileEntry, Toc, ensure_attributes_match};

/// CRC-64 (ISO polynomial) of file bodies.
pub(crate) const CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

const TYPE_FILE: u8 = 1;
const TYPE_SEGMENT: u8 = 2;

/// One record of a tar-split stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarSplitEntry {
    /// A file body that must be read from the staged tree.
    File {
        /// Name as recorded in the tar header.
        name: String,
        /// Body size in bytes.
        size: u64,
        /// Big-endian CRC-64 of the body, if recorded.
        crc64: Option<Vec<u8>>,
    },
    /// Raw bytes of the tar stream.
    Segment(Vec<u8>),
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_raw: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    crc64: Option<String>,
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| ChunkedError::TarSplitError(format!("invalid base64 in {field}: {e}")))
}

impl TryFrom<RawEntry> for TarSplitEntry {
    type Error = ChunkedError;

    fn try_from(raw: RawEntry) -> Result<Self> {
        match raw.type_id {
            TYPE_FILE => {
                let name = match (raw.name, raw.name_raw) {
                    (Some(n), _) if !n.is_empty() => n,
                    (_, Some(r)) => String::from_utf8_lossy(&decode_b64("name_raw", &r)?).into_owned(),
                    (n, None) => n.unwrap_or_default(),
                };
                let crc64 = raw
                    .payload
                    .or(raw.crc64)
                    .filter(|p| !p.is_empty())
                    .map(|p| decode_b64("file checksum", &p))
                    .transpose()?;
                Ok(TarSplitEntry::File {
                    name,
                    size: raw.size.unwrap_or(0),
                    crc64,
                })
            }
            TYPE_SEGMENT => {
                let payload = raw
                    .payload
                    .map(|p| decode_b64("segment", &p))
                    .transpose()?
                    .unwrap_or_default();
                Ok(TarSplitEntry::Segment(payload))
            }
            other => Err(ChunkedError::TarSplitError(format!(
                "invalid tar-split entry type: {other}"
            ))),
        }
    }
}

/// Parse a tar-split stream, gunzipping it first if needed.
pub fn parse_tar_split(data: &[u8]) -> Result<Vec<TarSplitEntry>> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decoded)?;
        return parse_tar_split(&decoded);
    }
    serde_json::Deserializer::from_slice(data)
        .into_iter::<RawEntry>()
        .map(|raw| TarSplitEntry::try_from(raw?))
        .collect()
}

/// A decoded tar-split stream together with its parsed records.
#[derive(Debug, Clone, Default)]
pub struct TarSplit {
    /// Decoded NDJSON, as stored alongside the layer.
    pub raw: Vec<u8>,
    /// Parsed records.
    pub entries: Vec<TarSplitEntry>,
}

impl TarSplit {
    /// Parse `raw`, keeping it.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let entries = parse_tar_split(&raw)?;
        Ok(Self { raw, entries })
    }

    /// Size of the tar stream this describes.
    pub fn tar_size(&self) -> u64 {
        tar_size(&self.entries)
    }
}

/// Size of the tar stream described by `entries`.
pub fn tar_size(entries: &[TarSplitEntry]) -> u64 {
    entries
        .iter()
        .map(|e| match e {
            TarSplitEntry::File { size, .. } => *size,
            TarSplitEntry::Segment(payload) => payload.len() as u64,
        })
        .sum()
}

/// Source of file bodies when regenerating a tar stream.
pub trait FileGetter {
    /// Open the body of the file recorded under `name`.
    fn open(&self, name: &str) -> Result<Box<dyn Read + '_>>;
}

/// Reads bodies from a staged destination directory.
#[derive(Debug)]
pub struct StagedFileGetter<'a> {
    root: &'a Dir,
    flat_paths: Option<&'a BTreeMap<String, String>>,
}

impl<'a> StagedFileGetter<'a> {
    /// Bodies are read from `root` by their cleaned tar name, or through
    /// `flat_paths` (cleaned name to flat path) for flat layouts.
    pub fn new(root: &'a Dir, flat_paths: Option<&'a BTreeMap<String, String>>) -> Self {
        Self { root, flat_paths }
    }
}

impl FileGetter for StagedFileGetter<'_> {
    fn open(&self, name: &str) -> Result<Box<dyn Read + '_>> {
        let cleaned = clean_rel_path(name);
        let path = match self.flat_paths {
            Some(map) => map.get(&cleaned).ok_or_else(|| {
                ChunkedError::TarSplitError(format!("no flat path for {name:?}"))
            })?,
            None => &cleaned,
        };
        Ok(Box::new(self.root.open(path)?))
    }
}

struct CrcTee<'a, W> {
    inner: W,
    digest: crc::Digest<'a, u64>,
    written: u64,
}

impl<W: Write> Write for CrcTee<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Regenerate the tar stream into `out`, verifying file bodies against their
/// recorded CRC-64 where one is present.
pub fn write_output_tar_stream<W: Write>(
    entries: &[TarSplitEntry],
    getter: &dyn FileGetter,
    out: &mut W,
) -> Result<()> {
    for entry in entries {
        match entry {
            TarSplitEntry::Segment(payload) => out.write_all(payload)?,
            TarSplitEntry::File { size: 0, .. } => {}
            TarSplitEntry::File { name, size, crc64 } => {
                let body = getter.open(name)?;
                let mut tee = CrcTee {
                    inner: &mut *out,
                    digest: CRC64_ISO.digest(),
                    written: 0,
                };
                io::copy(&mut body.take(*size), &mut tee)?;
                if tee.written != *size {
                    return Err(ChunkedError::TarSplitError(format!(
                        "{name:?} is {} bytes, expected {size}",
                        tee.written
                    )));
                }
                let actual = tee.digest.finalize().to_be_bytes();
                if let Some(expected) = crc64
                    && expected.as_slice() != actual
                {
                    return Err(ChunkedError::ChecksumMismatch {
                        path: name.clone(),
                        expected: hex::encode(expected),
                        actual: hex::encode(actual),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Presents the stream as a tar archive with zero-filled bodies, which is all
/// a header parser needs.
struct HeaderStream<'a> {
    entries: std::slice::Iter<'a, TarSplitEntry>,
    current: &'a [u8],
    zeros: u64,
}

impl Read for HeaderStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.read(buf)?;
                return Ok(n);
            }
            if self.zeros > 0 {
                let n = buf.len().min(usize::try_from(self.zeros).unwrap_or(usize::MAX));
                buf[..n].fill(0);
                self.zeros -= n as u64;
                return Ok(n);
            }
            match self.entries.next() {
                Some(TarSplitEntry::Segment(payload)) => self.current = payload,
                Some(TarSplitEntry::File { size, .. }) => self.zeros = *size,
                None => return Ok(0),
            }
        }
    }
}

/// Describe every member of the tar stream recorded in `entries`.
pub fn iterate_headers(entries: &[TarSplitEntry]) -> Result<Vec<FileEntry>> {
    let stream = HeaderStream {
        entries: entries.iter(),
        current: &[],
        zeros: 0,
    };
    let mut archive = tar::Archive::new(stream);
    let mut headers = Vec::new();
    for member in archive.entries()? {
        let mut member = member?;
        headers.push(FileEntry::from_tar(&mut member)?);
    }
    Ok(headers)
}

/// Check that the TOC and the tar-split describe the same files with the same
/// attributes.
///
/// The TOC is what drives reconstruction while the tar-split defines the layer
/// digest, so any disagreement would let the two diverge.
pub fn ensure_toc_matches_tar_split(toc: &Toc, tar_split: &[TarSplitEntry]) -> Result<()> {
    let mut pending: HashMap<&str, &FileEntry> = HashMap::new();
    for e in toc.entries.iter().filter(|e| e.entry_type != EntryType::Chunk) {
        if pending.insert(e.name.as_str(), e).is_some() {
            return Err(ChunkedError::InvalidToc(format!(
                "TOC contains duplicate entries for path {:?}",
                e.name
            )));
        }
    }
    for header in iterate_headers(tar_split)? {
        let toc_entry = pending.remove(header.name.as_str()).ok_or_else(|| {
            ChunkedError::TarSplitError(format!(
                "tar-split contains an entry for {:?} missing in TOC",
                header.name
            ))
        })?;
        ensure_attributes_match(toc_entry, &header).map_err(|e| {
            ChunkedError::TarSplitError(format!("TOC and tar-split metadata doesn't match: {e}"))
        })?;
    }
    if !pending.is_empty() {
        let mut remaining: Vec<&str> = pending.into_keys().collect();
        remaining.sort_unstable();
        remaining.truncate(5);
        return Err(ChunkedError::TarSplitError(format!(
            "TOC contains entries not present in tar-split, incl. {remaining:?}"
        )));
    }
    Ok(())
}
