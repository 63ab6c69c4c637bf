//! Table of Contents (TOC) of a chunked layer.
//!
//! The TOC is the JSON manifest embedded in zstd:chunked and eStargz blobs. It
//! lists every tar member of the layer and, for regular files, where their
//! content lives in the compressed blob. Large files are split into chunks: the
//! record of a regular file describes its first chunk and is immediately
//! followed by `chunk` records for the rest.
//!
//! # Parsing
//!
//! [`parse_manifest`] is deliberately strict about trailing data: the TOC digest
//! covers the whole document, so anything after the top-level object is an
//! error. Field names are matched case-insensitively and unknown fields are
//! skipped.
//!
//! # Example
//!
//! ```
//! use cstor_chunked::toc::{FileType, merge_entries, parse_manifest};
//!
//! let manifest = br#"{"version":1,"entries":[
//!     {"type":"reg","name":"big","size":8,"offset":100,"chunkSize":4,"digest":"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"},
//!     {"type":"chunk","name":"big","offset":200,"chunkOffset":4,"chunkSize":4}
//! ]}"#;
//! let toc = parse_manifest(manifest)?;
//! let merged = merge_entries(FileType::ZstdChunked, &toc.entries, 300)?;
//! assert_eq!(merged.len(), 1);
//! assert_eq!(merged[0].chunks[0].end_offset, 200);
//! assert_eq!(merged[0].chunks[1].end_offset, 300);
//! # Ok::<(), cstor_chunked::ChunkedError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;

use base64::prelude::*;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::digest::{Digest, Digester, EMPTY_SHA256};
use crate::error::{ChunkedError, Result};

/// eStargz bookkeeping files that are not part of the layer content.
const ESTARGZ_METADATA_FILES: [&str; 3] = [
    ".prefetch.landmark",
    ".no.prefetch.landmark",
    "stargz.index.json",
];

/// Compression of the blob the TOC describes.
///
/// Selects how chunk data read from the blob must be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Each chunk is an independent zstd frame.
    ZstdChunked,
    /// Each chunk is an independent gzip member.
    Estargz,
    /// Chunk bytes are stored as-is.
    Uncompressed,
    /// No bytes at all: the content is zeros.
    Hole,
}

/// Type of a TOC record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file (first chunk).
    #[default]
    Reg,
    /// Continuation chunk of the preceding regular file.
    Chunk,
    /// Hard link to `linkname`.
    Hardlink,
    /// Symbolic link.
    Symlink,
    /// Directory.
    Dir,
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// FIFO (named pipe).
    Fifo,
}

impl EntryType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "reg" => EntryType::Reg,
            "chunk" => EntryType::Chunk,
            "hardlink" => EntryType::Hardlink,
            "symlink" => EntryType::Symlink,
            "dir" => EntryType::Dir,
            "char" => EntryType::Char,
            "block" => EntryType::Block,
            "fifo" => EntryType::Fifo,
            _ => return None,
        })
    }

    /// Tar typeflag for this entry type.
    pub fn typeflag(self) -> u8 {
        match self {
            EntryType::Reg | EntryType::Chunk => b'0',
            EntryType::Hardlink => b'1',
            EntryType::Symlink => b'2',
            EntryType::Char => b'3',
            EntryType::Block => b'4',
            EntryType::Dir => b'5',
            EntryType::Fifo => b'6',
        }
    }

    /// Convert from a tar typeflag byte.
    pub fn from_typeflag(typeflag: u8) -> Option<Self> {
        match typeflag {
            b'0' | b'\0' | b'7' => Some(EntryType::Reg),
            b'1' => Some(EntryType::Hardlink),
            b'2' => Some(EntryType::Symlink),
            b'3' => Some(EntryType::Char),
            b'4' => Some(EntryType::Block),
            b'5' => Some(EntryType::Dir),
            b'6' => Some(EntryType::Fifo),
            _ => None,
        }
    }
}

/// Kind of data held by a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkType {
    /// Regular data.
    #[default]
    Data,
    /// All zeros; no bytes need to be read.
    Zeros,
}

impl ChunkType {
    fn is_data(&self) -> bool {
        *self == ChunkType::Data
    }
}

impl Serialize for ChunkType {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ChunkType::Data => s.serialize_str(""),
            ChunkType::Zeros => s.serialize_str("zeros"),
        }
    }
}

/// One record of the TOC.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileEntry {
    /// Record type.
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Path of the entry in the layer.
    pub name: String,
    /// Link target for symlinks and hard links.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub linkname: String,
    /// Permission bits.
    #[serde(skip_serializing_if = "is_zero")]
    pub mode: u32,
    /// File size (whole file, not chunk).
    #[serde(skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Owner.
    #[serde(skip_serializing_if = "is_zero")]
    pub uid: u32,
    /// Group.
    #[serde(skip_serializing_if = "is_zero")]
    pub gid: u32,
    /// Modification time.
    #[serde(rename = "modtime", serialize_with = "ser_time", skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    /// Access time.
    #[serde(rename = "accesstime", serialize_with = "ser_time", skip_serializing_if = "Option::is_none")]
    pub access_time: Option<DateTime<Utc>>,
    /// Change time.
    #[serde(rename = "changetime", serialize_with = "ser_time", skip_serializing_if = "Option::is_none")]
    pub change_time: Option<DateTime<Utc>>,
    /// Major device number.
    #[serde(rename = "devMajor", skip_serializing_if = "is_zero")]
    pub devmajor: u32,
    /// Minor device number.
    #[serde(rename = "devMinor", skip_serializing_if = "is_zero")]
    pub devminor: u32,
    /// Whole-file content digest (first record of a file only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Start of this chunk in the blob.
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// End of this chunk in the blob; zero when omitted.
    #[serde(rename = "endOffset", skip_serializing_if = "is_zero")]
    pub end_offset: u64,
    /// Uncompressed size of this chunk; zero means "rest of the file".
    #[serde(rename = "chunkSize", skip_serializing_if = "is_zero")]
    pub chunk_size: u64,
    /// Offset of this chunk within the uncompressed file.
    #[serde(rename = "chunkOffset", skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,
    /// Digest of this chunk's uncompressed content.
    #[serde(rename = "chunkDigest", skip_serializing_if = "Option::is_none")]
    pub chunk_digest: Option<String>,
    /// Data or zeros.
    #[serde(rename = "chunkType", skip_serializing_if = "ChunkType::is_data")]
    pub chunk_type: ChunkType,
    /// Extended attributes, values base64 encoded.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,
}

fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

fn ser_time<S: Serializer>(
    t: &Option<DateTime<Utc>>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match t {
        Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        None => s.serialize_none(),
    }
}

impl FileEntry {
    /// Create an entry with only type and name set.
    pub fn new(entry_type: EntryType, name: impl Into<String>) -> Self {
        Self {
            entry_type,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Compute the hard-link fingerprint of this entry.
    ///
    /// The fingerprint covers the content digest, owner, group, mode and
    /// extended attributes, so two files share it only if one can replace
    /// the other as a hard link without changing observable metadata.
    pub fn hard_link_fingerprint(&self) -> String {
        let mut d = Digester::new();
        d.update(self.digest.as_deref().unwrap_or_default().as_bytes());
        d.update(format!("{}:{}:{:o}", self.uid, self.gid, self.mode).as_bytes());
        for (k, v) in &self.xattrs {
            d.update(k.as_bytes());
            d.update(v.as_bytes());
        }
        d.finish().to_string()
    }

    /// Describe a tar member.
    ///
    /// Location fields (offsets, chunks, digests) are left for the caller.
    pub fn from_tar<R: std::io::Read>(entry: &mut tar::Entry<'_, R>) -> Result<Self> {
        let header = entry.header();
        let typeflag = header.entry_type().as_byte();
        let entry_type = EntryType::from_typeflag(typeflag).ok_or_else(|| {
            ChunkedError::InvalidToc(format!("unknown tarball type: {typeflag}"))
        })?;
        let mode = header.mode()?;
        let mut uid = header.uid()?;
        let mut gid = header.gid()?;
        let mtime = header.mtime()?;
        // Writers commonly leave the device fields blank for non-device members.
        let devmajor = header.device_major().ok().flatten().unwrap_or(0);
        let devminor = header.device_minor().ok().flatten().unwrap_or(0);

        let mut e = FileEntry::new(
            entry_type,
            String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
        );
        e.linkname = entry
            .link_name_bytes()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .unwrap_or_default();
        e.mode = mode;
        e.size = entry.size();
        e.mod_time = i64::try_from(mtime)
            .ok()
            .and_then(|t| DateTime::from_timestamp(t, 0));
        e.devmajor = devmajor;
        e.devminor = devminor;

        if let Some(pax) = entry.pax_extensions()? {
            for ext in pax {
                let ext = ext?;
                let Ok(key) = ext.key() else {
                    continue;
                };
                let value = ext.value_bytes();
                match key {
                    "mtime" => e.mod_time = pax_time(value).or(e.mod_time),
                    "atime" => e.access_time = pax_time(value),
                    "ctime" => e.change_time = pax_time(value),
                    "uid" => uid = ext.value().ok().and_then(|v| v.parse().ok()).unwrap_or(uid),
                    "gid" => gid = ext.value().ok().and_then(|v| v.parse().ok()).unwrap_or(gid),
                    _ => {
                        if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
                            e.xattrs
                                .insert(name.to_string(), BASE64_STANDARD.encode(value));
                        }
                    }
                }
            }
        }
        e.uid = u32::try_from(uid)
            .map_err(|_| ChunkedError::InvalidToc(format!("uid {uid} out of range")))?;
        e.gid = u32::try_from(gid)
            .map_err(|_| ChunkedError::InvalidToc(format!("gid {gid} out of range")))?;
        Ok(e)
    }
}

/// PAX record prefix carrying extended attributes.
const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

fn pax_time(value: &[u8]) -> Option<DateTime<Utc>> {
    let s = std::str::from_utf8(value).ok()?;
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse().ok()?
    };
    DateTime::from_timestamp(secs, nanos)
}

/// Times at the Unix epoch are treated as absent.
fn normalized_time(t: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    t.filter(|t| t.timestamp() != 0 || t.timestamp_subsec_nanos() != 0)
}

/// Check that two entries describe the same file attributes.
///
/// Location, digest and chunk fields are not compared.
pub fn ensure_attributes_match(a: &FileEntry, b: &FileEntry) -> Result<()> {
    fn check<T: PartialEq + fmt::Debug>(field: &str, a: T, b: T) -> Result<()> {
        if a == b {
            Ok(())
        } else {
            Err(ChunkedError::InvalidToc(format!(
                "mismatch of {field}: {a:?} != {b:?}"
            )))
        }
    }
    check("type", a.entry_type, b.entry_type)?;
    check("name", &a.name, &b.name)?;
    check("linkname", &a.linkname, &b.linkname)?;
    check("mode", a.mode, b.mode)?;
    check("size", a.size, b.size)?;
    check("uid", a.uid, b.uid)?;
    check("gid", a.gid, b.gid)?;
    check("modtime", normalized_time(a.mod_time), normalized_time(b.mod_time))?;
    check(
        "accesstime",
        normalized_time(a.access_time),
        normalized_time(b.access_time),
    )?;
    check(
        "changetime",
        normalized_time(a.change_time),
        normalized_time(b.change_time),
    )?;
    check("devmajor", a.devmajor, b.devmajor)?;
    check("devminor", a.devminor, b.devminor)?;
    check("xattrs", &a.xattrs, &b.xattrs)
}

/// Parsed TOC document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Toc {
    /// Format version.
    pub version: i64,
    /// Records in layer order.
    pub entries: Vec<FileEntry>,
    /// Digest of the compressed tar-split, when the layer carries one.
    #[serde(
        rename = "tarSplitDigest",
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_digest"
    )]
    pub tar_split_digest: Option<Digest>,
}

fn ser_digest<S: Serializer>(d: &Option<Digest>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.collect_str(d),
        None => s.serialize_none(),
    }
}

/// Parse a TOC manifest, rejecting any data after the top-level object.
pub fn parse_manifest(bytes: &[u8]) -> Result<Toc> {
    let mut de = serde_json::Deserializer::from_slice(bytes);
    let toc = Toc::deserialize(&mut de).map_err(|e| ChunkedError::InvalidToc(e.to_string()))?;
    de.end()
        .map_err(|_| ChunkedError::InvalidToc("unexpected data after manifest".to_string()))?;
    Ok(toc)
}

fn parse_time<E: de::Error>(s: Option<String>) -> std::result::Result<Option<DateTime<Utc>>, E> {
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| E::custom(format!("invalid time {s:?}: {e}"))),
    }
}

impl<'de> Deserialize<'de> for FileEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = FileEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a TOC entry object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<FileEntry, A::Error> {
                let mut e = FileEntry::new(EntryType::Reg, "");
                let mut entry_type: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.to_ascii_lowercase().as_str() {
                        "type" => entry_type = map.next_value()?,
                        "name" => e.name = map.next_value::<Option<String>>()?.unwrap_or_default(),
                        "linkname" => {
                            e.linkname = map.next_value::<Option<String>>()?.unwrap_or_default()
                        }
                        "mode" => e.mode = map.next_value()?,
                        "size" => e.size = map.next_value()?,
                        "uid" => e.uid = map.next_value()?,
                        "gid" => e.gid = map.next_value()?,
                        "modtime" => e.mod_time = parse_time(map.next_value()?)?,
                        "accesstime" => e.access_time = parse_time(map.next_value()?)?,
                        "changetime" => e.change_time = parse_time(map.next_value()?)?,
                        "devmajor" => e.devmajor = map.next_value()?,
                        "devminor" => e.devminor = map.next_value()?,
                        "digest" => {
                            e.digest = map
                                .next_value::<Option<String>>()?
                                .filter(|s| !s.is_empty())
                        }
                        "offset" => e.offset = map.next_value()?,
                        "endoffset" => e.end_offset = map.next_value()?,
                        "chunksize" => e.chunk_size = map.next_value()?,
                        "chunkoffset" => e.chunk_offset = map.next_value()?,
                        "chunkdigest" => {
                            e.chunk_digest = map
                                .next_value::<Option<String>>()?
                                .filter(|s| !s.is_empty())
                        }
                        "chunktype" => {
                            let t: Option<String> = map.next_value()?;
                            e.chunk_type = match t.as_deref() {
                                Some("zeros") => ChunkType::Zeros,
                                _ => ChunkType::Data,
                            };
                        }
                        "xattrs" => {
                            e.xattrs = map
                                .next_value::<Option<BTreeMap<String, String>>>()?
                                .unwrap_or_default()
                        }
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                let t = entry_type.unwrap_or_default();
                e.entry_type = EntryType::parse(&t)
                    .ok_or_else(|| de::Error::custom(format!("unknown entry type {t:?}")))?;
                if e.entry_type == EntryType::Reg && e.size == 0 && e.digest.is_none() {
                    e.digest = Some(EMPTY_SHA256.to_string());
                }
                Ok(e)
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

impl<'de> Deserialize<'de> for Toc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TocVisitor;

        impl<'de> Visitor<'de> for TocVisitor {
            type Value = Toc;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a TOC object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Toc, A::Error> {
                let mut toc = Toc::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.to_ascii_lowercase().as_str() {
                        "version" => toc.version = map.next_value()?,
                        "entries" => {
                            toc.entries = map.next_value::<Option<Vec<FileEntry>>>()?.unwrap_or_default()
                        }
                        "tarsplitdigest" => {
                            let s: String = map.next_value()?;
                            let d = Digest::parse(&s).map_err(|_| {
                                de::Error::custom(format!("invalid tarSplitDigest {s:?}"))
                            })?;
                            toc.tar_split_digest = Some(d);
                        }
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(toc)
            }
        }

        deserializer.deserialize_map(TocVisitor)
    }
}

/// A TOC record with its chunks collapsed into one list.
#[derive(Debug, Clone)]
pub struct MergedEntry {
    /// The file's own record; `end_offset` is that of its last chunk.
    pub entry: FileEntry,
    /// Regular files only: the file record followed by its chunk records,
    /// each with `end_offset` filled in.
    pub chunks: Vec<FileEntry>,
    /// Do not touch ownership, mode, times or xattrs of this file.
    pub skip_set_attrs: bool,
}

impl MergedEntry {
    fn new(entry: FileEntry) -> Self {
        Self {
            entry,
            chunks: Vec::new(),
            skip_set_attrs: false,
        }
    }
}

fn must_skip(file_type: FileType, e: &FileEntry) -> bool {
    file_type == FileType::Estargz && ESTARGZ_METADATA_FILES.contains(&e.name.as_str())
}

/// Collapse chunk records into their files and fill in omitted end offsets.
///
/// `toc_offset` is where the TOC starts in the blob, i.e. where the data of
/// the last chunk ends.
pub fn merge_entries(
    file_type: FileType,
    entries: &[FileEntry],
    toc_offset: u64,
) -> Result<Vec<MergedEntry>> {
    let mut merged = Vec::with_capacity(entries.len());
    let mut i = 0;
    while i < entries.len() {
        let e = &entries[i];
        if must_skip(file_type, e) {
            i += 1;
            continue;
        }
        if e.entry_type == EntryType::Chunk {
            return Err(ChunkedError::InvalidToc(format!(
                "chunk type without a regular file: {:?}",
                e.name
            )));
        }
        let mut m = MergedEntry::new(e.clone());
        if e.entry_type == EntryType::Reg {
            let n = entries[i + 1..]
                .iter()
                .take_while(|c| c.entry_type == EntryType::Chunk)
                .count();
            m.chunks = entries[i..=i + n].to_vec();
            m.entry.end_offset = entries[i + n].end_offset;
            i += n;
        }
        merged.push(m);
        i += 1;
    }

    // Walk backwards: each record's data ends where the next one starts.
    let mut last_offset = toc_offset;
    for m in merged.iter_mut().rev() {
        if m.entry.end_offset == 0 {
            m.entry.end_offset = last_offset;
        }
        if m.entry.offset != 0 {
            last_offset = m.entry.offset;
        }
        let mut last_chunk_offset = m.entry.end_offset;
        for c in m.chunks.iter_mut().rev() {
            c.end_offset = last_chunk_offset;
            last_chunk_offset = c.offset;
        }
    }
    Ok(merged)
}

/// Path of a regular file in the flat layout: `<hex[..2]>/<hex[2..]>`.
pub fn flat_path_for_digest(digest: &str) -> Result<String> {
    let d = Digest::parse(digest)?;
    let hex = d.encoded();
    if hex.len() < 3 {
        return Err(ChunkedError::InvalidDigest(digest.to_string()));
    }
    Ok(format!("{}/{}", &hex[..2], &hex[2..]))
}

/// Rewrite merged entries into the flat layout.
///
/// Keeps one entry per distinct regular-file digest, renamed to its flat path
/// with attribute replay disabled. When `name_map` is given, it receives a
/// mapping from every original (cleaned) name to its flat path.
pub fn make_entries_flat(
    entries: Vec<MergedEntry>,
    mut name_map: Option<&mut BTreeMap<String, String>>,
) -> Result<Vec<MergedEntry>> {
    let mut known = std::collections::HashSet::new();
    let mut out = Vec::new();
    for mut m in entries {
        if m.entry.entry_type != EntryType::Reg {
            continue;
        }
        let digest = m
            .entry
            .digest
            .as_deref()
            .ok_or_else(|| ChunkedError::InvalidToc(format!("missing digest for {:?}", m.entry.name)))?;
        let path = flat_path_for_digest(digest)?;
        if let Some(map) = name_map.as_deref_mut() {
            map.insert(crate::fsutil::clean_rel_path(&m.entry.name), path.clone());
        }
        if !known.insert(path.clone()) {
            continue;
        }
        m.entry.name = path;
        m.skip_set_attrs = true;
        out.push(m);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> String {
        Digest::sha256_of(data).to_string()
    }

    #[test]
    fn test_parse_case_insensitive_and_unknown_fields() {
        let manifest = br#"{"Version": 1, "extra": {"a": [1,2]}, "ENTRIES": [
            {"type":"dir","name":"etc","mode":493,"ModTime":"2024-01-15T12:40:45Z","foo":"bar"},
            {"type":"reg","name":"etc/hosts","size":3,"digest":"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855","xattrs":{"user.a":"Yg=="}}
        ]}"#;
        let toc = parse_manifest(manifest).unwrap();
        assert_eq!(toc.version, 1);
        assert_eq!(toc.entries.len(), 2);
        assert_eq!(toc.entries[0].entry_type, EntryType::Dir);
        assert_eq!(toc.entries[0].mode, 0o755);
        assert_eq!(toc.entries[0].mod_time.unwrap().timestamp(), 1705322445);
        assert_eq!(toc.entries[1].xattrs.get("user.a").unwrap(), "Yg==");
    }

    #[test]
    fn test_parse_rejects_trailing_data() {
        let good = br#"{"version":1,"entries":[]}"#;
        assert!(parse_manifest(good).is_ok());
        let mut with_ws = good.to_vec();
        with_ws.extend_from_slice(b"\n  ");
        assert!(parse_manifest(&with_ws).is_ok());

        let mut bad = good.to_vec();
        bad.extend_from_slice(b"{}");
        let err = parse_manifest(&bad).unwrap_err();
        assert!(matches!(err, ChunkedError::InvalidToc(_)));

        let mut junk = good.to_vec();
        junk.extend_from_slice(b"garbage");
        assert!(parse_manifest(&junk).is_err());
    }

    #[test]
    fn test_parse_empty_regular_file_gets_empty_digest() {
        let toc = parse_manifest(br#"{"entries":[{"type":"reg","name":"empty"}]}"#).unwrap();
        assert_eq!(toc.entries[0].digest.as_deref(), Some(EMPTY_SHA256));

        let toc = parse_manifest(br#"{"entries":[{"type":"dir","name":"d"}]}"#).unwrap();
        assert_eq!(toc.entries[0].digest, None);
    }

    #[test]
    fn test_parse_tar_split_digest() {
        let toc = parse_manifest(
            br#"{"entries":[],"tarSplitDigest":"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}"#,
        )
        .unwrap();
        assert_eq!(toc.tar_split_digest.unwrap().to_string(), EMPTY_SHA256);
        assert!(parse_manifest(br#"{"tarSplitDigest":"nope"}"#).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_type_and_bad_time() {
        assert!(parse_manifest(br#"{"entries":[{"type":"socket","name":"s"}]}"#).is_err());
        assert!(
            parse_manifest(br#"{"entries":[{"type":"dir","name":"d","modtime":"yesterday"}]}"#)
                .is_err()
        );
    }

    #[test]
    fn test_serialize_roundtrips_through_parser() {
        let mut e = FileEntry::new(EntryType::Reg, "a/b");
        e.size = 5;
        e.mode = 0o644;
        e.digest = Some(digest_of(b"hello"));
        e.offset = 10;
        e.end_offset = 15;
        e.chunk_type = ChunkType::Zeros;
        e.mod_time = DateTime::from_timestamp(1_700_000_000, 0);
        let toc = Toc {
            version: 1,
            entries: vec![e],
            tar_split_digest: None,
        };
        let json = serde_json::to_vec(&toc).unwrap();
        assert_eq!(parse_manifest(&json).unwrap(), toc);
    }

    #[test]
    fn test_merge_chunks_into_file() {
        let mut reg = FileEntry::new(EntryType::Reg, "f");
        reg.size = 12;
        reg.offset = 100;
        reg.end_offset = 110;
        reg.chunk_size = 4;
        reg.digest = Some(digest_of(b"x"));
        let mut c1 = FileEntry::new(EntryType::Chunk, "f");
        c1.offset = 110;
        c1.end_offset = 120;
        c1.chunk_offset = 4;
        c1.chunk_size = 4;
        let mut c2 = FileEntry::new(EntryType::Chunk, "f");
        c2.offset = 120;
        c2.end_offset = 130;
        c2.chunk_offset = 8;
        let dir = FileEntry::new(EntryType::Dir, "d");

        let merged =
            merge_entries(FileType::ZstdChunked, &[dir.clone(), reg, c1, c2, dir], 500).unwrap();
        assert_eq!(merged.len(), 3);
        let f = &merged[1];
        assert_eq!(f.chunks.len(), 3);
        assert_eq!(f.entry.end_offset, 130);
        assert_eq!(
            f.chunks.iter().map(|c| (c.offset, c.end_offset)).collect::<Vec<_>>(),
            vec![(100, 110), (110, 120), (120, 130)]
        );
        assert!(merged[0].chunks.is_empty());
    }

    #[test]
    fn test_merge_fills_missing_end_offsets_backwards() {
        let mut a = FileEntry::new(EntryType::Reg, "a");
        a.size = 1;
        a.offset = 10;
        let mut a2 = FileEntry::new(EntryType::Chunk, "a");
        a2.offset = 30;
        let dir = FileEntry::new(EntryType::Dir, "d");
        let mut b = FileEntry::new(EntryType::Reg, "b");
        b.size = 1;
        b.offset = 50;

        let merged = merge_entries(FileType::Estargz, &[a, a2, dir, b], 80).unwrap();
        let a = &merged[0];
        assert_eq!(a.entry.end_offset, 50);
        assert_eq!(a.chunks[0].end_offset, 30);
        assert_eq!(a.chunks[1].end_offset, 50);
        assert_eq!(merged[1].entry.end_offset, 50);
        assert_eq!(merged[2].chunks[0].end_offset, 80);
    }

    #[test]
    fn test_merge_rejects_orphan_chunk() {
        let c = FileEntry::new(EntryType::Chunk, "x");
        assert!(merge_entries(FileType::ZstdChunked, &[c], 0).is_err());
    }

    #[test]
    fn test_merge_skips_estargz_landmarks() {
        let landmark = FileEntry::new(EntryType::Reg, ".prefetch.landmark");
        let f = FileEntry::new(EntryType::Reg, "f");
        let merged =
            merge_entries(FileType::Estargz, &[landmark.clone(), f.clone()], 0).unwrap();
        assert_eq!(merged.len(), 1);
        let merged = merge_entries(FileType::ZstdChunked, &[landmark, f], 0).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_hard_link_fingerprint_covers_metadata() {
        let mut a = FileEntry::new(EntryType::Reg, "a");
        a.digest = Some(digest_of(b"content"));
        a.mode = 0o644;
        let base = a.hard_link_fingerprint();

        let mut b = a.clone();
        b.name = "other/name".into();
        assert_eq!(b.hard_link_fingerprint(), base);

        b.uid = 1;
        assert_ne!(b.hard_link_fingerprint(), base);

        let mut c = a.clone();
        c.xattrs.insert("user.k".into(), "dg==".into());
        assert_ne!(c.hard_link_fingerprint(), base);
    }

    #[test]
    fn test_make_entries_flat_dedups() {
        let d = digest_of(b"same");
        let mut a = FileEntry::new(EntryType::Reg, "a");
        a.digest = Some(d.clone());
        let mut b = FileEntry::new(EntryType::Reg, "./dir/b");
        b.digest = Some(d.clone());
        let dir = FileEntry::new(EntryType::Dir, "dir");
        let merged = merge_entries(FileType::ZstdChunked, &[a, dir, b], 0).unwrap();

        let mut map = BTreeMap::new();
        let flat = make_entries_flat(merged, Some(&mut map)).unwrap();
        assert_eq!(flat.len(), 1);
        let expected = flat_path_for_digest(&d).unwrap();
        assert_eq!(flat[0].entry.name, expected);
        assert!(flat[0].skip_set_attrs);
        assert_eq!(map.get("a"), Some(&expected));
        assert_eq!(map.get("dir/b"), Some(&expected));
    }
}
