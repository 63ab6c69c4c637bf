//! Binary lookaside cache for one layer.
//!
//! The cache maps digests (whole-file content, hard-link fingerprints and
//! chunk digests) to the location of that content inside the layer. Layout,
//! all integers little-endian:
//!
//! ```text
//! u64 version
//! u64 tag_len               digest_len + 16
//! u64 digest_len
//! bloom filter              u64 words, u32 k, u64[words]
//! u64 tags_len
//! u64 vdata_len
//! u64 fnames_len
//! tags                      sorted digest ‖ u64 offset ‖ u64 length
//! vdata                     uvarint path_pos, uvarint offset, uvarint length
//! fnames                    u32 length ‖ name, repeated
//! ```
//!
//! A tag's offset and length address a location record in `vdata`, whose
//! `path_pos` is a byte offset into `fnames`.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::ops::Range;

use crate::bloom::BloomFilter;
use crate::config::OutputFormat;
use crate::digest::binary_digest;
use crate::error::{ChunkedError, Result};
use crate::toc::{EntryType, FileEntry, flat_path_for_digest, parse_manifest};

/// Version written into the header; other versions are rebuilt.
pub const CACHE_VERSION: u64 = 3;
/// Bloom filter bits per tag.
const BLOOM_FILTER_SCALE: usize = 10;
/// Number of bloom filter hash functions.
const BLOOM_FILTER_HASHES: u32 = 3;
/// Upper bound for the tags section.
const MAX_TAGS_LEN: u64 = 100_000_000;

/// Where some content lives inside a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Path relative to the layer root.
    pub path: String,
    /// Offset of the content in that file.
    pub offset: u64,
    /// Length of the content.
    pub length: u64,
}

/// Memory holding a serialized cache.
pub enum CacheBuffer {
    /// Memory-mapped cache file, unmapped on drop.
    Mapped(memmap2::Mmap),
    /// Heap copy.
    Owned(Vec<u8>),
}

impl CacheBuffer {
    /// Map `file` read-only, advising random access.
    ///
    /// Empty files cannot be mapped and are reported as an error so the
    /// caller can fall back to reading.
    pub fn map(file: &File) -> std::io::Result<Self> {
        if file.metadata()?.len() == 0 {
            return Err(std::io::Error::other("cannot map an empty cache file"));
        }
        // SAFETY: cache files are written once and replaced, never modified
        // in place, so the mapping does not change under us.
        #[allow(unsafe_code)]
        let map = unsafe { memmap2::Mmap::map(file)? };
        // Best effort.
        let _ = map.advise(memmap2::Advice::Random);
        Ok(CacheBuffer::Mapped(map))
    }

    fn bytes(&self) -> &[u8] {
        match self {
            CacheBuffer::Mapped(m) => m,
            CacheBuffer::Owned(v) => v,
        }
    }

    /// True if backed by a mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self, CacheBuffer::Mapped(_))
    }
}

impl std::fmt::Debug for CacheBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBuffer::Mapped(m) => write!(f, "Mapped({} bytes)", m.len()),
            CacheBuffer::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
        }
    }
}

/// A parsed cache file.
#[derive(Debug)]
pub struct CacheFile {
    buffer: CacheBuffer,
    tag_len: usize,
    digest_len: usize,
    bloom: BloomFilter,
    tags: Range<usize>,
    vdata: Range<usize>,
    fnames: Range<usize>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u64(&mut self, what: &str) -> Result<u64> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or_else(|| ChunkedError::CorruptIndex(format!("truncated reading {what}")))?;
        self.pos += 8;
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(b))
    }
}

impl CacheFile {
    /// Parse a serialized cache.
    ///
    /// Returns `Ok(None)` when the cache was written with another format
    /// version, and [`ChunkedError::CorruptIndex`] when its declared lengths
    /// are inconsistent with the buffer.
    pub fn parse(buffer: CacheBuffer) -> Result<Option<Self>> {
        let buf = buffer.bytes();
        let mut r = Reader { buf, pos: 0 };
        if r.u64("version")? != CACHE_VERSION {
            return Ok(None);
        }
        let tag_len = r.u64("tag length")?;
        let digest_len = r.u64("digest length")?;
        let (bloom, used) = BloomFilter::read_from(&buf[r.pos..])?;
        r.pos += used;
        let tags_len = r.u64("tags length")?;
        let vdata_len = r.u64("vdata length")?;
        let fnames_len = r.u64("fnames length")?;

        if tags_len > MAX_TAGS_LEN {
            return Err(ChunkedError::CorruptIndex(format!(
                "tags len {tags_len} exceeds the maximum allowed size {MAX_TAGS_LEN}"
            )));
        }
        // An empty cache has no tags and records no lengths.
        if tag_len != 0 && digest_len.checked_add(16).is_none_or(|min| tag_len < min) {
            return Err(ChunkedError::CorruptIndex(format!(
                "tag len {tag_len} too small for digest len {digest_len}"
            )));
        }
        let remaining = (buf.len() - r.pos) as u64;
        if tags_len > remaining {
            return Err(ChunkedError::CorruptIndex(format!(
                "tags len {tags_len} exceeds the remaining buffer size {remaining}"
            )));
        }
        let tags = r.pos..r.pos + tags_len as usize;
        let remaining = remaining - tags_len;
        if vdata_len > remaining {
            return Err(ChunkedError::CorruptIndex(format!(
                "vdata len {vdata_len} exceeds the remaining buffer size {remaining}"
            )));
        }
        let vdata = tags.end..tags.end + vdata_len as usize;
        let remaining = remaining - vdata_len;
        if fnames_len > remaining {
            return Err(ChunkedError::CorruptIndex(format!(
                "fnames len {fnames_len} exceeds the remaining buffer size {remaining}"
            )));
        }
        let fnames = vdata.end..vdata.end + fnames_len as usize;

        Ok(Some(Self {
            tag_len: tag_len as usize,
            digest_len: digest_len as usize,
            bloom,
            tags,
            vdata,
            fnames,
            buffer,
        }))
    }

    /// True if the cache is backed by a memory mapping.
    pub fn is_mapped(&self) -> bool {
        self.buffer.is_mapped()
    }

    fn section(&self, r: &Range<usize>) -> &[u8] {
        &self.buffer.bytes()[r.clone()]
    }

    /// Binary search the tag table, returning the `(offset, length)` of the
    /// matching location record.
    fn find_tag(&self, digest: &[u8]) -> Option<(u64, u64)> {
        if self.tag_len == 0 || self.tag_len < self.digest_len.checked_add(16)? {
            return None;
        }
        let tags = self.section(&self.tags);
        let n = tags.len() / self.tag_len;
        let key = |i: usize| &tags[i * self.tag_len..i * self.tag_len + self.digest_len];
        let (mut lo, mut hi) = (0, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if key(mid) < digest {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == n || key(lo) != digest {
            return None;
        }
        let start = lo * self.tag_len + self.digest_len;
        let mut off = [0u8; 8];
        let mut len = [0u8; 8];
        off.copy_from_slice(&tags[start..start + 8]);
        len.copy_from_slice(&tags[start + 8..start + 16]);
        Some((u64::from_le_bytes(off), u64::from_le_bytes(len)))
    }

    /// Look up a binary digest.
    ///
    /// Returns `Ok(None)` when the digest is not indexed and
    /// [`ChunkedError::CorruptIndex`] when the records it points to are
    /// out of bounds.
    pub fn lookup(&self, digest: &[u8]) -> Result<Option<Location>> {
        if !self.bloom.maybe_contains(digest) {
            return Ok(None);
        }
        let Some((off, len)) = self.find_tag(digest) else {
            return Ok(None);
        };
        let corrupt = || ChunkedError::CorruptIndex("location out of bounds".to_string());
        let vdata = self.section(&self.vdata);
        let end = off.checked_add(len).ok_or_else(corrupt)?;
        let record = usize::try_from(off)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(s, e)| vdata.get(s..e))
            .ok_or_else(corrupt)?;
        let (path_pos, offset, length) = parse_location(record).ok_or_else(corrupt)?;

        let fnames = self.section(&self.fnames);
        let name_start = usize::try_from(path_pos)
            .ok()
            .and_then(|p| p.checked_add(4))
            .ok_or_else(corrupt)?;
        let name_len = fnames
            .get(name_start - 4..name_start)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(corrupt)?;
        let name_end = name_start.checked_add(name_len).ok_or_else(corrupt)?;
        let name = fnames.get(name_start..name_end).ok_or_else(corrupt)?;
        Ok(Some(Location {
            path: String::from_utf8_lossy(name).into_owned(),
            offset,
            length,
        }))
    }
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn get_uvarint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut v = 0u64;
    for shift in (0..64).step_by(7) {
        let b = *buf.get(*pos)?;
        *pos += 1;
        if shift == 63 && b > 1 {
            return None;
        }
        v |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Some(v);
        }
    }
    None
}

fn location_record(path_pos: u64, offset: u64, length: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    put_uvarint(&mut buf, path_pos);
    put_uvarint(&mut buf, offset);
    put_uvarint(&mut buf, length);
    buf
}

fn parse_location(record: &[u8]) -> Option<(u64, u64, u64)> {
    let mut pos = 0;
    Some((
        get_uvarint(record, &mut pos)?,
        get_uvarint(record, &mut pos)?,
        get_uvarint(record, &mut pos)?,
    ))
}

/// Entries worth indexing: every entry with a whole-file digest, and the
/// first entry carrying each chunk digest.
fn cache_candidates(manifest: &[u8], format: OutputFormat) -> Result<Vec<FileEntry>> {
    let toc = match parse_manifest(manifest) {
        Ok(toc) => toc,
        Err(e) => {
            tracing::debug!("could not parse manifest: {e}");
            return Ok(Vec::new());
        }
    };
    let mut out = Vec::new();
    match format {
        OutputFormat::Flat => {
            let mut seen = HashSet::new();
            for mut e in toc.entries {
                if e.entry_type != EntryType::Reg {
                    continue;
                }
                let Some(d) = e.digest.as_deref() else {
                    continue;
                };
                let path = flat_path_for_digest(d)?;
                if seen.insert(path.clone()) {
                    e.name = path;
                    e.chunk_digest = None;
                    out.push(e);
                }
            }
        }
        OutputFormat::Dir => {
            let mut chunks_seen = HashSet::new();
            for e in toc.entries {
                if e.digest.is_some() {
                    out.push(e);
                } else if let Some(cd) = &e.chunk_digest
                    && chunks_seen.insert(cd.clone())
                {
                    out.push(e);
                }
            }
        }
    }
    Ok(out)
}

/// Build the serialized cache for a layer from its TOC.
///
/// A manifest that cannot be parsed yields an empty (but valid) cache.
pub fn build_cache(manifest: &[u8], format: OutputFormat) -> Result<Vec<u8>> {
    let entries = cache_candidates(manifest, format)?;

    let mut vdata = Vec::new();
    let mut fnames = Vec::new();
    let mut fname_pos: HashMap<String, u64> = HashMap::new();
    let mut tags: Vec<Vec<u8>> = Vec::new();
    let mut tag_len = 0usize;
    let mut digest_len = 0usize;

    let mut name_position = |name: &str, fnames: &mut Vec<u8>| -> u64 {
        if let Some(pos) = fname_pos.get(name) {
            return *pos;
        }
        let pos = fnames.len() as u64;
        fnames.extend_from_slice(&(name.len() as u32).to_le_bytes());
        fnames.extend_from_slice(name.as_bytes());
        fname_pos.insert(name.to_string(), pos);
        pos
    };
    let mut push_tag = |digest: Vec<u8>, off: u64, len: u64| -> Result<()> {
        let mut tag = digest;
        tag.extend_from_slice(&off.to_le_bytes());
        tag.extend_from_slice(&len.to_le_bytes());
        if tag_len == 0 {
            tag_len = tag.len();
        }
        if tag.len() != tag_len {
            return Err(ChunkedError::InvalidDigest(
                "digest with different length found".to_string(),
            ));
        }
        tags.push(tag);
        Ok(())
    };

    for e in &entries {
        if let Some(d) = &e.digest {
            let content = binary_digest(d)?;
            let fingerprint = binary_digest(&e.hard_link_fingerprint())?;
            let pos = name_position(&e.name, &mut fnames);
            let record = location_record(pos, 0, e.size);
            let off = vdata.len() as u64;
            let len = record.len() as u64;
            push_tag(content, off, len)?;
            digest_len = fingerprint.len();
            push_tag(fingerprint, off, len)?;
            vdata.extend_from_slice(&record);
        }
        if let Some(cd) = &e.chunk_digest {
            let chunk = binary_digest(cd)?;
            let pos = name_position(&e.name, &mut fnames);
            let record = location_record(pos, e.chunk_offset, e.chunk_size);
            digest_len = chunk.len();
            push_tag(chunk, vdata.len() as u64, record.len() as u64)?;
            vdata.extend_from_slice(&record);
        }
    }

    tags.sort();
    let mut bloom = BloomFilter::new(tags.len() * BLOOM_FILTER_SCALE, BLOOM_FILTER_HASHES);
    for t in &tags {
        bloom.add(&t[..digest_len]);
    }

    let tags_len = tags.len() * tag_len;
    let mut out = Vec::with_capacity(
        8 * 6 + bloom.serialized_len() + tags_len + vdata.len() + fnames.len(),
    );
    out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
    out.extend_from_slice(&(tag_len as u64).to_le_bytes());
    out.extend_from_slice(&(digest_len as u64).to_le_bytes());
    bloom.write_to(&mut out)?;
    out.extend_from_slice(&(tags_len as u64).to_le_bytes());
    out.extend_from_slice(&(vdata.len() as u64).to_le_bytes());
    out.extend_from_slice(&(fnames.len() as u64).to_le_bytes());
    for t in &tags {
        out.extend_from_slice(t);
    }
    out.extend_from_slice(&vdata);
    out.extend_from_slice(&fnames);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn sha(data: &[u8]) -> String {
        Digest::sha256_of(data).to_string()
    }

    fn sample_manifest() -> Vec<u8> {
        serde_json::json!({
            "version": 1,
            "entries": [
                {"type": "dir", "name": "usr"},
                {"type": "reg", "name": "usr/a", "size": 5, "digest": sha(b"aaaaa"), "mode": 420,
                 "chunkSize": 3, "chunkDigest": sha(b"aaa")},
                {"type": "chunk", "name": "usr/a", "chunkOffset": 3, "chunkSize": 2, "chunkDigest": sha(b"aa")},
                {"type": "reg", "name": "usr/b", "size": 3, "digest": sha(b"bbb"), "uid": 7},
                {"type": "reg", "name": "usr/c", "size": 3, "digest": sha(b"ccc"), "chunkDigest": sha(b"aaa")},
            ]
        })
        .to_string()
        .into_bytes()
    }

    fn parse(bytes: Vec<u8>) -> CacheFile {
        CacheFile::parse(CacheBuffer::Owned(bytes)).unwrap().unwrap()
    }

    #[test]
    fn test_uvarint() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(get_uvarint(&buf, &mut pos), Some(v));
            assert_eq!(pos, buf.len());
        }
        assert_eq!(get_uvarint(&[0x80, 0x80], &mut 0), None);
    }

    #[test]
    fn test_lookup_files_fingerprints_and_chunks() {
        let cache = parse(build_cache(&sample_manifest(), OutputFormat::Dir).unwrap());
        let find = |d: &str| cache.lookup(&binary_digest(d).unwrap()).unwrap();

        let loc = find(&sha(b"bbb")).unwrap();
        assert_eq!(loc, Location { path: "usr/b".into(), offset: 0, length: 3 });

        let loc = find(&sha(b"aa")).unwrap();
        assert_eq!(loc, Location { path: "usr/a".into(), offset: 3, length: 2 });

        // Only the first entry with a chunk digest is indexed.
        let loc = find(&sha(b"aaa")).unwrap();
        assert_eq!(loc.path, "usr/a");

        let mut b = FileEntry::new(EntryType::Reg, "usr/b");
        b.digest = Some(sha(b"bbb"));
        b.uid = 7;
        let fp = find(&b.hard_link_fingerprint()).unwrap();
        assert_eq!(fp.path, "usr/b");
        b.uid = 8;
        assert!(find(&b.hard_link_fingerprint()).is_none());

        assert!(find(&sha(b"missing")).is_none());
    }

    #[test]
    fn test_flat_format_uses_digest_names() {
        let cache = parse(build_cache(&sample_manifest(), OutputFormat::Flat).unwrap());
        let d = sha(b"aaaaa");
        let loc = cache.lookup(&binary_digest(&d).unwrap()).unwrap().unwrap();
        assert_eq!(loc.path, flat_path_for_digest(&d).unwrap());
        let chunk = cache.lookup(&binary_digest(&sha(b"aa")).unwrap()).unwrap();
        assert!(chunk.is_none());
    }

    #[test]
    fn test_unparseable_manifest_gives_empty_cache() {
        let cache = parse(build_cache(b"not json", OutputFormat::Dir).unwrap());
        assert!(cache.lookup(&binary_digest(&sha(b"x")).unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_is_not_an_error() {
        let mut bytes = build_cache(&sample_manifest(), OutputFormat::Dir).unwrap();
        bytes[..8].copy_from_slice(&2u64.to_le_bytes());
        assert!(CacheFile::parse(CacheBuffer::Owned(bytes)).unwrap().is_none());
    }

    fn header_offsets(bytes: &[u8]) -> usize {
        let (bloom, used) = BloomFilter::read_from(&bytes[24..]).unwrap();
        assert_eq!(used, bloom.serialized_len());
        24 + used
    }

    #[test]
    fn test_oversized_vdata_is_corrupt() {
        let mut bytes = build_cache(&sample_manifest(), OutputFormat::Dir).unwrap();
        let lens = header_offsets(&bytes);
        bytes[lens + 8..lens + 16].copy_from_slice(&(1u64 << 40).to_le_bytes());
        let err = CacheFile::parse(CacheBuffer::Owned(bytes)).unwrap_err();
        assert!(matches!(err, ChunkedError::CorruptIndex(_)), "{err}");
    }

    #[test]
    fn test_oversized_tags_and_digest_len_are_corrupt() {
        let good = build_cache(&sample_manifest(), OutputFormat::Dir).unwrap();
        let lens = header_offsets(&good);

        let mut bytes = good.clone();
        bytes[lens..lens + 8].copy_from_slice(&(MAX_TAGS_LEN + 1).to_le_bytes());
        assert!(CacheFile::parse(CacheBuffer::Owned(bytes)).is_err());

        let mut bytes = good.clone();
        bytes[16..24].copy_from_slice(&1000u64.to_le_bytes());
        assert!(CacheFile::parse(CacheBuffer::Owned(bytes)).is_err());

        assert!(CacheFile::parse(CacheBuffer::Owned(good[..30].to_vec())).is_err());
    }

    #[test]
    fn test_huge_tag_and_digest_len_are_corrupt() {
        let mut bytes = build_cache(&sample_manifest(), OutputFormat::Dir).unwrap();
        bytes[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        bytes[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        let err = CacheFile::parse(CacheBuffer::Owned(bytes)).unwrap_err();
        assert!(matches!(err, ChunkedError::CorruptIndex(_)), "{err}");
    }

    /// A cache with one tag whose location record points at `path_pos`.
    fn single_tag_cache(digest: &[u8], path_pos: u64, fnames: &[u8]) -> Vec<u8> {
        let record = location_record(path_pos, 0, 3);
        let mut bloom = BloomFilter::new(BLOOM_FILTER_SCALE, BLOOM_FILTER_HASHES);
        bloom.add(digest);
        let mut out = Vec::new();
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&(digest.len() as u64 + 16).to_le_bytes());
        out.extend_from_slice(&(digest.len() as u64).to_le_bytes());
        bloom.write_to(&mut out).unwrap();
        out.extend_from_slice(&(digest.len() as u64 + 16).to_le_bytes());
        out.extend_from_slice(&(record.len() as u64).to_le_bytes());
        out.extend_from_slice(&(fnames.len() as u64).to_le_bytes());
        out.extend_from_slice(digest);
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&(record.len() as u64).to_le_bytes());
        out.extend_from_slice(&record);
        out.extend_from_slice(fnames);
        out
    }

    #[test]
    fn test_out_of_range_path_pos_is_corrupt() {
        let digest = binary_digest(&sha(b"bbb")).unwrap();
        let mut fnames = 5u32.to_le_bytes().to_vec();
        fnames.extend_from_slice(b"usr/b");

        let cache = parse(single_tag_cache(&digest, 0, &fnames));
        assert_eq!(cache.lookup(&digest).unwrap().unwrap().path, "usr/b");

        for path_pos in [u64::MAX, u64::MAX - 3, 2] {
            let cache = parse(single_tag_cache(&digest, path_pos, &fnames));
            let err = cache.lookup(&digest).unwrap_err();
            assert!(matches!(err, ChunkedError::CorruptIndex(_)), "{path_pos}: {err}");
        }
    }

    #[test]
    fn test_fnames_len_is_checked() {
        let good = build_cache(&sample_manifest(), OutputFormat::Dir).unwrap();
        let lens = header_offsets(&good);

        let mut bytes = good.clone();
        bytes[lens + 16..lens + 24].copy_from_slice(&(good.len() as u64).to_le_bytes());
        let err = CacheFile::parse(CacheBuffer::Owned(bytes)).unwrap_err();
        assert!(matches!(err, ChunkedError::CorruptIndex(_)), "{err}");

        // A short fnames section is only noticed once a name is read.
        let mut bytes = good;
        bytes[lens + 16..lens + 24].copy_from_slice(&1u64.to_le_bytes());
        let cache = parse(bytes);
        let err = cache.lookup(&binary_digest(&sha(b"bbb")).unwrap()).unwrap_err();
        assert!(matches!(err, ChunkedError::CorruptIndex(_)));
    }

    #[test]
    fn test_map_file() {
        use std::io::Write;
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&build_cache(&sample_manifest(), OutputFormat::Dir).unwrap())
            .unwrap();
        let cache = CacheFile::parse(CacheBuffer::map(&f).unwrap()).unwrap().unwrap();
        assert!(cache.is_mapped());
        assert!(cache.lookup(&binary_digest(&sha(b"bbb")).unwrap()).unwrap().is_some());

        let empty = tempfile::tempfile().unwrap();
        assert!(CacheBuffer::map(&empty).is_err());
    }
}
