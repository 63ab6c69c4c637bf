//! Locating, fetching and authenticating the TOC of a chunked blob.
//!
//! zstd:chunked layers advertise the TOC and tar-split positions in image
//! annotations; eStargz layers describe the TOC position in a fixed-size
//! gzip footer at the end of the blob. Either way the TOC is checked against
//! the digest from the (signed) image manifest before anything else trusts it.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::blob_source::{BlobSource, FanIn, ImageSourceChunk, get_blob_at};
use crate::digest::{Digest, Digester};
use crate::error::{ChunkedError, Result};
use crate::tar_split::{TarSplit, ensure_toc_matches_tar_split};
use crate::toc::{Toc, parse_manifest};

/// Annotation holding the digest of the compressed zstd:chunked TOC.
pub const MANIFEST_CHECKSUM_KEY: &str = "io.github.containers.zstd-chunked.manifest-checksum";
/// Annotation `offset:length:uncompressedLength:type` of the TOC.
pub const MANIFEST_INFO_KEY: &str = "io.github.containers.zstd-chunked.manifest-position";
/// Annotation `offset:length:uncompressedLength` of the tar-split.
pub const TAR_SPLIT_INFO_KEY: &str = "io.github.containers.zstd-chunked.tarsplit-position";
/// Annotation holding the digest of the uncompressed eStargz TOC.
pub const ESTARGZ_TOC_DIGEST_KEY: &str = "containerd.io/snapshot/stargz/toc.digest";

/// The only manifest type defined for zstd:chunked.
const MANIFEST_TYPE_CRFS: u64 = 1;

/// Size of the eStargz footer.
const ESTARGZ_FOOTER_SIZE: u64 = 51;

/// A fetched and verified zstd:chunked TOC.
#[derive(Debug)]
pub struct ZstdChunkedManifest {
    /// Decoded TOC JSON.
    pub manifest: Vec<u8>,
    /// Parsed TOC.
    pub toc: Toc,
    /// Tar-split, present only when the TOC authenticates one.
    pub tar_split: Option<TarSplit>,
    /// Offset of the TOC in the blob.
    pub toc_offset: u64,
}

/// A fetched and verified eStargz TOC.
#[derive(Debug)]
pub struct EstargzManifest {
    /// Decoded TOC JSON.
    pub manifest: Vec<u8>,
    /// Offset of the TOC in the blob.
    pub toc_offset: u64,
}

/// Request `chunks`; a rejected request shape means ranged reads do not work
/// for this source at all, so a full download (or conversion) is advised.
fn fetch(source: &dyn BlobSource, chunks: &[ImageSourceChunk]) -> Result<FanIn> {
    get_blob_at(source, chunks).map_err(|e| match e {
        ChunkedError::BadRequest(msg) => ChunkedError::fallback(msg, true),
        e => e,
    })
}

fn read_blob(fan_in: &mut FanIn, length: u64) -> Result<Vec<u8>> {
    let mut stream = fan_in.next_stream()?;
    let len = usize::try_from(length)
        .map_err(|_| ChunkedError::Internal(format!("blob of {length} bytes")))?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Verify `data` against `expected`.
pub(crate) fn validate_blob(data: &[u8], expected: &Digest) -> Result<()> {
    if expected.algorithm() != "sha256" {
        return Err(ChunkedError::InvalidDigest(expected.to_string()));
    }
    let actual = Digest::sha256_of(data);
    if &actual != expected {
        return Err(ChunkedError::ChecksumMismatch {
            path: "blob".to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// zstd-decode `data`, refusing output larger than `limit`.
fn zstd_decode(data: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    zstd::stream::read::Decoder::new(data)?
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(ChunkedError::fallback(
            format!("decoded metadata exceeds {limit} bytes"),
            false,
        ));
    }
    Ok(out)
}

fn parse_position<const N: usize>(key: &str, value: &str) -> Result<[u64; N]> {
    let invalid = || ChunkedError::InvalidToc(format!("invalid {key} annotation {value:?}"));
    let fields: Vec<u64> = value
        .split(':')
        .map(|f| f.parse().map_err(|_| invalid()))
        .collect::<Result<_>>()?;
    fields.try_into().map_err(|_| invalid())
}

/// Fetch and verify the TOC, and the tar-split if the TOC names one.
pub fn read_zstd_chunked_manifest(
    source: &dyn BlobSource,
    toc_digest: &Digest,
    annotations: &HashMap<String, String>,
    max_toc_size: u64,
) -> Result<ZstdChunkedManifest> {
    let info = annotations
        .get(MANIFEST_INFO_KEY)
        .ok_or_else(|| ChunkedError::InvalidToc(format!("{MANIFEST_INFO_KEY:?} annotation missing")))?;
    let [offset, length, uncompressed_length, manifest_type] =
        parse_position::<4>(MANIFEST_INFO_KEY, info)?;
    let manifest_chunk = ImageSourceChunk { offset, length };
    let tar_split_position = annotations
        .get(TAR_SPLIT_INFO_KEY)
        .map(|v| parse_position::<3>(TAR_SPLIT_INFO_KEY, v))
        .transpose()?
        .filter(|[offset, _, _]| *offset > 0);
    let tar_split_chunk = tar_split_position.map(|[offset, length, _]| ImageSourceChunk { offset, length });

    if manifest_type != MANIFEST_TYPE_CRFS {
        return Err(ChunkedError::InvalidToc("invalid manifest type".to_string()));
    }
    if length > max_toc_size || uncompressed_length > max_toc_size {
        return Err(ChunkedError::fallback(
            format!(
                "zstd:chunked manifest too big to process in memory ({length} bytes compressed, {uncompressed_length} uncompressed)"
            ),
            false,
        ));
    }
    if let Some([_, length, uncompressed_length]) = tar_split_position
        && (length > max_toc_size || uncompressed_length > max_toc_size)
    {
        return Err(ChunkedError::fallback(
            format!(
                "zstd:chunked tar-split too big to process in memory ({length} bytes compressed, {uncompressed_length} uncompressed)"
            ),
            false,
        ));
    }

    let mut chunks = vec![manifest_chunk];
    chunks.extend(tar_split_chunk);
    let mut fan_in = fetch(source, &chunks)?;

    let compressed = read_blob(&mut fan_in, manifest_chunk.length)?;
    validate_blob(&compressed, toc_digest)
        .map_err(|e| ChunkedError::InvalidToc(format!("validating TOC: {e}")))?;
    let manifest = zstd_decode(&compressed, max_toc_size)?;
    let toc = parse_manifest(&manifest)?;

    let tar_split = match (&toc.tar_split_digest, tar_split_chunk) {
        (Some(digest), Some(chunk)) => {
            let compressed = read_blob(&mut fan_in, chunk.length)?;
            validate_blob(&compressed, digest)
                .map_err(|e| ChunkedError::TarSplitError(format!("validating tar-split: {e}")))?;
            let tar_split = TarSplit::parse(zstd_decode(&compressed, max_toc_size)?)?;
            // The TOC drives file creation while the tar-split drives export;
            // they must agree or local inspection could mislead.
            ensure_toc_matches_tar_split(&toc, &tar_split.entries)
                .map_err(|e| ChunkedError::TarSplitError(format!("tar-split and TOC data is inconsistent: {e}")))?;
            Some(tar_split)
        }
        (Some(_), None) => {
            return Err(ChunkedError::TarSplitError(format!(
                "TOC requires a tar-split, but the {TAR_SPLIT_INFO_KEY} annotation does not describe a position"
            )));
        }
        (None, Some(chunk)) => {
            // Unauthenticated, so unusable; still consume it.
            read_blob(&mut fan_in, chunk.length)?;
            None
        }
        (None, None) => None,
    };
    fan_in.finish()?;

    Ok(ZstdChunkedManifest {
        manifest,
        toc,
        tar_split,
        toc_offset: manifest_chunk.offset,
    })
}

/// Fetch the eStargz TOC of a blob of `blob_size` bytes and verify it
/// against `toc_digest`.
pub fn read_estargz_manifest(
    source: &dyn BlobSource,
    blob_size: u64,
    toc_digest: &Digest,
    max_toc_size: u64,
) -> Result<EstargzManifest> {
    if blob_size <= ESTARGZ_FOOTER_SIZE {
        return Err(ChunkedError::InvalidToc("blob too small".to_string()));
    }
    let footer_chunk = ImageSourceChunk {
        offset: blob_size - ESTARGZ_FOOTER_SIZE,
        length: ESTARGZ_FOOTER_SIZE,
    };
    let mut fan_in = fetch(source, &[footer_chunk])?;
    let footer = read_blob(&mut fan_in, ESTARGZ_FOOTER_SIZE)?;
    fan_in.finish()?;

    // gzip header (10), XLEN (2), subfield id and length (4), then
    // "%016xSTARGZ".
    let toc_offset = std::str::from_utf8(&footer[16..32])
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| ChunkedError::InvalidToc("parse ToC offset".to_string()))?;
    let size = (blob_size - ESTARGZ_FOOTER_SIZE)
        .checked_sub(toc_offset)
        .ok_or_else(|| ChunkedError::InvalidToc(format!("ToC offset {toc_offset} beyond the blob")))?;
    if size > max_toc_size {
        return Err(ChunkedError::fallback(
            format!("estargz manifest too big to process in memory ({size} bytes)"),
            false,
        ));
    }

    let mut fan_in = fetch(
        source,
        &[ImageSourceChunk {
            offset: toc_offset,
            length: size,
        }],
    )?;
    let stream = fan_in.next_stream()?;
    let mut archive = tar::Archive::new(GzDecoder::new(stream));
    let mut member = archive
        .entries()?
        .next()
        .ok_or_else(|| ChunkedError::InvalidToc("manifest not found".to_string()))??;
    if member.size() > max_toc_size {
        return Err(ChunkedError::InvalidToc("manifest too big".to_string()));
    }
    let mut manifest = Vec::new();
    member.read_to_end(&mut manifest)?;
    drop(member);
    drop(archive);
    fan_in.finish()?;

    let mut d = Digester::new();
    d.update(&manifest);
    if &d.finish() != toc_digest {
        return Err(ChunkedError::InvalidToc("invalid manifest checksum".to_string()));
    }
    Ok(EstargzManifest {
        manifest,
        toc_offset,
    })
}
