//! On-the-fly conversion of a non-chunked layer.
//!
//! The whole blob is downloaded once and verified, decompressed into an
//! unlinked temporary file, and indexed: the TOC describes every member with
//! its content split into fixed-size windows, and a tar-split records the raw
//! header bytes. From then on the temporary file is treated as an
//! uncompressed chunked blob, so the rest of the pull (local dedup included)
//! works exactly as for a native chunked layer.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;

use flate2::read::GzDecoder;

use crate::blob_source::{BlobSource, ImageSourceChunk, get_blob_at};
use crate::digest::{Digest, Digester, EMPTY_SHA256};
use crate::error::{ChunkedError, Result};
use crate::tar_split::{CRC64_ISO, TarSplit};
use crate::tar_split_writer::TarSplitWriter;
use crate::toc::{ChunkType, EntryType, FileEntry, Toc};

/// Window used to split file content into chunks.
pub const CHUNK_SIZE: u64 = 64 << 10;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// A layer converted into an uncompressed chunked stream.
#[derive(Debug)]
pub struct Converted {
    /// The decompressed tar stream, unlinked.
    pub file: File,
    /// TOC describing `file`.
    pub toc: Toc,
    /// Serialized form of `toc`.
    pub manifest: Vec<u8>,
    /// Tar-split of `file`.
    pub tar_split: TarSplit,
    /// Digest of the blob as downloaded.
    pub compressed_digest: Digest,
    /// Digest of `file`.
    pub uncompressed_digest: Digest,
    /// Size of `file`.
    pub uncompressed_size: u64,
}

struct Tee<'a, W> {
    inner: W,
    digester: &'a mut Digester,
    written: u64,
}

impl<W: Write> Write for Tee<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into a new temporary file, returning it rewound with the
/// digest and size of what was written.
fn spool<R: Read>(mut reader: R) -> Result<(File, Digest, u64)> {
    let mut file = tempfile::tempfile()?;
    let mut digester = Digester::new();
    let mut tee = Tee {
        inner: io::BufWriter::new(&mut file),
        digester: &mut digester,
        written: 0,
    };
    io::copy(&mut reader, &mut tee)?;
    tee.flush()?;
    let written = tee.written;
    drop(tee);
    file.seek(SeekFrom::Start(0))?;
    Ok((file, digester.finish(), written))
}

/// Decompress `blob` according to its magic bytes.
fn decompress(blob: &File) -> Result<(File, Digest, u64)> {
    let mut magic = [0u8; 4];
    let mut reader = blob;
    let n = reader.read(&mut magic)?;
    reader.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(reader);
    if magic[..n].starts_with(&GZIP_MAGIC) {
        spool(GzDecoder::new(reader))
    } else if n == 4 && magic == ZSTD_MAGIC {
        spool(zstd::stream::read::Decoder::with_buffer(reader)?)
    } else {
        spool(reader)
    }
}

/// Describe the content of a regular file member, reading its body.
///
/// Returns the file record (first chunk) followed by continuation records.
fn chunk_file<R: Read>(mut entry: FileEntry, body: &mut R, file_pos: u64) -> Result<Vec<FileEntry>> {
    if entry.size == 0 {
        entry.digest = Some(EMPTY_SHA256.to_string());
        return Ok(vec![entry]);
    }
    let mut whole = Digester::new();
    let mut chunks: Vec<FileEntry> = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut pos = 0u64;
    while pos < entry.size {
        let len = (entry.size - pos).min(CHUNK_SIZE);
        let window = &mut buf[..len as usize];
        body.read_exact(window)?;
        whole.update(window);
        let zeros = window.iter().all(|&b| b == 0);

        if zeros
            && let Some(prev) = chunks.last_mut()
            && prev.chunk_type == ChunkType::Zeros
        {
            prev.chunk_size += len;
            prev.end_offset += len;
            let mut d = Digester::new();
            d.update_zeros(prev.chunk_size);
            prev.chunk_digest = Some(d.finish().to_string());
        } else {
            let mut c = if chunks.is_empty() {
                entry.clone()
            } else {
                FileEntry::new(EntryType::Chunk, entry.name.clone())
            };
            c.offset = file_pos + pos;
            c.end_offset = c.offset + len;
            c.chunk_offset = pos;
            c.chunk_size = len;
            c.chunk_digest = Some(Digest::sha256_of(window).to_string());
            c.chunk_type = if zeros { ChunkType::Zeros } else { ChunkType::Data };
            chunks.push(c);
        }
        pos += len;
    }
    if let Some(first) = chunks.first_mut() {
        first.digest = Some(whole.finish().to_string());
    }
    Ok(chunks)
}

/// Index an uncompressed tar stream.
fn index_tar(tar_file: &File, total: u64) -> Result<(Toc, TarSplit)> {
    let mut toc = Toc {
        version: 1,
        ..Default::default()
    };
    let mut writer = TarSplitWriter::new();
    let mut prev_end = 0u64;

    let mut archive = tar::Archive::new(BufReader::new(tar_file));
    for member in archive.entries()? {
        let mut member = member?;
        let typeflag = member.header().entry_type().as_byte();
        if EntryType::from_typeflag(typeflag).is_none() {
            // Global headers and the like stay inside the surrounding segment.
            tracing::debug!("Keeping tar member of type {typeflag} as raw data");
            continue;
        }
        let entry = FileEntry::from_tar(&mut member)?;
        let file_pos = member.raw_file_position();
        let size = member.size();

        // Positional reads leave the archive's file offset alone.
        let mut segment = vec![0u8; (file_pos - prev_end) as usize];
        tar_file.read_exact_at(&mut segment, prev_end)?;
        writer.add_segment(&segment)?;

        let name = entry.name.clone();
        if entry.entry_type == EntryType::Reg {
            let mut crc = CRC64_ISO.digest();
            let mut body = CrcReader {
                inner: &mut member,
                crc: &mut crc,
            };
            toc.entries.extend(chunk_file(entry, &mut body, file_pos)?);
            writer.add_file(&name, size, crc.finalize())?;
        } else {
            toc.entries.push(entry);
            writer.add_file(&name, size, 0)?;
        }
        prev_end = file_pos + size;
    }
    drop(archive);

    let mut tail = vec![0u8; total.saturating_sub(prev_end) as usize];
    tar_file.read_exact_at(&mut tail, prev_end)?;
    writer.add_segment(&tail)?;

    Ok((toc, TarSplit::parse(writer.finish())?))
}

struct CrcReader<'a, 'b, R> {
    inner: R,
    crc: &'a mut crc::Digest<'b, u64>,
}

impl<R: Read> Read for CrcReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }
}

/// Download the whole blob, verify it against `blob_digest` and convert it.
pub fn convert_blob(source: &dyn BlobSource, blob_size: u64, blob_digest: &Digest) -> Result<Converted> {
    let mut fan_in = get_blob_at(
        source,
        &[ImageSourceChunk {
            offset: 0,
            length: blob_size,
        }],
    )?;
    let stream = fan_in.next_stream()?;
    let (blob, compressed_digest, size) = spool(stream.take(blob_size))?;
    fan_in.finish()?;
    if size != blob_size {
        return Err(ChunkedError::MissingData(format!(
            "got {size} bytes of a {blob_size} byte blob"
        )));
    }
    if &compressed_digest != blob_digest {
        return Err(ChunkedError::ChecksumMismatch {
            path: "blob".to_string(),
            expected: blob_digest.to_string(),
            actual: compressed_digest.to_string(),
        });
    }

    let (file, uncompressed_digest, uncompressed_size) = decompress(&blob)?;
    drop(blob);
    let (toc, tar_split) = index_tar(&file, uncompressed_size)?;
    tracing::debug!(
        "Converted blob {blob_digest} into {} TOC entries",
        toc.entries.len()
    );
    let manifest = serde_json::to_vec(&toc)?;
    Ok(Converted {
        file,
        toc,
        manifest,
        tar_split,
        compressed_digest,
        uncompressed_digest,
        uncompressed_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_source::{BlobResponse, BlobStream};
    use crate::tar_split::{FileGetter, write_output_tar_stream};
    use crate::toc::parse_manifest;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct Mem(Vec<u8>);

    impl BlobSource for Mem {
        fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobResponse> {
            let streams = chunks
                .iter()
                .map(|c| {
                    let data = self.0[c.offset as usize..(c.offset + c.length) as usize].to_vec();
                    Box::new(Cursor::new(data)) as BlobStream
                })
                .collect();
            Ok(BlobResponse::ready(streams, Vec::new()))
        }
    }

    fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(kind);
        h.set_mode(mode);
        h.set_uid(0);
        h.set_gid(0);
        h.set_mtime(1_600_000_000);
        h.set_size(size);
        h
    }

    fn sample_tar() -> (Vec<u8>, HashMap<String, Vec<u8>>) {
        let mut big = vec![7u8; 70_000];
        big.extend_from_slice(&vec![0u8; 200_000]);
        big.extend_from_slice(b"tail");
        let files: Vec<(&str, Vec<u8>)> = vec![
            ("etc/hostname", b"box\n".to_vec()),
            ("empty", Vec::new()),
            ("big.img", big),
        ];
        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Directory, 0o755, 0);
        b.append_data(&mut h, "etc", io::empty()).unwrap();
        for (name, body) in &files {
            let mut h = header(tar::EntryType::Regular, 0o644, body.len() as u64);
            b.append_data(&mut h, name, body.as_slice()).unwrap();
        }
        let mut h = header(tar::EntryType::Symlink, 0o777, 0);
        b.append_link(&mut h, "link", "etc/hostname").unwrap();
        let tar = b.into_inner().unwrap();
        (tar, files.into_iter().map(|(n, b)| (n.to_string(), b)).collect())
    }

    struct MapGetter(HashMap<String, Vec<u8>>);

    impl FileGetter for MapGetter {
        fn open(&self, name: &str) -> Result<Box<dyn Read + '_>> {
            let body = self.0.get(name).ok_or_else(|| {
                ChunkedError::Io(io::Error::from(io::ErrorKind::NotFound))
            })?;
            Ok(Box::new(body.as_slice()))
        }
    }

    #[test]
    fn test_convert_gzip_blob() {
        let (tar, files) = sample_tar();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar).unwrap();
        let blob = gz.finish().unwrap();
        let digest = Digest::sha256_of(&blob);

        let c = convert_blob(&Mem(blob.clone()), blob.len() as u64, &digest).unwrap();
        assert_eq!(c.compressed_digest, digest);
        assert_eq!(c.uncompressed_digest, Digest::sha256_of(&tar));
        assert_eq!(c.uncompressed_size, tar.len() as u64);
        assert_eq!(c.tar_split.tar_size(), tar.len() as u64);

        // The tar-split regenerates the exact stream.
        let mut out = Vec::new();
        write_output_tar_stream(&c.tar_split.entries, &MapGetter(files.clone()), &mut out).unwrap();
        assert_eq!(out, tar);

        // The manifest parses back to the same TOC.
        assert_eq!(parse_manifest(&c.manifest).unwrap(), c.toc);

        let names: Vec<_> = c
            .toc
            .entries
            .iter()
            .filter(|e| e.entry_type != EntryType::Chunk)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names.len(), 5);
        assert_eq!(names[1..], ["etc/hostname", "empty", "big.img", "link"]);

        // 70000 bytes of data, then zeros, then the tail: data, data, zeros, data.
        let big: Vec<_> = c.toc.entries.iter().filter(|e| e.name == "big.img").collect();
        let kinds: Vec<_> = big.iter().map(|e| (e.chunk_type, e.chunk_size)).collect();
        assert_eq!(kinds[0], (ChunkType::Data, CHUNK_SIZE));
        assert_eq!(kinds[2].0, ChunkType::Zeros);
        assert_eq!(kinds.len(), 4);
        let total: u64 = kinds.iter().map(|(_, s)| s).sum();
        assert_eq!(total, files["big.img"].len() as u64);
        assert_eq!(
            big[0].digest.as_deref(),
            Some(Digest::sha256_of(&files["big.img"]).to_string().as_str())
        );
        // Chunk offsets address the decompressed stream.
        let first = big[0];
        let off = first.offset as usize;
        assert_eq!(&tar[off..off + 4], &[7u8; 4]);
    }

    #[test]
    fn test_convert_rejects_wrong_digest() {
        let (tar, _) = sample_tar();
        let wrong = Digest::sha256_of(b"nope");
        let err = convert_blob(&Mem(tar.clone()), tar.len() as u64, &wrong).unwrap_err();
        assert!(matches!(err, ChunkedError::ChecksumMismatch { .. }), "{err}");
    }

    #[test]
    fn test_convert_zstd_and_plain() {
        let (tar, _) = sample_tar();
        let zst = zstd::stream::encode_all(&tar[..], 1).unwrap();
        let c = convert_blob(&Mem(zst.clone()), zst.len() as u64, &Digest::sha256_of(&zst)).unwrap();
        assert_eq!(c.uncompressed_digest, Digest::sha256_of(&tar));

        let c = convert_blob(&Mem(tar.clone()), tar.len() as u64, &Digest::sha256_of(&tar)).unwrap();
        assert_eq!(c.uncompressed_digest, c.compressed_digest);
    }
}
