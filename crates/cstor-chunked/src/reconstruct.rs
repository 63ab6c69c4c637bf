//! Writing fetched and locally found content into the staged tree.
//!
//! The differ hands over a list of [`MissingPart`]s; each one is read either
//! from the next blob stream, from a file of another layer, or not at all for
//! holes. Destination files are written strictly in order, one decompressor
//! per chunk, and every byte written is hashed so the file can be checked
//! against its TOC digest when it is closed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::sync::Mutex;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use flate2::read::GzDecoder;

use crate::blob_source::{BlobSource, FanIn, get_blob_at};
use crate::config::{ApplyOptions, DifferTuning};
use crate::digest::{Digest, Digester, EMPTY_SHA256};
use crate::error::{ChunkedError, Result};
use crate::fsutil::{
    AttrPolicy, AttrTarget, append_hole, clean_rel_path, create_file, set_attrs_at, set_file_attrs,
};
use crate::scheduler::{MissingPart, OriginFile, chunks_to_request, merge_missing_chunks};
use crate::toc::{FileType, MergedEntry};
use crate::verity;

/// State shared by everything that writes into the destination.
pub(crate) struct Stage<'a> {
    pub root: &'a Dir,
    pub entries: &'a [MergedEntry],
    pub options: &'a ApplyOptions,
    pub xattrs_to_ignore: &'a BTreeSet<String>,
    pub copy_buffer_size: usize,
    /// Do not compare written files with their TOC digest.
    pub skip_validation: bool,
    /// fs-verity digests of the files written so far, by path.
    pub verity_digests: Mutex<BTreeMap<String, String>>,
}

impl<'a> Stage<'a> {
    /// Cleaned destination path of entry `index`.
    pub fn path(&self, index: usize) -> String {
        clean_rel_path(&self.entries[index].entry.name)
    }

    pub fn policy(&self, uid: u32, gid: u32) -> Result<AttrPolicy<'a>> {
        Ok(AttrPolicy {
            owner: self.options.host_owner(uid, gid)?,
            ignore_chown_errors: self.options.ignore_chown_errors,
            xattrs_to_ignore: self.xattrs_to_ignore,
        })
    }

    /// Apply the attributes of entry `index` to whatever is at its path.
    pub fn set_path_attrs(&self, index: usize) -> Result<()> {
        let e = &self.entries[index].entry;
        set_attrs_at(self.root, &self.path(index), e, &self.policy(e.uid, e.gid)?)
    }

    /// Apply attributes to a freshly written regular file and seal it with
    /// fs-verity if requested.
    pub fn finalize_file(&self, file: File, index: usize) -> Result<()> {
        let merged = &self.entries[index];
        let path = self.path(index);
        if !merged.skip_set_attrs {
            let policy = self.policy(merged.entry.uid, merged.entry.gid)?;
            set_file_attrs(AttrTarget::Fd(file.as_fd()), &path, &merged.entry, &policy)?;
        }
        // fs-verity refuses files that still have writers.
        drop(file);
        if self.options.fs_verity == crate::config::FsVerityMode::Disabled {
            return Ok(());
        }
        let ro = self.root.open(&path)?.into_std();
        if let Some(digest) = verity::enable_and_measure(&ro, &path, self.options.fs_verity)? {
            self.verity_digests
                .lock()
                .map_err(|_| ChunkedError::Internal("fs-verity digest map poisoned".into()))?
                .insert(path, digest);
        }
        Ok(())
    }
}

/// Writes into a file while hashing everything written.
struct HashingWriter {
    file: BufWriter<File>,
    digester: Digester,
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A destination file being assembled from chunks.
struct DestinationFile {
    index: usize,
    path: String,
    out: HashingWriter,
}

impl DestinationFile {
    fn create(stage: &Stage<'_>, index: usize) -> Result<Self> {
        let path = stage.path(index);
        let file = create_file(stage.root, &path)?;
        Ok(Self {
            index,
            path,
            out: HashingWriter {
                file: BufWriter::with_capacity(stage.copy_buffer_size, file),
                digester: Digester::new(),
            },
        })
    }

    fn copy_from<R: Read + ?Sized>(&mut self, reader: &mut R, size: u64) -> Result<()> {
        let copied = io::copy(&mut reader.take(size), &mut self.out)?;
        if copied != size {
            return Err(ChunkedError::MissingData(format!(
                "{}: got {copied} bytes of a {size} byte chunk",
                self.path
            )));
        }
        Ok(())
    }

    /// Decode one chunk from `reader` and append its `size` bytes.
    fn append(&mut self, reader: &mut dyn Read, compression: FileType, size: u64) -> Result<()> {
        match compression {
            FileType::ZstdChunked => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                self.copy_from(&mut decoder, size)
            }
            FileType::Estargz => self.copy_from(&mut GzDecoder::new(reader), size),
            FileType::Uncompressed => self.copy_from(reader, size),
            FileType::Hole => self.append_hole(size),
        }
    }

    fn append_hole(&mut self, size: u64) -> Result<()> {
        self.out.file.flush()?;
        append_hole(self.out.file.get_ref(), size)?;
        self.out.digester.update_zeros(size);
        Ok(())
    }

    fn close(self, stage: &Stage<'_>) -> Result<()> {
        let file = self.out.file.into_inner().map_err(|e| e.into_error())?;
        if !stage.skip_validation {
            let entry = &stage.entries[self.index].entry;
            let expected = match &entry.digest {
                Some(d) => Digest::parse(d)?,
                None if entry.size == 0 => Digest::parse(EMPTY_SHA256)?,
                None => {
                    return Err(ChunkedError::InvalidToc(format!(
                        "no digest for {:?}",
                        entry.name
                    )));
                }
            };
            let actual = self.out.digester.finish();
            if actual != expected {
                return Err(ChunkedError::ChecksumMismatch {
                    path: self.path,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        stage.finalize_file(file, self.index)
    }
}

fn discard<R: Read + ?Sized>(reader: &mut R, size: u64) -> Result<()> {
    let n = io::copy(&mut reader.take(size), &mut io::sink())?;
    if n != size {
        return Err(ChunkedError::MissingData(format!(
            "stream ended {} bytes early",
            size - n
        )));
    }
    Ok(())
}

fn open_origin(origin: &OriginFile) -> Result<Box<dyn Read>> {
    let root = Dir::open_ambient_dir(&origin.root, ambient_authority())?;
    let mut file = root.open(&origin.path)?.into_std();
    file.seek(SeekFrom::Start(origin.offset))?;
    Ok(Box::new(file))
}

/// Write the content described by `parts`, reading remote parts from
/// `fan_in` in order.
fn store_missing_files(
    stage: &Stage<'_>,
    mut fan_in: Option<FanIn>,
    parts: &[MissingPart],
    file_type: FileType,
) -> Result<()> {
    let mut dest: Option<DestinationFile> = None;
    for part in parts {
        let (mut reader, compression): (Box<dyn Read>, FileType) = if part.hole {
            (Box::new(io::empty()), FileType::Hole)
        } else if let Some(origin) = &part.origin {
            (open_origin(origin)?, FileType::Uncompressed)
        } else {
            let fan_in = fan_in
                .as_mut()
                .ok_or_else(|| ChunkedError::Internal("remote part without a request".into()))?;
            (Box::new(fan_in.next_stream()?), file_type)
        };

        for chunk in &part.chunks {
            if chunk.gap > 0 {
                discard(&mut reader, chunk.gap)?;
                continue;
            }
            let Some(index) = chunk.file else {
                continue;
            };
            if dest.as_ref().is_some_and(|d| d.index != index)
                && let Some(prev) = dest.take()
            {
                prev.close(stage)?;
            }
            if dest.is_none() {
                dest = Some(DestinationFile::create(stage, index)?);
            }
            let Some(d) = dest.as_mut() else {
                return Err(ChunkedError::Internal("no destination file".into()));
            };

            if part.hole || chunk.hole {
                // A hole fetched as part of a larger range still occupies bytes.
                if !part.hole {
                    discard(&mut reader, chunk.compressed_size)?;
                }
                d.append_hole(chunk.uncompressed_size)?;
            } else if part.origin.is_some() {
                d.append(&mut reader, compression, chunk.uncompressed_size)?;
            } else {
                let mut limited = (&mut reader).take(chunk.compressed_size);
                d.append(&mut limited, compression, chunk.uncompressed_size)?;
                // Decoders may stop before the end of the frame.
                io::copy(&mut limited, &mut io::sink())?;
            }
        }
    }
    if let Some(d) = dest.take() {
        d.close(stage)?;
    }
    match fan_in {
        Some(f) => f.finish(),
        None => Ok(()),
    }
}

/// Fetch whatever `parts` need from `source` and write every destination file
/// they describe. Returns the number of bytes requested.
///
/// Requests are merged down to `max_missing_chunks` ranges first; if the
/// source rejects the request shape, the number of ranges is halved and the
/// request repeated, down to a single range.
pub(crate) fn retrieve_missing_files(
    stage: &Stage<'_>,
    source: &dyn BlobSource,
    file_type: FileType,
    parts: Vec<MissingPart>,
    tuning: &DifferTuning,
) -> Result<u64> {
    let mut parts = merge_missing_chunks(parts, tuning.max_missing_chunks, tuning.auto_merge_threshold);
    let mut chunks = chunks_to_request(&parts);
    let fan_in = if chunks.is_empty() {
        None
    } else {
        loop {
            match get_blob_at(source, &chunks) {
                Ok(f) => break Some(f),
                Err(e) if e.is_bad_request() && chunks.len() > 1 => {
                    let target = chunks.len() / 2;
                    tracing::debug!(
                        "Blob source rejected {} ranges ({e}), retrying with at most {target}",
                        chunks.len()
                    );
                    parts = merge_missing_chunks(parts, target, tuning.auto_merge_threshold);
                    let merged = chunks_to_request(&parts);
                    // Ranges that cannot be coalesced any further.
                    if merged.len() >= chunks.len() {
                        return Err(e);
                    }
                    chunks = merged;
                }
                Err(e) => return Err(e),
            }
        }
    };
    let requested = chunks.iter().map(|c| c.length).sum();
    store_missing_files(stage, fan_in, &parts, file_type)?;
    Ok(requested)
}
