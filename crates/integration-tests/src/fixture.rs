//! Test fixtures: a directory-backed layer store, in-memory blob sources and
//! builders for layer blobs.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use tempfile::TempDir;

use cstor_chunked::manifest::{MANIFEST_CHECKSUM_KEY, MANIFEST_INFO_KEY, TAR_SPLIT_INFO_KEY};
use cstor_chunked::tar_split_writer::crc64_of;
use cstor_chunked::toc::{ChunkType, EntryType};
use cstor_chunked::{
    BlobInfo, BlobResponse, BlobSource, BlobStream, ChunkedError, Digest, DifferOutput, FileEntry,
    ImageSourceChunk, LayerData, LayerStore, StoredLayer, TarSplitWriter, Toc,
};

/// A layer store keeping every layer in a temporary directory.
///
/// Layer `<id>` has its content in `layers/<id>/diff` and its named data in
/// `layers/<id>/data/<key>`.
pub struct TestLayerStore {
    temp_dir: TempDir,
    layers: Mutex<Vec<StoredLayer>>,
}

impl TestLayerStore {
    /// Create an empty store.
    pub fn new() -> color_eyre::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            temp_dir: TempDir::new()?,
            layers: Mutex::new(Vec::new()),
        }))
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.temp_dir.path().join("layers").join(id)
    }

    /// Create the staging directory of a new layer.
    pub fn stage(&self, id: &str) -> color_eyre::Result<Dir> {
        let diff = self.layer_dir(id).join("diff");
        std::fs::create_dir_all(&diff)?;
        Ok(Dir::open_ambient_dir(&diff, ambient_authority())?)
    }

    /// Path of a file inside a layer.
    pub fn path_in_layer(&self, id: &str, path: &str) -> PathBuf {
        self.layer_dir(id).join("diff").join(path)
    }

    /// Record a staged layer, storing the named data the differ produced.
    pub fn commit(&self, id: &str, output: &DifferOutput, read_only: bool) -> color_eyre::Result<()> {
        for (key, value) in &output.big_data {
            self.write_layer_data(id, key, value)?;
        }
        self.layers
            .lock()
            .map_err(|_| color_eyre::eyre::eyre!("poisoned"))?
            .push(StoredLayer {
                id: id.to_string(),
                read_only,
            });
        Ok(())
    }

    /// Whether named data exists for a layer.
    pub fn has_layer_data(&self, id: &str, key: &str) -> bool {
        self.layer_dir(id).join("data").join(key).exists()
    }
}

impl LayerStore for TestLayerStore {
    fn layers(&self) -> cstor_chunked::Result<Vec<StoredLayer>> {
        self.layers
            .lock()
            .map(|l| l.clone())
            .map_err(|_| ChunkedError::Internal("poisoned".into()))
    }

    fn layer_root(&self, id: &str) -> cstor_chunked::Result<PathBuf> {
        Ok(self.layer_dir(id).join("diff"))
    }

    fn read_layer_data(&self, id: &str, key: &str) -> cstor_chunked::Result<Option<LayerData>> {
        match std::fs::File::open(self.layer_dir(id).join("data").join(key)) {
            Ok(f) => Ok(Some(LayerData::File(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_layer_data(&self, id: &str, key: &str, data: &[u8]) -> cstor_chunked::Result<()> {
        let dir = self.layer_dir(id).join("data");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(key), data)?;
        Ok(())
    }
}

/// A blob held in memory that records every request.
///
/// With `max_ranges` set, requests with more ranges are rejected the way
/// registries reject oversized multi-range requests.
pub struct MemoryBlobSource {
    blob: Vec<u8>,
    max_ranges: Option<usize>,
    requests: Mutex<Vec<Vec<ImageSourceChunk>>>,
}

impl MemoryBlobSource {
    pub fn new(blob: Vec<u8>, max_ranges: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            blob,
            max_ranges,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request seen so far, rejected ones included.
    pub fn requests(&self) -> Vec<Vec<ImageSourceChunk>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl BlobSource for MemoryBlobSource {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> cstor_chunked::Result<BlobResponse> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(chunks.to_vec());
        }
        if let Some(max) = self.max_ranges
            && chunks.len() > max
        {
            return Err(ChunkedError::BadRequest(format!("{} ranges requested", chunks.len())));
        }
        let mut streams = Vec::new();
        for c in chunks {
            let range = c.offset as usize..(c.offset + c.length) as usize;
            let data = self
                .blob
                .get(range)
                .ok_or_else(|| ChunkedError::Internal(format!("range {c:?} out of bounds")))?;
            streams.push(Box::new(Cursor::new(data.to_vec())) as BlobStream);
        }
        Ok(BlobResponse::ready(streams, Vec::new()))
    }
}

/// A member of a test tar stream.
pub enum Member<'a> {
    Dir(&'a str),
    File(&'a str, Vec<u8>),
    Symlink(&'a str, &'a str),
    HardLink(&'a str, &'a str),
}

/// Build a tar stream. Every member is owned by 0:0 with fixed times.
pub fn build_tar(members: &[Member<'_>]) -> color_eyre::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for m in members {
        let mut h = tar::Header::new_ustar();
        h.set_uid(0);
        h.set_gid(0);
        h.set_mtime(1_700_000_000);
        match m {
            Member::Dir(name) => {
                h.set_entry_type(tar::EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                builder.append_data(&mut h, name, std::io::empty())?;
            }
            Member::File(name, content) => {
                h.set_entry_type(tar::EntryType::Regular);
                h.set_mode(0o644);
                h.set_size(content.len() as u64);
                builder.append_data(&mut h, name, content.as_slice())?;
            }
            Member::Symlink(name, target) => {
                h.set_entry_type(tar::EntryType::Symlink);
                h.set_mode(0o777);
                h.set_size(0);
                builder.append_link(&mut h, name, target)?;
            }
            Member::HardLink(name, target) => {
                h.set_entry_type(tar::EntryType::Link);
                h.set_mode(0o644);
                h.set_size(0);
                builder.append_link(&mut h, name, target)?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

/// Gzip `data`.
pub fn gzip(data: &[u8]) -> color_eyre::Result<Vec<u8>> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// A layer blob together with what a registry would publish about it.
pub struct TestLayer {
    pub blob: Vec<u8>,
    /// The uncompressed tar stream.
    pub tar: Vec<u8>,
    pub annotations: HashMap<String, String>,
}

impl TestLayer {
    pub fn info(&self) -> BlobInfo {
        BlobInfo {
            digest: Digest::sha256_of(&self.blob),
            size: self.blob.len() as u64,
            annotations: self.annotations.clone(),
        }
    }

    /// Digest of the uncompressed tar stream.
    pub fn diff_id(&self) -> Digest {
        Digest::sha256_of(&self.tar)
    }

    pub fn toc_digest(&self) -> Option<Digest> {
        self.annotations
            .get(MANIFEST_CHECKSUM_KEY)
            .and_then(|d| d.parse().ok())
    }
}

fn append_frame(blob: &mut Vec<u8>, data: &[u8]) -> color_eyre::Result<()> {
    blob.extend(zstd::encode_all(data, 3)?);
    Ok(())
}

/// Append a zstd skippable frame; returns the offset of its payload.
fn append_skippable(blob: &mut Vec<u8>, payload: &[u8]) -> u64 {
    blob.extend_from_slice(&0x184D_2A50u32.to_le_bytes());
    blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let offset = blob.len() as u64;
    blob.extend_from_slice(payload);
    offset
}

/// Compress `tar` as zstd:chunked with file bodies cut into `chunk_size`
/// pieces.
pub fn zstd_chunked(tar: &[u8], chunk_size: usize) -> color_eyre::Result<TestLayer> {
    zstd_chunked_with(tar, chunk_size, |_| {})
}

/// Like [`zstd_chunked`], letting `tweak` edit the TOC records before they
/// are published.
pub fn zstd_chunked_with(
    tar: &[u8],
    chunk_size: usize,
    tweak: impl FnOnce(&mut Vec<FileEntry>),
) -> color_eyre::Result<TestLayer> {
    let mut blob = Vec::new();
    let mut tar_split = TarSplitWriter::new();
    let mut entries = Vec::new();
    let mut consumed = 0usize;

    let mut archive = tar::Archive::new(tar);
    for member in archive.entries()? {
        let mut member = member?;
        let data_start = member.raw_file_position() as usize;
        let size = member.size() as usize;
        let mut e = FileEntry::from_tar(&mut member)?;

        let segment = &tar[consumed..data_start];
        tar_split.add_segment(segment)?;
        append_frame(&mut blob, segment)?;

        let body = &tar[data_start..data_start + size];
        tar_split.add_file(&e.name, size as u64, crc64_of(&mut &body[..])?)?;
        consumed = data_start + size;

        if e.entry_type != EntryType::Reg || body.is_empty() {
            entries.push(e);
            continue;
        }
        e.digest = Some(Digest::sha256_of(body).to_string());
        for (i, window) in body.chunks(chunk_size).enumerate() {
            let mut c = if i == 0 {
                e.clone()
            } else {
                FileEntry::new(EntryType::Chunk, e.name.clone())
            };
            c.offset = blob.len() as u64;
            append_frame(&mut blob, window)?;
            c.end_offset = blob.len() as u64;
            c.chunk_offset = (i * chunk_size) as u64;
            c.chunk_size = window.len() as u64;
            c.chunk_digest = Some(Digest::sha256_of(window).to_string());
            if window.iter().all(|&b| b == 0) {
                c.chunk_type = ChunkType::Zeros;
            }
            entries.push(c);
        }
    }
    let tail = &tar[consumed..];
    tar_split.add_segment(tail)?;
    append_frame(&mut blob, tail)?;

    tweak(&mut entries);

    let tar_split_raw = tar_split.finish();
    let tar_split_z = zstd::encode_all(tar_split_raw.as_slice(), 3)?;
    let toc = Toc {
        version: 1,
        entries,
        tar_split_digest: Some(Digest::sha256_of(&tar_split_z)),
    };
    let manifest = serde_json::to_vec(&toc)?;
    let manifest_z = zstd::encode_all(manifest.as_slice(), 3)?;

    let manifest_offset = append_skippable(&mut blob, &manifest_z);
    let tar_split_offset = append_skippable(&mut blob, &tar_split_z);

    let annotations = HashMap::from([
        (
            MANIFEST_CHECKSUM_KEY.to_string(),
            Digest::sha256_of(&manifest_z).to_string(),
        ),
        (
            MANIFEST_INFO_KEY.to_string(),
            format!("{manifest_offset}:{}:{}:1", manifest_z.len(), manifest.len()),
        ),
        (
            TAR_SPLIT_INFO_KEY.to_string(),
            format!(
                "{tar_split_offset}:{}:{}",
                tar_split_z.len(),
                tar_split_raw.len()
            ),
        ),
    ]);
    Ok(TestLayer {
        blob,
        tar: tar.to_vec(),
        annotations,
    })
}
