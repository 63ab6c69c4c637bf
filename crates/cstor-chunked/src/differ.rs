//! Applying a chunked layer to a staging directory.
//!
//! [`ChunkedDiffer::new`] decides whether a blob can be pulled partially and
//! fetches its TOC; [`ChunkedDiffer::apply_diff`] then recreates the layer in
//! a directory, taking as much content as possible from the host and fetching
//! only what is left.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use cap_std::ambient_authority;
//! use cap_std::fs::Dir;
//! use cstor_chunked::{ApplyOptions, BlobInfo, ChunkedDiffer, DifferTuning, FileBlobSource, PullOptions};
//!
//! let blob = std::fs::File::open("/tmp/layer.tar.zst")?;
//! let info = BlobInfo {
//!     digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000".parse()?,
//!     size: blob.metadata()?.len(),
//!     annotations: HashMap::new(),
//! };
//! let source = Arc::new(FileBlobSource::new(blob));
//! let options = PullOptions { convert_images: true, ..Default::default() };
//! let mut differ = ChunkedDiffer::new(source, info, options, DifferTuning::default(), None)?;
//! let dest = Dir::open_ambient_dir("/tmp/staging", ambient_authority())?;
//! let output = differ.apply_diff(&dest, &ApplyOptions::default())?;
//! println!("{:?}", output.uncompressed_digest);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use cap_std::fs::Dir;

use crate::blob_source::{BlobSource, FileBlobSource, ImageSourceChunk};
use crate::config::{ApplyOptions, DifferTuning, OutputFormat, PullOptions};
use crate::convert::convert_blob;
use crate::dedup::{Dedup, LocalCopy, run_pool};
use crate::digest::{Digest, Digester};
use crate::error::{ChunkedError, Result};
use crate::fsutil::{
    clean_rel_path, create_dir, create_file, create_hard_link, create_node, create_symlink,
};
use crate::layers_cache::{LAYER_DATA_KEY, LayersCache, MANIFEST_KEY, layer_data_json};
use crate::manifest::{
    ESTARGZ_TOC_DIGEST_KEY, MANIFEST_CHECKSUM_KEY, read_estargz_manifest,
    read_zstd_chunked_manifest,
};
use crate::reconstruct::{Stage, retrieve_missing_files};
use crate::scheduler::{MissingFileChunk, MissingPart};
use crate::tar_split::{StagedFileGetter, TarSplit, write_output_tar_stream};
use crate::toc::{ChunkType, EntryType, FileType, MergedEntry, Toc, make_entries_flat, merge_entries, parse_manifest};

/// Identity of the layer blob being pulled.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Digest of the compressed blob.
    pub digest: Digest,
    /// Size of the compressed blob.
    pub size: u64,
    /// Layer annotations from the image manifest.
    pub annotations: HashMap<String, String>,
}

/// Counters collected while applying a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DifferStats {
    /// Regular files with content.
    pub files: usize,
    /// Files copied from another layer or an OSTree repository.
    pub files_copied: usize,
    /// Files hard linked from another layer or an OSTree repository.
    pub files_hard_linked: usize,
    /// Chunks read from files of other layers.
    pub chunks_from_local: usize,
    /// Uncompressed size of all regular file content.
    pub total_bytes: u64,
    /// Uncompressed bytes that had to come from the blob.
    pub missing_bytes: u64,
    /// Compressed bytes requested from the blob source.
    pub bytes_fetched: u64,
}

/// Everything the storage layer needs to commit the staged layer.
#[derive(Debug, Clone, Default)]
pub struct DifferOutput {
    /// Digest of the uncompressed tar stream; `None` only in insecure mode.
    pub uncompressed_digest: Option<Digest>,
    /// Digest of the compressed blob, when the whole blob was read.
    pub compressed_digest: Option<Digest>,
    /// Digest of the TOC the layer was built from.
    pub toc_digest: Option<Digest>,
    /// Size of the uncompressed tar stream, when known.
    pub size: Option<u64>,
    /// Distinct UIDs owning entries, before mapping.
    pub uids: Vec<u32>,
    /// Distinct GIDs owning entries, before mapping.
    pub gids: Vec<u32>,
    /// Mode of the layer's root directory entry, if it has one.
    pub root_dir_mode: Option<u32>,
    /// fs-verity digests by staged path.
    pub fs_verity_digests: BTreeMap<String, String>,
    /// Named data to store with the layer.
    pub big_data: BTreeMap<String, Vec<u8>>,
    /// The parsed TOC.
    pub toc: Toc,
    /// Raw tar-split data, if any.
    pub tar_split: Option<Vec<u8>>,
    /// Statistics.
    pub stats: DifferStats,
}

/// How the differ reads the layer.
enum Plan {
    /// A TOC was fetched: pull only missing chunks.
    Partial {
        file_type: FileType,
        manifest: Vec<u8>,
        toc: Toc,
        toc_digest: Digest,
        toc_offset: u64,
        tar_split: Option<TarSplit>,
    },
    /// Download the whole blob and index it locally.
    Convert,
}

/// A partial-pull session for one layer blob. Single use.
pub struct ChunkedDiffer {
    source: Arc<dyn BlobSource>,
    blob: BlobInfo,
    options: PullOptions,
    tuning: DifferTuning,
    cache: Option<Arc<LayersCache>>,
    plan: Plan,
    used: bool,
}

impl std::fmt::Debug for ChunkedDiffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plan = match &self.plan {
            Plan::Partial { file_type, .. } => format!("{file_type:?}"),
            Plan::Convert => "convert".to_string(),
        };
        f.debug_struct("ChunkedDiffer")
            .field("blob", &self.blob.digest)
            .field("plan", &plan)
            .field("used", &self.used)
            .finish()
    }
}

fn annotation_digest(annotations: &HashMap<String, String>, key: &str) -> Result<Option<Digest>> {
    annotations.get(key).map(|s| Digest::parse(s)).transpose()
}

impl ChunkedDiffer {
    /// Prepare a differ for `blob`.
    ///
    /// Returns [`ChunkedError::FallbackRecommended`] when the caller should
    /// download the layer the ordinary way instead.
    pub fn new(
        source: Arc<dyn BlobSource>,
        blob: BlobInfo,
        options: PullOptions,
        tuning: DifferTuning,
        cache: Option<Arc<LayersCache>>,
    ) -> Result<Self> {
        let plan = match Self::partial_plan(source.as_ref(), &blob, &options, &tuning) {
            Ok(plan) => plan,
            Err(e) if e.is_fallback() && options.convert_images => {
                if !e.can_convert() {
                    return Err(ChunkedError::PartialPullImpossible(e.to_string()));
                }
                tracing::debug!("Converting layer {} locally: {e}", blob.digest);
                Plan::Convert
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            source,
            blob,
            options,
            tuning,
            cache,
            plan,
            used: false,
        })
    }

    fn partial_plan(
        source: &dyn BlobSource,
        blob: &BlobInfo,
        options: &PullOptions,
        tuning: &DifferTuning,
    ) -> Result<Plan> {
        if !options.enable_partial_images {
            return Err(ChunkedError::fallback("partial images are disabled", true));
        }
        let zstd_toc = annotation_digest(&blob.annotations, MANIFEST_CHECKSUM_KEY)?;
        let estargz_toc = annotation_digest(&blob.annotations, ESTARGZ_TOC_DIGEST_KEY)?;
        match (zstd_toc, estargz_toc) {
            (Some(_), Some(_)) => Err(ChunkedError::InvalidToc(
                "both zstd:chunked and eStargz TOC found".into(),
            )),
            (Some(toc_digest), None) => {
                let m = read_zstd_chunked_manifest(
                    source,
                    &toc_digest,
                    &blob.annotations,
                    tuning.max_toc_size,
                )?;
                if m.tar_split.is_none() && !options.insecure_allow_unpredictable_image_contents {
                    return Err(ChunkedError::fallback(
                        "zstd:chunked layers without tar-split data don't support partial pulls \
                         with guaranteed consistency with non-partial pulls",
                        true,
                    ));
                }
                Ok(Plan::Partial {
                    file_type: FileType::ZstdChunked,
                    manifest: m.manifest,
                    toc: m.toc,
                    toc_digest,
                    toc_offset: m.toc_offset,
                    tar_split: m.tar_split,
                })
            }
            (None, Some(toc_digest)) => {
                if !options.insecure_allow_unpredictable_image_contents {
                    return Err(ChunkedError::fallback(
                        "estargz layers don't support partial pulls with guaranteed consistency \
                         with non-partial pulls",
                        true,
                    ));
                }
                let m = read_estargz_manifest(source, blob.size, &toc_digest, tuning.max_toc_size)?;
                let toc = parse_manifest(&m.manifest)?;
                Ok(Plan::Partial {
                    file_type: FileType::Estargz,
                    manifest: m.manifest,
                    toc,
                    toc_digest,
                    toc_offset: m.toc_offset,
                    tar_split: None,
                })
            }
            (None, None) => Err(ChunkedError::fallback(
                "no TOC found and convert_images is not configured",
                true,
            )),
        }
    }

    /// Whether this differ downloads and converts the whole blob.
    pub fn is_converting(&self) -> bool {
        matches!(self.plan, Plan::Convert)
    }

    /// Recreate the layer in `dest`, which should be empty.
    pub fn apply_diff(&mut self, dest: &Dir, options: &ApplyOptions) -> Result<DifferOutput> {
        if std::mem::replace(&mut self.used, true) {
            return Err(ChunkedError::DifferAlreadyUsed);
        }
        if let Some(cache) = &self.cache {
            cache.load()?;
        }

        let mut output = DifferOutput::default();
        let mut uncompressed_digest = None;
        let mut skip_validation = false;
        let (file_type, manifest, toc, toc_offset, tar_split) =
            match std::mem::replace(&mut self.plan, Plan::Convert) {
                Plan::Partial {
                    file_type,
                    manifest,
                    toc,
                    toc_digest,
                    toc_offset,
                    tar_split,
                } => {
                    output.toc_digest = Some(toc_digest);
                    output.size = tar_split.as_ref().map(TarSplit::tar_size);
                    (file_type, manifest, toc, toc_offset, tar_split)
                }
                Plan::Convert => {
                    let converted = convert_blob(self.source.as_ref(), self.blob.size, &self.blob.digest)?;
                    output.compressed_digest = Some(converted.compressed_digest);
                    output.size = Some(converted.uncompressed_size);
                    uncompressed_digest = Some(converted.uncompressed_digest);
                    // Every file digest was computed from the bytes just read.
                    skip_validation = true;
                    self.source = Arc::new(FileBlobSource::new(converted.file));
                    (
                        FileType::Uncompressed,
                        converted.manifest,
                        converted.toc,
                        converted.uncompressed_size,
                        Some(converted.tar_split),
                    )
                }
            };

        output.big_data.insert(MANIFEST_KEY.to_string(), manifest);
        output
            .big_data
            .insert(LAYER_DATA_KEY.to_string(), layer_data_json(options.format)?);
        output.tar_split = tar_split.as_ref().map(|t| t.raw.clone());

        let mut entries = merge_entries(file_type, &toc.entries, toc_offset)?;
        let (uids, gids) = collect_ids(&entries);
        output.uids = uids;
        output.gids = gids;

        let mut flat_map = None;
        if options.format == OutputFormat::Flat {
            let mut map = BTreeMap::new();
            entries = make_entries_flat(entries, Some(&mut map))?;
            flat_map = Some(map);
        }

        let stage = Stage {
            root: dest,
            entries: &entries,
            options,
            xattrs_to_ignore: &self.tuning.xattrs_to_ignore,
            copy_buffer_size: self.tuning.copy_buffer_size,
            skip_validation,
            verity_digests: Mutex::new(BTreeMap::new()),
        };
        let mut stats = DifferStats::default();
        output.root_dir_mode = self.apply_entries(&stage, file_type, &mut stats)?;

        if uncompressed_digest.is_none() {
            uncompressed_digest = match &tar_split {
                _ if self.options.insecure_allow_unpredictable_image_contents => None,
                Some(ts) => {
                    let getter = StagedFileGetter::new(dest, flat_map.as_ref());
                    let mut digester = Digester::new();
                    write_output_tar_stream(&ts.entries, &getter, &mut digester)?;
                    Some(digester.finish())
                }
                None => {
                    return Err(ChunkedError::Internal(
                        "layer's uncompressed digest is unknown and \
                         insecure_allow_unpredictable_image_contents is not set"
                            .into(),
                    ));
                }
            };
        }
        output.uncompressed_digest = uncompressed_digest;

        if stats.total_bytes > 0 {
            tracing::debug!(
                "Missing {} bytes out of {} ({:.2} %)",
                stats.missing_bytes,
                stats.total_bytes,
                stats.missing_bytes as f64 * 100.0 / stats.total_bytes as f64
            );
        }
        output.fs_verity_digests = stage
            .verity_digests
            .into_inner()
            .map_err(|_| ChunkedError::Internal("fs-verity digest map poisoned".into()))?;
        output.stats = stats;
        output.toc = toc;
        Ok(output)
    }

    /// Create every entry of the stage. Returns the root directory mode.
    fn apply_entries(
        &self,
        stage: &Stage<'_>,
        file_type: FileType,
        stats: &mut DifferStats,
    ) -> Result<Option<u32>> {
        let entries = stage.entries;
        let mut root_dir_mode = None;
        let mut dirs = Vec::new();
        let mut hard_links = Vec::new();
        let mut with_content = Vec::new();

        for (index, m) in entries.iter().enumerate() {
            let e = &m.entry;
            let path = stage.path(index);
            match e.entry_type {
                EntryType::Reg if e.size == 0 => {
                    let file = create_file(stage.root, &path)?;
                    stage.finalize_file(file, index)?;
                }
                EntryType::Reg => {
                    stats.total_bytes += e.size;
                    with_content.push(index);
                }
                EntryType::Dir => {
                    if path.is_empty() {
                        root_dir_mode = Some(e.mode & 0o7777);
                    }
                    create_dir(stage.root, &path)?;
                    // Attributes last, so children do not bump the mtime.
                    dirs.push(index);
                }
                EntryType::Hardlink => hard_links.push(index),
                EntryType::Symlink => {
                    create_symlink(stage.root, &e.linkname, &path)?;
                    if !m.skip_set_attrs {
                        stage.set_path_attrs(index)?;
                    }
                }
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    create_node(stage.root, e, &path)?;
                    stage.set_path_attrs(index)?;
                }
                EntryType::Chunk => {
                    return Err(ChunkedError::InvalidToc(format!(
                        "unexpected chunk record {:?}",
                        e.name
                    )));
                }
            }
        }

        let dedup = Dedup {
            cache: self.cache.as_deref(),
            ostree_repos: &self.options.ostree_repos,
            use_hard_links: self.options.use_hard_links,
        };
        stats.files = with_content.len();
        let results = run_pool(with_content.len(), self.tuning.copy_workers, |job| {
            dedup.find_and_copy_file(stage, with_content[job])
        });

        let mut parts = Vec::new();
        stats.missing_bytes = stats.total_bytes;
        for (&index, found) in with_content.iter().zip(results) {
            let counter = match found? {
                Some(LocalCopy::Linked) => &mut stats.files_hard_linked,
                Some(LocalCopy::Copied) => &mut stats.files_copied,
                None => {
                    self.plan_file(&dedup, &entries[index], index, &mut parts, stats)?;
                    continue;
                }
            };
            *counter += 1;
            stats.missing_bytes -= entries[index].entry.size;
        }

        stats.bytes_fetched =
            retrieve_missing_files(stage, self.source.as_ref(), file_type, parts, &self.tuning)?;

        for index in hard_links {
            let target = clean_rel_path(&entries[index].entry.linkname);
            create_hard_link(stage.root, &target, &stage.path(index))?;
            // The inode may belong to another layer.
            if !self.options.use_hard_links {
                stage.set_path_attrs(index)?;
            }
        }
        for &index in dirs.iter().rev() {
            stage.set_path_attrs(index)?;
        }
        Ok(root_dir_mode)
    }

    /// Turn the chunks of a file that was not found locally into missing parts.
    fn plan_file(
        &self,
        dedup: &Dedup<'_>,
        merged: &MergedEntry,
        index: usize,
        parts: &mut Vec<MissingPart>,
        stats: &mut DifferStats,
    ) -> Result<()> {
        let mut remaining = merged.entry.size;
        for chunk in &merged.chunks {
            let compressed = chunk.end_offset.checked_sub(chunk.offset).ok_or_else(|| {
                ChunkedError::InvalidToc(format!(
                    "chunk of {:?} ends at {} before it starts at {}",
                    merged.entry.name, chunk.end_offset, chunk.offset
                ))
            })?;
            let size = if chunk.chunk_size > 0 {
                chunk.chunk_size
            } else {
                remaining
            };
            remaining = remaining.saturating_sub(size);

            let mut part = MissingPart {
                source: ImageSourceChunk {
                    offset: chunk.offset,
                    length: compressed,
                },
                hole: false,
                origin: None,
                chunks: vec![MissingFileChunk::new(index, compressed, size)],
            };
            match chunk.chunk_type {
                ChunkType::Data => {
                    if let Some(origin) = dedup.find_chunk(chunk, size)? {
                        stats.chunks_from_local += 1;
                        stats.missing_bytes = stats.missing_bytes.saturating_sub(size);
                        part.origin = Some(origin);
                    }
                }
                ChunkType::Zeros => {
                    stats.missing_bytes = stats.missing_bytes.saturating_sub(size);
                    part.hole = true;
                    part.chunks[0].hole = true;
                }
            }
            parts.push(part);
        }
        Ok(())
    }
}

/// Sorted distinct owners of the layer's entries.
fn collect_ids(entries: &[MergedEntry]) -> (Vec<u32>, Vec<u32>) {
    let uids: BTreeSet<u32> = entries.iter().map(|m| m.entry.uid).collect();
    let gids: BTreeSet<u32> = entries.iter().map(|m| m.entry.gid).collect();
    (uids.into_iter().collect(), gids.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_source::BlobResponse;
    use crate::manifest::{MANIFEST_INFO_KEY, TAR_SPLIT_INFO_KEY};
    use crate::toc::FileEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A source that must never be contacted.
    struct Unreachable(AtomicUsize);

    impl BlobSource for Unreachable {
        fn get_blob_at(&self, _: &[ImageSourceChunk]) -> Result<BlobResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ChunkedError::Internal("unexpected fetch".into()))
        }
    }

    fn blob(annotations: &[(&str, &str)]) -> BlobInfo {
        BlobInfo {
            digest: Digest::sha256_of(b"blob"),
            size: 4096,
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn enabled() -> PullOptions {
        PullOptions {
            enable_partial_images: true,
            ..Default::default()
        }
    }

    fn new_differ(info: BlobInfo, options: PullOptions) -> (Arc<Unreachable>, Result<ChunkedDiffer>) {
        let source = Arc::new(Unreachable(AtomicUsize::new(0)));
        let r = ChunkedDiffer::new(source.clone(), info, options, DifferTuning::default(), None);
        (source, r)
    }

    #[test]
    fn test_partial_images_disabled_falls_back() {
        let (source, r) = new_differ(blob(&[]), PullOptions::default());
        let err = r.unwrap_err();
        assert!(err.is_fallback());
        assert!(err.to_string().contains("partial images are disabled"));
        assert_eq!(source.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_toc_without_conversion_falls_back() {
        let (_, r) = new_differ(blob(&[]), enabled());
        let err = r.unwrap_err();
        assert!(err.is_fallback());
        assert!(err.can_convert());
    }

    #[test]
    fn test_no_toc_with_conversion_converts() {
        let options = PullOptions {
            convert_images: true,
            ..enabled()
        };
        let (source, r) = new_differ(blob(&[]), options);
        assert!(r.unwrap().is_converting());
        // Nothing is fetched until the layer is applied.
        assert_eq!(source.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_both_tocs_is_an_error() {
        let d = Digest::sha256_of(b"toc").to_string();
        let options = PullOptions {
            convert_images: true,
            ..enabled()
        };
        let (_, r) = new_differ(
            blob(&[(MANIFEST_CHECKSUM_KEY, &d), (ESTARGZ_TOC_DIGEST_KEY, &d)]),
            options,
        );
        let err = r.unwrap_err();
        assert!(!err.is_fallback());
    }

    #[test]
    fn test_estargz_requires_insecure_mode() {
        let d = Digest::sha256_of(b"toc").to_string();
        let (source, r) = new_differ(blob(&[(ESTARGZ_TOC_DIGEST_KEY, &d)]), enabled());
        let err = r.unwrap_err();
        assert!(err.is_fallback() && err.can_convert());
        assert_eq!(source.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_oversized_toc_cannot_convert() {
        let d = Digest::sha256_of(b"toc").to_string();
        let annotations = [
            (MANIFEST_CHECKSUM_KEY, d.as_str()),
            (MANIFEST_INFO_KEY, "100:999999999999:999999999999:1"),
            (TAR_SPLIT_INFO_KEY, "0:10:10"),
        ];
        let (_, r) = new_differ(blob(&annotations), enabled());
        let err = r.unwrap_err();
        assert!(err.is_fallback() && !err.can_convert());

        let options = PullOptions {
            convert_images: true,
            ..enabled()
        };
        let (_, r) = new_differ(blob(&annotations), options);
        assert!(matches!(r.unwrap_err(), ChunkedError::PartialPullImpossible(_)));
    }

    #[test]
    fn test_collect_ids_sorted_distinct() {
        let mk = |uid, gid| {
            let mut e = FileEntry::new(EntryType::Dir, "d");
            e.uid = uid;
            e.gid = gid;
            MergedEntry {
                entry: e,
                chunks: Vec::new(),
                skip_set_attrs: false,
            }
        };
        let entries = vec![mk(1000, 5), mk(0, 0), mk(1000, 100), mk(0, 5)];
        assert_eq!(collect_ids(&entries), (vec![0, 1000], vec![0, 5, 100]));
    }
}
