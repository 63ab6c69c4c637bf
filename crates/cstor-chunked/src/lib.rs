#![deny(unsafe_code)]
//! Partial pulls of chunked container image layers.
//!
//! A layer blob in zstd:chunked or eStargz format carries a table of contents
//! (TOC) listing every file together with the digests and blob offsets of its
//! chunks. This crate uses the TOC to recreate the layer in a staging
//! directory while transferring as little as possible: files and chunks that
//! already exist in other layers of the local store (or in OSTree
//! repositories) are copied or hard linked, and only the remaining ranges are
//! requested from the registry.
//!
//! # Overview
//!
//! - [`ChunkedDiffer`] is the entry point. It decides whether a partial pull
//!   is possible, fetches and verifies the TOC, and applies the layer.
//! - [`LayersCache`] indexes the content of existing layers so it can be
//!   found by digest.
//! - [`BlobSource`] abstracts the transport that serves byte ranges of the
//!   blob.
//! - Layers without a usable TOC can be converted locally when
//!   `convert_images` is enabled.
//!
//! The result of a partial pull is indistinguishable from a full pull: unless
//! explicitly disabled, the uncompressed tar stream is regenerated from the
//! staged files and the tar-split metadata, and its digest is reported as the
//! layer's `DiffID`.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use cstor_chunked::{BlobInfo, ChunkedDiffer, DifferTuning, FileBlobSource, PullOptions};
//!
//! let options = PullOptions::from_storage_conf(&std::fs::read_to_string(
//!     "/etc/containers/storage.conf",
//! )?)?;
//! let blob = std::fs::File::open("/tmp/layer")?;
//! let info = BlobInfo {
//!     digest: "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".parse()?,
//!     size: blob.metadata()?.len(),
//!     annotations: HashMap::new(),
//! };
//! match ChunkedDiffer::new(Arc::new(FileBlobSource::new(blob)), info, options, DifferTuning::default(), None) {
//!     Ok(_differ) => println!("partial pull possible"),
//!     Err(e) if e.is_fallback() => println!("use an ordinary download: {e}"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Errors and configuration
pub mod config;
pub mod error;

// TOC and tar metadata
pub mod digest;
pub mod manifest;
pub mod tar_split;
pub mod tar_split_writer;
pub mod toc;

// Local content index
pub mod bloom;
pub mod cache_file;
pub mod layers_cache;

// Fetching and reconstruction
pub mod blob_source;
pub mod convert;
mod dedup;
pub mod differ;
mod fsutil;
pub mod idmap;
mod reconstruct;
pub mod scheduler;
pub mod verity;

pub use blob_source::{BlobResponse, BlobSource, BlobStream, FileBlobSource, ImageSourceChunk};
pub use config::{
    ApplyOptions, DifferTuning, FsVerityMode, IdMapping, OutputFormat, PullOptions,
};
pub use differ::{BlobInfo, ChunkedDiffer, DifferOutput, DifferStats};
pub use digest::{Digest, Digester};
pub use error::{ChunkedError, Result};
pub use fsutil::clean_rel_path;
pub use layers_cache::{LayerData, LayerStore, LayersCache, StoredLayer};
pub use tar_split_writer::TarSplitWriter;
pub use toc::{FileEntry, Toc};
