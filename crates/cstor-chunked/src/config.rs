//! Configuration for partial pulls.
//!
//! Partial pulls are configured through the `pull_options` table of the
//! containers `storage.conf`. Every value in that table is a string, so boolean
//! options are spelled `"true"` or `"false"`:
//!
//! ```toml
//! [storage.options.pull_options]
//! enable_partial_images = "true"
//! use_hard_links = "false"
//! ostree_repos = "/ostree/repo:/sysroot/ostree/repo"
//! ```
//!
//! Engine limits that are not exposed in storage.conf live in [`DifferTuning`],
//! and per-call settings live in [`ApplyOptions`].
//!
//! # Usage Example
//!
//! ```no_run
//! use cstor_chunked::PullOptions;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let content = std::fs::read_to_string("/etc/containers/storage.conf")?;
//! let options = PullOptions::from_storage_conf(&content)?;
//! println!("partial pulls enabled: {}", options.enable_partial_images);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

/// Parsed `pull_options` from storage.conf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// `enable_partial_images`: allow partial pulls at all.
    pub enable_partial_images: bool,
    /// `convert_images`: convert layers without a TOC instead of falling back.
    pub convert_images: bool,
    /// `use_hard_links`: deduplicate files with hard links when metadata matches.
    pub use_hard_links: bool,
    /// `insecure_allow_unpredictable_image_contents`: skip the whole-layer digest.
    pub insecure_allow_unpredictable_image_contents: bool,
    /// `ostree_repos`: OSTree repositories used as additional content sources.
    pub ostree_repos: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageConf {
    #[serde(default)]
    storage: StorageSection,
}

#[derive(Debug, Default, Deserialize)]
struct StorageSection {
    #[serde(default)]
    options: OptionsSection,
}

#[derive(Debug, Default, Deserialize)]
struct OptionsSection {
    #[serde(default)]
    pull_options: HashMap<String, String>,
}

impl PullOptions {
    /// Build options from the raw string map found in storage.conf.
    ///
    /// Unknown keys are ignored. Boolean keys are true only when their value
    /// is `"true"` (case-insensitive).
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let flag = |name: &str| {
            map.get(name)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let ostree_repos = map
            .get("ostree_repos")
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            enable_partial_images: flag("enable_partial_images"),
            convert_images: flag("convert_images"),
            use_hard_links: flag("use_hard_links"),
            insecure_allow_unpredictable_image_contents: flag(
                "insecure_allow_unpredictable_image_contents",
            ),
            ostree_repos,
        }
    }

    /// Parse a bare `pull_options` table.
    pub fn from_toml(content: &str) -> Result<Self> {
        let map: HashMap<String, String> = toml::from_str(content)?;
        Ok(Self::from_map(&map))
    }

    /// Parse the `[storage.options.pull_options]` table of a full storage.conf.
    pub fn from_storage_conf(content: &str) -> Result<Self> {
        let conf: StorageConf = toml::from_str(content)?;
        Ok(Self::from_map(&conf.storage.options.pull_options))
    }
}

/// Whether fs-verity should be enabled on reconstructed files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsVerityMode {
    /// Never touch fs-verity.
    #[default]
    Disabled,
    /// Enable it, ignoring filesystems that do not support it.
    IfPossible,
    /// Enable it and fail if that is not possible.
    Required,
}

/// Layout of the reconstructed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The usual directory tree.
    #[default]
    Dir,
    /// Content-addressed layout: each distinct regular file once, named by digest.
    Flat,
}

/// ID mapping range, in the shape used by containers-storage layer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdMapping {
    /// Container ID start.
    pub container_id: u32,
    /// Host ID start.
    pub host_id: u32,
    /// Size of the mapping range.
    pub size: u32,
}

/// Per-call options for [`ChunkedDiffer::apply_diff`](crate::ChunkedDiffer::apply_diff).
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// UID mappings applied to every entry.
    pub uid_maps: Vec<IdMapping>,
    /// GID mappings applied to every entry.
    pub gid_maps: Vec<IdMapping>,
    /// Force every entry to this owner, overriding the mappings.
    pub chown: Option<(u32, u32)>,
    /// Ignore failures to change ownership.
    pub ignore_chown_errors: bool,
    /// fs-verity policy.
    pub fs_verity: FsVerityMode,
    /// Output layout.
    pub format: OutputFormat,
}

/// Engine limits and knobs.
#[derive(Clone)]
pub struct DifferTuning {
    /// Number of concurrent local-dedup workers.
    pub copy_workers: usize,
    /// Gaps at or below this many bytes are always merged.
    pub auto_merge_threshold: u64,
    /// Target number of ranges in the first remote request.
    pub max_missing_chunks: usize,
    /// Size of the copy buffer used while streaming.
    pub copy_buffer_size: usize,
    /// Maximum size of a TOC (compressed or not) kept in memory.
    pub max_toc_size: u64,
    /// Extended attributes that must never be replayed or compared.
    pub xattrs_to_ignore: BTreeSet<String>,
}

impl Default for DifferTuning {
    fn default() -> Self {
        Self {
            copy_workers: 32,
            auto_merge_threshold: 1024,
            max_missing_chunks: 1024,
            copy_buffer_size: 2 << 20,
            max_toc_size: 150 << 20,
            xattrs_to_ignore: BTreeSet::from(["security.selinux".to_string()]),
        }
    }
}

impl std::fmt::Debug for DifferTuning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferTuning")
            .field("copy_workers", &self.copy_workers)
            .field("auto_merge_threshold", &self.auto_merge_threshold)
            .field("max_missing_chunks", &self.max_missing_chunks)
            .field("xattrs_to_ignore", &self.xattrs_to_ignore)
            .finish_non_exhaustive()
    }
}
