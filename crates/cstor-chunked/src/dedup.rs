//! Satisfying files and chunks from content already on this host.
//!
//! Before anything is fetched, every regular file of the layer is looked up
//! in the other layers of the store and in any configured OSTree
//! repositories. Lookups run on a small thread pool because they are
//! dominated by `open`/`copy_file_range` latency.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::channel;

use base64::prelude::*;
use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::digest::{Digest, Digester};
use crate::error::Result;
use crate::fsutil::copy_file_content;
use crate::layers_cache::{CacheHit, LayersCache};
use crate::reconstruct::Stage;
use crate::scheduler::OriginFile;
use crate::toc::FileEntry;

/// Run `job` for every index in `0..count` on up to `workers` threads.
///
/// Results land in a slot per job, in job order.
pub(crate) fn run_pool<R, F>(count: usize, workers: usize, job: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync,
{
    let (job_tx, job_rx) = channel::<usize>();
    for i in 0..count {
        // The receiver is alive until the end of this function.
        let _ = job_tx.send(i);
    }
    drop(job_tx);
    let job_rx = Mutex::new(job_rx);
    let (result_tx, result_rx) = channel::<(usize, R)>();

    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(count).collect();
    std::thread::scope(|s| {
        for _ in 0..workers.clamp(1, count.max(1)) {
            let result_tx = result_tx.clone();
            let job_rx = &job_rx;
            let job = &job;
            s.spawn(move || {
                loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => return,
                    };
                    let Ok(i) = next else {
                        return;
                    };
                    if result_tx.send((i, job(i))).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);
        for (i, r) in result_rx {
            slots[i] = Some(r);
        }
    });
    slots.into_iter().flatten().collect()
}

/// How a file was satisfied locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalCopy {
    /// Hard linked; shares the source's attributes.
    Linked,
    /// Copied into a new file.
    Copied,
}

/// Local content sources.
pub(crate) struct Dedup<'a> {
    pub cache: Option<&'a LayersCache>,
    pub ostree_repos: &'a [PathBuf],
    pub use_hard_links: bool,
}

fn open_in_layer(hit: &CacheHit) -> io::Result<File> {
    let root = Dir::open_ambient_dir(&hit.root, ambient_authority())?;
    Ok(root.open(&hit.location.path)?.into_std())
}

/// Extended attributes of `file` except those in `ignore`, base64 encoded.
fn read_xattrs(file: &File, ignore: &BTreeSet<String>) -> io::Result<std::collections::BTreeMap<String, String>> {
    let mut list = vec![0u8; 65536];
    let n = match rustix::fs::flistxattr(file.as_fd(), &mut list[..]) {
        Ok(n) => n,
        Err(rustix::io::Errno::OPNOTSUPP) => 0,
        Err(e) => return Err(e.into()),
    };
    let names: Vec<u8> = list[..n].iter().map(|&c| c as u8).collect();
    let mut out = std::collections::BTreeMap::new();
    let mut value = vec![0u8; 65536];
    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let name = String::from_utf8_lossy(name).into_owned();
        if ignore.contains(&name) {
            continue;
        }
        let len = rustix::fs::fgetxattr(file.as_fd(), name.as_str(), &mut value[..])?;
        out.insert(name, BASE64_STANDARD.encode(&value[..len]));
    }
    Ok(out)
}

/// Whether hard linking `file` in place of `entry` preserves every attribute
/// that matters.
fn metadata_matches(file: &File, entry: &FileEntry, ignore: &BTreeSet<String>) -> io::Result<bool> {
    let md = file.metadata()?;
    if md.uid() != entry.uid || md.gid() != entry.gid {
        return Ok(false);
    }
    if md.permissions().mode() & 0o7777 != entry.mode & 0o7777 {
        return Ok(false);
    }
    let expected: std::collections::BTreeMap<_, _> = entry
        .xattrs
        .iter()
        .filter(|(k, _)| !ignore.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(read_xattrs(file, ignore)? == expected)
}

impl Dedup<'_> {
    /// Try to satisfy regular file `index` from local content.
    pub fn find_and_copy_file(&self, stage: &Stage<'_>, index: usize) -> Result<Option<LocalCopy>> {
        let entry = &stage.entries[index].entry;
        let path = stage.path(index);

        let mut found = self.copy_from_other_layers(stage, entry, &path)?;
        if found.is_none() {
            found = self.copy_from_ostree(stage, entry, &path)?;
        }
        match found {
            None => Ok(None),
            Some((None, _)) => Ok(Some(LocalCopy::Linked)),
            Some((Some(file), _)) => {
                stage.finalize_file(file, index)?;
                Ok(Some(LocalCopy::Copied))
            }
        }
    }

    fn copy_from_other_layers(
        &self,
        stage: &Stage<'_>,
        entry: &FileEntry,
        path: &str,
    ) -> Result<Option<(Option<File>, u64)>> {
        let Some(cache) = self.cache else {
            return Ok(None);
        };
        let mut attempts = Vec::with_capacity(2);
        if self.use_hard_links {
            attempts.push(true);
        }
        attempts.push(false);
        for hard_link in attempts {
            let Some(hit) = cache.find_file_in_other_layers(entry, hard_link)? else {
                continue;
            };
            let src = match open_in_layer(&hit) {
                Ok(f) => f,
                Err(e) => {
                    tracing::debug!(
                        "Cannot open {:?} in layer {}: {e}",
                        hit.location.path,
                        hit.layer_id
                    );
                    continue;
                }
            };
            return copy_file_content(&src, stage.root, path, hard_link).map(Some);
        }
        Ok(None)
    }

    fn ostree_candidate(repo: &Path, digest: &Digest) -> PathBuf {
        let link = format!("{}.payload-link", digest.encoded());
        repo.join("objects").join(&link[..2]).join(&link[2..])
    }

    fn copy_from_ostree(
        &self,
        stage: &Stage<'_>,
        entry: &FileEntry,
        path: &str,
    ) -> Result<Option<(Option<File>, u64)>> {
        let Some(digest) = entry.digest.as_deref() else {
            return Ok(None);
        };
        if self.ostree_repos.is_empty() {
            return Ok(None);
        }
        let digest = Digest::parse(digest)?;
        let mut attempts = Vec::with_capacity(2);
        if self.use_hard_links {
            attempts.push(true);
        }
        attempts.push(false);
        for hard_link in attempts {
            for repo in self.ostree_repos {
                let candidate = Self::ostree_candidate(repo, &digest);
                let Ok(src) = File::open(&candidate) else {
                    continue;
                };
                let md = src.metadata()?;
                if !md.is_file() || md.len() != entry.size {
                    continue;
                }
                if hard_link && !metadata_matches(&src, entry, stage.xattrs_to_ignore)? {
                    continue;
                }
                match copy_file_content(&src, stage.root, path, hard_link) {
                    Ok(r) => return Ok(Some(r)),
                    Err(e) => {
                        tracing::debug!("Could not copy {}: {e}", candidate.display());
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Look for a chunk in another layer and check its content before
    /// trusting the location.
    pub fn find_chunk(&self, chunk: &FileEntry, size: u64) -> Result<Option<OriginFile>> {
        let Some(cache) = self.cache else {
            return Ok(None);
        };
        let Some(expected) = chunk.chunk_digest.as_deref() else {
            return Ok(None);
        };
        let Some(hit) = cache.find_chunk_in_other_layers(chunk)? else {
            return Ok(None);
        };
        let expected = Digest::parse(expected)?;
        match validate_chunk(&hit, size, &expected) {
            Ok(true) => Ok(Some(OriginFile {
                root: hit.root,
                path: hit.location.path,
                offset: hit.location.offset,
            })),
            Ok(false) => Ok(None),
            Err(e) => {
                tracing::debug!("Cannot validate chunk of {:?}: {e}", chunk.name);
                Ok(None)
            }
        }
    }
}

fn validate_chunk(hit: &CacheHit, size: u64, expected: &Digest) -> io::Result<bool> {
    let mut file = open_in_layer(hit)?;
    file.seek(SeekFrom::Start(hit.location.offset))?;
    let mut digester = Digester::new();
    let n = io::copy(&mut file.take(size), &mut digester)?;
    Ok(n == size && &digester.finish() == expected)
}
