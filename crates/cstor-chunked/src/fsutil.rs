//! Filesystem primitives used while staging a layer.
//!
//! Everything is resolved relative to a `cap_std` [`Dir`] so that names from an
//! untrusted layer cannot reach outside the destination, even through symlinks
//! created earlier in the same layer. Raw syscalls only ever see a directory
//! handle opened that way plus a single path component.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use base64::prelude::*;
use cap_std::fs::{Dir, OpenOptions};
use chrono::{DateTime, Utc};
use rustix::fs::{AtFlags, FileType, Gid, Mode, Timespec, Timestamps, Uid, XattrFlags};
use rustix::io::Errno;

use crate::error::{ChunkedError, Result};
use crate::toc::{EntryType, FileEntry};

/// Clean a layer path into a root-relative form without `.`/`..` components.
///
/// `..` at the root is dropped, as `filepath.Clean("/" + name)` would. The root
/// itself becomes the empty string.
pub fn clean_rel_path(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

/// Split a cleaned path into its parent (possibly empty) and final component.
fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, base)) => (parent, base),
        None => ("", path),
    }
}

/// Open the parent directory of `path`, creating it if needed.
pub(crate) fn open_parent<'a>(root: &Dir, path: &'a str) -> Result<(Dir, &'a str)> {
    let (parent, base) = split_parent(path);
    if base.is_empty() {
        return Err(ChunkedError::Internal(format!("empty file name {path:?}")));
    }
    if parent.is_empty() {
        return Ok((root.try_clone()?, base));
    }
    root.create_dir_all(parent)?;
    Ok((root.open_dir(parent)?, base))
}

/// Create a new regular file for writing; it must not exist yet.
pub(crate) fn create_file(root: &Dir, path: &str) -> Result<File> {
    let (dir, base) = open_parent(root, path)?;
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    Ok(dir.open_with(base, &opts)?.into_std())
}

/// Create a directory (and parents); an existing directory is fine.
pub(crate) fn create_dir(root: &Dir, path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    root.create_dir_all(path)?;
    Ok(())
}

/// Create a symlink, replacing whatever non-directory is at `path`.
pub(crate) fn create_symlink(root: &Dir, target: &str, path: &str) -> Result<()> {
    let (dir, base) = open_parent(root, path)?;
    match dir.symlink_contents(target, base) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            dir.remove_file(base)?;
            dir.symlink_contents(target, base)?;
        }
        r => r?,
    }
    Ok(())
}

/// Create a character or block device node, or a FIFO.
pub(crate) fn create_node(root: &Dir, entry: &FileEntry, path: &str) -> Result<()> {
    let file_type = match entry.entry_type {
        EntryType::Char => FileType::CharacterDevice,
        EntryType::Block => FileType::BlockDevice,
        EntryType::Fifo => FileType::Fifo,
        other => {
            return Err(ChunkedError::Internal(format!(
                "{other:?} is not a device node"
            )));
        }
    };
    let (dir, base) = open_parent(root, path)?;
    let dev = rustix::fs::makedev(entry.devmajor, entry.devminor);
    rustix::fs::mknodat(&dir, base, file_type, Mode::from_raw_mode(entry.mode & 0o7777), dev)
        .map_err(|e| ChunkedError::os("mknodat", path, e))
}

/// Hard link `path` to the existing `target`, replacing any existing file.
pub(crate) fn create_hard_link(root: &Dir, target: &str, path: &str) -> Result<()> {
    let (src_dir, src_base) = open_parent(root, target)?;
    let (dst_dir, dst_base) = open_parent(root, path)?;
    let link = || rustix::fs::linkat(&src_dir, src_base, &dst_dir, dst_base, AtFlags::empty());
    match link() {
        Err(Errno::EXIST) => {
            rustix::fs::unlinkat(&dst_dir, dst_base, AtFlags::empty())
                .map_err(|e| ChunkedError::os("unlinkat", path, e))?;
            link().map_err(|e| ChunkedError::os("linkat", path, e))
        }
        r => r.map_err(|e| ChunkedError::os("linkat", path, e)),
    }
}

/// Extend `file` by a hole of `size` zero bytes at the current position.
pub(crate) fn append_hole(mut file: &File, size: u64) -> Result<()> {
    let delta = i64::try_from(size)
        .map_err(|_| ChunkedError::Internal(format!("hole of {size} bytes")))?;
    let end = file.seek(SeekFrom::Current(delta))?;
    // The hole may be the last thing in the file.
    file.set_len(end)?;
    Ok(())
}

fn proc_fd_path(fd: BorrowedFd<'_>) -> String {
    format!("/proc/self/fd/{}", fd.as_raw_fd())
}

fn reflink_unavailable(e: Errno) -> bool {
    matches!(e, Errno::OPNOTSUPP | Errno::XDEV | Errno::INVAL | Errno::NOSYS | Errno::BADF)
}

/// Copy the whole of `src` into `dest`, preferring a reflink, then
/// `copy_file_range`, then a userspace copy.
pub(crate) fn copy_contents(src: &File, dest: &File) -> Result<u64> {
    match rustix::fs::ioctl_ficlone(dest, src) {
        Ok(()) => return Ok(src.metadata()?.len()),
        Err(e) if reflink_unavailable(e) => {}
        Err(e) => return Err(ChunkedError::os("ficlone", proc_fd_path(dest.as_fd()), e)),
    }

    let mut off_in = 0u64;
    let mut off_out = 0u64;
    loop {
        match rustix::fs::copy_file_range(src, Some(&mut off_in), dest, Some(&mut off_out), 1 << 30) {
            Ok(0) => return Ok(off_out),
            Ok(_) => {}
            Err(e) if off_out == 0 && reflink_unavailable(e) => break,
            Err(e) => return Err(ChunkedError::os("copy_file_range", proc_fd_path(dest.as_fd()), e)),
        }
    }

    let mut reader = src.try_clone()?;
    reader.seek(SeekFrom::Start(0))?;
    let mut writer = dest.try_clone()?;
    writer.seek(SeekFrom::Start(0))?;
    Ok(io::copy(&mut reader, &mut writer)?)
}

/// Copy `src` to the new file `dest` under `root`.
///
/// With `use_hard_links` a hard link is tried first; then the returned file is
/// `None` and the link shares the source's attributes. Otherwise the freshly
/// written copy is returned so its attributes can be set.
pub(crate) fn copy_file_content(
    src: &File,
    root: &Dir,
    dest: &str,
    use_hard_links: bool,
) -> Result<(Option<File>, u64)> {
    let size = src.metadata()?.len();
    if use_hard_links {
        let (dir, base) = open_parent(root, dest)?;
        // Linking through /proc works without CAP_DAC_READ_SEARCH.
        let src_path = proc_fd_path(src.as_fd());
        let link = || rustix::fs::linkat(rustix::fs::CWD, src_path.as_str(), &dir, base, AtFlags::SYMLINK_FOLLOW);
        let mut r = link();
        if r == Err(Errno::EXIST) {
            if let Err(e) = rustix::fs::unlinkat(&dir, base, AtFlags::empty()) {
                tracing::debug!("removing existing {dest} failed: {e}");
            }
            r = link();
        }
        match r {
            Ok(()) => return Ok((None, size)),
            Err(e) => tracing::debug!("hard link to {dest} failed ({e}), copying"),
        }
    }
    let file = create_file(root, dest)?;
    copy_contents(src, &file)?;
    Ok((Some(file), size))
}

/// What [`set_file_attrs`] operates on.
pub(crate) enum AttrTarget<'a> {
    /// An open regular file or directory.
    Fd(BorrowedFd<'a>),
    /// A name in an open directory; never followed if it is a symlink.
    At {
        dir: &'a Dir,
        name: &'a str,
        symlink: bool,
    },
}

/// Ownership and xattr policy for [`set_file_attrs`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttrPolicy<'a> {
    /// Owner to set, already mapped to host IDs.
    pub owner: (u32, u32),
    pub ignore_chown_errors: bool,
    pub xattrs_to_ignore: &'a BTreeSet<String>,
}

fn timespec(t: Option<DateTime<Utc>>) -> Timespec {
    match t {
        Some(t) => Timespec {
            tv_sec: t.timestamp(),
            tv_nsec: t.timestamp_subsec_nanos() as _,
        },
        None => Timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT as _,
        },
    }
}

/// Apply ownership, xattrs, times and mode, in that order.
pub(crate) fn set_file_attrs(
    target: AttrTarget<'_>,
    path: &str,
    entry: &FileEntry,
    policy: &AttrPolicy<'_>,
) -> Result<()> {
    let (uid, gid) = policy.owner;
    let (uid_r, gid_r) = (Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));

    let chown = match &target {
        AttrTarget::Fd(fd) => rustix::fs::fchown(fd, uid_r, gid_r),
        AttrTarget::At { dir, name, .. } => {
            rustix::fs::chownat(dir, *name, uid_r, gid_r, AtFlags::SYMLINK_NOFOLLOW)
        }
    };
    match chown {
        Ok(()) => {}
        Err(_) if policy.ignore_chown_errors => {}
        Err(Errno::INVAL) => {
            return Err(ChunkedError::InsufficientIds {
                uid,
                gid,
                path: path.to_string(),
                source: Errno::INVAL,
            });
        }
        Err(e) => return Err(ChunkedError::os("chown", path, e)),
    }

    for (key, value) in &entry.xattrs {
        if policy.xattrs_to_ignore.contains(key) {
            continue;
        }
        let data = BASE64_STANDARD
            .decode(value)
            .map_err(|e| ChunkedError::InvalidToc(format!("xattr {key} of {path}: {e}")))?;
        let r = match &target {
            AttrTarget::Fd(fd) => rustix::fs::fsetxattr(fd, key.as_str(), &data, XattrFlags::empty()),
            AttrTarget::At { dir, name, .. } => {
                let p = format!("{}/{}", proc_fd_path(dir.as_fd()), name);
                rustix::fs::lsetxattr(p.as_str(), key.as_str(), &data, XattrFlags::empty())
            }
        };
        match r {
            Ok(()) | Err(Errno::NOSYS) | Err(Errno::OPNOTSUPP) => {}
            Err(e) => return Err(ChunkedError::os("setxattr", format!("{path} ({key})"), e)),
        }
    }

    let times = Timestamps {
        last_access: timespec(entry.access_time),
        last_modification: timespec(entry.mod_time),
    };
    let r = match &target {
        AttrTarget::Fd(fd) => rustix::fs::futimens(fd, &times),
        AttrTarget::At { dir, name, .. } => {
            rustix::fs::utimensat(dir, *name, &times, AtFlags::SYMLINK_NOFOLLOW)
        }
    };
    r.map_err(|e| ChunkedError::os("utimensat", path, e))?;

    let mode = Mode::from_raw_mode(entry.mode & 0o7777);
    let r = match &target {
        AttrTarget::Fd(fd) => rustix::fs::fchmod(fd, mode),
        // Symlink permissions are meaningless and cannot be changed on Linux.
        AttrTarget::At { symlink: true, .. } => Ok(()),
        AttrTarget::At { dir, name, .. } => rustix::fs::chmodat(dir, *name, mode, AtFlags::empty()),
    };
    r.map_err(|e| ChunkedError::os("chmod", path, e))
}

/// Apply attributes to a non-regular entry by name.
pub(crate) fn set_attrs_at(
    root: &Dir,
    path: &str,
    entry: &FileEntry,
    policy: &AttrPolicy<'_>,
) -> Result<()> {
    if path.is_empty() || entry.entry_type == EntryType::Dir {
        let dir = if path.is_empty() {
            root.try_clone()?
        } else {
            root.open_dir(path)?
        };
        return set_file_attrs(AttrTarget::Fd(dir.as_fd()), path, entry, policy);
    }
    let (dir, base) = open_parent(root, path)?;
    let symlink = dir.symlink_metadata(base)?.is_symlink();
    set_file_attrs(
        AttrTarget::At {
            dir: &dir,
            name: base,
            symlink,
        },
        path,
        entry,
        policy,
    )
}
