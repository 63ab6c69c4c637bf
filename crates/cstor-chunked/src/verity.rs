//! fs-verity enablement and measurement for staged files.

use std::fs::File;

use composefs::fsverity::{
    EnableVerityError, FsVerityHashValue, MeasureVerityError, Sha256HashValue, enable_verity,
    measure_verity,
};

use crate::config::FsVerityMode;
use crate::error::{ChunkedError, Result};

fn unsupported(e: &EnableVerityError) -> bool {
    match e {
        EnableVerityError::FilesystemNotSupported => true,
        EnableVerityError::Io(e) => matches!(
            e.raw_os_error(),
            Some(libc::EOPNOTSUPP | libc::ENOTTY | libc::ENOSYS)
        ),
        _ => false,
    }
}

fn verity_error(path: &str, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> ChunkedError {
    ChunkedError::FsVerity {
        path: path.to_string(),
        source: std::io::Error::other(e),
    }
}

/// Enable fs-verity on `file` according to `mode` and return its measured
/// digest, hex encoded.
///
/// `file` must be opened read-only with no writers left. Returns `None` when
/// verity is disabled, or unsupported and not required.
pub fn enable_and_measure(file: &File, path: &str, mode: FsVerityMode) -> Result<Option<String>> {
    if mode == FsVerityMode::Disabled {
        return Ok(None);
    }
    match enable_verity::<Sha256HashValue>(file) {
        // Already enabled, e.g. on a hard link to a verity file.
        Ok(()) | Err(EnableVerityError::AlreadyEnabled) => {}
        Err(e) if unsupported(&e) && mode != FsVerityMode::Required => {
            tracing::debug!("fs-verity not supported for {path}: {e}");
            return Ok(None);
        }
        Err(e) => return Err(verity_error(path, e)),
    }
    let digest: Sha256HashValue =
        measure_verity(file).map_err(|e: MeasureVerityError| verity_error(path, e))?;
    Ok(Some(digest.to_hex()))
}
