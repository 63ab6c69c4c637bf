//! Error types for the cstor-chunked library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, ChunkedError>`.
//!
//! # Error Categories
//!
//! - **Fallback**: [`FallbackRecommended`] means the partial-pull preconditions
//!   are not met. Callers are expected to retry with an ordinary full-layer
//!   download (or, when [`ChunkedError::can_convert`] is true, with conversion).
//! - **Transport**: [`BadRequest`] means a merged range request was rejected and
//!   must be split and retried. It never reaches the end user.
//! - **Integrity**: [`ChecksumMismatch`] aborts the whole reconstruction.
//! - **Index**: [`CorruptIndex`] is raised by the cache file reader and is
//!   handled inside the layers cache by ignoring the affected layer.
//! - **System errors**: [`Io`], [`Os`], [`JsonParse`]
//!
//! [`FallbackRecommended`]: ChunkedError::FallbackRecommended
//! [`BadRequest`]: ChunkedError::BadRequest
//! [`ChecksumMismatch`]: ChunkedError::ChecksumMismatch
//! [`CorruptIndex`]: ChunkedError::CorruptIndex
//! [`Io`]: ChunkedError::Io
//! [`Os`]: ChunkedError::Os
//! [`JsonParse`]: ChunkedError::JsonParse
//!
//! # Error Handling Example
//!
//! ```no_run
//! use cstor_chunked::ChunkedError;
//!
//! fn pull(result: Result<(), ChunkedError>) -> Result<(), ChunkedError> {
//!     match result {
//!         Err(e) if e.is_fallback() => {
//!             eprintln!("partial pull not possible, downloading the full layer: {e}");
//!             Ok(())
//!         }
//!         other => other,
//!     }
//! }
//! ```

/// Result type alias for operations that may return a ChunkedError.
pub type Result<T> = std::result::Result<T, ChunkedError>;

/// Error types for chunked layer operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    /// Partial pull is not possible; retry with a full layer download.
    #[error("falling back to ordinary layer download: {reason}")]
    FallbackRecommended {
        /// Human readable reason.
        reason: String,
        /// Whether converting the full blob on the fly would work instead.
        can_convert: bool,
    },

    /// The blob source rejected a range request as malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A file or blob digest did not match the expected value.
    #[error("checksum mismatch for {path:?} (got {actual:?} instead of {expected:?})")]
    ChecksumMismatch {
        /// Path (or blob name) that failed verification.
        path: String,
        /// Declared digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// A cache file is internally inconsistent.
    #[error("corrupt cache index: {0}")]
    CorruptIndex(String),

    /// The table of contents could not be parsed or is inconsistent.
    #[error("invalid TOC: {0}")]
    InvalidToc(String),

    /// A digest string could not be parsed.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// Error related to tar-split processing.
    #[error("tar-split error: {0}")]
    TarSplitError(String),

    /// The blob source produced more streams than ranges were requested.
    #[error("too many streams returned, got more than {0}")]
    TooManyStreams(usize),

    /// The blob source produced fewer streams than ranges were requested.
    #[error("not enough data returned from the server: {0}")]
    MissingData(String),

    /// chown failed with EINVAL, which almost always means the IDs are not mapped.
    #[error(
        "potentially insufficient UIDs or GIDs available in the user namespace (requested {uid}:{gid} for {path}): check /etc/subuid and /etc/subgid: {source}"
    )]
    InsufficientIds {
        /// Requested owner.
        uid: u32,
        /// Requested group.
        gid: u32,
        /// Path being changed.
        path: String,
        /// Underlying errno.
        source: rustix::io::Errno,
    },

    /// A container ID has no host counterpart in the configured mapping.
    #[error("container {kind} {id} cannot be mapped to a host ID")]
    UnmappedId {
        /// `"uid"` or `"gid"`.
        kind: &'static str,
        /// The container ID.
        id: u32,
    },

    /// Enabling or measuring fs-verity failed.
    #[error("fs-verity on {path}: {source}")]
    FsVerity {
        /// Path of the file.
        path: String,
        /// Error reported by the verity layer.
        source: std::io::Error,
    },

    /// Partial pull failed in a way that conversion cannot fix either.
    #[error("neither a partial pull nor convert_images is possible: {0}")]
    PartialPullImpossible(String),

    /// A differ instance was used twice.
    #[error("internal error: chunked differ already used")]
    DifferAlreadyUsed,

    /// A condition that should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),

    /// A system call failed on a specific path.
    #[error("{op} {path}: {source}")]
    Os {
        /// Name of the failing operation.
        op: &'static str,
        /// Path passed to the operation.
        path: String,
        /// Underlying errno.
        source: rustix::io::Errno,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl ChunkedError {
    /// Build a fallback error.
    pub(crate) fn fallback(reason: impl Into<String>, can_convert: bool) -> Self {
        ChunkedError::FallbackRecommended {
            reason: reason.into(),
            can_convert,
        }
    }

    /// Build an [`ChunkedError::Os`] from an errno.
    pub(crate) fn os(op: &'static str, path: impl Into<String>, source: rustix::io::Errno) -> Self {
        ChunkedError::Os {
            op,
            path: path.into(),
            source,
        }
    }

    /// True if the caller should retry with an ordinary layer download.
    pub fn is_fallback(&self) -> bool {
        matches!(self, ChunkedError::FallbackRecommended { .. })
    }

    /// True if the caller may retry by converting the full blob.
    pub fn can_convert(&self) -> bool {
        matches!(
            self,
            ChunkedError::FallbackRecommended {
                can_convert: true,
                ..
            }
        )
    }

    /// True if the blob source rejected the request shape.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, ChunkedError::BadRequest(_))
    }

    /// Returns the errno carried by this error, if any.
    pub fn errno(&self) -> Option<rustix::io::Errno> {
        match self {
            ChunkedError::Os { source, .. } | ChunkedError::InsufficientIds { source, .. } => {
                Some(*source)
            }
            ChunkedError::Io(e) | ChunkedError::FsVerity { source: e, .. } => {
                e.raw_os_error().map(rustix::io::Errno::from_raw_os_error)
            }
            _ => None,
        }
    }
}
