//! Content digests in the `algorithm:hex` form used by OCI.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{ChunkedError, Result};

/// Digest of the empty byte string.
pub const EMPTY_SHA256: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A validated `algorithm:hex` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || ChunkedError::InvalidDigest(s.to_string());
        let (algorithm, encoded) = s.split_once(':').ok_or_else(invalid)?;
        if algorithm.is_empty()
            || !algorithm
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b))
        {
            return Err(invalid());
        }
        if encoded.is_empty() || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        if algorithm == "sha256" && encoded.len() != 64 {
            return Err(invalid());
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_ascii_lowercase(),
        })
    }

    /// Digest algorithm, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Hex encoded value.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Binary form used as cache key: algorithm bytes, `:`, raw digest bytes.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let raw =
            hex::decode(&self.encoded).map_err(|_| ChunkedError::InvalidDigest(self.to_string()))?;
        let mut buf = Vec::with_capacity(self.algorithm.len() + 1 + raw.len());
        buf.extend_from_slice(self.algorithm.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&raw);
        Ok(buf)
    }

    /// sha256 of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut d = Digester::new();
        d.update(data);
        d.finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = ChunkedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Binary cache key for a digest string.
pub fn binary_digest(s: &str) -> Result<Vec<u8>> {
    Digest::parse(s)?.to_binary()
}

/// Streaming sha256 digester that can be used as an [`io::Write`] sink.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    /// Create a new digester.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Feed `size` zero bytes.
    pub fn update_zeros(&mut self, mut size: u64) {
        const ZEROS: [u8; 8192] = [0u8; 8192];
        while size > 0 {
            let n = size.min(ZEROS.len() as u64) as usize;
            self.hasher.update(&ZEROS[..n]);
            size -= n as u64;
        }
    }

    /// Finish and return the digest.
    pub fn finish(self) -> Digest {
        Digest {
            algorithm: "sha256".to_string(),
            encoded: format!("{:x}", self.hasher.finalize()),
        }
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
