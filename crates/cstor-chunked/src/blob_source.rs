//! Ranged access to the layer blob.
//!
//! A [`BlobSource`] answers a list of byte ranges with two channels: one
//! delivering a reader per range, in request order, and one delivering errors.
//! [`get_blob_at`] multiplexes both into a single [`FanIn`], which enforces the
//! stream count and always drains whatever the source still produces, so an
//! early return never leaves a sender blocked or a stream open.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use crate::error::{ChunkedError, Result};

/// A byte range of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSourceChunk {
    /// Offset from the start of the blob.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

/// A reader over one requested range.
pub type BlobStream = Box<dyn Read + Send>;

/// The channels a [`BlobSource`] answers with.
pub struct BlobResponse {
    /// One reader per requested range, in order.
    pub streams: Receiver<BlobStream>,
    /// Errors encountered while serving the ranges.
    pub errors: Receiver<ChunkedError>,
}

impl BlobResponse {
    /// A response whose streams and errors are all known up front.
    pub fn ready(streams: Vec<BlobStream>, errors: Vec<ChunkedError>) -> Self {
        let (stx, srx) = channel();
        let (etx, erx) = channel();
        for s in streams {
            let _ = stx.send(s);
        }
        for e in errors {
            let _ = etx.send(e);
        }
        Self {
            streams: srx,
            errors: erx,
        }
    }
}

/// Source of blob byte ranges, typically a registry connection.
pub trait BlobSource: Send + Sync {
    /// Request `chunks`.
    ///
    /// An immediate [`ChunkedError::BadRequest`] means the request shape was
    /// rejected and the caller should retry with fewer, larger ranges. The
    /// total number of streams plus errors delivered must not exceed
    /// `chunks.len()`.
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobResponse>;
}

/// An item of the fan-in channel.
enum StreamOrError {
    Stream(BlobStream),
    Error(ChunkedError),
}

/// Single ordered view of a [`BlobResponse`].
///
/// Dropping it drains and closes everything still in flight.
pub struct FanIn {
    rx: Option<Receiver<StreamOrError>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for FanIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanIn").finish_non_exhaustive()
    }
}

fn forward_streams(streams: Receiver<BlobStream>, tx: Sender<StreamOrError>, max_streams: usize) {
    let mut seen = 0usize;
    let mut too_many = false;
    for s in streams {
        if seen >= max_streams {
            too_many = true;
            drop(s);
            continue;
        }
        seen += 1;
        // A gone consumer means we just close the stream.
        let _ = tx.send(StreamOrError::Stream(s));
    }
    if too_many {
        let _ = tx.send(StreamOrError::Error(ChunkedError::TooManyStreams(max_streams)));
    }
}

fn forward_errors(errors: Receiver<ChunkedError>, tx: Sender<StreamOrError>) {
    for e in errors {
        let _ = tx.send(StreamOrError::Error(e));
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    Ok(std::thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Request `chunks` from `source` and multiplex the answer.
pub fn get_blob_at(source: &dyn BlobSource, chunks: &[ImageSourceChunk]) -> Result<FanIn> {
    let response = source.get_blob_at(chunks)?;
    let (tx, rx) = channel();
    let max_streams = chunks.len();
    let etx = tx.clone();
    let mut workers = Vec::with_capacity(2);
    workers.push(spawn("blob-streams", move || {
        forward_streams(response.streams, tx, max_streams)
    })?);
    let errors = response.errors;
    workers.push(spawn("blob-errors", move || forward_errors(errors, etx))?);
    Ok(FanIn {
        rx: Some(rx),
        workers,
    })
}

impl FanIn {
    /// Next stream, in request order.
    ///
    /// Fails with the next error the source reported, or with
    /// [`ChunkedError::MissingData`] if the source ran out of streams.
    pub fn next_stream(&mut self) -> Result<BlobStream> {
        let item = self.rx.as_ref().and_then(|rx| rx.recv().ok());
        match item {
            Some(StreamOrError::Stream(s)) => Ok(s),
            Some(StreamOrError::Error(e)) => Err(e),
            None => Err(ChunkedError::MissingData(
                "the blob source returned fewer streams than requested".to_string(),
            )),
        }
    }

    /// Close every remaining stream, returning the first error still pending.
    pub fn finish(mut self) -> Result<()> {
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        let mut first = None;
        if let Some(rx) = self.rx.take() {
            for item in rx {
                if let StreamOrError::Error(e) = item
                    && first.is_none()
                {
                    first = Some(e);
                }
            }
        }
        for w in self.workers.drain(..) {
            if w.join().is_err() && first.is_none() {
                first = Some(ChunkedError::Internal("blob fan-in thread panicked".into()));
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for FanIn {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            tracing::debug!("discarding blob source error after abort: {e}");
        }
    }
}

/// Fetch `chunks` fully into memory.
pub fn read_chunks(source: &dyn BlobSource, chunks: &[ImageSourceChunk]) -> Result<Vec<Vec<u8>>> {
    let mut fan_in = get_blob_at(source, chunks)?;
    let mut out = Vec::with_capacity(chunks.len());
    for c in chunks {
        let mut stream = fan_in.next_stream()?;
        let mut buf = Vec::with_capacity(usize::try_from(c.length).unwrap_or(0));
        stream.read_to_end(&mut buf)?;
        out.push(buf);
    }
    fan_in.finish()?;
    Ok(out)
}

/// Reader over a byte range of a shared file.
#[derive(Debug)]
pub struct SectionReader {
    file: Arc<File>,
    offset: u64,
    remaining: u64,
}

impl SectionReader {
    /// Read `length` bytes of `file` starting at `offset`.
    pub fn new(file: Arc<File>, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            remaining: length,
        }
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let n = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.file.read_at(&mut buf[..n], self.offset)?;
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// [`BlobSource`] over a local file, used when a blob was fetched whole.
#[derive(Debug, Clone)]
pub struct FileBlobSource {
    file: Arc<File>,
}

impl FileBlobSource {
    /// Serve ranges of `file`.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }
}

impl BlobSource for FileBlobSource {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> Result<BlobResponse> {
        let streams = chunks
            .iter()
            .map(|c| Box::new(SectionReader::new(self.file.clone(), c.offset, c.length)) as BlobStream)
            .collect();
        Ok(BlobResponse::ready(streams, Vec::new()))
    }
}
