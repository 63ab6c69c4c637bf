//! Planning of the remote range requests for content that is not on disk.
//!
//! The differ describes every missing chunk as a [`MissingPart`]. Parts that
//! are holes or can be read from another local file need no network I/O; the
//! others each name a byte range of the blob. [`merge_missing_chunks`] folds
//! them into fewer, larger requests, inserting gap pseudo-chunks so the
//! reconstructor knows which bytes of a merged range to throw away.

use std::path::PathBuf;

use crate::blob_source::ImageSourceChunk;

/// Content available in a file of another local layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginFile {
    /// Root directory of the layer.
    pub root: PathBuf,
    /// Path relative to `root`.
    pub path: String,
    /// Offset of the content in the file.
    pub offset: u64,
}

/// One piece of a destination file, or bytes to skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFileChunk {
    /// Bytes of the part stream to discard; nonzero only for gap pseudo-chunks.
    pub gap: u64,
    /// The content is zeros.
    pub hole: bool,
    /// Index of the destination file in the differ's entry list; `None` for gaps.
    pub file: Option<usize>,
    /// Bytes this chunk occupies in the part stream.
    pub compressed_size: u64,
    /// Bytes this chunk contributes to the destination file.
    pub uncompressed_size: u64,
}

impl MissingFileChunk {
    /// A chunk of destination file `file`.
    pub fn new(file: usize, compressed_size: u64, uncompressed_size: u64) -> Self {
        Self {
            gap: 0,
            hole: false,
            file: Some(file),
            compressed_size,
            uncompressed_size,
        }
    }

    /// Bytes to skip.
    pub fn gap(size: u64) -> Self {
        Self {
            gap: size,
            hole: false,
            file: None,
            compressed_size: 0,
            uncompressed_size: 0,
        }
    }
}

/// A unit of work for the reconstructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPart {
    /// Byte range of the blob holding this part's data.
    pub source: ImageSourceChunk,
    /// The whole part is zeros.
    pub hole: bool,
    /// The data can be read from a local file instead.
    pub origin: Option<OriginFile>,
    /// Destination chunks in stream order.
    pub chunks: Vec<MissingFileChunk>,
}

impl MissingPart {
    /// True if the part must be fetched from the blob source.
    pub fn is_remote(&self) -> bool {
        !self.hole && self.origin.is_none()
    }

    fn end(&self) -> u64 {
        self.source.offset + self.source.length
    }
}

/// Ranges to request for `parts`, in order.
pub fn chunks_to_request(parts: &[MissingPart]) -> Vec<ImageSourceChunk> {
    parts
        .iter()
        .filter(|p| p.is_remote())
        .map(|p| p.source)
        .collect()
}

/// Bytes between the end of `prev` and the start of `next`, or `None` if
/// they overlap or are out of order.
fn gap_between(prev: &MissingPart, next: &MissingPart) -> Option<u64> {
    next.source.offset.checked_sub(prev.end())
}

/// Fold `parts` so that at most `max(target, 1)` remote requests remain,
/// except that gaps of at most `auto_merge_threshold` bytes are always merged.
pub fn merge_missing_chunks(
    parts: Vec<MissingPart>,
    target: usize,
    auto_merge_threshold: u64,
) -> Vec<MissingPart> {
    // Contiguous single-chunk pieces of the same file become one chunk.
    let mut simplified: Vec<MissingPart> = Vec::with_capacity(parts.len());
    for part in parts {
        if let Some(prev) = simplified.last_mut()
            && prev.is_remote()
            && part.is_remote()
            && gap_between(prev, &part) == Some(0)
            && prev.chunks.len() == 1
            && part.chunks.len() == 1
            && prev.chunks[0].file.is_some()
            && prev.chunks[0].file == part.chunks[0].file
        {
            prev.source.length += part.source.length;
            prev.chunks[0].compressed_size += part.chunks[0].compressed_size;
            prev.chunks[0].uncompressed_size += part.chunks[0].uncompressed_size;
            continue;
        }
        simplified.push(part);
    }
    let parts = simplified;

    struct Gap {
        from: usize,
        to: usize,
        cost: u64,
    }
    let mut gaps = Vec::new();
    let mut last_remote: Option<usize> = None;
    let mut remote_count = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if !part.is_remote() {
            continue;
        }
        remote_count += 1;
        if let Some(from) = last_remote {
            // Only ranges in ascending order can be coalesced, and every part in
            // between must be as well.
            let ordered = (from + 1..=i).all(|j| gap_between(&parts[j - 1], &parts[j]).is_some());
            if ordered && let Some(cost) = gap_between(&parts[from], part) {
                gaps.push(Gap { from, to: i, cost });
            }
        }
        last_remote = Some(i);
    }
    gaps.sort_by_key(|g| g.cost);

    let mut to_merge = vec![false; parts.len()];
    let mut excess = remote_count.saturating_sub(target.max(1));
    for g in &gaps {
        if excess == 0 && g.cost > auto_merge_threshold {
            continue;
        }
        for m in &mut to_merge[g.from + 1..=g.to] {
            *m = true;
        }
        excess = excess.saturating_sub(1);
    }

    let mut merged: Vec<MissingPart> = Vec::with_capacity(parts.len());
    let mut prev_end = 0u64;
    for (i, part) in parts.into_iter().enumerate() {
        let end = part.end();
        match merged.last_mut() {
            Some(prev) if to_merge[i] => {
                let gap = part.source.offset - prev_end;
                prev.source.length += gap + part.source.length;
                prev.hole = false;
                prev.origin = None;
                if gap > 0 {
                    prev.chunks.push(MissingFileChunk::gap(gap));
                }
                prev.chunks.extend(part.chunks);
            }
            _ => merged.push(part),
        }
        prev_end = end;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(file: usize, offset: u64, length: u64) -> MissingPart {
        MissingPart {
            source: ImageSourceChunk { offset, length },
            hole: false,
            origin: None,
            chunks: vec![MissingFileChunk::new(file, length, length * 2)],
        }
    }

    fn hole(file: usize, offset: u64, length: u64) -> MissingPart {
        let mut p = remote(file, offset, length);
        p.hole = true;
        p.chunks[0].hole = true;
        p
    }

    fn requested_bytes(parts: &[MissingPart]) -> u64 {
        chunks_to_request(parts).iter().map(|c| c.length).sum()
    }

    #[test]
    fn test_same_file_contiguous_chunks_collapse() {
        let parts = vec![remote(0, 0, 10), remote(0, 10, 5), remote(1, 20, 5)];
        let merged = merge_missing_chunks(parts, 10, 0);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, ImageSourceChunk { offset: 0, length: 15 });
        assert_eq!(merged[0].chunks.len(), 1);
        assert_eq!(merged[0].chunks[0].compressed_size, 15);
        assert_eq!(merged[0].chunks[0].uncompressed_size, 30);
    }

    #[test]
    fn test_target_met_keeps_expensive_gaps() {
        let parts = vec![remote(0, 0, 10), remote(1, 5000, 10), remote(2, 10000, 10)];
        let merged = merge_missing_chunks(parts.clone(), 3, 1024);
        assert_eq!(merged, parts);
    }

    #[test]
    fn test_small_gaps_always_merged() {
        let parts = vec![remote(0, 0, 10), remote(1, 20, 10), remote(2, 10000, 10)];
        let merged = merge_missing_chunks(parts, 100, 1024);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, ImageSourceChunk { offset: 0, length: 30 });
        let kinds: Vec<_> = merged[0].chunks.iter().map(|c| (c.gap, c.file)).collect();
        assert_eq!(kinds, vec![(0, Some(0)), (10, None), (0, Some(1))]);
    }

    #[test]
    fn test_cheapest_gaps_merged_first() {
        let parts = vec![
            remote(0, 0, 10),
            remote(1, 5000, 10),
            remote(2, 7000, 10),
            remote(3, 20000, 10),
        ];
        let merged = merge_missing_chunks(parts, 3, 0);
        let requests = chunks_to_request(&merged);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1], ImageSourceChunk { offset: 5000, length: 2010 });
    }

    #[test]
    fn test_request_count_bounded_by_target() {
        let parts: Vec<_> = (0..50).map(|i| remote(i, i as u64 * 1000, 100)).collect();
        for target in [1usize, 2, 7, 25, 49, 50, 100] {
            let merged = merge_missing_chunks(parts.clone(), target, 0);
            let n = chunks_to_request(&merged).len();
            assert!(n <= target.max(1), "target {target} gave {n}");
            // Merging never requests bytes outside the overall span.
            assert!(requested_bytes(&merged) <= 49 * 1000 + 100);
        }
        let merged = merge_missing_chunks(parts.clone(), 0, 0);
        assert_eq!(chunks_to_request(&merged).len(), 1);
    }

    #[test]
    fn test_local_parts_not_requested_unless_bridged() {
        let parts = vec![remote(0, 0, 10), hole(1, 10, 10), remote(2, 5000, 10)];
        let merged = merge_missing_chunks(parts.clone(), 10, 0);
        assert_eq!(merged.len(), 3);
        assert_eq!(chunks_to_request(&merged).len(), 2);

        // Forced into one request: the hole is fetched but still flagged as a hole.
        let merged = merge_missing_chunks(parts, 1, 0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, ImageSourceChunk { offset: 0, length: 5010 });
        let flags: Vec<_> = merged[0].chunks.iter().map(|c| (c.gap, c.hole)).collect();
        assert_eq!(flags, vec![(0, false), (0, true), (4980, false), (0, false)]);
    }

    #[test]
    fn test_out_of_order_ranges_never_merged() {
        let parts = vec![remote(0, 100, 10), remote(1, 0, 10)];
        let merged = merge_missing_chunks(parts.clone(), 1, 1024);
        assert_eq!(merged, parts);
    }
}
