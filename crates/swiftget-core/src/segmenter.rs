//! Segment type and range planning.
//!
//! A download is split into contiguous byte ranges, one per worker. Ranges use
//! inclusive ends to match the HTTP `Range: bytes=start-end` form. Failed
//! segments can have their unfinished tail re-split across surviving workers;
//! those child segments carry a reference to their parent.

/// A single segment: inclusive byte range `[start, end]` of the remote file.
///
/// Zero-length segments (emitted when the plan has more parts than bytes)
/// have `end < start` and are skipped by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    /// Stable id. Original segments use their plan position (0-based).
    /// Redistributed children use a negative id derived from the parent.
    pub id: i64,
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (inclusive). `end < start` means zero length.
    pub end: u64,
    /// Plan position of the parent segment when this range was produced by
    /// redistribution; `None` for original segments.
    pub parent: Option<usize>,
}

impl SegmentRange {
    /// Length of this segment in bytes.
    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start)
    }

    /// True for zero-length segments (plan had more parts than bytes).
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// HTTP Range header value: `bytes=start-end`.
    pub fn range_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Range header value for resuming this segment after `done` bytes.
    pub fn resume_range_header_value(&self, done: u64) -> String {
        format!("bytes={}-{}", self.start + done, self.end)
    }
}

/// Builds a segment plan for `total_size` bytes split into `count` parts.
///
/// Always returns exactly `count` ranges: parts are contiguous with no gaps
/// or overlaps, and the first `total_size % count` parts are one byte larger
/// than the rest. When `count > total_size` the trailing parts are
/// zero-length (`end < start`); a zero `total_size` makes every part
/// zero-length. A zero `count` yields an empty plan.
pub fn split(total_size: u64, count: usize) -> Vec<SegmentRange> {
    if count == 0 {
        return Vec::new();
    }

    let count = count as u64;
    let base = total_size / count;
    let remainder = total_size % count;

    let mut out = Vec::with_capacity(count as usize);
    // An unsigned range cannot express "empty at offset zero", so an empty
    // file's plan starts its cursor at one: (1,0), (2,1), ...
    let mut start = if total_size == 0 { 1 } else { 0 };

    for i in 0..count {
        let size = base + if i < remainder { 1 } else { 0 };
        let end = if size == 0 { start - 1 } else { start + size - 1 };
        out.push(SegmentRange {
            id: i as i64,
            start,
            end,
            parent: None,
        });
        // Zero-length parts still advance by one so ids and starts stay
        // distinct; they are never dispatched.
        start += size.max(1);
    }

    out
}

/// Limits applied when re-splitting a failed segment across peers.
#[derive(Debug, Clone, Copy)]
pub struct RedistributionLimits {
    /// Tails smaller than this are not worth re-splitting.
    pub size_threshold: u64,
    /// Cap on child count per redistribution.
    pub max_targets: usize,
}

impl Default for RedistributionLimits {
    fn default() -> Self {
        Self {
            size_threshold: 1024 * 1024,
            max_targets: 4,
        }
    }
}

/// Re-splits the unfinished tail of `failed` evenly across up to
/// `peer_count` workers.
///
/// `bytes_done` is how much of the segment already landed on disk; those
/// bytes are kept and only `[start + bytes_done, end]` is re-planned.
/// Children get negative ids (`-1000 - parent*10 + k` for the first
/// redistribution; later `epoch`s shift further down so ids stay unique)
/// and carry the parent plan position so progress can be attributed.
/// Returns `None` when the tail is under the size threshold or no peers
/// are available.
pub fn redistribute(
    failed: &SegmentRange,
    bytes_done: u64,
    peer_count: usize,
    limits: &RedistributionLimits,
    epoch: u32,
) -> Option<Vec<SegmentRange>> {
    if peer_count == 0 {
        return None;
    }
    let remaining = failed.len().saturating_sub(bytes_done);
    if remaining < limits.size_threshold {
        return None;
    }

    let parent_pos = match failed.parent {
        // A child failing again re-splits against its original parent.
        Some(p) => p,
        None => usize::try_from(failed.id).ok()?,
    };
    let targets = peer_count.min(limits.max_targets) as u64;
    let base = remaining / targets;
    let extra = remaining % targets;

    let mut out = Vec::with_capacity(targets as usize);
    let mut start = failed.start + bytes_done;
    for k in 0..targets {
        let size = base + if k < extra { 1 } else { 0 };
        if size == 0 {
            continue;
        }
        out.push(SegmentRange {
            id: -1000 - (epoch as i64) * 10_000 - (parent_pos as i64) * 10 + k as i64,
            start,
            end: start + size - 1,
            parent: Some(parent_pos),
        });
        start += size;
    }

    Some(out)
}
