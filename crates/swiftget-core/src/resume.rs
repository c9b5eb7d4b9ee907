//! Resume planning: the target file's existence and size are the resume key.
//!
//! No sidecar state is kept; a partial `.swiftget-part` file plus the
//! server's current metadata decide whether to continue, start over, or do
//! nothing. Validator comparison guards in-process restarts (fallback,
//! checksum re-run) against the remote object changing mid-flight.

use std::path::Path;

use crate::client::HeadResult;
use crate::storage;

/// What the coordinator should do with existing on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No usable partial data; transfer from byte 0.
    StartFresh,
    /// Continue the partial file from this offset.
    ResumeAt(u64),
    /// The final file is already fully present.
    AlreadyComplete,
}

/// Remote validators captured at probe time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

impl From<&HeadResult> for RemoteValidators {
    fn from(head: &HeadResult) -> Self {
        Self {
            etag: head.etag.clone(),
            last_modified: head.last_modified.clone(),
            content_length: head.content_length,
        }
    }
}

/// True when any validator differs between two probes of the same URL.
/// A validator present on one side but not the other counts as changed.
pub fn remote_changed(stored: &RemoteValidators, current: &RemoteValidators) -> bool {
    fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
        match (a, b) {
            (None, None) => false,
            (Some(x), Some(y)) => x != y,
            _ => true,
        }
    }
    differs(&stored.etag, &current.etag)
        || differs(&stored.last_modified, &current.last_modified)
        || differs(&stored.content_length, &current.content_length)
}

/// Decide how to treat existing files for `final_path`.
///
/// Resume only continues a partial file when the caller asked for it, the
/// server supports ranges, the total length is known, and the partial is
/// strictly smaller than the total. Anything else starts fresh (overwrite).
pub fn plan_resume(final_path: &Path, head: &HeadResult, resume_requested: bool) -> ResumeDecision {
    if let (Ok(meta), Some(total)) = (std::fs::metadata(final_path), head.content_length) {
        if meta.is_file() && meta.len() == total && resume_requested {
            return ResumeDecision::AlreadyComplete;
        }
    }

    if !resume_requested {
        return ResumeDecision::StartFresh;
    }

    let part = storage::part_path(final_path);
    let Ok(meta) = std::fs::metadata(&part) else {
        return ResumeDecision::StartFresh;
    };
    let partial = meta.len();
    match head.content_length {
        Some(total) if head.accept_ranges && partial > 0 && partial < total => {
            ResumeDecision::ResumeAt(partial)
        }
        Some(total) if partial == total && total > 0 => {
            // Fully transferred but never published; finish the tail end of
            // the pipeline (verify + rename) without refetching.
            ResumeDecision::ResumeAt(partial)
        }
        _ => ResumeDecision::StartFresh,
    }
}
