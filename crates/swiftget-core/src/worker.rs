//! Segment worker: one ranged GET streamed into the output file.
//!
//! A worker owns its response stream and writes only inside its segment's
//! byte window. Every chunk passes through the token-bucket limiter, lands
//! via positional write, and is reported to the aggregator. Errors are
//! returned as values; the supervisor decides what happens next.

use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use tokio_util::sync::CancellationToken;

use crate::client::HttpClient;
use crate::limiter::RateLimiter;
use crate::progress::ProgressAggregator;
use crate::retry::{
    classify_http_status, classify_io_error, classify_transport_error, parse_retry_after,
    DownloadError, SegmentFailure,
};
use crate::segmenter::SegmentRange;
use crate::storage::OutputFile;

/// Largest slice written and throttled at once.
const MAX_CHUNK: usize = 64 * 1024;

/// How a worker run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Every byte of the range is on disk.
    Complete,
    /// Cancellation was requested; progress so far is surrendered.
    Cancelled { bytes_transferred: u64 },
}

/// Shared plumbing for the workers of one download.
#[derive(Clone)]
pub struct SegmentWorker {
    pub client: HttpClient,
    pub url: String,
    pub output: OutputFile,
    pub limiter: RateLimiter,
    pub aggregator: ProgressAggregator,
    pub cancel: CancellationToken,
}

impl SegmentWorker {
    /// Download `segment`, resuming past `already` bytes from an earlier
    /// attempt. `sole_worker` marks the degenerate one-segment plan, the only
    /// case where a 200 response may be consumed as the whole object.
    pub async fn run(
        &self,
        segment: SegmentRange,
        already: u64,
        attempt: u32,
        sole_worker: bool,
    ) -> Result<SegmentOutcome, SegmentFailure> {
        self.transfer(segment, already, attempt, sole_worker, Some(segment.len())).await
    }

    /// Stream an unknown-length body until EOF, writing from `start_offset`.
    /// Used by the single-stream path when the server sent no Content-Length.
    pub async fn run_until_eof(
        &self,
        start_offset: u64,
        attempt: u32,
    ) -> Result<SegmentOutcome, SegmentFailure> {
        let segment = SegmentRange { id: 0, start: start_offset, end: u64::MAX - 1, parent: None };
        self.transfer(segment, 0, attempt, true, None).await
    }

    async fn transfer(
        &self,
        segment: SegmentRange,
        already: u64,
        attempt: u32,
        sole_worker: bool,
        expected: Option<u64>,
    ) -> Result<SegmentOutcome, SegmentFailure> {
        let fail = |error: DownloadError, bytes: u64| SegmentFailure {
            segment_index: segment.id,
            error,
            attempt,
            bytes_transferred: bytes,
        };

        if let Some(expected) = expected {
            if already >= expected {
                self.aggregator.mark_segment_complete(segment.id).await;
                return Ok(SegmentOutcome::Complete);
            }
        }

        // An unbounded transfer from offset 0 is a plain GET; a bounded one
        // asks for its exact window, an unbounded resume for an open range.
        let range = match expected {
            Some(_) => Some(segment.resume_range_header_value(already)),
            None if segment.start + already > 0 => {
                Some(format!("bytes={}-", segment.start + already))
            }
            None => None,
        };
        let response = self
            .client
            .get(&self.url, range.as_deref())
            .await
            .map_err(|e| fail(e, already))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(fail(DownloadError::RateLimited { retry_after }, already));
        }
        if !status.is_success() {
            return Err(fail(classify_http_status(status.as_u16(), None), already));
        }
        if range.is_some() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            // The server ignored the Range header and is sending the whole
            // object. Acceptable only for a from-zero single-segment plan;
            // any parallel worker must bail so the download can fall back.
            if !(sole_worker && segment.start == 0 && already == 0) {
                return Err(fail(DownloadError::PartialContent, already));
            }
        }

        let mut written = already;
        let mut stream = response.bytes_stream();
        'body: loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!(id = segment.id, written, "segment cancelled");
                    return Ok(SegmentOutcome::Cancelled { bytes_transferred: written });
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        return Err(fail(classify_transport_error(&e, &self.url), written));
                    }
                    // EOF: complete for unbounded transfers, premature for
                    // bounded ones that have bytes missing.
                    None => match expected {
                        Some(expected) if written < expected => {
                            return Err(fail(DownloadError::ConnectionLost, written));
                        }
                        _ => break 'body,
                    },
                },
            };

            for slice in chunk.chunks(MAX_CHUNK) {
                if self.cancel.is_cancelled() {
                    return Ok(SegmentOutcome::Cancelled { bytes_transferred: written });
                }
                // Never write outside this segment's window, whatever the
                // server decided to send.
                let take = match expected {
                    Some(expected) => {
                        let room = expected - written;
                        if room == 0 {
                            break 'body;
                        }
                        (slice.len() as u64).min(room) as usize
                    }
                    None => slice.len(),
                };
                self.limiter.throttle(take as u64).await;
                self.output
                    .write_at(segment.start + written, &slice[..take])
                    .map_err(|e| {
                        fail(classify_io_error(&e, self.output.part_file_path()), written)
                    })?;
                written += take as u64;
                self.aggregator.report_segment_progress(segment.id, take as u64).await;
            }
            if let Some(expected) = expected {
                if written >= expected {
                    break 'body;
                }
            }
        }

        self.aggregator.mark_segment_complete(segment.id).await;
        Ok(SegmentOutcome::Complete)
    }
}
