//! Per-download failure policy: retry in place, redistribute, fall back, abort.
//!
//! The supervisor owns all retry state; workers never see it. Failures come
//! in as values, decisions go back as values, so the worker/supervisor
//! relationship stays one-way.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::retry::{
    CircuitBreaker, CircuitBreakerConfig, DownloadError, NetworkQuality, RetryContext,
    RetryDecision, RetryPolicy, SegmentFailure,
};

/// Maximum backoff growth factor for one segment.
const BACKOFF_FACTOR_CAP: f64 = 8.0;

/// Per-failure backoff growth.
const BACKOFF_GROWTH: f64 = 1.5;

/// Budgets for a download's recovery behaviour.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Total retries across all segments of the download.
    pub global_max_retries: u32,
    /// Total redistributions for the download.
    pub max_redistributions: u32,
    /// Fall back to single-stream when this fraction of segments is lost.
    pub fallback_threshold: f64,
    /// Tails smaller than this are not redistributed.
    pub redistribution_size_threshold: u64,
    pub enable_fallback: bool,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl RecoveryConfig {
    /// Cautious preset: give up early, at most one redistribution.
    pub fn conservative() -> Self {
        Self {
            global_max_retries: 5,
            max_redistributions: 1,
            fallback_threshold: 0.3,
            redistribution_size_threshold: 1024 * 1024,
            enable_fallback: true,
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }

    /// Persistent preset for bad links.
    pub fn aggressive() -> Self {
        Self {
            global_max_retries: 25,
            max_redistributions: 5,
            fallback_threshold: 0.7,
            ..Self::default()
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            global_max_retries: 15,
            max_redistributions: 3,
            fallback_threshold: 0.5,
            redistribution_size_threshold: 1024 * 1024,
            enable_fallback: true,
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }
}

/// Retry bookkeeping for one segment.
#[derive(Debug, Clone)]
pub struct SegmentRetryState {
    pub attempt_count: u32,
    pub last_error: Option<DownloadError>,
    /// Bytes safely on disk across all attempts; retries resume past them.
    pub total_bytes_transferred: u64,
    /// Grows by 1.5 per failure, capped at 8.
    pub backoff_multiplier: f64,
    pub is_redistributed: bool,
    pub redistribution_targets: Vec<i64>,
    segment_len: u64,
    first_failure_at: Option<Instant>,
}

impl SegmentRetryState {
    fn new(segment_len: u64) -> Self {
        Self {
            attempt_count: 0,
            last_error: None,
            total_bytes_transferred: 0,
            backoff_multiplier: 1.0,
            is_redistributed: false,
            redistribution_targets: Vec::new(),
            segment_len,
            first_failure_at: None,
        }
    }

    fn record_failure(&mut self, error: DownloadError, bytes_transferred: u64) {
        self.attempt_count += 1;
        self.backoff_multiplier = (self.backoff_multiplier * BACKOFF_GROWTH).min(BACKOFF_FACTOR_CAP);
        self.total_bytes_transferred = self.total_bytes_transferred.max(bytes_transferred);
        self.last_error = Some(error);
        self.first_failure_at.get_or_insert_with(Instant::now);
    }

    /// Delay before the next in-place retry of this segment.
    pub fn next_retry_delay(&self) -> Duration {
        match &self.last_error {
            Some(e) => e.profile().base_delay.mul_f64(self.backoff_multiplier),
            None => Duration::ZERO,
        }
    }

    /// Bytes of this segment still missing.
    pub fn remaining(&self) -> u64 {
        self.segment_len.saturating_sub(self.total_bytes_transferred)
    }
}

/// What the coordinator should do about a failed segment.
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Re-run the same worker range after `delay`, resuming past the bytes
    /// already on disk.
    Retry { delay: Duration },
    /// Split the segment's unfinished tail across active peers.
    Redistribute,
    /// Abandon the parallel attempt; restart the whole URL single-stream.
    Fallback,
    /// Surface the error; the download is over.
    Abort { error: DownloadError },
}

struct SupervisorState {
    segments: HashMap<i64, SegmentRetryState>,
    exhausted: HashSet<i64>,
    total_segments: usize,
    total_retries: u32,
    total_redistributions: u32,
    breaker: Option<CircuitBreaker>,
    started_at: Instant,
}

/// Exclusive-access supervisor for one download.
#[derive(Clone)]
pub struct RecoverySupervisor {
    config: RecoveryConfig,
    policy: RetryPolicy,
    state: Arc<Mutex<SupervisorState>>,
}

impl RecoverySupervisor {
    pub fn new(config: RecoveryConfig, policy: RetryPolicy) -> Self {
        Self {
            config,
            policy,
            state: Arc::new(Mutex::new(SupervisorState {
                segments: HashMap::new(),
                exhausted: HashSet::new(),
                total_segments: 0,
                total_retries: 0,
                total_redistributions: 0,
                breaker: config.circuit_breaker.map(CircuitBreaker::new),
                started_at: Instant::now(),
            })),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Declare a planned segment before workers start. Failures for
    /// undeclared indices abort the download.
    pub async fn register_segment(&self, index: i64, segment_len: u64) {
        let mut st = self.state.lock().await;
        st.segments.insert(index, SegmentRetryState::new(segment_len));
        st.total_segments = st.segments.len();
    }

    pub async fn on_segment_success(&self, index: i64) {
        let mut st = self.state.lock().await;
        if let Some(b) = st.breaker.as_mut() {
            b.record_success();
        }
        st.exhausted.remove(&index);
    }

    /// Record a redistribution decision: the parent keeps its downloaded
    /// prefix, the children own the tail.
    pub async fn note_redistributed(&self, parent: i64, children: &[i64]) {
        let mut st = self.state.lock().await;
        st.total_redistributions += 1;
        if let Some(seg) = st.segments.get_mut(&parent) {
            seg.is_redistributed = true;
            seg.redistribution_targets = children.to_vec();
        }
    }

    /// Decide what to do about a failed segment. `active_peers` is the
    /// number of workers still making progress.
    pub async fn on_segment_failure(
        &self,
        failure: &SegmentFailure,
        active_peers: usize,
        is_multi_connection: bool,
    ) -> RecoveryAction {
        let mut st = self.state.lock().await;

        if !st.segments.contains_key(&failure.segment_index) {
            tracing::error!(index = failure.segment_index, "failure for unknown segment");
            return RecoveryAction::Abort { error: failure.error.clone() };
        }

        if let Some(b) = st.breaker.as_mut() {
            b.record_failure();
        }
        let elapsed = st.started_at.elapsed();
        let seg = st
            .segments
            .get_mut(&failure.segment_index)
            .expect("checked above");
        seg.record_failure(failure.error.clone(), failure.bytes_transferred);
        let attempt = seg.attempt_count;
        let remaining = seg.remaining();

        // 1. In-place retry while the per-kind and global budgets hold.
        let ctx = RetryContext {
            attempt,
            total_elapsed: elapsed,
            is_multi_connection,
            network_quality: NetworkQuality::Good,
            memory_pressure_high: false,
            cpu_usage: 0.0,
        };
        if st.total_retries < self.config.global_max_retries {
            match self.policy.should_retry(&failure.error, &ctx, st.breaker.as_ref()) {
                RetryDecision::Retry { delay } => {
                    st.total_retries += 1;
                    tracing::debug!(
                        index = failure.segment_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying segment in place"
                    );
                    return RecoveryAction::Retry { delay };
                }
                RetryDecision::CircuitBreakerOpen { remaining } => {
                    tracing::warn!(
                        cooldown_ms = remaining.as_millis() as u64,
                        "circuit open, not retrying in place"
                    );
                }
                RetryDecision::Stop { reason } => {
                    tracing::debug!(index = failure.segment_index, %reason, "retry budget closed");
                }
            }
        }

        st.exhausted.insert(failure.segment_index);

        // 2. Hand the tail to the peers that are still healthy.
        if st.total_redistributions < self.config.max_redistributions
            && remaining >= self.config.redistribution_size_threshold
            && active_peers >= 1
        {
            return RecoveryAction::Redistribute;
        }

        // 3. Widespread failure: give up on parallelism, not on the file.
        let failure_ratio = st.exhausted.len() as f64 / st.total_segments.max(1) as f64;
        if self.config.enable_fallback && failure_ratio >= self.config.fallback_threshold {
            tracing::warn!(
                failed = st.exhausted.len(),
                total = st.total_segments,
                "falling back to single-stream"
            );
            return RecoveryAction::Fallback;
        }

        RecoveryAction::Abort { error: failure.error.clone() }
    }

    /// Snapshot of a segment's retry state (tests, status displays).
    pub async fn segment_state(&self, index: i64) -> Option<SegmentRetryState> {
        self.state.lock().await.segments.get(&index).cloned()
    }

    pub async fn totals(&self) -> (u32, u32) {
        let st = self.state.lock().await;
        (st.total_retries, st.total_redistributions)
    }
}
