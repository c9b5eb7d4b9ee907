//! Progress aggregation across segment workers.
//!
//! The aggregator is the only owner of mutable progress state; workers push
//! byte deltas through it and consumers read consistent snapshots. A pluggable
//! reporter is invoked at a bounded rate with the latest statistics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Smoothing factor for the current-speed EWMA.
const SPEED_EWMA_ALPHA: f64 = 0.2;

/// EWMA tick period; also the default reporter rate bound.
const SPEED_TICK: Duration = Duration::from_millis(100);

/// Consumer of rate-bounded progress updates (a progress bar, a log line).
pub trait ProgressReporter: Send + Sync {
    /// Latest totals; `total_bytes` is 0 when the size is unknown.
    fn update(&self, bytes_downloaded: u64, total_bytes: u64, speed_bps: f64);
    /// The download finished; render the final state.
    fn complete(&self);
}

/// Display mode for reporters that render a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterMode {
    Simple,
    Detailed,
}

/// Reporter presentation settings. The aggregator only consumes
/// `update_interval`; the rest parameterises the CLI renderer.
#[derive(Debug, Clone, Copy)]
pub struct ReporterConfig {
    pub mode: ReporterMode,
    pub show_segments: bool,
    pub bar_width: u16,
    pub update_interval: Duration,
}

impl ReporterConfig {
    /// Single-stream downloads: plain bar.
    pub fn default_config() -> Self {
        Self {
            mode: ReporterMode::Simple,
            show_segments: false,
            bar_width: 30,
            update_interval: SPEED_TICK,
        }
    }

    /// Parallel downloads: wider bar with per-segment counts.
    pub fn multi_connection() -> Self {
        Self {
            mode: ReporterMode::Detailed,
            show_segments: true,
            bar_width: 40,
            update_interval: SPEED_TICK,
        }
    }
}

/// Progress of one segment.
#[derive(Debug, Clone)]
pub struct SegmentProgress {
    pub segment_id: i64,
    pub total_bytes: u64,
    pub bytes_downloaded: u64,
    pub started_at: Instant,
    pub last_update_at: Instant,
    pub complete: bool,
}

impl SegmentProgress {
    /// Average speed over the segment's lifetime, bytes/sec.
    pub fn avg_speed(&self) -> f64 {
        let elapsed = self.last_update_at.duration_since(self.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 / elapsed
    }

    /// Estimated seconds to finish this segment; `None` when stalled.
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total_bytes.saturating_sub(self.bytes_downloaded);
        if remaining == 0 {
            return Some(0.0);
        }
        let speed = self.avg_speed();
        if speed <= 0.0 {
            return None;
        }
        Some(remaining as f64 / speed)
    }

    /// Fraction complete in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Snapshot of global download statistics.
#[derive(Debug, Clone)]
pub struct DownloadStatistics {
    pub total_bytes: u64,
    pub bytes_downloaded: u64,
    /// Fraction in [0, 1]; 0 when the total is unknown.
    pub percentage: f64,
    /// EWMA-smoothed speed, bytes/sec.
    pub current_speed: f64,
    /// Lifetime average, bytes/sec.
    pub average_speed: f64,
    pub peak_speed: f64,
    /// Segments with progress that are not yet complete.
    pub active_segments: usize,
    pub completed_segments: usize,
    pub total_segments: usize,
    pub is_complete: bool,
    pub elapsed: Duration,
}

impl DownloadStatistics {
    pub fn current_speed_mib(&self) -> f64 {
        self.current_speed / BYTES_PER_MIB
    }

    pub fn average_speed_mib(&self) -> f64 {
        self.average_speed / BYTES_PER_MIB
    }

    pub fn peak_speed_mib(&self) -> f64 {
        self.peak_speed / BYTES_PER_MIB
    }

    /// Estimated seconds remaining based on the current speed.
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total_bytes.saturating_sub(self.bytes_downloaded);
        if remaining == 0 {
            return Some(0.0);
        }
        let speed = if self.current_speed > 0.0 { self.current_speed } else { self.average_speed };
        if speed <= 0.0 {
            return None;
        }
        Some(remaining as f64 / speed)
    }
}

struct AggregatorState {
    segments: BTreeMap<i64, SegmentProgress>,
    total_bytes: u64,
    started_at: Instant,
    completed_at: Option<Instant>,
    // Sliding speed window.
    tick_started_at: Instant,
    tick_bytes: u64,
    ewma_speed: f64,
    peak_speed: f64,
    last_report_at: Option<Instant>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    report_interval: Duration,
}

impl AggregatorState {
    fn roll_speed_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.tick_started_at);
        if elapsed < SPEED_TICK {
            return;
        }
        let instant_speed = self.tick_bytes as f64 / elapsed.as_secs_f64();
        self.ewma_speed = if self.ewma_speed == 0.0 {
            instant_speed
        } else {
            SPEED_EWMA_ALPHA * instant_speed + (1.0 - SPEED_EWMA_ALPHA) * self.ewma_speed
        };
        if self.ewma_speed > self.peak_speed {
            self.peak_speed = self.ewma_speed;
        }
        self.tick_started_at = now;
        self.tick_bytes = 0;
    }

    fn statistics(&self) -> DownloadStatistics {
        // Global bytes are derived from the per-segment counts so attempt
        // restarts can never double-count.
        let bytes_downloaded: u64 = self.segments.values().map(|s| s.bytes_downloaded).sum();
        let completed = self.segments.values().filter(|s| s.complete).count();
        let active = self
            .segments
            .values()
            .filter(|s| s.bytes_downloaded > 0 && !s.complete)
            .count();
        let end = self.completed_at.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(self.started_at);
        let average = if elapsed.as_secs_f64() > 0.0 {
            bytes_downloaded as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        DownloadStatistics {
            total_bytes: self.total_bytes,
            bytes_downloaded,
            percentage: if self.total_bytes > 0 {
                bytes_downloaded as f64 / self.total_bytes as f64
            } else {
                0.0
            },
            current_speed: self.ewma_speed,
            average_speed: average,
            peak_speed: self.peak_speed,
            active_segments: active,
            completed_segments: completed,
            total_segments: self.segments.len(),
            is_complete: !self.segments.is_empty() && self.segments.values().all(|s| s.complete),
            elapsed,
        }
    }

    fn maybe_report(&mut self, now: Instant) {
        let Some(reporter) = self.reporter.clone() else { return };
        let due = match self.last_report_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.report_interval,
        };
        if due {
            let stats = self.statistics();
            reporter.update(stats.bytes_downloaded, stats.total_bytes, stats.current_speed);
            self.last_report_at = Some(now);
        }
    }
}

/// Exclusive-access aggregator; clone the handle freely across workers.
#[derive(Clone)]
pub struct ProgressAggregator {
    state: Arc<Mutex<AggregatorState>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(AggregatorState {
                segments: BTreeMap::new(),
                total_bytes: 0,
                started_at: now,
                completed_at: None,
                tick_started_at: now,
                tick_bytes: 0,
                ewma_speed: 0.0,
                peak_speed: 0.0,
                last_report_at: None,
                reporter: None,
                report_interval: SPEED_TICK,
            })),
        }
    }

    /// Attach the external reporter, rate-bounded by `config.update_interval`.
    pub async fn set_reporter(&self, reporter: Arc<dyn ProgressReporter>, config: &ReporterConfig) {
        let mut st = self.state.lock().await;
        st.reporter = Some(reporter);
        st.report_interval = config.update_interval;
    }

    /// Declare a segment before its worker starts. A zero `total_bytes`
    /// means the length is unknown (single-stream without Content-Length);
    /// such segments complete only via `mark_segment_complete`.
    pub async fn register_segment(&self, segment_id: i64, total_bytes: u64) {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        let previous = st.segments.get(&segment_id).map(|s| s.total_bytes).unwrap_or(0);
        st.total_bytes = st.total_bytes - previous + total_bytes;
        st.segments.insert(
            segment_id,
            SegmentProgress {
                segment_id,
                total_bytes,
                bytes_downloaded: 0,
                started_at: now,
                last_update_at: now,
                complete: false,
            },
        );
    }

    /// Shrink a segment's share after redistribution took over its tail.
    pub async fn shrink_segment(&self, segment_id: i64, new_total: u64) {
        let mut st = self.state.lock().await;
        let mut removed = 0u64;
        if let Some(seg) = st.segments.get_mut(&segment_id) {
            removed = seg.total_bytes.saturating_sub(new_total);
            seg.total_bytes = new_total;
            seg.complete = seg.bytes_downloaded >= seg.total_bytes;
        }
        st.total_bytes = st.total_bytes.saturating_sub(removed);
    }

    /// Record `delta` new bytes for a segment.
    pub async fn report_segment_progress(&self, segment_id: i64, delta: u64) {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        if let Some(seg) = st.segments.get_mut(&segment_id) {
            seg.bytes_downloaded = if seg.total_bytes == 0 {
                seg.bytes_downloaded + delta
            } else {
                (seg.bytes_downloaded + delta).min(seg.total_bytes)
            };
            seg.last_update_at = now;
        }
        st.tick_bytes += delta;
        st.roll_speed_window(now);
        st.maybe_report(now);
    }

    /// Forget a segment's progress before an attempt restarts from zero
    /// (no-range servers refetch the whole body).
    pub async fn reset_segment(&self, segment_id: i64) {
        let mut st = self.state.lock().await;
        if let Some(seg) = st.segments.get_mut(&segment_id) {
            seg.bytes_downloaded = 0;
            seg.complete = false;
            seg.started_at = Instant::now();
            seg.last_update_at = seg.started_at;
        }
    }

    pub async fn mark_segment_complete(&self, segment_id: i64) {
        let mut st = self.state.lock().await;
        let mut discovered = 0u64;
        if let Some(seg) = st.segments.get_mut(&segment_id) {
            seg.complete = true;
            if seg.total_bytes == 0 {
                // Length was unknown until EOF; the bytes define the total.
                seg.total_bytes = seg.bytes_downloaded;
                discovered = seg.total_bytes;
            } else {
                seg.bytes_downloaded = seg.total_bytes;
            }
            seg.last_update_at = Instant::now();
        }
        st.total_bytes += discovered;
    }

    pub async fn get_download_statistics(&self) -> DownloadStatistics {
        self.state.lock().await.statistics()
    }

    /// Per-segment snapshots in stable id order.
    pub async fn get_segment_progress(&self) -> Vec<SegmentProgress> {
        self.state.lock().await.segments.values().cloned().collect()
    }

    /// Seal the aggregate and notify the reporter exactly once.
    pub async fn complete(&self) {
        let mut st = self.state.lock().await;
        if st.completed_at.is_some() {
            return;
        }
        st.completed_at = Some(Instant::now());
        if let Some(reporter) = st.reporter.clone() {
            let stats = st.statistics();
            reporter.update(stats.bytes_downloaded, stats.total_bytes, stats.current_speed);
            reporter.complete();
        }
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}
