//! Per-worker token-bucket rate limiter.
//!
//! Tokens are bytes. The bucket holds at most one second of budget, refills
//! linearly, and `throttle` suspends the caller while the balance is negative.
//! A zero rate disables throttling entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Refill bookkeeping, updated under the lock.
struct RefillState {
    last_refill: Instant,
    /// Signed token balance in bytes; negative means callers owe time.
    balance: i64,
}

/// Token-bucket limiter shared by the chunks of one worker (and, for the
/// single-stream path, the whole download). Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    /// Target bytes/sec; 0 means unlimited.
    rate: Arc<AtomicU64>,
    state: Arc<Mutex<RefillState>>,
}

impl RateLimiter {
    /// Create a limiter targeting `bytes_per_sec`. Pass 0 for unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: Arc::new(AtomicU64::new(bytes_per_sec)),
            state: Arc::new(Mutex::new(RefillState {
                last_refill: Instant::now(),
                balance: bytes_per_sec.min(i64::MAX as u64) as i64,
            })),
        }
    }

    /// Limiter that never throttles.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current target rate in bytes/sec (0 = unlimited).
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Update the target rate. Takes effect on the next `throttle` call;
    /// used when the bandwidth manager reissues a token.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Account for `wrote` bytes of egress and suspend until the bucket
    /// allows them. Safe to call concurrently from cooperative tasks.
    pub async fn throttle(&self, wrote: u64) {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }

        let sleep_for = {
            let mut st = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(st.last_refill).as_secs_f64();
            let refill = (elapsed * rate as f64) as i64;
            // Cap at one second of burst so a long idle gap cannot flood.
            st.balance = (st.balance + refill).min(rate.min(i64::MAX as u64) as i64);
            st.last_refill = now;
            st.balance -= wrote.min(i64::MAX as u64) as i64;
            if st.balance < 0 {
                Some(Duration::from_secs_f64((-st.balance) as f64 / rate as f64))
            } else {
                None
            }
        };

        if let Some(d) = sleep_for {
            tokio::time::sleep(d).await;
        }
    }
}
