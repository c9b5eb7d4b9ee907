//! Error taxonomy, classification, and retry/backoff policy.
//!
//! This module keeps error classification (timeouts, throttling, connection
//! failures, resource errors) and backoff decisions in one place so the
//! worker, supervisor, and coordinator share a consistent policy.

mod classify;
mod error;
mod policy;

pub use classify::{classify_http_status, classify_io_error, classify_transport_error, parse_retry_after};
pub use error::{DownloadError, ErrorCategory, ErrorProfile, SegmentFailure};
pub use policy::{
    Backoff, CircuitBreaker, CircuitBreakerConfig, Jitter, NetworkQuality, RetryContext,
    RetryDecision, RetryPolicy, RetryRecommendation,
};
