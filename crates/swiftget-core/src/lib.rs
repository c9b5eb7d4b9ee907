//! Core engine for the SwiftGet segmented download manager.
//!
//! One URL is probed, split into byte ranges, transferred over concurrent
//! range GETs with shared bandwidth budgeting, recovered on failure, verified,
//! and atomically published.

pub mod bandwidth;
pub mod checksum;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod limiter;
pub mod logging;
pub mod naming;
pub mod progress;
pub mod recovery;
pub mod resume;
pub mod retry;
pub mod segmenter;
pub mod storage;
pub mod worker;
