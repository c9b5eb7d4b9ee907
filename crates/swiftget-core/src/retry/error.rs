//! Typed download errors and their retry profiles.

use std::path::PathBuf;
use std::time::Duration;

/// Category of a download error, used for reporting and policy grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    ServerError,
    RateLimited,
    ClientError,
    ContentIntegrity,
    SystemResource,
    Configuration,
    Unknown,
}

/// Per-kind retry profile: whether and how often a kind may be retried.
#[derive(Debug, Clone, Copy)]
pub struct ErrorProfile {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Scheduling priority when several segments wait to retry (0..10).
    pub retry_priority: u8,
}

/// Error raised anywhere in the transfer path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    #[error("network timeout")]
    NetworkTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("TLS certificate validation failed")]
    SslCertificate,

    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("client error: HTTP {status}")]
    ClientError { status: u16 },

    /// Server ignored the Range header or sent a body of the wrong length.
    #[error("unusable partial content response")]
    PartialContent,

    #[error("corrupted data in response body")]
    CorruptedData,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("no space left on device")]
    DiskSpace,

    #[error("permission denied: {}", path.display())]
    FilePermission { path: PathBuf },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

impl DownloadError {
    /// Retry profile for this error kind.
    pub fn profile(&self) -> ErrorProfile {
        use ErrorCategory::*;
        let secs = Duration::from_secs_f64;
        match self {
            Self::NetworkTimeout | Self::ConnectionLost => ErrorProfile {
                category: TransientNetwork,
                retryable: true,
                max_attempts: 5,
                base_delay: secs(1.0),
                retry_priority: 8,
            },
            Self::DnsResolutionFailed { .. } => ErrorProfile {
                category: TransientNetwork,
                retryable: true,
                max_attempts: 2,
                base_delay: secs(1.0),
                retry_priority: 7,
            },
            Self::ServerError { .. } => ErrorProfile {
                category: ServerError,
                retryable: true,
                max_attempts: 3,
                base_delay: secs(2.0),
                retry_priority: 5,
            },
            Self::RateLimited { .. } => ErrorProfile {
                category: RateLimited,
                retryable: true,
                max_attempts: 2,
                base_delay: secs(5.0),
                retry_priority: 6,
            },
            Self::PartialContent => ErrorProfile {
                category: ServerError,
                retryable: true,
                max_attempts: 3,
                base_delay: secs(0.5),
                retry_priority: 5,
            },
            Self::CorruptedData => ErrorProfile {
                category: ContentIntegrity,
                retryable: true,
                max_attempts: 3,
                base_delay: secs(0.5),
                retry_priority: 4,
            },
            Self::ChecksumMismatch { .. } => ErrorProfile {
                category: ContentIntegrity,
                retryable: true,
                max_attempts: 1,
                base_delay: secs(0.5),
                retry_priority: 4,
            },
            Self::ClientError { .. } => ErrorProfile {
                category: ClientError,
                retryable: false,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                retry_priority: 0,
            },
            Self::SslCertificate => ErrorProfile {
                category: Configuration,
                retryable: false,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                retry_priority: 0,
            },
            Self::DiskSpace | Self::FilePermission { .. } => ErrorProfile {
                category: SystemResource,
                retryable: false,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                retry_priority: 0,
            },
            Self::Cancelled | Self::Unknown(_) => ErrorProfile {
                category: Unknown,
                retryable: false,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                retry_priority: 0,
            },
        }
    }

    /// Human-readable kind name for user-visible messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::ConnectionLost => "connection lost",
            Self::DnsResolutionFailed { .. } => "DNS resolution failure",
            Self::SslCertificate => "TLS certificate failure",
            Self::ServerError { .. } => "server error",
            Self::RateLimited { .. } => "rate limited",
            Self::ClientError { .. } => "client error",
            Self::PartialContent => "partial content error",
            Self::CorruptedData => "corrupted data",
            Self::ChecksumMismatch { .. } => "checksum mismatch",
            Self::DiskSpace => "disk full",
            Self::FilePermission { .. } => "permission denied",
            Self::Cancelled => "cancelled",
            Self::Unknown(_) => "unknown error",
        }
    }
}

/// Failure report a segment worker hands back to the supervisor.
/// Never thrown across task boundaries; always returned by value.
#[derive(Debug, Clone)]
pub struct SegmentFailure {
    /// Id of the failed segment (negative for redistributed children).
    pub segment_index: i64,
    pub error: DownloadError,
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// Bytes of this segment already on disk; kept across retries.
    pub bytes_transferred: u64,
}
