//! Map transport, HTTP, and I/O failures onto the error taxonomy.

use std::error::Error as StdError;
use std::path::Path;
use std::time::{Duration, SystemTime};

use super::error::DownloadError;

/// Classify an HTTP status code. 2xx is not an error and maps to `Unknown`
/// only if a caller misuses this on a success status.
pub fn classify_http_status(status: u16, retry_after: Option<Duration>) -> DownloadError {
    match status {
        429 => DownloadError::RateLimited { retry_after },
        500..=599 => DownloadError::ServerError { status },
        400..=499 => DownloadError::ClientError { status },
        _ => DownloadError::Unknown(format!("unexpected HTTP status {status}")),
    }
}

/// Classify a reqwest transport error (connect, timeout, body read).
pub fn classify_transport_error(e: &reqwest::Error, host: &str) -> DownloadError {
    if e.is_timeout() {
        return DownloadError::NetworkTimeout;
    }

    // Walk the source chain: reqwest wraps hyper/io errors whose text is the
    // only stable discriminator for DNS and TLS failures.
    let mut chain = String::new();
    let mut src: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = src {
        chain.push_str(&err.to_string().to_ascii_lowercase());
        chain.push(' ');
        src = err.source();
    }

    if chain.contains("certificate") || chain.contains("ssl") || chain.contains("tls") {
        return DownloadError::SslCertificate;
    }
    if chain.contains("dns") || chain.contains("failed to lookup") {
        return DownloadError::DnsResolutionFailed { host: host.to_string() };
    }
    if e.is_connect() || e.is_body() || e.is_request() {
        return DownloadError::ConnectionLost;
    }
    DownloadError::Unknown(e.to_string())
}

/// Classify a filesystem error raised while writing the output file.
pub fn classify_io_error(e: &std::io::Error, path: &Path) -> DownloadError {
    #[cfg(unix)]
    {
        match e.raw_os_error() {
            Some(libc::ENOSPC) => return DownloadError::DiskSpace,
            Some(libc::EACCES) => {
                return DownloadError::FilePermission { path: path.to_path_buf() }
            }
            _ => {}
        }
    }
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return DownloadError::FilePermission { path: path.to_path_buf() };
    }
    DownloadError::Unknown(format!("I/O error on {}: {}", path.display(), e))
}

/// Parse a `Retry-After` header value: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}
