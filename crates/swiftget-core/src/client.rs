//! HTTP façade: capability probe and range GETs.
//!
//! Thin wrapper over reqwest that owns header composition, timeouts, proxy,
//! and the certificate-check toggle. Response bodies stay streaming; transport
//! errors surface as typed conditions via `retry::classify_transport_error`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};

use crate::retry::{classify_http_status, classify_transport_error, DownloadError};

/// Default User-Agent, overridable by config and `--user-agent`.
pub const DEFAULT_USER_AGENT: &str =
    concat!("swiftget/", env!("CARGO_PKG_VERSION"));

/// Constructor-time client settings.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    /// User-supplied headers, applied after the defaults so they win.
    pub custom_headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub check_certificate: bool,
    pub connect_timeout: Duration,
    /// Per-read stall timeout on response bodies.
    pub read_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            custom_headers: HashMap::new(),
            proxy: None,
            check_certificate: true,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a capability probe: the headers that drive segmentation and resume.
#[derive(Debug, Clone)]
pub struct HeadResult {
    /// Total size in bytes, when the server reports one.
    pub content_length: Option<u64>,
    /// True when the server advertises `Accept-Ranges: bytes` (or proved
    /// range support during the fallback probe).
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Raw `Content-Disposition` value, used for filename resolution.
    pub content_disposition: Option<String>,
}

/// Shared, immutable HTTP client. Response streams are owned by the caller.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    custom_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .danger_accept_invalid_certs(!config.check_certificate);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy URL")?);
        }
        let inner = builder.build().context("build HTTP client")?;

        let mut custom_headers = HeaderMap::new();
        for (k, v) in &config.custom_headers {
            let name: HeaderName = k.trim().parse().with_context(|| format!("bad header name {k:?}"))?;
            let value: HeaderValue =
                v.trim().parse().with_context(|| format!("bad header value for {k:?}"))?;
            custom_headers.insert(name, value);
        }

        Ok(Self { inner, custom_headers })
    }

    fn host_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string())
    }

    /// Probe server capabilities. Tries HEAD first; servers that block HEAD
    /// (405/501) get a one-byte range GET instead, which both proves range
    /// support and reveals the total length via `Content-Range`.
    pub async fn head(&self, url: &str) -> Result<HeadResult, DownloadError> {
        let response = self
            .inner
            .head(url)
            .headers(self.custom_headers.clone())
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, &Self::host_of(url)))?;

        let status = response.status();
        if status == reqwest::StatusCode::METHOD_NOT_ALLOWED
            || status == reqwest::StatusCode::NOT_IMPLEMENTED
        {
            return self.probe_with_range_get(url).await;
        }
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), None));
        }

        Ok(parse_probe_headers(response.headers(), response.content_length()))
    }

    async fn probe_with_range_get(&self, url: &str) -> Result<HeadResult, DownloadError> {
        let response = self
            .get(url, Some("bytes=0-0"))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), None));
        }

        let mut head = parse_probe_headers(response.headers(), None);
        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            head.accept_ranges = true;
            head.content_length = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total);
        } else {
            // 200: the server ignored the range; the body is the full object.
            head.accept_ranges = false;
            head.content_length = response.content_length();
        }
        // The one-byte body is dropped with the response.
        Ok(head)
    }

    /// Issue a GET, optionally with a `Range` header. Status handling is the
    /// caller's: workers distinguish 206 from 200 themselves.
    pub async fn get(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.inner.get(url).headers(self.custom_headers.clone());
        if let Some(range) = range {
            // Applied last so nothing can shadow it.
            request = request.header(RANGE, range);
        }
        request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, &Self::host_of(url)))
    }
}

fn parse_probe_headers(headers: &HeaderMap, content_length: Option<u64>) -> HeadResult {
    let text = |name: reqwest::header::HeaderName| {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };
    HeadResult {
        content_length: headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
            .or(content_length),
        accept_ranges: headers
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
        etag: text(reqwest::header::ETAG).map(|v| v.trim_matches('"').to_string()),
        last_modified: text(reqwest::header::LAST_MODIFIED),
        content_disposition: text(reqwest::header::CONTENT_DISPOSITION),
    }
}

/// Total size from a `Content-Range: bytes a-b/total` value.
pub fn content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}
