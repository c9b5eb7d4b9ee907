//! Minimal HTTP/1.1 server with HEAD and Range GET support for integration
//! tests, plus failure injection: blocked HEAD, ignored ranges, 5xx bursts,
//! 429 throttling, and mid-body truncation.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes` even if ranges work.
    pub advertise_ranges: bool,
    /// Respond 500 to this many GETs before behaving.
    pub fail_first_gets: usize,
    /// After the 500 burst, respond 429 (Retry-After: 1) to this many GETs.
    pub rate_limit_gets: usize,
    /// Close the connection halfway through the body for this many GETs.
    pub truncate_first_gets: usize,
    /// Respond 404 to GETs whose Range starts at this offset, this many times.
    pub fail_range_start: Option<(u64, usize)>,
    /// `Content-Disposition` header value for GET/HEAD responses.
    pub content_disposition: Option<&'static str>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            advertise_ranges: true,
            fail_first_gets: 0,
            rate_limit_gets: 0,
            truncate_first_gets: 0,
            fail_range_start: None,
            content_disposition: None,
        }
    }
}

/// Handle for asserting on observed traffic.
pub struct ServerHandle {
    pub url: String,
    get_count: Arc<AtomicUsize>,
}

impl ServerHandle {
    pub fn gets(&self) -> usize {
        self.get_count.load(Ordering::SeqCst)
    }
}

/// Starts a server in a background thread serving `body`. Returns the base
/// URL and a traffic counter. The server runs until the process exits.
pub fn start(body: Vec<u8>) -> ServerHandle {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> ServerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let get_count = Arc::new(AtomicUsize::new(0));
    let range_fail_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&get_count);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let counter = Arc::clone(&counter);
            let range_fail = Arc::clone(&range_fail_count);
            thread::spawn(move || handle(stream, &body, opts, &counter, &range_fail));
        }
    });
    ServerHandle {
        url: format!("http://127.0.0.1:{}/file.bin", port),
        get_count,
    }
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    get_count: &AtomicUsize,
    range_fail_count: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    let extra_headers = |opts: &RangeServerOptions| {
        let mut out = String::new();
        // Advertised independently of actual support so tests can model
        // servers that lie about ranges.
        if opts.advertise_ranges {
            out.push_str("Accept-Ranges: bytes\r\n");
        }
        if let Some(cd) = opts.content_disposition {
            out.push_str(&format!("Content-Disposition: {cd}\r\n"));
        }
        out.push_str("ETag: \"range-server-v1\"\r\n");
        out.push_str("Last-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n");
        out.push_str("Connection: close\r\n");
        out
    };

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n",
            );
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
            total,
            extra_headers(&opts)
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if method.eq_ignore_ascii_case("GET") {
        let seq = get_count.fetch_add(1, Ordering::SeqCst);

        if seq < opts.fail_first_gets {
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
        if seq < opts.fail_first_gets + opts.rate_limit_gets {
            let _ = stream.write_all(
                b"HTTP/1.1 429 Too Many Requests\r\nRetry-After: 1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
        if let (Some((bad_start, times)), Some((start, _))) = (opts.fail_range_start, range) {
            if start == bad_start && range_fail_count.fetch_add(1, Ordering::SeqCst) < times {
                let _ = stream.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
                return;
            }
        }

        let (status, content_range, slice) = match (opts.support_ranges, range) {
            (true, Some((start, end_incl))) => {
                let start = start.min(total);
                let end_incl = end_incl.min(total.saturating_sub(1));
                if start > end_incl {
                    let _ = stream.write_all(
                        format!(
                            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            total
                        )
                        .as_bytes(),
                    );
                    return;
                }
                let slice = &body[start as usize..=(end_incl as usize)];
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    slice,
                )
            }
            _ => ("200 OK", None, body),
        };

        let truncate = seq < opts.fail_first_gets + opts.rate_limit_gets + opts.truncate_first_gets;
        let sent = if truncate { slice.len() / 2 } else { slice.len() };
        let mut response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}",
            status,
            slice.len(),
            extra_headers(&opts)
        );
        if let Some(cr) = content_range {
            response.push_str(&format!("Content-Range: {cr}\r\n"));
        }
        response.push_str("\r\n");
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(&slice[..sent]);
        // Truncated responses drop the connection with bytes missing.
        return;
    }

    let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
}

/// Returns (method, optional (start, end_inclusive)) for `Range: bytes=X-Y`.
/// An open-ended `bytes=X-` maps the end to `u64::MAX`.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(part) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
