//! Target filename resolution: Content-Disposition, URL path, fallback.

const FALLBACK_FILENAME: &str = "download.bin";

/// Picks the output filename: `Content-Disposition` wins over the URL path,
/// which wins over a generic fallback. The result is always sanitised.
pub fn resolve_filename(content_disposition: Option<&str>, url: &str) -> String {
    let candidate = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url_path(url));
    match candidate.map(|c| sanitize(&c)) {
        Some(name) if !name.is_empty() => name,
        _ => FALLBACK_FILENAME.to_string(),
    }
}

/// Extracts the filename from a `Content-Disposition` header value.
///
/// `filename*=UTF-8''percent-encoded` (RFC 5987) takes precedence over a
/// quoted or bare `filename=`.
pub fn filename_from_content_disposition(header_value: &str) -> Option<String> {
    let mut plain: Option<String> = None;

    for param in header_value.split(';') {
        let param = param.trim();
        let Some((name, value)) = param.split_once('=') else { continue };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        if name == "filename*" {
            let rest = value
                .strip_prefix("UTF-8''")
                .or_else(|| value.strip_prefix("utf-8''"))?;
            let decoded = percent_decode(rest);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        } else if name == "filename" {
            let unquoted = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                unescape_quoted(&value[1..value.len() - 1])
            } else {
                value.to_string()
            };
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }

    plain
}

/// Last path segment of the URL, if usable as a filename.
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(percent_decode(segment))
}

/// Strips directory components and characters that are unsafe in filenames.
/// A name reduced to nothing comes back empty; callers substitute a fallback.
pub fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    cleaned.trim_matches([' ', '.']).to_string()
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                Some(next) => {
                    out.push(c);
                    out.push(next);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next().and_then(hex_val);
            let lo = bytes.next().and_then(hex_val);
            match (hi, lo) {
                (Some(h), Some(l)) => out.push(h << 4 | l),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
