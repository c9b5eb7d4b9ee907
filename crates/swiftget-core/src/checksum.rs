//! Checksum verification over the assembled file.
//!
//! Digests are computed after assembly, off the transfer hot path, by
//! streaming the file in fixed-size chunks.

use anyhow::{Context, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::retry::DownloadError;

const BUF_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Hex digest length for this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => anyhow::bail!("unsupported checksum algorithm: {other}"),
        }
    }
}

/// Expected digest attached to a download task, e.g. from `--checksum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex.
    pub digest: String,
}

impl FromStr for ExpectedChecksum {
    type Err = anyhow::Error;

    /// Parses the `ALG:HEX` form.
    fn from_str(s: &str) -> Result<Self> {
        let (alg, hex_digest) = s
            .split_once(':')
            .context("checksum must be ALG:HEX (e.g. sha256:deadbeef...)")?;
        let algorithm: ChecksumAlgorithm = alg.parse()?;
        let digest = hex_digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len()
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            anyhow::bail!(
                "{} digest must be {} hex characters",
                algorithm.name(),
                algorithm.hex_len()
            );
        }
        Ok(Self { algorithm, digest })
    }
}

/// Compute the digest of a file as lowercase hex, streaming in chunks so
/// memory stays bounded for large files.
pub fn digest_path(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = [0u8; BUF_SIZE];
    match algorithm {
        ChecksumAlgorithm::Md5 => hash_stream::<Md5>(&mut f, &mut buf, path),
        ChecksumAlgorithm::Sha1 => hash_stream::<Sha1>(&mut f, &mut buf, path),
        ChecksumAlgorithm::Sha256 => hash_stream::<Sha256>(&mut f, &mut buf, path),
    }
}

fn hash_stream<D: Digest>(f: &mut File, buf: &mut [u8], path: &Path) -> Result<String> {
    let mut hasher = D::new();
    loop {
        let n = f.read(buf).with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify `path` against `expected`. Comparison is case-insensitive; a
/// mismatch carries both digests for the error message and exit code.
pub fn verify_path(path: &Path, expected: &ExpectedChecksum) -> Result<(), DownloadError> {
    let actual = digest_path(path, expected.algorithm)
        .map_err(|e| DownloadError::Unknown(format!("checksum read failed: {e:#}")))?;
    if actual.eq_ignore_ascii_case(&expected.digest) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            expected: expected.digest.clone(),
            actual,
        })
    }
}
