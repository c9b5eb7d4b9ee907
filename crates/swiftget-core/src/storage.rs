//! Output-file plumbing: preallocated temp file, positional writes, atomic publish.
//!
//! Workers share one `OutputFile` and write only inside their own byte
//! windows, so positional I/O needs no shared cursor and no locking.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Suffix for in-progress downloads; renamed away on success so a partial
/// file is never visible under the final name.
pub const PART_SUFFIX: &str = ".swiftget-part";

/// Temp path next to the intended final path.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(PART_SUFFIX);
    final_path.with_file_name(name)
}

/// Shared handle to the in-progress output file. Cheap to clone; every
/// `write_at` is independent pwrite-style I/O.
#[derive(Clone)]
pub struct OutputFile {
    file: Arc<File>,
    part_path: PathBuf,
}

impl OutputFile {
    /// Create (or truncate) the temp file and preallocate `size` bytes.
    /// Pass 0 when the final size is unknown (single-stream, chunked).
    pub fn create(final_path: &Path, size: u64) -> Result<Self> {
        let part = part_path(final_path);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part)
            .with_context(|| format!("create temp file {}", part.display()))?;
        let out = Self { file: Arc::new(file), part_path: part };
        if size > 0 {
            out.preallocate(size)?;
        }
        Ok(out)
    }

    /// Open an existing temp file without truncation, for resume.
    pub fn open_existing(final_path: &Path) -> Result<Self> {
        let part = part_path(final_path);
        let file = File::options()
            .read(true)
            .write(true)
            .open(&part)
            .with_context(|| format!("open temp file {}", part.display()))?;
        Ok(Self { file: Arc::new(file), part_path: part })
    }

    /// Reserve blocks up front: `posix_fallocate` where available, `set_len`
    /// otherwise. Real allocation keeps concurrent segment writes from
    /// fragmenting the file.
    fn preallocate(&self, size: u64) -> Result<()> {
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file
            .set_len(size)
            .with_context(|| format!("preallocate {} bytes", size))?;
        Ok(())
    }

    /// Write `data` at `offset` without touching any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self.file.write_at(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "pwrite returned zero",
                ));
            }
            written += n;
        }
        Ok(())
    }

    /// Non-Unix stub: seek + write on a cloned handle. Not used by the
    /// parallel path on platforms without positional writes.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    /// Current on-disk size of the temp file.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().context("stat temp file")?.len())
    }

    /// Cut the file back to `size` bytes. Used when a parallel attempt is
    /// abandoned and the single-stream fallback restarts from a known prefix.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .with_context(|| format!("truncate to {} bytes", size))?;
        Ok(())
    }

    /// Flush file data to disk; call before `publish` for durability.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("sync temp file")?;
        Ok(())
    }

    pub fn part_file_path(&self) -> &Path {
        &self.part_path
    }

    /// Atomically rename the temp file onto `final_path`. Consumes the
    /// handle; both paths must be on the same filesystem.
    pub fn publish(self, final_path: &Path) -> Result<()> {
        let part = self.part_path.clone();
        drop(self.file);
        std::fs::rename(&part, final_path).with_context(|| {
            format!("rename {} to {}", part.display(), final_path.display())
        })?;
        Ok(())
    }

    /// Remove the temp file (cancelled download without resume).
    pub fn discard(self) -> Result<()> {
        let part = self.part_path.clone();
        drop(self.file);
        std::fs::remove_file(&part)
            .with_context(|| format!("remove {}", part.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        let p = part_path(Path::new("/downloads/file.iso"));
        assert_eq!(p, Path::new("/downloads/file.iso.swiftget-part"));
    }

    #[test]
    fn concurrent_offsets_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        let out = OutputFile::create(&final_path, 12).unwrap();

        let a = out.clone();
        let b = out.clone();
        let ta = std::thread::spawn(move || a.write_at(6, b"world!").unwrap());
        let tb = std::thread::spawn(move || b.write_at(0, b"hello ").unwrap());
        ta.join().unwrap();
        tb.join().unwrap();

        out.sync().unwrap();
        out.publish(&final_path).unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello world!");
        assert!(!final_path.with_file_name("out.bin.swiftget-part").exists());
    }

    #[test]
    fn preallocate_sets_length() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("big.bin");
        let out = OutputFile::create(&final_path, 4096).unwrap();
        assert_eq!(out.len().unwrap(), 4096);
    }

    #[test]
    fn truncate_cuts_back_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("t.bin");
        let out = OutputFile::create(&final_path, 100).unwrap();
        out.write_at(0, &[7u8; 100]).unwrap();
        out.truncate(10).unwrap();
        assert_eq!(out.len().unwrap(), 10);
    }

    #[test]
    fn open_existing_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("r.bin");
        {
            let out = OutputFile::create(&final_path, 4).unwrap();
            out.write_at(0, b"abcd").unwrap();
            out.sync().unwrap();
        }
        let reopened = OutputFile::open_existing(&final_path).unwrap();
        assert_eq!(reopened.len().unwrap(), 4);
        reopened.write_at(2, b"CD").unwrap();
        reopened.publish(&final_path).unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"abCD");
    }

    #[test]
    fn discard_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("d.bin");
        let out = OutputFile::create(&final_path, 1).unwrap();
        let part = out.part_file_path().to_path_buf();
        assert!(part.exists());
        out.discard().unwrap();
        assert!(!part.exists());
    }
}
