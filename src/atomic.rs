//! Atomic file replacement.
//!
//! Every durable document taskloop writes (loop state, receipts, tracker
//! files) goes through [`write_atomic`]: content is written to a uniquely
//! named sibling temp file, flushed to disk, then renamed over the target.
//! Readers observe either the old document or the new one, never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = "tmp";

/// Lock file suffix for writer exclusion.
const LOCK_SUFFIX: &str = "lock";

/// Write `contents` to `path` via write-temp-then-rename.
///
/// Parent directories are created as needed. The temp name carries a random
/// component so concurrent writers of the same target never share a temp file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = sibling(path, &format!("{}.{TMP_SUFFIX}", uuid::Uuid::new_v4().simple()));
    let result = (|| {
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(contents)?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Like [`write_atomic`], holding an exclusive advisory lock on
/// `<path>.lock` for the duration of the write.
pub fn write_atomic_locked(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let lock_file = File::create(sibling(path, LOCK_SUFFIX))?;
    FileExt::lock_exclusive(&lock_file)?;
    let result = write_atomic(path, contents);
    let _ = FileExt::unlock(&lock_file);
    result
}

/// `<dir>/.<file name>.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a").join("b").join("doc.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic_locked(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        let a = "a".repeat(64 * 1024);
        let b = "b".repeat(64 * 1024);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| write_atomic(&path, a.as_bytes()).unwrap());
                s.spawn(|| write_atomic(&path, b.as_bytes()).unwrap());
            }
        });

        let content = fs::read_to_string(&path).unwrap();
        assert!(content == a || content == b);
    }
}
