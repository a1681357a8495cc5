//! File persistence primitives: atomic writes and lock-guarded reads.
//!
//! Every durable file the orchestrator owns (workflow state, event log,
//! audit log, coordination store) goes through these helpers. Writes go to
//! a sibling temp file which is fsynced and renamed over the target while
//! the exclusive lock is still held, so a reader can never observe a
//! partially written file. Readers take a shared lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use fs2::FileExt;

/// Atomically replace `path` with `bytes`.
///
/// Lock ordering: the exclusive lock is taken on the temp file, the rename
/// happens while it is held, and the lock is released last. Releasing
/// before the rename would let a shared-lock reader open the old file
/// after the rename started.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut temp = File::create(&temp_path)?;
    temp.lock_exclusive()?;

    let result = (|| {
        temp.write_all(bytes)?;
        temp.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    let _ = fs2::FileExt::unlock(&temp);
    result
}

/// Read the whole file under a shared lock. Returns `Ok(None)` if the file
/// does not exist.
pub fn read_locked(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.lock_shared()?;
    let mut buf = Vec::new();
    let result = file.read_to_end(&mut buf);
    let _ = fs2::FileExt::unlock(&file);
    result?;
    Ok(Some(buf))
}

/// Append a line under an exclusive lock, creating the file and its parent
/// directory on demand.
pub fn append_line_locked(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let result = (|| {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    })();
    let _ = fs2::FileExt::unlock(&file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep/nested/state.json");

        write_atomic(&path, b"{\"v\":1}").unwrap();
        assert_eq!(read_locked(&path).unwrap().unwrap(), b"{\"v\":1}");

        write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(read_locked(&path).unwrap().unwrap(), b"{\"v\":2}");
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"x").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn read_locked_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_locked(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn append_line_locked_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line_locked(&path, "{\"n\":1}").unwrap();
        append_line_locked(&path, "{\"n\":2}").unwrap();
        let content = String::from_utf8(read_locked(&path).unwrap().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["{\"n\":1}", "{\"n\":2}"]);
    }

    #[test]
    fn concurrent_writers_serialize_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contended.jsonl");
        let mut handles = Vec::new();
        for t in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    append_line_locked(&path, &format!("{{\"t\":{t},\"i\":{i}}}")).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let content = String::from_utf8(read_locked(&path).unwrap().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 100);
        // Every line is complete JSON: no torn writes.
        for line in content.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
