//! Diagnostic dump files for protocol errors.
//!
//! Bytes that could not be interpreted as frames, and any other
//! protocol-level trouble, are appended to a per-fork dump file in the
//! reports directory — once per distinct failure, so a chatty worker cannot
//! flood the disk. The dump path is referenced from error reports so the
//! root cause is recoverable without re-running.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Append-only dump sink, scoped to one fork.
pub struct DumpFile {
    path: PathBuf,
    seen: Mutex<HashSet<u64>>,
}

impl DumpFile {
    pub fn new(reports_dir: &Path, fork_index: u32) -> Self {
        DumpFile {
            path: reports_dir.join(format!("kiln-{fork_index}.dump")),
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one failure. Repeats of the same `reason` are dropped.
    pub fn dump_once(&self, reason: &str, raw: &[u8]) {
        let mut hasher = DefaultHasher::new();
        reason.hash(&mut hasher);
        if !self.seen.lock().insert(hasher.finish()) {
            return;
        }
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let entry = format!(
            "# {reason}\n{}\n",
            String::from_utf8_lossy(raw).trim_end_matches('\n')
        );
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));
        if let Err(e) = appended {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot write dump file");
        }
    }

    /// Whether anything was dumped.
    pub fn is_dirty(&self) -> bool {
        !self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_reason_is_dumped_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dump = DumpFile::new(dir.path(), 1);
        dump.dump_once("unknown opcode 'x'", b"raw one");
        dump.dump_once("unknown opcode 'x'", b"raw two");
        dump.dump_once("unknown opcode 'y'", b"raw three");

        let text = std::fs::read_to_string(dump.path()).expect("read dump");
        assert!(text.contains("raw one"));
        assert!(!text.contains("raw two"));
        assert!(text.contains("raw three"));
        assert!(dump.is_dirty());
    }

    #[test]
    fn clean_dump_creates_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dump = DumpFile::new(dir.path(), 2);
        assert!(!dump.is_dirty());
        assert!(!dump.path().exists());
    }
}
