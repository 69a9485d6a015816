//! Append-only JSONL writer with time-based rotation and periodic fsync.
//!
//! Rotation is time-based rather than size-based so downstream readers
//! never have to reason about partial records at a size boundary. On
//! startup the writer resumes at the next free part number by scanning
//! the directory, so a restart never appends to a file another process
//! (or a prior run) already closed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub struct RotatingSink {
    dir: PathBuf,
    prefix: String,
    rotate_after: Duration,
    fsync_after: Duration,
    part: u32,
    file: Option<File>,
    opened_at: Instant,
    last_fsync: Instant,
}

impl RotatingSink {
    pub fn open(dir: impl AsRef<Path>, prefix: impl Into<String>, rotate_minutes: u64, fsync_seconds: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let prefix = prefix.into();
        let part = Self::next_part(&dir, &prefix)?;

        let mut sink = Self {
            dir,
            prefix,
            rotate_after: Duration::from_secs(rotate_minutes * 60),
            fsync_after: Duration::from_secs(fsync_seconds),
            part,
            file: None,
            opened_at: Instant::now(),
            last_fsync: Instant::now(),
        };
        sink.open_new()?;
        Ok(sink)
    }

    fn next_part(dir: &Path, prefix: &str) -> std::io::Result<u32> {
        let want_prefix = format!("{}.part-", prefix);
        let mut max_part: i64 = -1;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&want_prefix) else {
                continue;
            };
            let Some(digits) = rest.strip_suffix(".jsonl") else {
                continue;
            };
            if let Ok(n) = digits.parse::<i64>() {
                max_part = max_part.max(n);
            }
        }
        Ok((max_part + 1) as u32)
    }

    fn part_path(&self) -> PathBuf {
        self.dir.join(format!("{}.part-{:04}.jsonl", self.prefix, self.part))
    }

    fn open_new(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }

        let path = self.part_path();
        self.part += 1;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(file);
        self.opened_at = Instant::now();
        self.last_fsync = self.opened_at;
        info!(path = %path.display(), "rotating_sink opened new part");
        Ok(())
    }

    /// Append one record as a JSON line, rotating and fsyncing as needed.
    pub fn write<T: Serialize>(&mut self, record: &T) -> std::io::Result<()> {
        if self.opened_at.elapsed() > self.rotate_after {
            self.open_new()?;
        }

        let line = serde_json::to_string(record)?;
        let file = self.file.as_mut().expect("rotating_sink always has an open file");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        if self.last_fsync.elapsed() > self.fsync_after {
            file.flush()?;
            file.sync_all()?;
            self.last_fsync = Instant::now();
        }

        Ok(())
    }

    /// Convenience for callers holding a raw `serde_json::Value`.
    pub fn write_value(&mut self, record: &Value) -> std::io::Result<()> {
        self.write(record)
    }

    /// Flush, fsync, and drop the active file handle. Safe to call more
    /// than once.
    pub fn close(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for RotatingSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RotatingSink::open(dir.path(), "orderbooks", 10, 3600).unwrap();
        sink.write(&json!({"a": 1})).unwrap();
        sink.write(&json!({"a": 2})).unwrap();
        sink.close().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn resumes_part_counter_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = RotatingSink::open(dir.path(), "orderbooks", 10, 3600).unwrap();
            sink.write(&json!({"a": 1})).unwrap();
            sink.close().unwrap();
        }
        let sink = RotatingSink::open(dir.path(), "orderbooks", 10, 3600).unwrap();
        assert_eq!(sink.part, 2);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RotatingSink::open(dir.path(), "orderbooks", 10, 3600).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn rotates_when_interval_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RotatingSink::open(dir.path(), "orderbooks", 10, 3600).unwrap();
        sink.write(&json!({"a": 1})).unwrap();
        sink.opened_at = Instant::now() - Duration::from_secs(10 * 60 + 1);
        sink.write(&json!({"a": 2})).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["orderbooks.part-0000.jsonl", "orderbooks.part-0001.jsonl"]);
    }
}
