use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_STEM: &str = "curation-journal";

/// Append-only JSONL record of what a run did to each record.
#[derive(Clone)]
pub struct RunJournal {
    queue: Arc<Mutex<Vec<JournalEntry>>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

#[derive(Debug, Serialize)]
pub struct JournalEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RunJournal {
    pub fn open(config: &AppConfig) -> AppResult<Self> {
        Self::open_in(&config.journal_dir, config)
    }

    pub fn open_in<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{JOURNAL_STEM}.jsonl"));
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
            batch_size: config.journal_batch_size.max(1),
            max_file_bytes: config.journal_max_bytes,
            max_file_count: config.journal_max_files.max(1),
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: Value) -> AppResult<()> {
        let mut queue = self.queue.lock();
        queue.push(JournalEntry {
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        });
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The queue is only cleared after a successful write so nothing is lost
    // when the disk write fails.
    fn persist_locked(&self, queue: &mut Vec<JournalEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for entry in queue.iter() {
            let line = serde_json::to_vec(entry)?;
            incoming += line.len() as u64 + 1;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.dir().join(format!(
                "{JOURNAL_STEM}-{}.jsonl",
                Utc::now().format("%Y%m%d%H%M%S%3f")
            ));
            fs::rename(&self.path, rotated)?;
            self.prune_rotations()?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{JOURNAL_STEM}-");
        let mut rotations = fs::read_dir(self.dir())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect::<Vec<_>>();

        // Timestamped names sort chronologically.
        rotations.sort();
        let allowed = self.max_file_count - 1;
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for path in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::config::test_config;

    #[test]
    fn writes_entries_as_json_lines() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::open_in(dir.path(), &test_config()).unwrap();
        journal.record("enriched", json!({ "id": 7 })).unwrap();
        journal.flush().unwrap();

        let contents = fs::read_to_string(journal.path()).unwrap();
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["name"], json!("enriched"));
        assert_eq!(line["payload"]["id"], json!(7));
    }

    #[test]
    fn buffers_until_batch_size() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.journal_batch_size = 3;
        let journal = RunJournal::open_in(dir.path(), &config).unwrap();
        journal.record("a", json!({})).unwrap();
        journal.record("b", json!({})).unwrap();
        assert_eq!(journal.pending(), 2);
        journal.record("c", json!({})).unwrap();
        assert_eq!(journal.pending(), 0);
    }

    #[test]
    fn appends_across_instances() {
        let dir = tempdir().unwrap();
        let config = test_config();
        {
            let journal = RunJournal::open_in(dir.path(), &config).unwrap();
            journal.record("first", json!({})).unwrap();
        }
        let journal = RunJournal::open_in(dir.path(), &config).unwrap();
        journal.record("second", json!({})).unwrap();

        let contents = fs::read_to_string(journal.path()).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[test]
    fn rotates_and_prunes_when_over_budget() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.journal_max_bytes = 64;
        config.journal_max_files = 2;
        let journal = RunJournal::open_in(dir.path(), &config).unwrap();
        for idx in 0..4 {
            journal
                .record("big", json!({ "payload": "0123456789abcdef0123456789abcdef", "idx": idx }))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{JOURNAL_STEM}-"))
            })
            .count();
        assert_eq!(rotated, 1);
        let current = fs::read_to_string(journal.path()).unwrap();
        assert!(current.contains("\"idx\":3"));
    }
}
