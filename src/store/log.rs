//! Usage log of closed flow windows.
//!
//! The log is a JSON-lines file, most recent record first. Writing a
//! record rewrites the whole file through a temporary file so a crash
//! mid-write leaves either the old or the new log, never a torn one.

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One closed flow window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Comma separated station indices
    pub valves: String,
    /// Comma separated station names
    pub stations: String,
    /// Volume used
    pub usage: f64,
    /// Volume unit
    pub measure: String,
    /// `mm:ss`
    pub duration: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM:SS`
    pub start: String,
}

/// JSON-lines log file, most recent first.
#[derive(Debug, Clone)]
pub struct EventLogStore {
    path: PathBuf,
}

impl EventLogStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepend `entry`, keep at most `max_entries` (0 = all), rewrite the file.
    pub fn write(&self, entry: &LogEntry, max_entries: usize) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let limit = if max_entries == 0 {
            usize::MAX
        } else {
            max_entries
        };
        let older = self.read_existing(limit.saturating_sub(1))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for record in std::iter::once(entry).chain(older.iter()) {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Up to `keep` existing records for a rewrite. Unlike [`read`](Self::read),
    /// an I/O error is returned so the caller does not drop the unread tail.
    fn read_existing(&self, keep: usize) -> Result<Vec<LogEntry>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            if records.len() >= keep {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => records.push(entry),
                Err(e) => tracing::debug!("Dropping malformed flow log line: {}", e),
            }
        }
        Ok(records)
    }

    /// Lazily iterate the log, most recent first.
    ///
    /// A missing file reads as an empty log; unparsable lines are skipped.
    /// Each call starts again from the top of the file.
    pub fn read(&self) -> LogIter {
        let lines = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not open flow log {:?}: {}", self.path, e);
                }
                None
            }
        };
        LogIter { lines }
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&self.path)?;
        Ok(())
    }
}

/// Iterator over log records.
pub struct LogIter {
    lines: Option<Lines<BufReader<File>>>,
}

impl Iterator for LogIter {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Flow log read failed: {}", e);
                    self.lines = None;
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => return Some(entry),
                Err(e) => tracing::debug!("Skipping malformed flow log line: {}", e),
            }
        }
    }
}

/// What happened to a log write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another write was in progress; this one was dropped
    Skipped,
    /// Logging is turned off in the settings
    Disabled,
    /// The write failed; the error has been logged
    Failed,
}

/// Log store guarded so that at most one write or clear proceeds at a time.
///
/// A write that finds the guard held is dropped rather than queued: the
/// writer holding the guard records the settled state of a burst of valve
/// changes, and the loser would only duplicate it. A clear waits instead.
#[derive(Debug)]
pub struct LogWriter {
    store: EventLogStore,
    guard: Mutex<()>,
}

impl LogWriter {
    pub fn new(store: EventLogStore) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &EventLogStore {
        &self.store
    }

    /// Remove every record once any write in progress has finished.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.store.clear()
    }

    /// Write `entry` unless logging is off or another write holds the guard.
    pub fn try_write(&self, entry: &LogEntry, enabled: bool, max_entries: usize) -> WriteOutcome {
        let _guard = match self.guard.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                tracing::debug!("Flow log write already in progress, skipping");
                return WriteOutcome::Skipped;
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if !enabled {
            return WriteOutcome::Disabled;
        }

        match self.store.write(entry, max_entries) {
            Ok(()) => {
                tracing::info!(
                    "Logged flow window: stations [{}], {} {} over {}",
                    entry.stations,
                    entry.usage,
                    entry.measure,
                    entry.duration
                );
                WriteOutcome::Written
            }
            Err(e) => {
                tracing::warn!("Could not write flow log: {}", e);
                WriteOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(valves: &str, usage: f64) -> LogEntry {
        LogEntry {
            valves: valves.to_string(),
            stations: format!("S{valves}"),
            usage,
            measure: "gal".to_string(),
            duration: "01:00".to_string(),
            date: "2024-06-01".to_string(),
            start: "06:00:00".to_string(),
        }
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventLogStore::new(dir.path().join("flowlog.json"));
        assert_eq!(store.read().count(), 0);
    }

    #[test]
    fn test_most_recent_first_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventLogStore::new(dir.path().join("flowlog.json"));
        store.write(&entry("1", 1.0), 2).unwrap();
        store.write(&entry("2", 2.0), 2).unwrap();
        store.write(&entry("3", 3.0), 2).unwrap();

        let valves: Vec<String> = store.read().map(|e| e.valves).collect();
        assert_eq!(valves, vec!["3", "2"]);
    }

    #[test]
    fn test_unbounded_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventLogStore::new(dir.path().join("flowlog.json"));
        for i in 0..5 {
            store.write(&entry(&i.to_string(), 1.0), 0).unwrap();
        }
        assert_eq!(store.read().count(), 5);
        assert_eq!(store.read().next().unwrap().valves, "4");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowlog.json");
        let good = serde_json::to_string(&entry("2", 4.5)).unwrap();
        std::fs::write(&path, format!("garbage\n\n{good}\n")).unwrap();

        let store = EventLogStore::new(path);
        let records: Vec<LogEntry> = store.read().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usage, 4.5);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventLogStore::new(dir.path().join("flowlog.json"));
        store.write(&entry("1", 1.0), 0).unwrap();
        store.clear().unwrap();
        assert_eq!(store.read().count(), 0);
    }

    #[test]
    fn test_write_keeps_log_when_read_back_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowlog.json");
        // A directory opens but fails on read.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let store = EventLogStore::new(path.clone());
        assert!(matches!(
            store.write(&entry("1", 1.0), 0),
            Err(StoreError::Io(_))
        ));
        assert!(path.join("keep").exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_clear_waits_for_write_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let writer = std::sync::Arc::new(LogWriter::new(EventLogStore::new(
            dir.path().join("flowlog.json"),
        )));
        writer.try_write(&entry("1", 1.0), true, 0);

        let held = writer.guard.lock().unwrap();
        let clearing = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.clear())
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        // Finish the write that owns the guard; the clear must not land first.
        writer.store().write(&entry("2", 2.0), 0).unwrap();
        assert_eq!(writer.store().read().count(), 2);
        drop(held);

        clearing.join().unwrap().unwrap();
        assert_eq!(writer.store().read().count(), 0);
    }

    #[test]
    fn test_writer_skips_on_contention() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LogWriter::new(EventLogStore::new(dir.path().join("flowlog.json")));

        let held = writer.guard.lock().unwrap();
        assert_eq!(
            writer.try_write(&entry("1", 1.0), true, 0),
            WriteOutcome::Skipped
        );
        drop(held);

        assert_eq!(
            writer.try_write(&entry("1", 1.0), false, 0),
            WriteOutcome::Disabled
        );
        assert_eq!(
            writer.try_write(&entry("1", 1.0), true, 0),
            WriteOutcome::Written
        );
        assert_eq!(writer.store().read().count(), 1);
    }
}
