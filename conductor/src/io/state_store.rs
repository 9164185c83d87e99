//! Durable, atomic persistence for run/checkpoint/event records.
//!
//! All cross-process coordination goes through this layer; no in-memory
//! state is authoritative across process boundaries. Records are written
//! whole (temp file, fsync, rename) so a crash never leaves a partially
//! written record and readers never observe one.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::types::Event;

/// Error returned by [`StateStore::get`] when no record exists for a key.
///
/// Callers that treat absence as a normal condition downcast to this
/// type; any other error is a real I/O or parse failure.
#[derive(Debug)]
pub struct NotFoundError {
    pub key: String,
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no record for key {:?}", self.key)
    }
}

impl std::error::Error for NotFoundError {}

/// File-backed record store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    events_path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>, events_path: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            events_path: events_path.into(),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.state_dir.join(format!("{key}.json"))
    }

    /// Write a record atomically. A failure here is fatal to the
    /// triggering transition; callers retry the whole transition.
    #[instrument(skip_all, fields(key))]
    pub fn put<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let path = self.record_path(key);
        let mut buf = serde_json::to_string_pretty(record).context("serialize record")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(key, "record written");
        Ok(())
    }

    /// Read the last fully-written record for a key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let path = self.record_path(key);
        if !path.exists() {
            return Err(anyhow!(NotFoundError {
                key: key.to_string()
            }));
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read record {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse record {}", path.display()))
    }

    /// Whether a record exists for a key.
    pub fn contains(&self, key: &str) -> bool {
        self.record_path(key).exists()
    }

    /// Remove a record. Missing records are not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove record {}", path.display()))?;
        }
        Ok(())
    }

    /// List record keys under a prefix directory (e.g. `"runs"`).
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.state_dir.join(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let entry = entry.context("read dir entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(format!("{prefix}/{stem}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Append an event to the ordered, append-only log.
    ///
    /// Events are newline-delimited JSON; appends never block concurrent
    /// readers, which only ever see complete lines.
    #[instrument(skip_all, fields(event_type = %event.event_type))]
    pub fn append_event(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("open event log {}", self.events_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event to {}", self.events_path.display()))?;
        file.flush().context("flush event log")?;
        Ok(())
    }

    /// Read all events in append order. Partial trailing lines (from a
    /// crash mid-append) are skipped rather than failing the read.
    pub fn read_events(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.events_path)
            .with_context(|| format!("read event log {}", self.events_path.display()))?;
        let mut events = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(err = %err, "skipping unparseable event line");
                }
            }
        }
        Ok(events)
    }
}

/// Write contents to `path` via temp file, fsync, rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        value: u32,
    }

    fn store(temp: &tempfile::TempDir) -> StateStore {
        StateStore::new(temp.path().join("state"), temp.path().join("events.jsonl"))
    }

    #[test]
    fn put_then_get_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        store.put("runs/42", &Record { value: 7 }).expect("put");
        let loaded: Record = store.get("runs/42").expect("get");
        assert_eq!(loaded, Record { value: 7 });
    }

    #[test]
    fn get_missing_downcasts_to_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        let err = store.get::<Record>("runs/absent").unwrap_err();
        let not_found = err.downcast_ref::<NotFoundError>().expect("NotFoundError");
        assert_eq!(not_found.key, "runs/absent");
    }

    #[test]
    fn put_leaves_no_temp_file_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        store.put("runs/42", &Record { value: 1 }).expect("put");
        let dir = temp.path().join("state").join("runs");
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn events_append_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        for i in 0..3 {
            let event =
                Event::new("stage.completed", Some("42"), Utc::now()).with("seq", i.to_string());
            store.append_event(&event).expect("append");
        }
        let events = store.read_events().expect("read");
        let seqs: Vec<&str> = events
            .iter()
            .map(|e| e.payload.get("seq").expect("seq").as_str())
            .collect();
        assert_eq!(seqs, vec!["0", "1", "2"]);
    }

    #[test]
    fn partial_trailing_event_line_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        store
            .append_event(&Event::new("run.created", Some("42"), Utc::now()))
            .expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp.path().join("events.jsonl"))
            .expect("open");
        file.write_all(b"{\"timestamp\":\"2026-01-")
            .expect("write partial");

        let events = store.read_events().expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run.created");
    }

    #[test]
    fn list_returns_sorted_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        store.put("runs/9", &Record { value: 9 }).expect("put");
        store.put("runs/12", &Record { value: 12 }).expect("put");
        let keys = store.list("runs").expect("list");
        assert_eq!(keys, vec!["runs/12".to_string(), "runs/9".to_string()]);
    }
}
