//! Per-repository memory of past failures and hotspots.
//!
//! Records are keyed by a repository fingerprint and injected into stage
//! goals so the agent does not rediscover known failure modes. The
//! build/test stages append an entry per failure.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::state_store::write_atomic;

/// One remembered failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub recorded_at: DateTime<Utc>,
    /// Normalized failure signature (see `core::signature`).
    pub signature: String,
    pub root_cause: String,
    /// Fix applied, when one landed.
    pub fix: Option<String>,
    pub affected_files: Vec<String>,
}

/// Memory record for one repository fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryRecord {
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
    /// File path → failure frequency.
    #[serde(default)]
    pub hotspots: BTreeMap<String, u32>,
}

/// File-backed memory index, one record per repository fingerprint.
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    dir: PathBuf,
}

impl MemoryIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Load the record for a fingerprint; absent records are empty.
    pub fn load(&self, fingerprint: &str) -> Result<MemoryRecord> {
        let path = self.record_path(fingerprint);
        if !path.exists() {
            return Ok(MemoryRecord::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read memory record {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse memory record {}", path.display()))
    }

    /// Append a failure and bump hotspot counters for its files.
    pub fn append_failure(&self, fingerprint: &str, entry: FailureEntry) -> Result<()> {
        let mut record = self.load(fingerprint)?;
        for file in &entry.affected_files {
            *record.hotspots.entry(file.clone()).or_insert(0) += 1;
        }
        record.failures.push(entry);
        self.save(fingerprint, &record)?;
        debug!(fingerprint, failures = record.failures.len(), "memory appended");
        Ok(())
    }

    /// Record the fix that resolved the most recent matching signature.
    pub fn record_fix(&self, fingerprint: &str, signature: &str, fix: &str) -> Result<()> {
        let mut record = self.load(fingerprint)?;
        if let Some(entry) = record
            .failures
            .iter_mut()
            .rev()
            .find(|entry| entry.signature == signature)
        {
            entry.fix = Some(fix.to_string());
            self.save(fingerprint, &record)?;
        }
        Ok(())
    }

    /// Render a bounded context block for goal injection.
    ///
    /// Most recent failures first, then the hottest files. Empty records
    /// render to an empty string so templates can drop the section.
    pub fn context_block(&self, fingerprint: &str, max_failures: usize) -> Result<String> {
        let record = self.load(fingerprint)?;
        if record.failures.is_empty() && record.hotspots.is_empty() {
            return Ok(String::new());
        }
        let mut block = String::new();
        if !record.failures.is_empty() {
            block.push_str("Known past failures in this repository:\n");
            for entry in record.failures.iter().rev().take(max_failures) {
                block.push_str(&format!("- [{}] {}", entry.signature, entry.root_cause));
                if let Some(fix) = &entry.fix {
                    block.push_str(&format!(" (fixed by: {fix})"));
                }
                block.push('\n');
            }
        }
        let mut hotspots: Vec<(&String, &u32)> = record.hotspots.iter().collect();
        hotspots.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        if !hotspots.is_empty() {
            block.push_str("Failure hotspots (file: count):\n");
            for (file, count) in hotspots.iter().take(5) {
                block.push_str(&format!("- {file}: {count}\n"));
            }
        }
        Ok(block)
    }

    fn save(&self, fingerprint: &str, record: &MemoryRecord) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(record).context("serialize memory record")?;
        buf.push('\n');
        write_atomic(&self.record_path(fingerprint), &buf)
    }
}

/// Memory signal for triage scoring: how often this repo failed lately.
pub fn memory_signal(record: &MemoryRecord) -> f64 {
    // Saturates so one pathological repo cannot dominate the score.
    (record.failures.len() as f64 / 5.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(signature: &str, files: &[&str]) -> FailureEntry {
        FailureEntry {
            recorded_at: Utc::now(),
            signature: signature.to_string(),
            root_cause: format!("{signature} root cause"),
            fix: None,
            affected_files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn append_bumps_hotspots() {
        let temp = tempfile::tempdir().expect("tempdir");
        let index = MemoryIndex::new(temp.path());

        index
            .append_failure("abc", entry("sig1", &["src/a.rs", "src/b.rs"]))
            .expect("append");
        index
            .append_failure("abc", entry("sig2", &["src/a.rs"]))
            .expect("append");

        let record = index.load("abc").expect("load");
        assert_eq!(record.failures.len(), 2);
        assert_eq!(record.hotspots.get("src/a.rs"), Some(&2));
        assert_eq!(record.hotspots.get("src/b.rs"), Some(&1));
    }

    #[test]
    fn record_fix_targets_latest_matching_signature() {
        let temp = tempfile::tempdir().expect("tempdir");
        let index = MemoryIndex::new(temp.path());

        index.append_failure("abc", entry("sig1", &[])).expect("append");
        index.append_failure("abc", entry("sig1", &[])).expect("append");
        index.record_fix("abc", "sig1", "pin dependency").expect("fix");

        let record = index.load("abc").expect("load");
        assert_eq!(record.failures[0].fix, None);
        assert_eq!(record.failures[1].fix.as_deref(), Some("pin dependency"));
    }

    #[test]
    fn context_block_is_empty_for_unknown_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let index = MemoryIndex::new(temp.path());
        let block = index.context_block("nope", 3).expect("context");
        assert!(block.is_empty());
    }

    #[test]
    fn context_block_lists_recent_failures_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let index = MemoryIndex::new(temp.path());
        index.append_failure("abc", entry("old", &["src/x.rs"])).expect("append");
        index.append_failure("abc", entry("new", &["src/x.rs"])).expect("append");

        let block = index.context_block("abc", 2).expect("context");
        let old_pos = block.find("old root cause").expect("old entry");
        let new_pos = block.find("new root cause").expect("new entry");
        assert!(new_pos < old_pos);
        assert!(block.contains("src/x.rs: 2"));
    }

    #[test]
    fn memory_signal_saturates() {
        let mut record = MemoryRecord::default();
        assert_eq!(memory_signal(&record), 0.0);
        for i in 0..10 {
            record.failures.push(entry(&format!("sig{i}"), &[]));
        }
        assert_eq!(memory_signal(&record), 1.0);
    }
}
