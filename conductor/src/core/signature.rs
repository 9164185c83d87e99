//! Failure-output normalization and stable signature hashing.
//!
//! Two runs of the same broken build rarely produce byte-identical
//! output: addresses, line numbers, durations and temp paths all vary.
//! Normalization strips those so the self-heal loop can recognize a
//! repeated failure by its signature.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex address regex"));
static LINE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(:\d+)?").expect("line:col regex"));
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\s*(ms|s|secs?|seconds?)\b").expect("duration regex"));
static TMP_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/tmp/[\w./-]+").expect("tmp path regex"));
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex")
});

/// Collapse run-varying details out of failure output.
pub fn normalize_failure(output: &str) -> String {
    let mut text = output.to_string();
    text = TIMESTAMP_RE.replace_all(&text, "<ts>").into_owned();
    text = HEX_ADDR_RE.replace_all(&text, "<addr>").into_owned();
    text = TMP_PATH_RE.replace_all(&text, "<tmp>").into_owned();
    text = DURATION_RE.replace_all(&text, "<dur>").into_owned();
    text = LINE_COL_RE.replace_all(&text, ":<loc>").into_owned();
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

/// Stable short signature of normalized failure output.
pub fn failure_signature(output: &str) -> String {
    let normalized = normalize_failure(output);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// Stable fingerprint for a repository, keyed by its canonical location.
pub fn repo_fingerprint(repo: &str) -> String {
    let digest = Sha256::digest(repo.trim().as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_varying_details() {
        let a = "error at src/lib.rs:10:5 (0xdeadbeef) after 1.2s in /tmp/work-abc";
        let b = "error at src/lib.rs:99:1 (0xcafebabe) after 0.8s in /tmp/work-xyz";
        assert_eq!(normalize_failure(a), normalize_failure(b));
    }

    #[test]
    fn identical_failures_share_a_signature() {
        let a = "test failed: assertion at foo.rs:12";
        let b = "test failed: assertion at foo.rs:99";
        assert_eq!(failure_signature(a), failure_signature(b));
    }

    #[test]
    fn different_failures_differ() {
        assert_ne!(
            failure_signature("assertion failed: left == right"),
            failure_signature("thread panicked at index out of bounds"),
        );
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let fp = repo_fingerprint("git@example.com:acme/widget.git");
        assert_eq!(fp, repo_fingerprint("git@example.com:acme/widget.git"));
        assert_eq!(fp.len(), 16);
    }
}
