//! Durable log of terminally failed fetches
//!
//! One JSON-lines file per phase (`<dir>/<phase>.jsonl`). Entries are only ever
//! appended; a target that fails in several runs appears several times. The
//! retry-failed mode reads the [latest snapshot](FailureLedger::latest_snapshot),
//! which keeps the most recent entry per identifier.
//!
//! A crash in the middle of an append can leave a torn last line. Readers skip
//! lines that do not parse, and writers start a fresh line when the file does
//! not end with a newline, so one torn entry never corrupts the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{FetchTarget, Phase};

/// One terminal failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The target that failed, including its request parameters
    #[serde(flatten)]
    pub target: FetchTarget,
    /// Last failure observed before giving up
    pub reason: String,
    /// When the first attempt of this target started
    pub first_seen: DateTime<Utc>,
    /// Number of attempts made
    pub attempt_count: u32,
}

/// Append-only failure ledger, one file per phase
///
/// Writers to the same phase file are serialized; different phases never
/// contend.
#[derive(Debug)]
pub struct FailureLedger {
    dir: PathBuf,
    locks: [Mutex<()>; 3],
}

impl FailureLedger {
    /// Ledger rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    /// File holding the entries of `phase`
    pub fn path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("{}.jsonl", phase.as_str()))
    }

    fn lock(&self, phase: Phase) -> &Mutex<()> {
        match phase {
            Phase::Listing => &self.locks[0],
            Phase::Detail => &self.locks[1],
            Phase::Attachment => &self.locks[2],
        }
    }

    /// Append one entry and flush it to disk
    pub async fn append(&self, record: &FailureRecord) -> Result<()> {
        let phase = record.target.phase();
        let path = self.path(phase);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock(phase).lock().await;
        write_line(&self.dir, &path, &line)
            .await
            .map_err(|source| Error::Ledger {
                path: path.clone(),
                source,
            })?;

        tracing::info!(
            phase = %phase,
            target_id = record.target.identifier(),
            attempts = record.attempt_count,
            reason = %record.reason,
            "terminal failure recorded"
        );
        Ok(())
    }

    /// Every entry of `phase` in file order, skipping unreadable lines
    pub async fn read_all(&self, phase: Phase) -> Result<Vec<FailureRecord>> {
        let path = self.path(phase);
        let _guard = self.lock(phase).lock().await;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(Error::Ledger { path, source }),
        };
        Ok(parse_lines(&path, &raw))
    }

    /// Most recent entry per identifier, in order of first appearance
    pub async fn latest_snapshot(&self, phase: Phase) -> Result<Vec<FailureRecord>> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, FailureRecord> = HashMap::new();
        for record in self.read_all(phase).await? {
            let key = record.target.identifier().to_string();
            if !latest.contains_key(&key) {
                order.push(key.clone());
            }
            latest.insert(key, record);
        }
        Ok(order
            .into_iter()
            .filter_map(|key| latest.remove(&key))
            .collect())
    }
}

async fn write_line(dir: &Path, path: &Path, line: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .await?;

    let len = file.metadata().await?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(std::io::SeekFrom::Start(len - 1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] != b'\n' {
            file.write_all(b"\n").await?;
        }
    }

    file.write_all(line).await?;
    file.sync_data().await
}

fn parse_lines(path: &Path, raw: &str) -> Vec<FailureRecord> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable ledger line"
                );
                None
            }
        })
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(phase: Phase, id: &str, reason: &str) -> FailureRecord {
        FailureRecord {
            target: FetchTarget::new(phase, id).with_params([("currentPage", "3")]),
            reason: reason.into(),
            first_seen: Utc::now(),
            attempt_count: 5,
        }
    }

    #[tokio::test]
    async fn entries_survive_a_new_ledger_instance() {
        let dir = tempfile::tempdir().unwrap();
        let first = FailureLedger::new(dir.path());
        first
            .append(&record(Phase::Listing, "page:3", "HTTP status 403"))
            .await
            .unwrap();
        drop(first);

        let reopened = FailureLedger::new(dir.path());
        let entries = reopened.read_all(Phase::Listing).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target.param("currentPage"), Some("3"));
        assert!(reopened.read_all(Phase::Detail).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_kept_in_the_log_and_collapsed_in_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::new(dir.path());
        ledger
            .append(&record(Phase::Detail, "https://a", "timeout"))
            .await
            .unwrap();
        ledger
            .append(&record(Phase::Detail, "https://b", "HTTP status 500"))
            .await
            .unwrap();
        ledger
            .append(&record(Phase::Detail, "https://a", "HTTP status 502"))
            .await
            .unwrap();

        assert_eq!(ledger.read_all(Phase::Detail).await.unwrap().len(), 3);

        let snapshot = ledger.latest_snapshot(Phase::Detail).await.unwrap();
        let ids: Vec<_> = snapshot.iter().map(|r| r.target.identifier()).collect();
        assert_eq!(ids, vec!["https://a", "https://b"]);
        assert_eq!(snapshot[0].reason, "HTTP status 502");
    }

    #[tokio::test]
    async fn torn_last_line_is_skipped_and_does_not_swallow_the_next_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::new(dir.path());
        ledger
            .append(&record(Phase::Attachment, "https://x", "timeout"))
            .await
            .unwrap();

        // Simulate a crash mid-append.
        let path = ledger.path(Phase::Attachment);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(br#"{"phase":"attachment","identi"#);
        std::fs::write(&path, raw).unwrap();

        ledger
            .append(&record(Phase::Attachment, "https://y", "timeout"))
            .await
            .unwrap();

        let ids: Vec<_> = ledger
            .read_all(Phase::Attachment)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.target.identifier().to_string())
            .collect();
        assert_eq!(ids, vec!["https://x", "https://y"]);
    }

    #[tokio::test]
    async fn concurrent_appends_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let ledger = ledger.clone();
            tasks.spawn(async move {
                ledger
                    .append(&record(Phase::Listing, &format!("page:{i}"), "timeout"))
                    .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(ledger.read_all(Phase::Listing).await.unwrap().len(), 32);
    }
}
