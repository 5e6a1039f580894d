//! Idempotent append-only tabular storage
//!
//! A [`TabularTarget`] is a sheet inside a workbook directory, stored as
//! `<workbook>/<sheet>.csv`. [`TabularStore::append`] guarantees:
//! - the header row is written exactly once per sheet, however many times the
//!   process restarts, because "has data" is read from the file every time;
//! - existing rows are never rewritten or truncated once a sheet has data;
//! - a batch is written with a single `write_all` and synced, and a torn last
//!   row left by a crash (including one cut inside a quoted field) is cut back
//!   to the last complete row first;
//! - appends to the same sheet are serialized, appends to different sheets run
//!   in parallel, and a sheet's lock is dropped once nobody uses it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::Record;

/// One sheet of one workbook
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TabularTarget {
    workbook: PathBuf,
    sheet: String,
}

impl TabularTarget {
    /// Sheet `sheet` of the workbook directory `workbook`
    pub fn new(workbook: impl Into<PathBuf>, sheet: impl Into<String>) -> Self {
        Self {
            workbook: workbook.into(),
            sheet: sheet.into(),
        }
    }

    /// Workbook directory
    pub fn workbook(&self) -> &Path {
        &self.workbook
    }

    /// Sheet name
    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    /// File backing the sheet
    pub fn sheet_path(&self) -> PathBuf {
        self.workbook.join(format!("{}.csv", self.sheet))
    }
}

/// What an append did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendReport {
    /// Data rows written
    pub rows_written: usize,
    /// Whether this call wrote the header
    pub header_written: bool,
    /// Columns present in the rows but absent from the existing header
    pub dropped_columns: Vec<String>,
}

/// Writer of every sheet in the process
#[derive(Debug, Default)]
pub struct TabularStore {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TabularStore {
    /// Create a store with no open sheets
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the sheet's lock entry once no other task holds or awaits it
    fn release(&self, path: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    /// Append `rows` to the sheet, creating it with a header if needed
    ///
    /// # Errors
    ///
    /// Any I/O failure is returned as [`Error::Store`] for this target only.
    pub async fn append(&self, target: &TabularTarget, rows: &[Record]) -> Result<AppendReport> {
        if rows.is_empty() {
            return Ok(AppendReport::default());
        }
        let path = target.sheet_path();
        let lock = self.lock_for(&path);
        let result = {
            let _guard = lock.lock().await;
            let rows = rows.to_vec();
            let blocking_path = path.clone();
            tokio::task::spawn_blocking(move || append_blocking(&blocking_path, &rows)).await
        };
        self.release(&path, lock);
        let report = result
            .map_err(|e| Error::Other(format!("store task for {} failed: {e}", path.display())))??;

        if !report.dropped_columns.is_empty() {
            tracing::warn!(
                path = %path.display(),
                columns = ?report.dropped_columns,
                "columns not in existing header were dropped"
            );
        }
        tracing::debug!(
            path = %path.display(),
            rows = report.rows_written,
            header = report.header_written,
            "rows appended"
        );
        Ok(report)
    }

    /// All data rows of a sheet; a missing sheet has none
    pub async fn read(&self, target: &TabularTarget) -> Result<Vec<Record>> {
        let path = target.sheet_path();
        let lock = self.lock_for(&path);
        let result = {
            let _guard = lock.lock().await;
            let blocking_path = path.clone();
            tokio::task::spawn_blocking(move || read_blocking(&blocking_path)).await
        };
        self.release(&path, lock);
        result.map_err(|e| Error::Other(format!("store task for {} failed: {e}", path.display())))?
    }
}

enum SheetState {
    Missing,
    HeaderOnly(Vec<String>),
    HasData(Vec<String>),
}

fn store_err(path: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |source| Error::Store {
        path: path.to_path_buf(),
        source,
    }
}

fn append_blocking(path: &Path, rows: &[Record]) -> Result<AppendReport> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(store_err(path))?;
    }

    match inspect(path)? {
        SheetState::Missing => {
            let header = header_from_rows(&[], rows);
            rewrite(path, &header, rows)?;
            Ok(AppendReport {
                rows_written: rows.len(),
                header_written: true,
                dropped_columns: Vec::new(),
            })
        }
        SheetState::HeaderOnly(existing) => {
            let header = header_from_rows(&existing, rows);
            rewrite(path, &header, rows)?;
            Ok(AppendReport {
                rows_written: rows.len(),
                header_written: true,
                dropped_columns: Vec::new(),
            })
        }
        SheetState::HasData(header) => {
            let dropped = unknown_columns(&header, rows);
            let bytes = encode(None, &header, rows)?;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(store_err(path))?;
            file.write_all(&bytes).map_err(store_err(path))?;
            file.sync_data().map_err(store_err(path))?;
            Ok(AppendReport {
                rows_written: rows.len(),
                header_written: false,
                dropped_columns: dropped,
            })
        }
    }
}

fn inspect(path: &Path) -> Result<SheetState> {
    let mut raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SheetState::Missing),
        Err(e) => return Err(store_err(path)(e)),
    };

    let keep = complete_len(&raw);
    if keep < raw.len() {
        tracing::warn!(
            path = %path.display(),
            discarded_bytes = raw.len() - keep,
            "truncating torn trailing row"
        );
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(store_err(path))?;
        file.set_len(keep as u64).map_err(store_err(path))?;
        file.sync_data().map_err(store_err(path))?;
        raw.truncate(keep);
    }

    if raw.is_empty() {
        return Ok(SheetState::Missing);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_slice());
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut records = reader.records();
    match records.next() {
        None => Ok(SheetState::HeaderOnly(header)),
        Some(first) => {
            first?;
            Ok(SheetState::HasData(header))
        }
    }
}

/// Length of the prefix ending with the last complete row
///
/// A row is complete once its terminating newline is seen outside quotes, so a
/// crash inside a quoted multi-line field is cut back as well.
fn complete_len(raw: &[u8]) -> usize {
    let mut in_quotes = false;
    let mut keep = 0;
    for (i, byte) in raw.iter().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => keep = i + 1,
            _ => {}
        }
    }
    keep
}

fn read_blocking(path: &Path) -> Result<Vec<Record>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(store_err(path)(e)),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_slice());
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        match record {
            Ok(record) => rows.push(
                header
                    .iter()
                    .zip(record.iter())
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                row = idx + 1,
                error = %e,
                "skipping unreadable row"
            ),
        }
    }
    Ok(rows)
}

/// Existing columns first, then new keys in first-seen order
fn header_from_rows(existing: &[String], rows: &[Record]) -> Vec<String> {
    let mut header: Vec<String> = existing.to_vec();
    for row in rows {
        for key in row.keys() {
            if !header.iter().any(|h| h == key) {
                header.push(key.to_string());
            }
        }
    }
    header
}

fn unknown_columns(header: &[String], rows: &[Record]) -> Vec<String> {
    let mut unknown: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !header.iter().any(|h| h == key) && !unknown.iter().any(|u| u == key) {
                unknown.push(key.to_string());
            }
        }
    }
    unknown
}

fn encode(header: Option<&[String]>, columns: &[String], rows: &[Record]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(columns.iter().map(|c| row.get(c).unwrap_or("")))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Csv(e.into_error().into()))
}

/// Replace the sheet with header + rows through a temp file and rename
fn rewrite(path: &Path, header: &[String], rows: &[Record]) -> Result<()> {
    let bytes = encode(Some(header), header, rows)?;
    let tmp = path.with_extension("csv.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        std::fs::remove_file(&tmp).ok();
        store_err(path)(e)
    })
}
