//! Per-phase run accounting

use std::collections::BTreeMap;
use std::fmt;

use crate::pagination::PaginationReport;
use crate::types::Phase;

/// Counters of one phase run
///
/// Workers each fill a fresh summary for their target and the phase merges
/// them, so no counter is shared between tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSummary {
    /// Phase these counters belong to
    pub phase: Phase,
    /// Fetch targets attempted (listing: pages)
    pub targets: usize,
    /// Records produced by extraction
    pub records_emitted: usize,
    /// Rows appended to sheets
    pub records_written: usize,
    /// Dropped records and bodies by reason
    pub drops: BTreeMap<String, usize>,
    /// Targets that exhausted their retries (ledger entries written)
    pub terminal_failures: usize,
    /// Targets fetched but not persisted (ledger entries written)
    pub store_errors: usize,
    /// Attachment files downloaded
    pub files_written: usize,
    /// Attachment files already present on disk
    pub skipped_existing: usize,
    /// Targets never started because of shutdown
    pub not_started: usize,
}

impl PhaseSummary {
    /// Empty counters for `phase`
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            targets: 0,
            records_emitted: 0,
            records_written: 0,
            drops: BTreeMap::new(),
            terminal_failures: 0,
            store_errors: 0,
            files_written: 0,
            skipped_existing: 0,
            not_started: 0,
        }
    }

    /// Count one drop under `reason`
    pub fn record_drop(&mut self, reason: &str) {
        self.record_drops(reason, 1);
    }

    /// Count `count` drops under `reason`
    pub fn record_drops(&mut self, reason: &str, count: usize) {
        if count > 0 {
            *self.drops.entry(reason.to_string()).or_default() += count;
        }
    }

    /// Drops across all reasons
    pub fn total_drops(&self) -> usize {
        self.drops.values().sum()
    }

    /// Add another summary's counters to this one
    pub fn merge(&mut self, other: PhaseSummary) {
        self.targets += other.targets;
        self.records_emitted += other.records_emitted;
        self.records_written += other.records_written;
        for (reason, count) in other.drops {
            self.record_drops(&reason, count);
        }
        self.terminal_failures += other.terminal_failures;
        self.store_errors += other.store_errors;
        self.files_written += other.files_written;
        self.skipped_existing += other.skipped_existing;
        self.not_started += other.not_started;
    }

    /// Fold a listing walk into the counters
    pub(crate) fn absorb_walk(&mut self, report: &PaginationReport) {
        let pages = report.pages_fetched + report.pages_failed + report.pages_unparsable;
        self.targets += pages as usize;
        self.records_emitted += report.records_emitted;
        self.terminal_failures += report.pages_failed as usize;
        self.record_drops("unparsable_page", report.pages_unparsable as usize);
        self.record_drops("rejected_row", report.rows_rejected);
    }

    /// Whether anything ended up in the failure ledger
    pub fn is_degraded(&self) -> bool {
        self.terminal_failures > 0 || self.store_errors > 0
    }

    /// Emit the summary as one structured log line
    pub fn log(&self) {
        tracing::info!(
            phase = %self.phase,
            targets = self.targets,
            records = self.records_emitted,
            written = self.records_written,
            dropped = self.total_drops(),
            drops = ?self.drops,
            failed = self.terminal_failures,
            store_errors = self.store_errors,
            files = self.files_written,
            skipped_existing = self.skipped_existing,
            not_started = self.not_started,
            "phase finished"
        );
    }
}

impl fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} targets, {} records, {} written, {} dropped, {} failed, {} store errors",
            self.phase,
            self.targets,
            self.records_emitted,
            self.records_written,
            self.total_drops(),
            self.terminal_failures,
            self.store_errors
        )?;
        if self.phase == Phase::Attachment {
            write!(
                f,
                ", {} files, {} already present",
                self.files_written, self.skipped_existing
            )?;
        }
        if self.not_started > 0 {
            write!(f, ", {} not started", self.not_started)?;
        }
        Ok(())
    }
}

/// Summaries of every phase that ran
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// In execution order
    pub phases: Vec<PhaseSummary>,
}

impl RunSummary {
    /// Whether any phase wrote ledger entries
    pub fn is_degraded(&self) -> bool {
        self.phases.iter().any(PhaseSummary::is_degraded)
    }
}
