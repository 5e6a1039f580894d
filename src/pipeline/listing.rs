//! Listing phase: paged walk into per-day `Contracts` sheets

use async_trait::async_trait;
use std::sync::Arc;

use super::{Harvester, LISTING_SHEET, PhaseSummary, persist};
use crate::error::Result;
use crate::ledger::FailureLedger;
use crate::pagination::{PageSink, PaginationDriver, PaginationReport};
use crate::partition::RecordPartitioner;
use crate::store::{TabularStore, TabularTarget};
use crate::types::{FetchTarget, Phase, Record};

/// Routes every page's records to their day workbook
pub(super) struct StoreSink {
    partitioner: RecordPartitioner,
    store: Arc<TabularStore>,
    ledger: Arc<FailureLedger>,
    summary: PhaseSummary,
}

impl StoreSink {
    pub(super) fn new(
        partitioner: RecordPartitioner,
        store: Arc<TabularStore>,
        ledger: Arc<FailureLedger>,
        phase: Phase,
    ) -> Self {
        Self {
            partitioner,
            store,
            ledger,
            summary: PhaseSummary::new(phase),
        }
    }

    pub(super) fn into_summary(self) -> PhaseSummary {
        self.summary
    }
}

#[async_trait]
impl PageSink for StoreSink {
    async fn accept(&mut self, page: &FetchTarget, records: Vec<Record>) -> Result<()> {
        for (sheet, rows) in group_by_sheet(&self.partitioner, records, &mut self.summary) {
            persist(&self.store, &self.ledger, page, &sheet, &rows, &mut self.summary).await?;
        }
        Ok(())
    }
}

/// Split records by destination sheet, keeping first-seen order
///
/// Records that cannot be routed are dropped and counted by reason.
pub(super) fn group_by_sheet(
    partitioner: &RecordPartitioner,
    records: Vec<Record>,
    summary: &mut PhaseSummary,
) -> Vec<(TabularTarget, Vec<Record>)> {
    let mut groups: Vec<(TabularTarget, Vec<Record>)> = Vec::new();
    for record in records {
        match partitioner.route(&record) {
            Ok((_, sheet)) => match groups.iter_mut().find(|(existing, _)| *existing == sheet) {
                Some((_, rows)) => rows.push(record),
                None => groups.push((sheet, vec![record])),
            },
            Err(e) => {
                tracing::warn!(error = %e, reason = e.reason(), "listing record dropped");
                summary.record_drop(e.reason());
            }
        }
    }
    groups
}

impl Harvester {
    fn listing_driver(&self) -> PaginationDriver {
        PaginationDriver::new(
            self.executor(Phase::Listing),
            Arc::clone(&self.listing),
            self.config.page_size,
            self.config.max_unknown_pages,
            self.cancel.clone(),
        )
    }

    fn listing_sink(&self) -> Result<StoreSink> {
        let range = self.config.listing.date_range(Phase::Listing)?;
        let partitioner = RecordPartitioner::new(
            self.config.output.listing_dir.clone(),
            LISTING_SHEET,
            self.listing.date_field(),
        )
        .with_range(range);
        Ok(StoreSink::new(
            partitioner,
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            Phase::Listing,
        ))
    }

    pub(super) async fn run_listing(&self) -> Result<PhaseSummary> {
        let mut sink = self.listing_sink()?;
        let report = self.listing_driver().run(&mut sink).await?;
        let mut summary = sink.into_summary();
        summary.absorb_walk(&report);
        Ok(summary)
    }

    /// Replay individual pages; the count query is rediscovered by a full run
    pub(super) async fn replay_listing(&self, targets: Vec<FetchTarget>) -> Result<PhaseSummary> {
        let driver = self.listing_driver();
        let mut sink = self.listing_sink()?;
        let mut report = PaginationReport::default();
        let mut not_started = 0;

        for target in targets {
            if !self.listing.is_page_target(&target) {
                tracing::info!(target_id = target.identifier(), "count query not replayed");
                continue;
            }
            if self.cancel.is_cancelled() {
                not_started += 1;
                continue;
            }
            let kind = driver.replay(&target, &mut report, &mut sink).await?;
            tracing::debug!(target_id = target.identifier(), kind = ?kind, "page replayed");
        }

        let mut summary = sink.into_summary();
        summary.absorb_walk(&report);
        summary.not_started += not_started;
        Ok(summary)
    }
}
