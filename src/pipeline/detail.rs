//! Detail phase: one fetch per listed contract into per-day `Details` sheets

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;

use super::{DETAIL_SHEET, Harvester, LISTING_SHEET, PhaseSummary, persist};
use crate::error::{Error, Result};
use crate::executor::{EmptyReason, FetchExecutor, FetchOutcome};
use crate::partition::{RecordPartitioner, workbooks_in_range};
use crate::store::TabularTarget;
use crate::types::{FetchTarget, Phase};

impl Harvester {
    pub(super) async fn run_detail(&self) -> Result<PhaseSummary> {
        let links = self.detail_links().await?;
        let targets = links
            .iter()
            .map(|link| self.detail.detail_target(link))
            .collect();
        self.fetch_details(targets).await
    }

    /// Distinct detail links of every listing workbook in the detail range
    async fn detail_links(&self) -> Result<Vec<String>> {
        let range = self.config.detail.date_range(Phase::Detail)?;
        let workbooks = workbooks_in_range(&self.config.output.listing_dir, range)?;
        let link_field = self.listing.link_field();

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for (day, workbook) in &workbooks {
            let rows = self
                .store
                .read(&TabularTarget::new(workbook.clone(), LISTING_SHEET))
                .await?;
            let before = links.len();
            for row in &rows {
                let Some(link) = row.get(link_field).map(str::trim) else {
                    continue;
                };
                if !link.is_empty() && seen.insert(link.to_string()) {
                    links.push(link.to_string());
                }
            }
            tracing::debug!(day = %day, rows = rows.len(), new_links = links.len() - before, "listing workbook read");
        }
        tracing::info!(workbooks = workbooks.len(), links = links.len(), "detail links collected");
        Ok(links)
    }

    /// Fetch, parse and store every target with the phase's worker count
    pub(super) async fn fetch_details(&self, targets: Vec<FetchTarget>) -> Result<PhaseSummary> {
        let executor = self.executor(Phase::Detail);
        let partitioner = RecordPartitioner::new(
            self.config.output.detail_dir.clone(),
            DETAIL_SHEET,
            self.detail.date_field(),
        );
        let concurrency = self.config.detail.concurrency;

        let results: Vec<Result<PhaseSummary>> = stream::iter(targets)
            .map(|target| self.fetch_detail(&executor, &partitioner, target))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = PhaseSummary::new(Phase::Detail);
        for result in results {
            summary.merge(result?);
        }
        Ok(summary)
    }

    async fn fetch_detail(
        &self,
        executor: &FetchExecutor,
        partitioner: &RecordPartitioner,
        target: FetchTarget,
    ) -> Result<PhaseSummary> {
        let mut tally = PhaseSummary::new(Phase::Detail);
        if self.cancel.is_cancelled() {
            tally.not_started = 1;
            return Ok(tally);
        }
        tally.targets = 1;

        let response = match executor.execute(&target).await? {
            FetchOutcome::Fetched(response) => response,
            FetchOutcome::Empty(EmptyReason::AcceptedStatus(status)) => {
                tracing::info!(target_id = target.identifier(), status, "detail page has no content");
                tally.record_drop("no_content");
                return Ok(tally);
            }
            FetchOutcome::Empty(_) => {
                tally.terminal_failures = 1;
                return Ok(tally);
            }
        };

        let extractor = Arc::clone(&self.detail);
        let url = target.identifier().to_string();
        let parsed = tokio::task::spawn_blocking(move || extractor.parse(&url, &response.body))
            .await
            .map_err(|e| Error::Other(format!("detail parser task failed: {e}")))?;
        let record = match parsed {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(target_id = target.identifier(), error = %e, "detail page dropped");
                tally.record_drop(e.reason());
                return Ok(tally);
            }
        };
        tally.records_emitted = 1;

        match partitioner.route(&record) {
            Ok((_, sheet)) => {
                persist(&self.store, &self.ledger, &target, &sheet, &[record], &mut tally).await?;
            }
            Err(e) => {
                tracing::warn!(target_id = target.identifier(), error = %e, "detail record dropped");
                tally.record_drop(e.reason());
            }
        }
        Ok(tally)
    }
}
