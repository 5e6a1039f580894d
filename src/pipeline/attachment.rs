//! Attachment phase: download files referenced by stored detail rows

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{DETAIL_SHEET, Harvester, PhaseSummary};
use crate::error::Result;
use crate::executor::{EmptyReason, FetchExecutor, FetchOutcome};
use crate::ledger::FailureRecord;
use crate::partition::{PartitionKey, RecordPartitioner, workbooks_in_range};
use crate::store::TabularTarget;
use crate::types::{AttachmentDescriptor, FetchTarget, Phase, Record};

impl Harvester {
    pub(super) async fn run_attachment(&self) -> Result<PhaseSummary> {
        let (descriptors, mut summary) = self.attachment_descriptors().await?;
        summary.merge(self.download_attachments(descriptors).await?);
        Ok(summary)
    }

    /// Descriptors of detail rows announced within the attachment range
    ///
    /// Rows that repeat a destination (the same contract stored twice) are
    /// collapsed so each file is downloaded once.
    async fn attachment_descriptors(&self) -> Result<(Vec<AttachmentDescriptor>, PhaseSummary)> {
        let range = self.config.attachment.date_range(Phase::Attachment)?;
        let partitioner = RecordPartitioner::new(
            self.config.output.detail_dir.clone(),
            DETAIL_SHEET,
            self.detail.date_field(),
        )
        .with_range(range);

        let mut summary = PhaseSummary::new(Phase::Attachment);
        let mut destinations = HashSet::new();
        let mut descriptors = Vec::new();
        for (_, workbook) in workbooks_in_range(&self.config.output.detail_dir, range)? {
            let rows = self
                .store
                .read(&TabularTarget::new(workbook, DETAIL_SHEET))
                .await?;
            for row in &rows {
                let Some(key) = attachment_key(&partitioner, row, &mut summary) else {
                    continue;
                };
                for descriptor in self.detail.attachments(row, &key.period()) {
                    if destinations.insert((descriptor.period.clone(), descriptor.file_name.clone())) {
                        descriptors.push(descriptor);
                    }
                }
            }
        }
        tracing::info!(attachments = descriptors.len(), "attachments collected");
        Ok((descriptors, summary))
    }

    pub(super) async fn replay_attachments(&self, targets: Vec<FetchTarget>) -> Result<PhaseSummary> {
        let mut summary = PhaseSummary::new(Phase::Attachment);
        let mut descriptors = Vec::with_capacity(targets.len());
        for target in &targets {
            match AttachmentDescriptor::from_target(target) {
                Some(descriptor) => descriptors.push(descriptor),
                None => {
                    tracing::warn!(target_id = target.identifier(), "ledger entry has no destination");
                    summary.record_drop("no_destination");
                }
            }
        }
        summary.merge(self.download_attachments(descriptors).await?);
        Ok(summary)
    }

    async fn download_attachments(&self, descriptors: Vec<AttachmentDescriptor>) -> Result<PhaseSummary> {
        let executor = self.executor(Phase::Attachment);
        let concurrency = self.config.attachment.concurrency;

        let results: Vec<Result<PhaseSummary>> = stream::iter(descriptors)
            .map(|descriptor| self.download_attachment(&executor, descriptor))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = PhaseSummary::new(Phase::Attachment);
        for result in results {
            summary.merge(result?);
        }
        Ok(summary)
    }

    async fn download_attachment(
        &self,
        executor: &FetchExecutor,
        descriptor: AttachmentDescriptor,
    ) -> Result<PhaseSummary> {
        let mut tally = PhaseSummary::new(Phase::Attachment);
        let destination = attachment_path(&self.config.output.attachment_dir, &descriptor);
        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            tracing::debug!(path = %destination.display(), "attachment already present");
            tally.skipped_existing = 1;
            return Ok(tally);
        }
        if self.cancel.is_cancelled() {
            tally.not_started = 1;
            return Ok(tally);
        }
        tally.targets = 1;

        let target = descriptor.to_target();
        let response = match executor.execute(&target).await? {
            FetchOutcome::Fetched(response) => response,
            FetchOutcome::Empty(EmptyReason::AcceptedStatus(status)) => {
                tracing::info!(target_id = target.identifier(), status, "attachment has no content");
                tally.record_drop("no_content");
                return Ok(tally);
            }
            FetchOutcome::Empty(_) => {
                tally.terminal_failures = 1;
                return Ok(tally);
            }
        };

        match write_file(&destination, &response.body).await {
            Ok(()) => {
                tracing::debug!(path = %destination.display(), bytes = response.body.len(), "attachment saved");
                tally.files_written = 1;
            }
            Err(e) => {
                tracing::error!(path = %destination.display(), error = %e, "could not save attachment");
                tally.store_errors = 1;
                self.ledger
                    .append(&FailureRecord {
                        target,
                        reason: format!("write error: {e}"),
                        first_seen: Utc::now(),
                        attempt_count: 1,
                    })
                    .await?;
            }
        }
        Ok(tally)
    }
}

/// Partition key of a detail row, or a logged and counted drop
fn attachment_key(
    partitioner: &RecordPartitioner,
    row: &Record,
    summary: &mut PhaseSummary,
) -> Option<PartitionKey> {
    match partitioner.key(row) {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!(error = %e, reason = e.reason(), "detail row skipped for attachments");
            summary.record_drop(e.reason());
            None
        }
    }
}

/// `<root>/<period>/<file name>`
pub(super) fn attachment_path(root: &Path, descriptor: &AttachmentDescriptor) -> PathBuf {
    root.join(&descriptor.period).join(&descriptor.file_name)
}

/// Write through a `.part` file and rename, so a present file is always whole
async fn write_file(destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = destination.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let written = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, destination).await
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    written
}
