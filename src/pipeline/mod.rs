//! Phase orchestration
//!
//! A [`Harvester`] owns everything the three phases share: the transport,
//! the identity supply, the failure ledger, the tabular store and the
//! shutdown token. Each phase lives in its own submodule:
//!
//! - `listing` walks the paged listing into per-day `Contracts` sheets
//! - `detail` fetches every listed contract into per-day `Details` sheets
//! - `attachment` downloads the files referenced by stored detail rows
//!
//! Phases only communicate through the files on disk, so any of them can be
//! run on its own, re-run, or replayed from the failure ledger.

mod attachment;
mod detail;
mod listing;
mod summary;

pub use summary::{PhaseSummary, RunSummary};

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::executor::{FetchExecutor, Fetcher};
use crate::http::HttpFetcher;
use crate::identity::{self, IdentitySource};
use crate::ledger::{FailureLedger, FailureRecord};
use crate::source::{ContractDetail, ContractListing, DetailExtractor, ListingSource};
use crate::store::{TabularStore, TabularTarget};
use crate::types::{FetchTarget, Phase, Record};

/// Sheet holding listing rows inside a day workbook
pub const LISTING_SHEET: &str = "Contracts";

/// Sheet holding detail rows inside a day workbook
pub const DETAIL_SHEET: &str = "Details";

/// The crawler: one configured pipeline over one source
pub struct Harvester {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    identities: Arc<dyn IdentitySource>,
    listing: Arc<dyn ListingSource>,
    detail: Arc<dyn DetailExtractor>,
    ledger: Arc<FailureLedger>,
    store: Arc<TabularStore>,
    cancel: CancellationToken,
}

impl Harvester {
    /// Assemble a pipeline from explicit capabilities
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `config` does not validate; nothing
    /// is fetched in that case.
    pub fn new(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        identities: Arc<dyn IdentitySource>,
        listing: Arc<dyn ListingSource>,
        detail: Arc<dyn DetailExtractor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(FailureLedger::new(config.output.ledger_dir.clone()));
        Ok(Self {
            config,
            fetcher,
            identities,
            listing,
            detail,
            ledger,
            store: Arc::new(TabularStore::new()),
            cancel,
        })
    }

    /// Pipeline for the contract publication site over HTTP
    pub fn from_config(config: Config, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let listing_range = config.listing.date_range(Phase::Listing)?;
        let fetcher = Arc::new(HttpFetcher::new(config.source.referer.clone()));
        let identities = identity::from_config(&config.identity)?;
        let listing = Arc::new(ContractListing::new(&config.source, listing_range));
        let detail = Arc::new(ContractDetail::new(&config.source)?);
        Self::new(config, fetcher, identities, listing, detail, cancel)
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Failure ledger shared by all phases
    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Run one phase over its configured date range
    pub async fn run(&self, phase: Phase) -> Result<PhaseSummary> {
        tracing::info!(phase = %phase, "phase starting");
        let summary = match phase {
            Phase::Listing => self.run_listing().await?,
            Phase::Detail => self.run_detail().await?,
            Phase::Attachment => self.run_attachment().await?,
        };
        summary.log();
        Ok(summary)
    }

    /// Run listing, detail and attachment in order
    ///
    /// Stops between phases once shutdown was requested.
    pub async fn run_all(&self) -> Result<RunSummary> {
        let mut run = RunSummary::default();
        for phase in Phase::ALL {
            if self.cancel.is_cancelled() {
                tracing::info!(phase = %phase, "shutdown requested, phase not started");
                break;
            }
            run.phases.push(self.run(phase).await?);
        }
        Ok(run)
    }

    /// Re-fetch the latest ledger entry of every target that failed in `phase`
    ///
    /// Replayed targets that fail again are appended to the ledger once more,
    /// so the next replay picks up their newest entry.
    pub async fn retry_failed(&self, phase: Phase) -> Result<PhaseSummary> {
        let snapshot = self.ledger.latest_snapshot(phase).await?;
        tracing::info!(phase = %phase, targets = snapshot.len(), "replaying failed targets");
        let targets: Vec<FetchTarget> = snapshot.into_iter().map(|entry| entry.target).collect();

        let summary = match phase {
            Phase::Listing => self.replay_listing(targets).await?,
            Phase::Detail => self.fetch_details(targets).await?,
            Phase::Attachment => self.replay_attachments(targets).await?,
        };
        summary.log();
        Ok(summary)
    }

    fn executor(&self, phase: Phase) -> FetchExecutor {
        FetchExecutor::new(
            &self.config.phase(phase).retry,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.identities),
            Arc::clone(&self.ledger),
            self.cancel.clone(),
        )
    }
}

/// Append `rows` fetched from `source` to `sheet`
///
/// A store failure is not propagated: it is logged, counted, and written to
/// the ledger under `source` so a replay fetches the data again. Only a ledger
/// failure is an error.
async fn persist(
    store: &TabularStore,
    ledger: &FailureLedger,
    source: &FetchTarget,
    sheet: &TabularTarget,
    rows: &[Record],
    summary: &mut PhaseSummary,
) -> Result<()> {
    match store.append(sheet, rows).await {
        Ok(report) => {
            summary.records_written += report.rows_written;
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                target_id = source.identifier(),
                sheet = %sheet.sheet_path().display(),
                rows = rows.len(),
                error = %e,
                "could not persist rows"
            );
            summary.store_errors += 1;
            ledger
                .append(&FailureRecord {
                    target: source.clone(),
                    reason: format!("store error: {e}"),
                    first_seen: Utc::now(),
                    attempt_count: 1,
                })
                .await
        }
    }
}

/// Formatted log output emitted while `f` runs on this thread
#[cfg(test)]
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer
        .0
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
