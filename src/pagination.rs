//! Listing pagination state machine
//!
//! ```text
//! DiscoverTotal ──► FetchPage(1) ──► FetchPage(n + 1) ──► … ──► Done
//!        │                 │
//!        └─ count 0 ──► Done└─ empty page / past total / cancelled ──► Done
//! ```
//!
//! With a known total, a page that terminally failed (already in the ledger)
//! or could not be parsed is skipped and the walk continues; the first empty
//! page ends it. Without a total (no count endpoint, or the count query failed)
//! failed and empty pages both count as empty observations and two in a row
//! end the walk.
//!
//! While page `n` is handed to the sink, page `n + 1` is already being fetched
//! when the total says it exists. Pages still reach the sink strictly in order
//! and a page's records are all accepted before the next page is looked at.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::executor::{EmptyReason, FetchExecutor, FetchOutcome};
use crate::source::ListingSource;
use crate::types::{FetchTarget, Record};

/// Downstream consumer of listing pages
#[async_trait]
pub trait PageSink: Send {
    /// Take every record of `page`; returning `Err` aborts the walk
    async fn accept(&mut self, page: &FetchTarget, records: Vec<Record>) -> Result<()>;
}

/// Why a walk ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The count query reported zero records
    NoData,
    /// Every page up to the discovered total was visited
    Exhausted,
    /// End of data observed as empty pages
    EmptyPage,
    /// The unknown-total page cap was reached
    PageCap,
    /// Shutdown requested
    Cancelled,
}

/// Outcome of one walk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaginationReport {
    /// Discovered page count, `None` when walking until empty
    pub total_pages: Option<u32>,
    /// Pages fetched and parsed
    pub pages_fetched: u32,
    /// Pages that terminally failed (recorded in the ledger)
    pub pages_failed: u32,
    /// Pages fetched but not parseable
    pub pages_unparsable: u32,
    /// Records handed to the sink
    pub records_emitted: usize,
    /// Rows dropped by the extractor
    pub rows_rejected: usize,
    /// Why the walk ended
    pub stop: Option<StopReason>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    DiscoverTotal,
    FetchPage { page: u32, empty_streak: u32 },
    Done(StopReason),
}

/// What one page turned out to be
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// The page carried rows (possibly all rejected)
    Data,
    /// Fetched and empty, or an accepted "no more data" status
    Empty,
    /// Terminal fetch failure or unparsable body
    Failed,
}

type PendingPage = (u32, JoinHandle<Result<FetchOutcome>>);

/// Walks one listing from the first page to the end of data
pub struct PaginationDriver {
    executor: FetchExecutor,
    source: Arc<dyn ListingSource>,
    page_size: u32,
    max_unknown_pages: u32,
    cancel: CancellationToken,
}

impl PaginationDriver {
    /// Create a driver over `source` using the listing phase's executor
    pub fn new(
        executor: FetchExecutor,
        source: Arc<dyn ListingSource>,
        page_size: u32,
        max_unknown_pages: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            source,
            page_size,
            max_unknown_pages,
            cancel,
        }
    }

    /// Walk the listing, handing every page to `sink`
    ///
    /// # Errors
    ///
    /// Ledger failures and sink errors end the walk; fetch and parse failures
    /// never do.
    pub async fn run(&self, sink: &mut dyn PageSink) -> Result<PaginationReport> {
        let mut report = PaginationReport::default();
        let mut ahead: Option<PendingPage> = None;
        let mut state = if self.cancel.is_cancelled() {
            State::Done(StopReason::Cancelled)
        } else {
            State::DiscoverTotal
        };

        loop {
            state = match state {
                State::DiscoverTotal => {
                    report.total_pages = self.discover_total().await?;
                    match report.total_pages {
                        Some(0) => State::Done(StopReason::NoData),
                        _ => State::FetchPage {
                            page: 1,
                            empty_streak: 0,
                        },
                    }
                }
                State::FetchPage { page, empty_streak } => {
                    self.step(page, empty_streak, &mut ahead, &mut report, sink)
                        .await?
                }
                State::Done(reason) => {
                    if let Some((page, handle)) = ahead.take() {
                        tracing::debug!(page, "dropping request-ahead past end of data");
                        handle.abort();
                    }
                    tracing::info!(
                        reason = ?reason,
                        total_pages = ?report.total_pages,
                        pages = report.pages_fetched,
                        failed_pages = report.pages_failed,
                        records = report.records_emitted,
                        "listing walk finished"
                    );
                    report.stop = Some(reason);
                    return Ok(report);
                }
            };
        }
    }

    async fn step(
        &self,
        page: u32,
        empty_streak: u32,
        ahead: &mut Option<PendingPage>,
        report: &mut PaginationReport,
        sink: &mut dyn PageSink,
    ) -> Result<State> {
        let target = self.source.page_target(page);
        let outcome = match ahead.take() {
            Some((ahead_page, handle)) if ahead_page == page => join_fetch(handle).await?,
            stale => {
                if let Some((_, handle)) = stale {
                    handle.abort();
                }
                if self.cancel.is_cancelled() {
                    return Ok(State::Done(StopReason::Cancelled));
                }
                self.executor.execute(&target).await?
            }
        };

        if let Some(total) = report.total_pages
            && page < total
            && !self.cancel.is_cancelled()
        {
            *ahead = Some((page + 1, self.spawn_fetch(page + 1)));
        }

        let kind = self.deliver(&target, outcome, report, sink).await?;
        tracing::debug!(page, total = ?report.total_pages, kind = ?kind, "page done");
        Ok(transition(
            page,
            report.total_pages,
            empty_streak,
            kind,
            self.max_unknown_pages,
        ))
    }

    /// Fetch a single page target outside of a walk and hand it to `sink`
    ///
    /// Used to replay pages recorded in the failure ledger.
    pub async fn replay(
        &self,
        target: &FetchTarget,
        report: &mut PaginationReport,
        sink: &mut dyn PageSink,
    ) -> Result<PageKind> {
        let outcome = self.executor.execute(target).await?;
        self.deliver(target, outcome, report, sink).await
    }

    async fn deliver(
        &self,
        target: &FetchTarget,
        outcome: FetchOutcome,
        report: &mut PaginationReport,
        sink: &mut dyn PageSink,
    ) -> Result<PageKind> {
        let response = match outcome {
            FetchOutcome::Fetched(response) => response,
            FetchOutcome::Empty(EmptyReason::AcceptedStatus(status)) => {
                tracing::info!(page = target.identifier(), status, "no more data status");
                return Ok(PageKind::Empty);
            }
            FetchOutcome::Empty(_) => {
                report.pages_failed += 1;
                return Ok(PageKind::Failed);
            }
        };

        let parsed = match self.source.parse_page(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(page = target.identifier(), error = %e, "unparsable page skipped");
                report.pages_unparsable += 1;
                return Ok(PageKind::Failed);
            }
        };
        report.pages_fetched += 1;

        if parsed.is_empty() {
            return Ok(PageKind::Empty);
        }
        for rejected in &parsed.rejected {
            tracing::warn!(page = target.identifier(), error = %rejected, "row dropped");
        }
        report.rows_rejected += parsed.rejected.len();
        report.records_emitted += parsed.records.len();
        sink.accept(target, parsed.records).await?;
        Ok(PageKind::Data)
    }

    async fn discover_total(&self) -> Result<Option<u32>> {
        let Some(target) = self.source.count_target() else {
            tracing::info!("no count endpoint, walking until pages run dry");
            return Ok(None);
        };
        match self.executor.execute(&target).await? {
            FetchOutcome::Fetched(response) => match self.source.parse_count(&response.body) {
                Ok(count) => {
                    let pages = total_pages(count, self.page_size);
                    tracing::info!(count, page_size = self.page_size, pages, "total discovered");
                    Ok(Some(pages))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "count unreadable, walking until pages run dry");
                    Ok(None)
                }
            },
            FetchOutcome::Empty(reason) => {
                tracing::warn!(reason = ?reason, "count unavailable, walking until pages run dry");
                Ok(None)
            }
        }
    }

    fn spawn_fetch(&self, page: u32) -> JoinHandle<Result<FetchOutcome>> {
        let executor = self.executor.clone();
        let target = self.source.page_target(page);
        tokio::spawn(async move { executor.execute(&target).await })
    }
}

async fn join_fetch(handle: JoinHandle<Result<FetchOutcome>>) -> Result<FetchOutcome> {
    handle
        .await
        .map_err(|e| Error::Other(format!("page fetch task failed: {e}")))?
}

/// `ceil(count / page_size)`
pub fn total_pages(count: u64, page_size: u32) -> u32 {
    let page_size = u64::from(page_size.max(1));
    u32::try_from(count.div_ceil(page_size)).unwrap_or(u32::MAX)
}

fn transition(
    page: u32,
    total: Option<u32>,
    empty_streak: u32,
    kind: PageKind,
    max_unknown_pages: u32,
) -> State {
    match total {
        Some(_) if kind == PageKind::Empty => State::Done(StopReason::EmptyPage),
        Some(total) if page >= total => State::Done(StopReason::Exhausted),
        Some(_) => State::FetchPage {
            page: page + 1,
            empty_streak: 0,
        },
        None => {
            let streak = if kind == PageKind::Data {
                0
            } else {
                empty_streak + 1
            };
            if streak >= 2 {
                State::Done(StopReason::EmptyPage)
            } else if page >= max_unknown_pages {
                State::Done(StopReason::PageCap)
            } else {
                State::FetchPage {
                    page: page + 1,
                    empty_streak: streak,
                }
            }
        }
    }
}
