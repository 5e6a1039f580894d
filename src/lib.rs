//! # contract-harvest
//!
//! Resilient fetch-and-persist crawler for a paged public-procurement listing.
//!
//! ## Design Philosophy
//!
//! contract-harvest is designed to be:
//! - **Resumable** - Every phase reads its inputs from disk and skips what is
//!   already there, so a run can be stopped and restarted at any point
//! - **Loss-aware** - A target that exhausts its retries is written to a
//!   durable failure ledger and can be replayed later
//! - **Source-agnostic** - The pipeline never inspects bodies; extraction is a
//!   pluggable capability
//!
//! ## Phases
//!
//! 1. **Listing** walks the paged listing and appends rows to per-day sheets.
//! 2. **Detail** fetches the detail page of every listed record.
//! 3. **Attachment** downloads the files referenced by detail rows.
//!
//! ## Quick Start
//!
//! ```no_run
//! use contract_harvest::{Config, Harvester, Phase, run_with_shutdown};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(std::path::Path::new("harvest.json"))?;
//!     let cancel = CancellationToken::new();
//!     let harvester = Harvester::from_config(config, cancel.clone())?;
//!
//!     let summary = run_with_shutdown(cancel, harvester.run(Phase::Listing)).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Retrying fetch executor
pub mod executor;
/// reqwest transport
pub mod http;
/// Proxy and user-agent supply
pub mod identity;
/// Durable failure ledger
pub mod ledger;
/// Listing pagination
pub mod pagination;
/// Date partitioning of records
pub mod partition;
/// Phase orchestration
pub mod pipeline;
/// Retry policy with exponential backoff
pub mod retry;
/// Extraction capability and the contract publication source
pub mod source;
/// Append-only tabular store
pub mod store;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::{Config, DateRange, PhaseConfig, RetryConfig};
pub use error::{Error, ExtractError, FetchError, PartitionError, Result};
pub use executor::{EmptyReason, FetchExecutor, FetchOutcome, Fetcher};
pub use identity::IdentitySource;
pub use ledger::{FailureLedger, FailureRecord};
pub use pipeline::{Harvester, PhaseSummary, RunSummary};
pub use source::{DetailExtractor, ListingSource};
pub use types::{AttachmentDescriptor, FetchResponse, FetchTarget, Identity, Phase, Record};

use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Drive `work` to completion while cancelling `cancel` on a termination signal.
///
/// A signal does not abort `work`: the pipeline observes the token, stops
/// starting new pages and targets, and lets in-flight ones finish and persist.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown<F: Future>(cancel: CancellationToken, work: F) -> F::Output {
    let listener_token = cancel.clone();
    let listener = tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("shutdown requested, finishing in-flight work");
                listener_token.cancel();
            }
            _ = listener_token.cancelled() => {}
        }
    });

    let output = work.await;
    listener.abort();
    output
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
