//! One logical fetch wrapped in the retry policy
//!
//! The [`FetchExecutor`] is built once per phase and shared by that phase's
//! workers. For every attempt it obtains a fresh identity, runs the transport
//! under a per-attempt timeout, asks the [`RetryPolicy`] what to do and sleeps
//! between attempts (never before the first). A target that exhausts its budget
//! is written to the [`FailureLedger`] exactly once and reported as an empty
//! outcome so that callers keep making progress.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, FetchError, Result};
use crate::identity::{IdentitySource, acquire_identity};
use crate::ledger::{FailureLedger, FailureRecord};
use crate::retry::{Decision, RetryPolicy};
use crate::types::{Attempt, AttemptOutcome, FetchResponse, FetchTarget, Identity};

/// Transport capability: one round trip for one target with one identity
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request; non-2xx statuses may be returned as `Ok`
    async fn fetch(
        &self,
        target: &FetchTarget,
        identity: &Identity,
    ) -> std::result::Result<FetchResponse, FetchError>;
}

/// Why a fetch produced no body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmptyReason {
    /// The upstream answered with a whitelisted "no more data" status
    AcceptedStatus(u16),
    /// Retry budget exhausted; a ledger entry was written
    GaveUp {
        /// Attempts made
        attempts: u32,
    },
    /// Shutdown interrupted the retries; a ledger entry was written
    Cancelled,
}

/// Result of [`FetchExecutor::execute`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A 2xx response
    Fetched(FetchResponse),
    /// Empty-success sentinel
    Empty(EmptyReason),
}

impl FetchOutcome {
    /// The response, if one was fetched
    pub fn into_response(self) -> Option<FetchResponse> {
        match self {
            FetchOutcome::Fetched(resp) => Some(resp),
            FetchOutcome::Empty(_) => None,
        }
    }

    /// Whether this outcome came from a recorded terminal failure
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Empty(EmptyReason::GaveUp { .. } | EmptyReason::Cancelled)
        )
    }
}

/// Retrying executor of one phase
#[derive(Clone)]
pub struct FetchExecutor {
    fetcher: Arc<dyn Fetcher>,
    identities: Arc<dyn IdentitySource>,
    ledger: Arc<FailureLedger>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    identity_attempts: u32,
    identity_delay: Duration,
    cancel: CancellationToken,
}

impl FetchExecutor {
    /// Create an executor for one phase
    pub fn new(
        retry: &RetryConfig,
        fetcher: Arc<dyn Fetcher>,
        identities: Arc<dyn IdentitySource>,
        ledger: Arc<FailureLedger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            identities,
            ledger,
            policy: RetryPolicy::from_config(retry),
            attempt_timeout: retry.attempt_timeout,
            identity_attempts: retry.identity_attempts,
            identity_delay: retry.identity_delay,
            cancel,
        }
    }

    /// The retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `target` until it succeeds, is accepted as empty, or gives up
    ///
    /// # Errors
    ///
    /// Only a failure to write the ledger entry is returned as an error.
    pub async fn execute(&self, target: &FetchTarget) -> Result<FetchOutcome> {
        let first_seen = Utc::now();
        let mut attempt_number = 0u32;
        let mut last_failure = String::from("not attempted");

        loop {
            if self.cancel.is_cancelled() {
                return self
                    .record_cancelled(target, first_seen, attempt_number, &last_failure)
                    .await;
            }
            attempt_number += 1;

            let result = match acquire_identity(
                self.identities.as_ref(),
                self.identity_attempts,
                self.identity_delay,
                &self.cancel,
            )
            .await
            {
                Ok(identity) => self.attempt(target, &identity).await,
                Err(Error::ShuttingDown) => {
                    return self
                        .record_cancelled(target, first_seen, attempt_number - 1, &last_failure)
                        .await;
                }
                Err(e) => Err(FetchError::Identity(e.to_string())),
            };

            let attempt = Attempt {
                target,
                attempt_number,
                outcome: AttemptOutcome::from_result(result),
            };
            log_attempt(&attempt);

            match self.policy.decide(attempt_number, &attempt.outcome) {
                Decision::Accept => {
                    return Ok(match attempt.outcome {
                        AttemptOutcome::Success(resp) => FetchOutcome::Fetched(resp),
                        AttemptOutcome::TransientFailure(err) => FetchOutcome::Empty(
                            EmptyReason::AcceptedStatus(err.status().unwrap_or_default()),
                        ),
                    });
                }
                Decision::GiveUp => {
                    let reason = failure_reason(&attempt.outcome);
                    self.ledger
                        .append(&FailureRecord {
                            target: target.clone(),
                            reason,
                            first_seen,
                            attempt_count: attempt_number,
                        })
                        .await?;
                    return Ok(FetchOutcome::Empty(EmptyReason::GaveUp {
                        attempts: attempt_number,
                    }));
                }
                Decision::Retry => {
                    last_failure = failure_reason(&attempt.outcome);
                    let delay = self.policy.delay_after(attempt_number);
                    tracing::debug!(
                        phase = %target.phase(),
                        target_id = target.identifier(),
                        attempt = attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before next attempt"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return self
                                .record_cancelled(target, first_seen, attempt_number, &last_failure)
                                .await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        target: &FetchTarget,
        identity: &Identity,
    ) -> std::result::Result<FetchResponse, FetchError> {
        match tokio::time::timeout(self.attempt_timeout, self.fetcher.fetch(target, identity)).await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    async fn record_cancelled(
        &self,
        target: &FetchTarget,
        first_seen: chrono::DateTime<Utc>,
        attempts: u32,
        last_failure: &str,
    ) -> Result<FetchOutcome> {
        self.ledger
            .append(&FailureRecord {
                target: target.clone(),
                reason: format!("cancelled during retries ({last_failure})"),
                first_seen,
                attempt_count: attempts,
            })
            .await?;
        Ok(FetchOutcome::Empty(EmptyReason::Cancelled))
    }
}

fn failure_reason(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Success(resp) => format!("HTTP status {}", resp.status),
        AttemptOutcome::TransientFailure(err) => err.to_string(),
    }
}

fn log_attempt(attempt: &Attempt<'_>) {
    let phase = attempt.target.phase();
    let target_id = attempt.target.identifier();
    match &attempt.outcome {
        AttemptOutcome::Success(resp) => tracing::debug!(
            phase = %phase,
            target_id,
            attempt = attempt.attempt_number,
            status = resp.status,
            bytes = resp.body.len(),
            "fetch succeeded"
        ),
        AttemptOutcome::TransientFailure(err) => tracing::warn!(
            phase = %phase,
            target_id,
            attempt = attempt.attempt_number,
            kind = err.kind(),
            error = %err,
            "fetch attempt failed"
        ),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RotatingIdentity;
    use crate::types::Phase;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Plays back scripted results; repeats the last one when exhausted
    struct ScriptedFetcher {
        script: Mutex<VecDeque<std::result::Result<FetchResponse, FetchError>>>,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<std::result::Result<FetchResponse, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _target: &FetchTarget,
            _identity: &Identity,
        ) -> std::result::Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    fn retry_config(max_attempts: u32, delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(delay_ms),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: false,
            attempt_timeout: Duration::from_secs(5),
            accept_statuses: vec![],
            identity_attempts: 3,
            identity_delay: Duration::from_millis(1),
        }
    }

    fn executor(
        retry: &RetryConfig,
        fetcher: Arc<ScriptedFetcher>,
        ledger: Arc<FailureLedger>,
        cancel: CancellationToken,
    ) -> FetchExecutor {
        FetchExecutor::new(
            retry,
            fetcher,
            Arc::new(RotatingIdentity::new(None, vec!["ua".into()])),
            ledger,
            cancel,
        )
    }

    #[tokio::test]
    async fn five_failures_write_exactly_one_ledger_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchResponse::new(403, ""))]));
        let exec = executor(
            &retry_config(5, 1),
            fetcher.clone(),
            ledger.clone(),
            CancellationToken::new(),
        );

        let target = FetchTarget::new(Phase::Listing, "page:7");
        let outcome = exec.execute(&target).await.unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Empty(EmptyReason::GaveUp { attempts: 5 })
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5, "no sixth attempt");
        let entries = ledger.read_all(Phase::Listing).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 5);
        assert_eq!(entries[0].reason, "HTTP status 403");
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Err(FetchError::Connection("reset".into())),
            Ok(FetchResponse::new(502, "")),
            Ok(FetchResponse::new(200, "payload")),
        ]));
        let exec = executor(
            &retry_config(5, 1),
            fetcher.clone(),
            ledger.clone(),
            CancellationToken::new(),
        );

        let outcome = exec
            .execute(&FetchTarget::new(Phase::Detail, "https://d/1"))
            .await
            .unwrap();
        assert_eq!(
            outcome.into_response().unwrap().body,
            b"payload".to_vec()
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert!(ledger.read_all(Phase::Detail).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn whitelisted_status_is_empty_without_retry_or_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchResponse::new(404, ""))]));
        let mut retry = retry_config(5, 1);
        retry.accept_statuses = vec![404];
        let exec = executor(&retry, fetcher.clone(), ledger.clone(), CancellationToken::new());

        let outcome = exec
            .execute(&FetchTarget::new(Phase::Listing, "page:9"))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Empty(EmptyReason::AcceptedStatus(404)));
        assert!(!outcome.is_terminal_failure());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(ledger.read_all(Phase::Listing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delay_only_between_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchResponse::new(500, ""))]));
        let exec = executor(
            &retry_config(3, 100),
            fetcher.clone(),
            ledger,
            CancellationToken::new(),
        );

        let start = Instant::now();
        exec.execute(&FetchTarget::new(Phase::Detail, "https://d/2"))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        let times = fetcher.call_times.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        assert!(
            times[0].duration_since(start) < Duration::from_millis(80),
            "first attempt must not be delayed"
        );
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
        // Two gaps, no trailing sleep after the last attempt.
        assert!(elapsed < Duration::from_millis(300), "waited {elapsed:?}");
    }

    #[tokio::test]
    async fn slow_attempt_counts_as_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let mut fetcher = ScriptedFetcher::new(vec![Ok(FetchResponse::new(200, "late"))]);
        fetcher.delay = Some(Duration::from_millis(200));
        let fetcher = Arc::new(fetcher);
        let mut retry = retry_config(2, 1);
        retry.attempt_timeout = Duration::from_millis(20);
        let exec = executor(&retry, fetcher.clone(), ledger.clone(), CancellationToken::new());

        let outcome = exec
            .execute(&FetchTarget::new(Phase::Attachment, "https://f/1"))
            .await
            .unwrap();
        assert!(outcome.is_terminal_failure());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        let entries = ledger.read_all(Phase::Attachment).await.unwrap();
        assert_eq!(entries[0].reason, "attempt timed out");
    }

    #[tokio::test]
    async fn cancellation_during_backoff_records_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchResponse::new(503, ""))]));
        let cancel = CancellationToken::new();
        let exec = executor(
            &retry_config(5, 10_000),
            fetcher.clone(),
            ledger.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move {
            exec.execute(&FetchTarget::new(Phase::Detail, "https://d/3"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, FetchOutcome::Empty(EmptyReason::Cancelled));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let entries = ledger.read_all(Phase::Detail).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].reason.starts_with("cancelled"));
    }

    #[tokio::test]
    async fn identity_exhaustion_consumes_fetch_attempts() {
        struct NoIdentity;

        #[async_trait]
        impl IdentitySource for NoIdentity {
            async fn acquire(&self) -> Result<Identity> {
                Err(Error::Identity("proxy pool empty".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchResponse::new(200, ""))]));
        let exec = FetchExecutor::new(
            &retry_config(2, 1),
            fetcher.clone(),
            Arc::new(NoIdentity),
            ledger.clone(),
            CancellationToken::new(),
        );

        let outcome = exec
            .execute(&FetchTarget::new(Phase::Listing, "page:1"))
            .await
            .unwrap();
        assert!(outcome.is_terminal_failure());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0, "transport never reached");
        let entries = ledger.read_all(Phase::Listing).await.unwrap();
        assert!(entries[0].reason.contains("identity unavailable"));
    }
}
