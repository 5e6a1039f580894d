//! Retry policy shared by every fetch phase
//!
//! [`decide`] is a pure function of the attempt counter, the attempt ceiling and
//! the outcome. Phases differ only in the [`RetryPolicy`] they are given: the
//! ceiling, the delay schedule and the whitelist of statuses the upstream uses
//! to signal "nothing more here".
//!
//! # Example
//!
//! ```
//! use contract_harvest::retry::{decide, Decision};
//! use contract_harvest::types::AttemptOutcome;
//! use contract_harvest::error::FetchError;
//!
//! let failed = AttemptOutcome::TransientFailure(FetchError::Timeout);
//! assert_eq!(decide(4, 5, &failed, &[]), Decision::Retry);
//! assert_eq!(decide(5, 5, &failed, &[]), Decision::GiveUp);
//! ```

use crate::config::RetryConfig;
use crate::types::AttemptOutcome;
use rand::Rng;
use std::time::Duration;

/// What the executor should do after an attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Try again with a fresh identity after the backoff delay
    Retry,
    /// Budget exhausted; record a terminal failure and move on
    GiveUp,
    /// Done: either a success or a whitelisted terminal status
    Accept,
}

/// Decide the fate of attempt `attempt_number` (1-based, `max_attempts` inclusive)
///
/// - `Accept` on success, or on a failure status listed in `accept_statuses`.
/// - `GiveUp` on any other failure once `attempt_number >= max_attempts`.
/// - `Retry` otherwise.
pub fn decide(
    attempt_number: u32,
    max_attempts: u32,
    outcome: &AttemptOutcome,
    accept_statuses: &[u16],
) -> Decision {
    match outcome {
        AttemptOutcome::Success(_) => Decision::Accept,
        AttemptOutcome::TransientFailure(err)
            if err.status().is_some_and(|s| accept_statuses.contains(&s)) =>
        {
            Decision::Accept
        }
        AttemptOutcome::TransientFailure(_) if attempt_number >= max_attempts => Decision::GiveUp,
        AttemptOutcome::TransientFailure(_) => Decision::Retry,
    }
}

/// Per-phase parameterization of [`decide`] plus the delay schedule
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    accept_statuses: Vec<u16>,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Build the policy of one phase
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            accept_statuses: config.accept_statuses.clone(),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Inclusive attempt ceiling
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply [`decide`] with this phase's ceiling and whitelist
    pub fn decide(&self, attempt_number: u32, outcome: &AttemptOutcome) -> Decision {
        decide(
            attempt_number,
            self.max_attempts,
            outcome,
            &self.accept_statuses,
        )
    }

    /// Delay to wait after failed attempt `attempt_number` before the next one
    ///
    /// Grows by `backoff_multiplier` per retry and is capped at `max_delay`,
    /// jitter included.
    pub fn delay_after(&self, attempt_number: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt_number {
            let next = self.next_delay(delay);
            if next == delay {
                break;
            }
            delay = next;
        }
        if self.jitter {
            add_jitter(delay).min(self.max_delay)
        } else {
            delay
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
