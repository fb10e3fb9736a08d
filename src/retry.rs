//! Retry/backoff policy wrapped around outbound submissions.
//!
//! The policy is stateless across calls: every invocation starts at attempt
//! one, and the caller builds a fresh transaction for every attempt so an
//! outcome can never be credited to an earlier try.

use std::{future::Future, time::Duration};

use bitflags::bitflags;
use tokio::time::sleep;
use tracing::debug;

bitflags! {
    /// Failure kinds a policy may retry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RetryableFailures: u8 {
        /// The gateway answered with a busy negative acknowledgement.
        const GATEWAY_BUSY = 1 << 0;
        /// No acknowledgement arrived within its timeout.
        const NO_ACKNOWLEDGEMENT = 1 << 1;
        /// No action validation arrived within its timeout.
        const NO_ACTION = 1 << 2;
    }
}

/// Per-gateway retry knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Upper bound on attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Double the delay after every failed attempt.
    pub exponential: bool,
    /// Which failure kinds are worth another attempt.
    pub retryable: RetryableFailures,
}

impl Default for RetryOptions {
    /// Three attempts, 100 ms constant delay, retrying busy gateways and
    /// missing acknowledgements or action validations.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            exponential: false,
            retryable: RetryableFailures::all(),
        }
    }
}

impl RetryOptions {
    /// Delay before the attempt following failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.delay.saturating_mul(factor)
        } else {
            self.delay
        }
    }
}

/// Run `attempt` under the policy.
///
/// `classify` maps an error to the retryable kind it represents, if any;
/// other errors surface immediately. With `single_shot` (the
/// `DisallowRetransmissions` transmission option) exactly one attempt runs.
///
/// # Errors
/// The last attempt's error once the policy gives up.
pub async fn execute<T, E, F, Fut>(
    options: &RetryOptions,
    single_shot: bool,
    classify: impl Fn(&E) -> Option<RetryableFailures>,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let budget = if single_shot { 1 } else { options.max_attempts.max(1) };
    let mut tried = 0;
    loop {
        tried += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let worth_retry = classify(&err)
                    .is_some_and(|kind| options.retryable.contains(kind));
                if !worth_retry || tried >= budget {
                    return Err(err);
                }
                let pause = options.backoff(tried);
                debug!(attempt = tried, delay_ms = pause.as_millis() as u64, "retrying send");
                sleep(pause).await;
            }
        }
    }
}
