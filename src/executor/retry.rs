//! Retry policy for provider calls.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::ProviderError;
use crate::graph::ResourceId;

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound for any delay, provider hints included.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from execution settings.
    #[must_use]
    pub const fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// A provider hint wins when it asks for a longer wait, but never past
    /// `max_backoff`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        hint.map_or(computed, |hint| hint.max(computed).min(self.max_backoff))
    }

    /// Whether a failed call stopped before its retries ran out.
    #[must_use]
    pub fn gave_up_early(&self, attempts: u32, error: &ProviderError) -> bool {
        error.is_transient() && attempts <= self.max_retries
    }

    /// Runs `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// Once `halt` turns true no further attempt is made: a pending backoff
    /// is cut short and the last transient error is returned.
    ///
    /// Returns the number of attempts made alongside the final result.
    pub async fn run<T, F, Fut>(
        &self,
        id: &ResourceId,
        halt: &mut watch::Receiver<bool>,
        mut call: F,
    ) -> (u32, Result<T, ProviderError>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return (attempt, Ok(value)),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt - 1, e.retry_after());
                    warn!(
                        resource = %id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient provider failure, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = signalled(halt) => {}
                    }
                    if *halt.borrow() {
                        debug!(resource = %id, attempt, "Run stopped during backoff");
                        return (attempt, Err(e));
                    }
                }
                Err(e) => {
                    debug!(resource = %id, attempt, error = %e, "Giving up on provider call");
                    return (attempt, Err(e));
                }
            }
        }
    }
}

/// Resolves once `flag` turns true; never resolves if the sender goes away.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
