use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::race::{race, sleep_or_cancel, Raced};
use crate::{StorageHandle, TransportClient, TransportError, UploadConfig};

/// Why one resolve attempt did not produce a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Backend answered, but the URL is not published yet
    NotReady,
    /// Backend call failed
    Failed(TransportError),
    /// Backend call did not answer within the attempt budget
    TimedOut(Duration),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => f.write_str("URL not available yet"),
            Self::Failed(err) => write!(f, "{err}"),
            Self::TimedOut(budget) => write!(f, "no answer within {budget:?}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(
        "Public URL still unavailable after {attempts} attempts (last: {}). The file was stored; \
         retry once the storage backend has published it, \
         or check that uploaded objects are publicly readable",
        .failures.last().map(ToString::to_string).unwrap_or_default()
    )]
    Exhausted {
        attempts: u32,
        /// One entry per attempt, in order
        failures: Vec<AttemptFailure>,
    },

    #[error("URL resolution cancelled")]
    Cancelled,
}

/// Bounded, strictly sequential retry loop around
/// [`TransportClient::resolve_url`].
#[derive(Debug, Clone)]
pub struct UrlResolver {
    max_attempts: u32,
    delay: Duration,
    attempt_timeout: Duration,
}

impl UrlResolver {
    /// Attempt budget used when none is configured
    pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            attempt_timeout: Self::DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Bound each `resolve_url` call
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.resolve_max_retries, config.resolve_retry_delay())
            .with_attempt_timeout(config.resolve_attempt_timeout())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Poll until a URL appears or the attempts run out.
    ///
    /// `None`, errors and calls that overrun the attempt budget all count as
    /// a failed attempt. The delay only
    /// separates attempts; there is none before the first or after the last.
    /// `on_attempt(attempt, max_attempts)` runs before each call.
    #[instrument(
        skip(self, transport, cancel, on_attempt),
        fields(backend = transport.name(), handle = %handle)
    )]
    pub async fn resolve<F>(
        &self,
        transport: &dyn TransportClient,
        handle: &StorageHandle,
        cancel: &CancellationToken,
        mut on_attempt: F,
    ) -> Result<String, ResolveError>
    where
        F: FnMut(u32, u32),
    {
        let mut failures = Vec::new();

        for attempt in 1..=self.max_attempts {
            on_attempt(attempt, self.max_attempts);

            let deadline = Instant::now() + self.attempt_timeout;
            match race(cancel, Some(deadline), transport.resolve_url(handle)).await {
                Raced::Settled(Ok(Some(url))) => {
                    debug!("Resolved on attempt {}/{}", attempt, self.max_attempts);
                    return Ok(url);
                }
                Raced::Settled(Ok(None)) => {
                    warn!(
                        "Resolve attempt {}/{}: URL not available yet",
                        attempt, self.max_attempts
                    );
                    failures.push(AttemptFailure::NotReady);
                }
                Raced::Settled(Err(err)) => {
                    warn!("Resolve attempt {}/{} failed: {}", attempt, self.max_attempts, err);
                    failures.push(AttemptFailure::Failed(err));
                }
                Raced::TimedOut => {
                    warn!(
                        "Resolve attempt {}/{} timed out after {:?}",
                        attempt, self.max_attempts, self.attempt_timeout
                    );
                    failures.push(AttemptFailure::TimedOut(self.attempt_timeout));
                }
                Raced::Cancelled => return Err(ResolveError::Cancelled),
            }

            if attempt < self.max_attempts && !sleep_or_cancel(cancel, self.delay).await {
                return Err(ResolveError::Cancelled);
            }
        }

        Err(ResolveError::Exhausted {
            attempts: self.max_attempts,
            failures,
        })
    }
}
