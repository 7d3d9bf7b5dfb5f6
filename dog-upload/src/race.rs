use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a raced operation ended
#[derive(Debug, PartialEq, Eq)]
pub enum Raced<T> {
    /// The operation settled first
    Settled(T),
    /// The deadline elapsed first; the operation was dropped
    TimedOut,
    /// The token was cancelled first; the operation was dropped
    Cancelled,
}

impl<T> Raced<T> {
    pub fn settled(self) -> Option<T> {
        match self {
            Self::Settled(value) => Some(value),
            _ => None,
        }
    }
}

/// Run `fut` against a cancellation token and an optional deadline.
///
/// Cancellation wins ties, so a cancelled session never observes a result.
pub async fn race<F, T>(cancel: &CancellationToken, deadline: Option<Instant>, fut: F) -> Raced<T>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Raced::Cancelled,
            res = tokio::time::timeout_at(deadline, fut) => match res {
                Ok(value) => Raced::Settled(value),
                Err(_) => Raced::TimedOut,
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Raced::Cancelled,
            value = fut => Raced::Settled(value),
        },
    }
}

/// Sleep unless cancelled first; returns `false` on cancellation
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: std::time::Duration) -> bool {
    !matches!(
        race(cancel, None, tokio::time::sleep(duration)).await,
        Raced::Cancelled
    )
}
