use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::UploadConfig;

/// Synthetic progress for a transfer that reports none.
///
/// Emits `start + step`, `start + 2 * step`, ... every `interval`, clamped to
/// `ceiling`. The values are unrelated to bytes actually sent; the backends
/// expose no granular progress.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    start: u8,
    step: u8,
    ceiling: u8,
    interval: Duration,
}

impl ProgressEstimator {
    pub fn new(start: u8, step: u8, ceiling: u8, interval: Duration) -> Self {
        Self {
            start: start.min(100),
            step: step.max(1),
            ceiling: ceiling.min(100),
            interval,
        }
    }

    /// Ticks configured by `config`, counting up from `start`
    pub fn from_config(config: &UploadConfig, start: u8) -> Self {
        Self::new(
            start,
            config.progress_tick_step,
            config.progress_ceiling_during_upload,
            config.progress_tick_interval(),
        )
    }

    /// Spawn the ticker. `sink` receives each new value.
    ///
    /// The first tick fires one `interval` after the call. The ticker ends on
    /// its own once the ceiling is reached.
    pub fn start<F>(&self, sink: F) -> ProgressHandle
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let Self {
            start,
            step,
            ceiling,
            interval,
        } = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut current = start;

            while current < ceiling {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if token.is_cancelled() {
                    return;
                }
                current = current.saturating_add(step).min(ceiling);
                sink(current);
            }

            debug!("Progress estimate reached its ceiling of {}%", ceiling);
        });

        ProgressHandle { cancel, task }
    }
}

/// Running ticker; stopping (or dropping) it guarantees no further values
#[derive(Debug)]
pub struct ProgressHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.task.is_finished()
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync + 'static) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink_values = values.clone();
        (values, move |p| sink_values.lock().push(p))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_increasing_and_capped() {
        let (values, sink) = recorder();
        let estimator = ProgressEstimator::new(10, 5, 45, Duration::from_millis(500));
        let handle = estimator.start(sink);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(*values.lock(), vec![15, 20, 25, 30, 35, 40, 45]);
        assert!(handle.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_step_clamps_to_ceiling() {
        let (values, sink) = recorder();
        let _handle = ProgressEstimator::new(10, 20, 45, Duration::from_millis(100)).start(sink);

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*values.lock(), vec![30, 45]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resumes_after_stop() {
        let (values, sink) = recorder();
        let handle = ProgressEstimator::new(10, 5, 45, Duration::from_millis(500)).start(sink);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*values.lock(), vec![15, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_ticker() {
        let (values, sink) = recorder();
        drop(ProgressEstimator::new(0, 5, 45, Duration::from_millis(100)).start(sink));

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(values.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_at_ceiling_emits_nothing() {
        let (values, sink) = recorder();
        let _handle = ProgressEstimator::new(45, 5, 45, Duration::from_millis(100)).start(sink);

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(values.lock().is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = UploadConfig::default().with_progress(Duration::from_millis(250), 3, 40);
        let estimator = ProgressEstimator::from_config(&config, 10);
        assert_eq!(estimator.step, 3);
        assert_eq!(estimator.ceiling, 40);
        assert_eq!(estimator.interval, Duration::from_millis(250));
    }
}
