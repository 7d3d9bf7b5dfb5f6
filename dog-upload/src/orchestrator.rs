use chrono::Utc;
use futures_core::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::probe::{bounded_probe, DurationProbe};
use crate::race::{race, Raced};
use crate::resolver::{ResolveError, UrlResolver};
use crate::{
    ErrorKind, FileValidator, ProgressEstimator, ResolvedAsset, SessionError, SessionId,
    SessionSnapshot, StorageHandle, TransportClient, UploadConfig, UploadError, UploadRequest,
    UploadResult, UploadSession, UploadState,
};

const VALIDATING_PROGRESS: u8 = 5;
const UPLOAD_START_PROGRESS: u8 = 10;
const RESOLVING_PROGRESS: u8 = 50;
const RESOLVE_ATTEMPT_PROGRESS_STEP: u8 = 5;
const RESOLVING_MAX_PROGRESS: u8 = 70;
const METADATA_PROGRESS: u8 = 80;
const COMPLETE_PROGRESS: u8 = 100;

/// Drives one upload at a time through
/// `Validating -> Uploading -> Resolving -> ExtractingMetadata -> Complete`.
///
/// Cloning is cheap and every clone shares the same session slot.
/// Independent instances (one for audio, one for cover images) share nothing.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn TransportClient>,
    probe: Arc<dyn DurationProbe>,
    validator: FileValidator,
    resolver: UrlResolver,
    config: UploadConfig,
    slot: Mutex<Option<ActiveSession>>,
    runs: AtomicU64,
}

/// The session in the slot plus everything needed to drive and observe it
struct ActiveSession {
    session: UploadSession,
    /// Validated file, kept for `retry()`
    request: Option<Arc<UploadRequest>>,
    cancel: CancellationToken,
    /// Pipeline run allowed to mutate the session; bumped by `retry()`
    run: u64,
    subscribers: Vec<mpsc::UnboundedSender<SessionSnapshot>>,
    latest: watch::Sender<SessionSnapshot>,
}

impl ActiveSession {
    fn transition(
        &mut self,
        next: UploadState,
        progress: Option<u8>,
        step_label: impl Into<String>,
    ) -> bool {
        let from = self.session.state;
        if !from.can_transition_to(next) {
            warn!(session_id = %self.session.id, "Rejected transition {} -> {}", from, next);
            return false;
        }

        debug!(session_id = %self.session.id, "{} -> {}", from, next);
        self.session.state = next;
        self.session.step_label = step_label.into();
        if let Some(progress) = progress {
            self.session.advance_progress(progress);
        }
        true
    }

    /// Move to `next` with its own step label
    fn enter(&mut self, next: UploadState, progress: u8) -> bool {
        self.transition(next, Some(progress), next.step_label())
    }

    fn fail(&mut self, kind: ErrorKind, message: String) -> bool {
        if !self.transition(UploadState::Error, None, UploadState::Error.step_label()) {
            return false;
        }
        warn!(session_id = %self.session.id, "Upload failed ({}): {}", kind, message);
        self.session.error = Some(SessionError::new(kind, message));
        true
    }

    /// Deliver the current snapshot to every observer, in transition order
    fn publish(&mut self) {
        self.session.updated_at = Utc::now();
        let snapshot = self.session.snapshot();

        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        if snapshot.is_terminal() {
            // closes every stream after its final event
            self.subscribers.clear();
        }
        self.latest.send_replace(snapshot);
    }
}

impl Inner {
    fn next_run(&self) -> u64 {
        self.runs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply `change` if `run` still owns a non-terminal session.
    ///
    /// `change` returns whether anything changed worth publishing.
    fn update<F>(&self, run: u64, what: &str, change: F) -> bool
    where
        F: FnOnce(&mut ActiveSession) -> bool,
    {
        let mut slot = self.slot.lock();
        let active = match slot.as_mut() {
            Some(active) if active.run == run && !active.session.state.is_terminal() => active,
            _ => {
                debug!("Discarding late {} from run {}", what, run);
                return false;
            }
        };

        if !change(active) {
            return false;
        }
        active.publish();
        true
    }

    fn apply_progress(&self, run: u64, percent: u8) {
        self.update(run, "progress tick", |active| {
            if active.session.state != UploadState::Uploading
                || percent <= active.session.progress_percent
            {
                return false;
            }
            active.session.advance_progress(percent);
            true
        });
    }

    fn enter(&self, run: u64, state: UploadState, progress: u8) -> bool {
        self.update(run, state.step_label(), |active| active.enter(state, progress))
    }

    fn resolve_attempt(&self, run: u64, attempt: u32, max_attempts: u32) {
        let extra = attempt.saturating_sub(1).min(u8::MAX as u32) as u8;
        let progress = RESOLVING_PROGRESS
            .saturating_add(extra.saturating_mul(RESOLVE_ATTEMPT_PROGRESS_STEP))
            .min(RESOLVING_MAX_PROGRESS);

        self.update(run, "resolve attempt", |active| {
            if active.session.state != UploadState::Resolving {
                return false;
            }
            active.session.advance_progress(progress);
            active.session.step_label = format!(
                "{} (attempt {}/{})",
                UploadState::Resolving.step_label(),
                attempt,
                max_attempts
            );
            true
        });
    }

    fn fail(&self, run: u64, kind: ErrorKind, message: String) {
        self.update(run, "failure", |active| active.fail(kind, message));
    }

    fn complete(&self, run: u64, asset: ResolvedAsset) {
        self.update(run, "completion", |active| {
            if !active.enter(UploadState::Complete, COMPLETE_PROGRESS) {
                return false;
            }
            info!(
                session_id = %active.session.id,
                "Upload complete: {} ({:.1}s{})",
                asset.url,
                asset.duration_seconds,
                if asset.metadata_warning { ", duration unknown" } else { "" }
            );
            active.session.result = Some(asset);
            true
        });
    }

    fn spawn_pipeline(
        self: &Arc<Self>,
        runtime: &Handle,
        session_id: &SessionId,
        run: u64,
        request: Arc<UploadRequest>,
        cancel: CancellationToken,
        progress_floor: u8,
    ) {
        let span = info_span!("upload_session", session_id = %session_id, run);
        runtime.spawn(
            self.clone()
                .run_pipeline(run, request, cancel, progress_floor)
                .instrument(span),
        );
    }

    async fn run_pipeline(
        self: Arc<Self>,
        run: u64,
        request: Arc<UploadRequest>,
        cancel: CancellationToken,
        progress_floor: u8,
    ) {
        let Some(handle) = self.upload(run, &request, &cancel, progress_floor).await else {
            return;
        };

        if !self.enter(run, UploadState::Resolving, RESOLVING_PROGRESS) {
            return;
        }
        let resolved = self
            .resolver
            .resolve(self.transport.as_ref(), &handle, &cancel, |attempt, max| {
                if attempt > 1 {
                    self.resolve_attempt(run, attempt, max);
                }
            })
            .await;
        let url = match resolved {
            Ok(url) => url,
            Err(ResolveError::Cancelled) => {
                debug!("Resolution abandoned, session was cancelled");
                return;
            }
            Err(err @ ResolveError::Exhausted { .. }) => {
                self.fail(run, ErrorKind::ResolutionError, err.to_string());
                return;
            }
        };

        if !self.enter(run, UploadState::ExtractingMetadata, METADATA_PROGRESS) {
            return;
        }
        let Some(outcome) =
            bounded_probe(self.probe.as_ref(), &url, self.config.metadata_timeout(), &cancel).await
        else {
            debug!("Duration probe abandoned, session was cancelled");
            return;
        };

        self.complete(
            run,
            ResolvedAsset {
                url,
                duration_seconds: outcome.duration_seconds,
                storage_handle: handle,
                metadata_warning: outcome.warning,
            },
        );
    }

    /// Target + transfer raced against the upload deadline, with synthetic
    /// progress running alongside. `None` once the session has moved on.
    async fn upload(
        self: &Arc<Self>,
        run: u64,
        request: &UploadRequest,
        cancel: &CancellationToken,
        progress_floor: u8,
    ) -> Option<StorageHandle> {
        let deadline = self.config.upload_deadline();
        let ticks = {
            let inner = self.clone();
            ProgressEstimator::from_config(&self.config, progress_floor)
                .start(move |percent| inner.apply_progress(run, percent))
        };

        debug!(
            "Uploading {} ({} bytes) via {} with a {:?} deadline",
            request.file_name,
            request.size_bytes,
            self.transport.name(),
            deadline
        );
        let transfer = async {
            let target = self.transport.obtain_upload_target(request).await?;
            self.transport.upload_bytes(&target, request).await
        };
        let outcome = race(cancel, Some(Instant::now() + deadline), transfer).await;
        ticks.stop();

        match outcome {
            Raced::Settled(Ok(handle)) => Some(handle),
            Raced::Settled(Err(err)) => {
                self.fail(run, err.kind(), err.to_string());
                None
            }
            Raced::TimedOut => {
                self.fail(
                    run,
                    ErrorKind::Timeout,
                    format!(
                        "Upload did not finish within {:?}; \
                         retry, or raise uploadDeadlineMs for slow connections",
                        deadline
                    ),
                );
                None
            }
            Raced::Cancelled => {
                debug!("Transfer abandoned, session was cancelled");
                None
            }
        }
    }
}

fn current_runtime() -> UploadResult<Handle> {
    Handle::try_current().map_err(|_| {
        UploadError::config("upload sessions must be driven from within a Tokio runtime")
    })
}

impl UploadOrchestrator {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        probe: Arc<dyn DurationProbe>,
        config: UploadConfig,
    ) -> UploadResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                validator: FileValidator::from_config(&config),
                resolver: UrlResolver::from_config(&config),
                transport,
                probe,
                config,
                slot: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// Begin a new session for `request`.
    ///
    /// Fails with `Busy` while another session is non-terminal. A file that
    /// fails validation still yields a handle; its session ends in
    /// `Error(InvalidInput)` without any transport call.
    #[instrument(
        skip(self, request),
        fields(file = %request.file_name, mime = %request.mime_type, size = request.size_bytes)
    )]
    pub fn start(&self, request: UploadRequest) -> UploadResult<OperationHandle> {
        let runtime = current_runtime()?;
        let mut slot = self.inner.slot.lock();

        if let Some(active) = slot.as_ref().filter(|a| !a.session.state.is_terminal()) {
            warn!(
                "Rejected start, session {} is still {}",
                active.session.id, active.session.state
            );
            return Err(UploadError::Busy {
                session_id: active.session.id.clone(),
            });
        }

        let session = UploadSession::new();
        let session_id = session.id.clone();
        let (latest, snapshots) = watch::channel(session.snapshot());
        let mut active = ActiveSession {
            session,
            request: None,
            cancel: CancellationToken::new(),
            run: self.inner.next_run(),
            subscribers: Vec::new(),
            latest,
        };
        let handle = OperationHandle {
            session_id: session_id.clone(),
            snapshots,
        };

        info!(session_id = %session_id, "Starting upload session");
        active.enter(UploadState::Validating, VALIDATING_PROGRESS);
        active.publish();

        if let Err(err) = self.inner.validator.validate(&request) {
            active.fail(ErrorKind::InvalidInput, err.to_string());
            active.publish();
            *slot = Some(active);
            return Ok(handle);
        }

        let request = Arc::new(request);
        active.request = Some(request.clone());
        active.enter(UploadState::Uploading, UPLOAD_START_PROGRESS);
        active.publish();

        let (run, cancel, floor) = (
            active.run,
            active.cancel.clone(),
            active.session.progress_percent,
        );
        *slot = Some(active);
        drop(slot);

        self.inner.spawn_pipeline(&runtime, &session_id, run, request, cancel, floor);
        Ok(handle)
    }

    /// Cancel a non-terminal session.
    ///
    /// Returns `false` when the session had already ended. Results of calls
    /// still in flight are discarded on arrival.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel(&self, session_id: &SessionId) -> UploadResult<bool> {
        let mut slot = self.inner.slot.lock();
        let active = slot
            .as_mut()
            .filter(|a| &a.session.id == session_id)
            .ok_or_else(|| UploadError::session_not_found(session_id))?;

        if active.session.state.is_terminal() {
            debug!("Session already {}, nothing to cancel", active.session.state);
            return Ok(false);
        }

        active.transition(UploadState::Cancelled, None, UploadState::Cancelled.step_label());
        active.publish();
        active.cancel.cancel();
        info!("Upload session cancelled");
        Ok(true)
    }

    /// Re-enter `Uploading` from `Error` with the already validated file.
    ///
    /// Observers of the failed run saw their streams end at `Error`; they
    /// resubscribe to follow the retry.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn retry(&self, session_id: &SessionId) -> UploadResult<()> {
        let runtime = current_runtime()?;
        let mut slot = self.inner.slot.lock();
        let active = slot
            .as_mut()
            .filter(|a| &a.session.id == session_id)
            .ok_or_else(|| UploadError::session_not_found(session_id))?;

        let state = active.session.state;
        let retryable = state == UploadState::Error
            && active.session.error.as_ref().map(|e| e.kind.is_retryable()).unwrap_or(false);
        let request = match (&active.request, retryable) {
            (Some(request), true) => request.clone(),
            _ => return Err(UploadError::invalid_state(session_id, state, "retry")),
        };

        active.cancel.cancel();
        active.cancel = CancellationToken::new();
        active.run = self.inner.next_run();
        active.session.retry_count += 1;
        active.session.error = None;
        active.enter(UploadState::Uploading, UPLOAD_START_PROGRESS);
        active.publish();
        info!("Retrying upload (retry #{})", active.session.retry_count);

        let (run, cancel, floor) = (
            active.run,
            active.cancel.clone(),
            active.session.progress_percent,
        );
        drop(slot);

        self.inner.spawn_pipeline(&runtime, session_id, run, request, cancel, floor);
        Ok(())
    }

    /// Snapshots of `session_id`, starting with the current one.
    ///
    /// The stream ends after the terminal snapshot; dropping it unsubscribes.
    pub fn subscribe(&self, session_id: &SessionId) -> UploadResult<SessionEvents> {
        let mut slot = self.inner.slot.lock();
        let active = slot
            .as_mut()
            .filter(|a| &a.session.id == session_id)
            .ok_or_else(|| UploadError::session_not_found(session_id))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = active.session.snapshot();
        let terminal = snapshot.is_terminal();
        // receiver is alive, send cannot fail
        let _ = tx.send(snapshot);
        if !terminal {
            active.subscribers.push(tx);
        }

        Ok(SessionEvents { rx })
    }

    /// Invoke `callback` for every snapshot of `session_id` until the
    /// session ends or the returned guard is dropped.
    pub fn subscribe_with<F>(
        &self,
        session_id: &SessionId,
        mut callback: F,
    ) -> UploadResult<Unsubscribe>
    where
        F: FnMut(SessionSnapshot) + Send + 'static,
    {
        let runtime = current_runtime()?;
        let mut events = self.subscribe(session_id)?;

        let task = runtime.spawn(async move {
            while let Some(snapshot) = events.recv().await {
                callback(snapshot);
            }
        });

        Ok(Unsubscribe { task: Some(task) })
    }

    /// Latest snapshot of the session in the slot, if any
    pub fn current(&self) -> Option<SessionSnapshot> {
        self.inner.slot.lock().as_ref().map(|a| a.session.snapshot())
    }
}

impl std::fmt::Debug for UploadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOrchestrator")
            .field("transport", &self.inner.transport.name())
            .field("config", &self.inner.config)
            .field("current", &self.current().map(|s| (s.session_id, s.state)))
            .finish()
    }
}

/// Returned by [`UploadOrchestrator::start`]
#[derive(Debug, Clone)]
pub struct OperationHandle {
    session_id: SessionId,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl OperationHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the session to reach a terminal state.
    ///
    /// After a `retry()` this waits for the retried run to end.
    pub async fn finished(&self) -> SessionSnapshot {
        let mut snapshots = self.snapshots.clone();
        let finished = snapshots
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| SessionSnapshot::clone(&s));
        match finished {
            Ok(snapshot) => snapshot,
            // slot was reused by a newer session; the last value is terminal
            Err(_) => snapshots.borrow().clone(),
        }
    }
}

/// Ordered stream of session snapshots
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionSnapshot>,
}

impl SessionEvents {
    /// Next snapshot; `None` after the terminal one
    pub async fn recv(&mut self) -> Option<SessionSnapshot> {
        self.rx.recv().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Keeps a [`UploadOrchestrator::subscribe_with`] callback alive
#[derive(Debug)]
pub struct Unsubscribe {
    task: Option<JoinHandle<()>>,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Let the callback run until the session ends
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
