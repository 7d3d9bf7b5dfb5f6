//! # dog-upload: Deadline-aware media upload orchestration
//!
//! `dog-upload` takes a large media file (podcast audio, cover art) from "the user picked a file"
//! to "here is a public URL and its duration", against storage backends that may be slow, flaky
//! or bounded by a hard execution deadline.
//!
//! ## Key Features
//!
//! - **Pre-flight validation**: MIME prefix and size limits checked before any network call
//! - **Deadline racing**: the transfer races a configurable deadline; late results are discarded
//! - **Synthetic progress**: monotonic progress ticks for transfers that report none
//! - **Eventually-consistent URLs**: bounded, sequential retry loop until the URL is published
//! - **Best-effort metadata**: duration probing never fails an upload
//! - **Cooperative cancellation and retry**: one cancellation token per run, no stray mutations
//! - **Pluggable backends**: in-memory, S3-compatible object storage, CDN direct upload
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_upload::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let transport = dog_upload::connect(&TransportConfig::from_env()?).await?;
//! let orchestrator = UploadOrchestrator::new(
//!     transport,
//!     Arc::new(HttpDurationProbe::new()),
//!     UploadConfig::from_env()?,
//! )?;
//!
//! let request = UploadRequest::from_path("episode-12.mp3", None).await?;
//! let handle = orchestrator.start(request)?;
//!
//! let mut events = orchestrator.subscribe(handle.session_id())?;
//! while let Some(snapshot) = events.recv().await {
//!     println!("{:>3}% {}", snapshot.progress_percent, snapshot.step_label);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  UploadOrchestrator  │  ← state machine, session slot, subscribers
//! ├──────────────────────┤
//! │ FileValidator        │
//! │ ProgressEstimator    │  ← one component per pipeline phase
//! │ UrlResolver          │
//! │ DurationProbe        │
//! ├──────────────────────┤
//! │   TransportClient    │  ← memory / s3 / direct
//! └──────────────────────┘
//! ```
//!
//! Sessions move through
//! `Idle → Validating → Uploading → Resolving → ExtractingMetadata → Complete`;
//! `Error` and `Cancelled` are reachable from every non-terminal state, and
//! `retry()` re-enters `Uploading` from `Error`.

mod config;
mod error;
pub mod orchestrator;
pub mod probe;
mod progress;
pub mod race;
pub mod resolver;
pub mod transport;
mod types;
mod validator;

// Re-export main types for clean API
pub use config::{TransportConfig, UploadConfig, ENV_PREFIX};
pub use error::{ErrorKind, ProbeError, TransportError, UploadError, UploadResult, ValidationError};
pub use orchestrator::{OperationHandle, SessionEvents, Unsubscribe, UploadOrchestrator};
pub use probe::{bounded_probe, duration_from_bytes, DurationProbe, HttpDurationProbe, ProbeOutcome};
pub use progress::{ProgressEstimator, ProgressHandle};
pub use race::{race, sleep_or_cancel, Raced};
pub use resolver::{AttemptFailure, ResolveError, UrlResolver};
pub use transport::{
    connect, DirectUploadTransport, MemoryTransport, TransportCalls, TransportClient,
};
#[cfg(feature = "s3")]
pub use transport::S3Transport;
pub use types::{
    guess_audio_mime, FileSource, ResolvedAsset, SessionError, SessionId, SessionSnapshot,
    StorageHandle, UploadRequest, UploadSession, UploadState, UploadTarget,
};
pub use validator::FileValidator;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        DurationProbe, ErrorKind, HttpDurationProbe, OperationHandle, SessionSnapshot,
        TransportClient, TransportConfig, UploadConfig, UploadError, UploadOrchestrator,
        UploadRequest, UploadResult, UploadState,
    };
}
