use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use dog_upload::{
    duration_from_bytes, DurationProbe, HttpDurationProbe, ProbeError, SessionSnapshot,
    TransportConfig, UploadConfig, UploadOrchestrator, UploadRequest, UploadState,
};

/// Automatic retries for recoverable failures before giving up
const MAX_RETRIES: u32 = 2;

/// Reads the duration from the local file; memory backend URLs are not fetchable
struct LocalFileProbe {
    path: PathBuf,
}

#[async_trait]
impl DurationProbe for LocalFileProbe {
    async fn probe(&self, _url: &str) -> Result<f64, ProbeError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ProbeError::Fetch(e.to_string()))?;
        let hint = self.path.extension().and_then(|e| e.to_str()).map(str::to_string);

        tokio::task::spawn_blocking(move || duration_from_bytes(Bytes::from(data), hint.as_deref()))
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))?
    }
}

fn report(snapshot: &SessionSnapshot) {
    info!(
        state = %snapshot.state,
        retry = snapshot.retry_count,
        "{:>3}% {}",
        snapshot.progress_percent,
        snapshot.step_label
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dog_upload=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next().map(PathBuf::from) else {
        bail!("usage: podcast-upload <audio-file> [mime-type]");
    };
    let mime_type = args.next();

    let config = UploadConfig::from_env()?;
    let transport_config = TransportConfig::from_env()?;

    println!("🔧 Upload configuration:");
    println!("   Max file size: {} MB", config.max_file_size_bytes / (1024 * 1024));
    println!("   Upload deadline: {:?}", config.upload_deadline());
    println!(
        "   Resolve attempts: {} every {:?}",
        config.resolve_max_retries,
        config.resolve_retry_delay()
    );

    let transport = dog_upload::connect(&transport_config).await?;
    println!("   Backend: {}", transport.name());

    let probe: Arc<dyn DurationProbe> = match transport_config {
        TransportConfig::Memory => Arc::new(LocalFileProbe { path: path.clone() }),
        _ => Arc::new(HttpDurationProbe::new()),
    };
    let orchestrator = UploadOrchestrator::new(transport, probe, config)?;

    let request = UploadRequest::from_path(&path, mime_type.as_deref())
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let handle = orchestrator.start(request)?;
    let session_id = handle.session_id().clone();

    loop {
        let mut events = orchestrator.subscribe(&session_id)?;
        let outcome = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(snapshot) => {
                        report(&snapshot);
                        if snapshot.is_terminal() {
                            break snapshot;
                        }
                    }
                    None => break handle.snapshot(),
                },
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling upload");
                    orchestrator.cancel(&session_id)?;
                }
            }
        };

        match (outcome.state, outcome.error) {
            (UploadState::Complete, _) => {
                println!("{}", serde_json::to_string_pretty(&outcome.result)?);
                return Ok(());
            }
            (UploadState::Cancelled, _) => {
                println!("Upload cancelled");
                return Ok(());
            }
            (UploadState::Error, Some(error))
                if error.kind.is_retryable() && outcome.retry_count < MAX_RETRIES =>
            {
                warn!("{} ({}), retrying", error.message, error.kind);
                orchestrator.retry(&session_id)?;
            }
            (UploadState::Error, Some(error)) => {
                bail!("upload failed ({}): {}", error.kind, error.message)
            }
            (state, _) => bail!("session ended in unexpected state {state}"),
        }
    }
}
