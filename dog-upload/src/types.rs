use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::{ErrorKind, UploadError, UploadResult};

/// Unique identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("ups_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Content already held in memory
    Bytes(Bytes),
    /// Content on the local filesystem, read lazily by the transport
    Path(PathBuf),
}

/// A candidate file: opaque content reference plus its declared type and size.
///
/// Immutable once accepted by the orchestrator.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: FileSource,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl UploadRequest {
    /// Build a request from in-memory content
    pub fn from_bytes<N, M>(file_name: N, mime_type: M, data: Bytes) -> Self
    where
        N: Into<String>,
        M: Into<String>,
    {
        Self {
            size_bytes: data.len() as u64,
            source: FileSource::Bytes(data),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Build a request for a local file, reading its size from the filesystem.
    ///
    /// The MIME type is guessed from the extension when not given.
    pub async fn from_path<P: AsRef<Path>>(path: P, mime_type: Option<&str>) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::config(format!("{} is not a file", path.display())));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mime_type = mime_type
            .map(str::to_string)
            .or_else(|| guess_audio_mime(&file_name).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(Self {
            source: FileSource::Path(path.to_path_buf()),
            file_name,
            mime_type,
            size_bytes: metadata.len(),
        })
    }

    /// Load the full content (used by transports that need a contiguous body)
    pub async fn read_bytes(&self) -> std::io::Result<Bytes> {
        match &self.source {
            FileSource::Bytes(data) => Ok(data.clone()),
            FileSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }
}

/// Map a file name's extension to an audio MIME type
pub fn guess_audio_mime(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();

    match ext.as_str() {
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" | "oga" => Some("audio/ogg"),
        "flac" => Some("audio/flac"),
        "webm" => Some("audio/webm"),
        _ => None,
    }
}

/// Backend-issued destination for the bytes of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Object key (or file key) the backend will store the bytes under
    pub key: String,
    /// Pre-authorized URL to send the bytes to, when the backend issues one
    pub upload_url: Option<String>,
}

impl UploadTarget {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            upload_url: None,
        }
    }

    pub fn with_upload_url<S: Into<String>>(mut self, url: S) -> Self {
        self.upload_url = Some(url.into());
        self
    }
}

/// Opaque backend reference to uploaded bytes, only meaningful to the
/// transport that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageHandle(pub String);

impl StorageHandle {
    pub fn new<S: Into<String>>(handle: S) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal payload of a successful session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAsset {
    pub url: String,
    /// Playback duration; `0.0` when `metadata_warning` is set
    pub duration_seconds: f64,
    pub storage_handle: StorageHandle,
    pub metadata_warning: bool,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    Idle,
    Validating,
    Uploading,
    Resolving,
    ExtractingMetadata,
    Complete,
    Error,
    Cancelled,
}

impl UploadState {
    /// Terminal states end the session instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Error` and `Cancelled` are reachable from every non-terminal state;
    /// `Error -> Uploading` is the retry edge.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Error, Uploading) => true,
            (from, Error | Cancelled) => !from.is_terminal(),
            (Idle, Validating)
            | (Validating, Uploading)
            | (Uploading, Resolving)
            | (Resolving, ExtractingMetadata)
            | (ExtractingMetadata, Complete) => true,
            _ => false,
        }
    }

    /// Human-readable phase name
    pub fn step_label(&self) -> &'static str {
        match self {
            Self::Idle => "Waiting for a file",
            Self::Validating => "Validating file",
            Self::Uploading => "Uploading file",
            Self::Resolving => "Resolving public URL",
            Self::ExtractingMetadata => "Reading media duration",
            Self::Complete => "Upload complete",
            Self::Error => "Upload failed",
            Self::Cancelled => "Upload cancelled",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Uploading => "uploading",
            Self::Resolving => "resolving",
            Self::ExtractingMetadata => "extracting_metadata",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error recorded on a failed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Mutable record of one upload's lifecycle, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: SessionId,
    pub state: UploadState,
    pub progress_percent: u8,
    pub step_label: String,
    pub error: Option<SessionError>,
    pub result: Option<ResolvedAsset>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            state: UploadState::Idle,
            progress_percent: 0,
            step_label: UploadState::Idle.step_label().to_string(),
            error: None,
            result: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Raise progress; never lowers it
    pub fn advance_progress(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            state: self.state,
            progress_percent: self.progress_percent,
            step_label: self.step_label.clone(),
            error: self.error.clone(),
            result: self.result.clone(),
            retry_count: self.retry_count,
            at: self.updated_at,
        }
    }
}

impl Default for UploadSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of a session delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: UploadState,
    pub progress_percent: u8,
    pub step_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResolvedAsset>,
    pub retry_count: u32,
    pub at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Error kind, if the session failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use UploadState::*;
        let path = [Idle, Validating, Uploading, Resolving, ExtractingMetadata, Complete];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Validating.can_transition_to(Resolving));
        assert!(!Uploading.can_transition_to(Complete));
    }

    #[test]
    fn test_error_and_cancel_reachable_from_non_terminal_only() {
        use UploadState::*;
        for from in [Idle, Validating, Uploading, Resolving, ExtractingMetadata] {
            assert!(from.can_transition_to(Error));
            assert!(from.can_transition_to(Cancelled));
        }
        for from in [Complete, Error, Cancelled] {
            assert!(!from.can_transition_to(Cancelled));
        }
        assert!(Error.can_transition_to(Uploading));
        assert!(!Cancelled.can_transition_to(Uploading));
    }

    #[test]
    fn test_step_labels_fit_any_media_type() {
        use UploadState::*;
        assert_eq!(Uploading.step_label(), "Uploading file");
        for state in [
            Idle, Validating, Uploading, Resolving, ExtractingMetadata, Complete, Error, Cancelled,
        ] {
            assert!(!state.step_label().contains("audio"), "{state}");
        }
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut session = UploadSession::new();
        session.advance_progress(40);
        session.advance_progress(10);
        assert_eq!(session.progress_percent, 40);
        session.advance_progress(250);
        assert_eq!(session.progress_percent, 100);
    }

    #[test]
    fn test_guess_audio_mime() {
        assert_eq!(guess_audio_mime("episode-12.MP3"), Some("audio/mpeg"));
        assert_eq!(guess_audio_mime("take.m4a"), Some("audio/mp4"));
        assert_eq!(guess_audio_mime("cover.png"), None);
        assert_eq!(guess_audio_mime("README"), None);
    }

    #[test]
    fn test_request_from_bytes_uses_content_length() {
        let req = UploadRequest::from_bytes("a.wav", "audio/wav", Bytes::from_static(b"RIFF...."));
        assert_eq!(req.size_bytes, 8);
        assert_eq!(req.file_name, "a.wav");
    }

    #[tokio::test]
    async fn test_request_from_missing_path_fails() {
        let result = UploadRequest::from_path("/nonexistent/episode.mp3", None).await;
        assert!(matches!(result, Err(UploadError::Io { .. })));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut session = UploadSession::new();
        session.state = UploadState::Uploading;
        session.progress_percent = 15;
        let json = serde_json::to_string(&session.snapshot()).unwrap();
        assert!(json.contains("\"progressPercent\":15"));
        assert!(json.contains("\"stepLabel\""));
        assert!(!json.contains("\"error\""));
    }
}
