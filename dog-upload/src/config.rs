use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Prefix for every environment variable the crate reads
pub const ENV_PREFIX: &str = "DOG_UPLOAD_";

/// Configuration for one orchestrator instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    /// Largest accepted file (safety guard, checked before any network call)
    pub max_file_size_bytes: u64,

    /// Declared MIME type must start with this, e.g. `"audio/"`
    pub allowed_mime_prefix: String,

    /// How long the transfer may take before the session times out
    pub upload_deadline_ms: u64,

    /// Attempts the URL resolver makes before giving up
    pub resolve_max_retries: u32,

    /// Pause between two resolve attempts
    pub resolve_retry_delay_ms: u64,

    /// Budget for a single resolve call; a call that runs over counts as a failed attempt
    pub resolve_attempt_timeout_ms: u64,

    /// Budget for reading the duration of the uploaded asset
    pub metadata_timeout_ms: u64,

    /// Period of the synthetic progress ticks during the transfer
    pub progress_tick_interval_ms: u64,

    /// Progress never exceeds this while the transfer is in flight
    pub progress_ceiling_during_upload: u8,

    /// Percent added per tick
    pub progress_tick_step: u8,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 50 * 1024 * 1024, // 50MB
            allowed_mime_prefix: "audio/".to_string(),
            upload_deadline_ms: 60_000,
            resolve_max_retries: 3,
            resolve_retry_delay_ms: 1_000,
            resolve_attempt_timeout_ms: 10_000,
            metadata_timeout_ms: 10_000,
            progress_tick_interval_ms: 500,
            progress_ceiling_during_upload: 45,
            progress_tick_step: 5,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// First-party storage mutation API: 50MB audio
    pub fn first_party() -> Self {
        Self::default()
    }

    /// Third-party CDN direct upload: 32MB audio
    pub fn cdn() -> Self {
        Self::default().with_max_file_size(32 * 1024 * 1024)
    }

    /// Constrained, high-latency deployments (serverless functions):
    /// longer deadline and a slower, longer resolve loop.
    pub fn serverless() -> Self {
        Self::default()
            .with_upload_deadline(Duration::from_secs(300))
            .with_resolve_retries(5, Duration::from_secs(2))
    }

    /// Set max file size
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    /// Set accepted MIME prefix
    pub fn with_allowed_mime_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.allowed_mime_prefix = prefix.into();
        self
    }

    /// Set the upload deadline
    pub fn with_upload_deadline(mut self, deadline: Duration) -> Self {
        self.upload_deadline_ms = millis(deadline);
        self
    }

    /// Set resolve attempts and the delay between them
    pub fn with_resolve_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.resolve_max_retries = attempts;
        self.resolve_retry_delay_ms = millis(delay);
        self
    }

    /// Set the metadata timeout
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout_ms = millis(timeout);
        self
    }

    /// Set the budget of a single resolve call
    pub fn with_resolve_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_attempt_timeout_ms = millis(timeout);
        self
    }

    /// Set tick interval, step and ceiling of the synthetic progress
    pub fn with_progress(mut self, interval: Duration, step: u8, ceiling: u8) -> Self {
        self.progress_tick_interval_ms = millis(interval);
        self.progress_tick_step = step;
        self.progress_ceiling_during_upload = ceiling;
        self
    }

    pub fn upload_deadline(&self) -> Duration {
        Duration::from_millis(self.upload_deadline_ms)
    }

    pub fn resolve_retry_delay(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_delay_ms)
    }

    pub fn resolve_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_attempt_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn progress_tick_interval(&self) -> Duration {
        Duration::from_millis(self.progress_tick_interval_ms)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> UploadResult<()> {
        if self.allowed_mime_prefix.trim().is_empty() {
            return Err(UploadError::config("allowedMimePrefix must not be empty"));
        }
        if self.max_file_size_bytes == 0 {
            return Err(UploadError::config("maxFileSizeBytes must be greater than 0"));
        }
        if self.upload_deadline_ms == 0 {
            return Err(UploadError::config("uploadDeadlineMs must be greater than 0"));
        }
        if self.resolve_max_retries == 0 {
            return Err(UploadError::config("resolveMaxRetries must be at least 1"));
        }
        if self.resolve_attempt_timeout_ms == 0 {
            return Err(UploadError::config("resolveAttemptTimeoutMs must be greater than 0"));
        }
        if self.progress_tick_interval_ms == 0 || self.progress_tick_step == 0 {
            return Err(UploadError::config(
                "progressTickIntervalMs and progressTickStep must be greater than 0",
            ));
        }
        if self.progress_ceiling_during_upload >= 100 {
            return Err(UploadError::config(format!(
                "progressCeilingDuringUpload must be below 100 (got {})",
                self.progress_ceiling_during_upload
            )));
        }
        Ok(())
    }

    /// Parse a JSON document (camelCase keys, missing keys take defaults)
    pub fn from_json_str(json: &str) -> UploadResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `DOG_UPLOAD_*` environment variables
    pub fn from_env() -> UploadResult<Self> {
        Self::default().apply_env()
    }

    /// Override fields from `DOG_UPLOAD_*` environment variables
    /// (`DOG_UPLOAD_MAX_FILE_SIZE_BYTES`, `DOG_UPLOAD_UPLOAD_DEADLINE_MS`, ...)
    pub fn apply_env(self) -> UploadResult<Self> {
        self.apply_vars(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    fn apply_vars<F>(self, lookup: F) -> UploadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self;

        fn parse<T: std::str::FromStr>(key: &str, value: String) -> UploadResult<T> {
            value.trim().parse().map_err(|_| {
                UploadError::config(format!("{ENV_PREFIX}{key} has an invalid value: {value:?}"))
            })
        }

        macro_rules! override_field {
            ($field:ident, $key:literal) => {
                if let Some(value) = lookup($key) {
                    config.$field = parse($key, value)?;
                }
            };
        }

        override_field!(max_file_size_bytes, "MAX_FILE_SIZE_BYTES");
        override_field!(allowed_mime_prefix, "ALLOWED_MIME_PREFIX");
        override_field!(upload_deadline_ms, "UPLOAD_DEADLINE_MS");
        override_field!(resolve_max_retries, "RESOLVE_MAX_RETRIES");
        override_field!(resolve_retry_delay_ms, "RESOLVE_RETRY_DELAY_MS");
        override_field!(resolve_attempt_timeout_ms, "RESOLVE_ATTEMPT_TIMEOUT_MS");
        override_field!(metadata_timeout_ms, "METADATA_TIMEOUT_MS");
        override_field!(progress_tick_interval_ms, "PROGRESS_TICK_INTERVAL_MS");
        override_field!(progress_ceiling_during_upload, "PROGRESS_CEILING_DURING_UPLOAD");
        override_field!(progress_tick_step, "PROGRESS_TICK_STEP");

        config.validate()?;
        Ok(config)
    }
}

/// Millisecond fields saturate instead of wrapping
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Which storage backend the orchestrator talks to
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process backend (development and tests)
    Memory,

    /// First-party S3-compatible object storage
    #[serde(rename_all = "camelCase")]
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        endpoint_url: Option<String>,
        /// Base of the URLs handed out once an object is readable
        public_base_url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },

    /// Third-party CDN with a presign / PUT / poll direct-upload API
    Direct { endpoint: String, token: String },
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::S3 {
                bucket,
                region,
                endpoint_url,
                public_base_url,
                key_prefix,
            } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("region", region)
                .field("endpoint_url", endpoint_url)
                .field("public_base_url", public_base_url)
                .field("key_prefix", key_prefix)
                .finish(),
            Self::Direct { endpoint, .. } => f
                .debug_struct("Direct")
                .field("endpoint", endpoint)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

fn default_key_prefix() -> String {
    "uploads".to_string()
}

impl TransportConfig {
    /// Read `DOG_UPLOAD_BACKEND` (`memory`, `s3`, `direct`) and the chosen
    /// backend's variables.
    pub fn from_env() -> UploadResult<Self> {
        Self::from_vars(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    fn from_vars<F>(lookup: F) -> UploadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    UploadError::config(format!("{ENV_PREFIX}{key} environment variable required"))
                })
        };

        let backend = lookup("BACKEND").unwrap_or_else(|| "memory".to_string());
        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "s3" => Ok(Self::S3 {
                bucket: get("S3_BUCKET")?,
                region: get("S3_REGION")?,
                endpoint_url: lookup("S3_ENDPOINT_URL"),
                public_base_url: get("S3_PUBLIC_BASE_URL")?,
                key_prefix: lookup("S3_KEY_PREFIX").unwrap_or_else(default_key_prefix),
            }),
            "direct" => Ok(Self::Direct {
                endpoint: get("DIRECT_ENDPOINT")?,
                token: get("DIRECT_TOKEN")?,
            }),
            other => Err(UploadError::config(format!("unknown backend {other:?}"))),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        UploadConfig::default().validate().unwrap();
        UploadConfig::cdn().validate().unwrap();
        UploadConfig::serverless().validate().unwrap();
        assert_eq!(UploadConfig::cdn().max_file_size_bytes, 32 * 1024 * 1024);
        assert!(
            UploadConfig::serverless().upload_deadline() > UploadConfig::default().upload_deadline()
        );
    }

    #[test]
    fn test_json_uses_option_names() {
        let config = UploadConfig::from_json_str(
            r#"{ "maxFileSizeBytes": 1024, "allowedMimePrefix": "image/", "resolveMaxRetries": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.max_file_size_bytes, 1024);
        assert_eq!(config.allowed_mime_prefix, "image/");
        assert_eq!(config.resolve_max_retries, 5);
        assert_eq!(config.metadata_timeout_ms, 10_000);
    }

    #[test]
    fn test_json_rejects_invalid_values() {
        let result = UploadConfig::from_json_str(r#"{ "progressCeilingDuringUpload": 100 }"#);
        assert!(matches!(result, Err(UploadError::Config { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let config = UploadConfig::default()
            .apply_vars(vars(&[
                ("UPLOAD_DEADLINE_MS", "120000"),
                ("RESOLVE_RETRY_DELAY_MS", " 2000 "),
            ]))
            .unwrap();
        assert_eq!(config.upload_deadline(), Duration::from_secs(120));
        assert_eq!(config.resolve_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.resolve_max_retries, 3);
    }

    #[test]
    fn test_resolve_attempt_timeout_option() {
        let config = UploadConfig::default()
            .apply_vars(vars(&[("RESOLVE_ATTEMPT_TIMEOUT_MS", "2500")]))
            .unwrap();
        assert_eq!(config.resolve_attempt_timeout(), Duration::from_millis(2500));

        let zero = UploadConfig::from_json_str(r#"{ "resolveAttemptTimeoutMs": 0 }"#);
        assert!(matches!(zero, Err(UploadError::Config { .. })));
    }

    #[test]
    fn test_huge_durations_saturate() {
        let config = UploadConfig::default().with_upload_deadline(Duration::MAX);
        assert_eq!(config.upload_deadline_ms, u64::MAX);
    }

    #[test]
    fn test_debug_redacts_direct_token() {
        let config = TransportConfig::Direct {
            endpoint: "https://files.example.com".to_string(),
            token: "sk_live_secret".to_string(),
        };
        let printed = format!("{config:?}");
        assert!(printed.contains("files.example.com"));
        assert!(!printed.contains("sk_live_secret"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = UploadConfig::default().apply_vars(vars(&[("RESOLVE_MAX_RETRIES", "lots")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("DOG_UPLOAD_RESOLVE_MAX_RETRIES"), "{err}");
    }

    #[test]
    fn test_transport_from_vars() {
        assert_eq!(TransportConfig::from_vars(vars(&[])).unwrap(), TransportConfig::Memory);

        let s3 = TransportConfig::from_vars(vars(&[
            ("BACKEND", "s3"),
            ("S3_BUCKET", "podcasts"),
            ("S3_REGION", "us-east-1"),
            ("S3_PUBLIC_BASE_URL", "https://cdn.example.com"),
        ]))
        .unwrap();
        assert!(matches!(
            s3,
            TransportConfig::S3 { ref key_prefix, .. } if key_prefix == "uploads"
        ));

        let missing = TransportConfig::from_vars(vars(&[("BACKEND", "direct")]));
        assert!(matches!(missing, Err(UploadError::Config { .. })));
    }

    #[test]
    fn test_transport_config_json() {
        let config: TransportConfig = serde_json::from_str(
            r#"{ "backend": "direct", "endpoint": "https://files.example.com", "token": "t0k" }"#,
        )
        .unwrap();
        assert_eq!(
            config,
            TransportConfig::Direct {
                endpoint: "https://files.example.com".to_string(),
                token: "t0k".to_string(),
            }
        );
    }
}
