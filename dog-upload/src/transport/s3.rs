use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::{primitives::ByteStream as AwsByteStream, Client};
use chrono::{Datelike, Utc};
use std::env;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::TransportClient;
use crate::{
    config::ENV_PREFIX, FileSource, StorageHandle, TransportConfig, TransportError, UploadError,
    UploadRequest, UploadResult, UploadTarget,
};

/// Static credentials, when the deployment does not use the default AWS chain
#[derive(Debug)]
struct S3Credentials {
    access_key_id: String,
    secret_access_key: String,
}

impl S3Credentials {
    fn from_env() -> Option<Self> {
        fn get_env(key: &str) -> Option<String> {
            env::var(format!("{ENV_PREFIX}{key}")).ok().filter(|v| !v.is_empty())
        }

        Some(Self {
            access_key_id: get_env("S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("S3_SECRET_ACCESS_KEY")?,
        })
    }
}

/// First-party object storage through the AWS SDK (S3 and S3-compatible stores)
#[derive(Clone)]
pub struct S3Transport {
    client: Client,
    bucket: String,
    public_base_url: String,
    key_prefix: String,
}

impl S3Transport {
    /// Build a client from an `s3` transport config
    pub async fn connect(config: &TransportConfig) -> UploadResult<Self> {
        let TransportConfig::S3 {
            bucket,
            region,
            endpoint_url,
            public_base_url,
            key_prefix,
        } = config
        else {
            return Err(UploadError::config("S3Transport requires an s3 transport config"));
        };

        let credentials = S3Credentials::from_env();
        let client = Self::create_client(region, endpoint_url.as_deref(), credentials).await;
        Ok(Self::from_client(client, bucket, public_base_url, key_prefix))
    }

    /// Wrap an already configured client
    pub fn from_client<B, U, P>(
        client: Client,
        bucket: B,
        public_base_url: U,
        key_prefix: P,
    ) -> Self
    where
        B: Into<String>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            client,
            bucket: bucket.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            key_prefix: key_prefix.into().trim_matches('/').to_string(),
        }
    }

    async fn create_client(
        region: &str,
        endpoint_url: Option<&str>,
        credentials: Option<S3Credentials>,
    ) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));

        if let Some(creds) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id,
                creds.secret_access_key,
                None,
                None,
                "dog-upload",
            ));
        }
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let aws_config = loader.load().await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                // S3-compatible stores (RustFS, MinIO) address buckets by path
                .force_path_style(endpoint_url.is_some())
                .build(),
        )
    }

    fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> TransportError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::ServiceError(service) => {
                TransportError::server(Some(service.raw().status().as_u16()), message)
            }
            SdkError::ResponseError(response) => {
                TransportError::server(Some(response.raw().status().as_u16()), message)
            }
            _ => TransportError::network(message),
        }
    }
}

/// `{prefix}/{yyyy}/{mm}/{uuid}-{file_name}`
fn object_key(prefix: &str, file_name: &str) -> String {
    let now = Utc::now();
    let name = sanitize_file_name(file_name);
    let id = Uuid::new_v4().simple();
    if prefix.is_empty() {
        format!("{:04}/{:02}/{}-{}", now.year(), now.month(), id, name)
    } else {
        format!("{}/{:04}/{:02}/{}-{}", prefix, now.year(), now.month(), id, name)
    }
}

/// Keep keys URL-safe without losing the recognisable part of the name
fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '-' })
        .collect();
    if cleaned.trim_matches('-').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl TransportClient for S3Transport {
    async fn obtain_upload_target(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadTarget, TransportError> {
        Ok(UploadTarget::new(object_key(&self.key_prefix, &request.file_name)))
    }

    #[instrument(
        skip(self, request),
        fields(bucket = %self.bucket, key = %target.key, size = request.size_bytes)
    )]
    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        request: &UploadRequest,
    ) -> Result<StorageHandle, TransportError> {
        let body = match &request.source {
            FileSource::Bytes(data) => AwsByteStream::from(data.clone()),
            FileSource::Path(path) => AwsByteStream::from_path(path).await.map_err(|e| {
                TransportError::network(format!("failed to open {}: {e}", path.display()))
            })?,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&target.key)
            .content_type(&request.mime_type)
            .content_length(request.size_bytes as i64)
            .metadata("filename", &request.file_name)
            .body(body)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        debug!("Object stored");
        Ok(StorageHandle::new(target.key.clone()))
    }

    async fn resolve_url(&self, handle: &StorageHandle) -> Result<Option<String>, TransportError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(handle.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(Some(format!("{}/{}", self.public_base_url, handle.as_str()))),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(Self::map_sdk_error(err)),
        }
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        let key = object_key("uploads", "Episode 12.mp3");
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "uploads");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 2);
        assert!(parts[3].ends_with("-Episode-12.mp3"));
    }

    #[test]
    fn test_object_key_without_prefix() {
        assert_eq!(object_key("", "a.wav").split('/').count(), 3);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("my show (final).mp3"), "my-show--final-.mp3");
        assert_eq!(sanitize_file_name("???"), "upload");
    }
}
