//! Storage backends.
//!
//! The orchestrator only ever sees `Arc<dyn TransportClient>`; which backend
//! sits behind it is decided by [`TransportConfig`] through [`connect`].

pub mod direct;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    StorageHandle, TransportConfig, TransportError, UploadRequest, UploadResult, UploadTarget,
};

pub use direct::DirectUploadTransport;
pub use memory::{MemoryTransport, TransportCalls};
#[cfg(feature = "s3")]
pub use s3::S3Transport;

/// "Get an upload target, push bytes, later resolve a public URL"
/// against a concrete storage backend.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Ask the backend where the next upload should go
    async fn obtain_upload_target(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadTarget, TransportError>;

    /// Push the file's bytes to `target`
    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        request: &UploadRequest,
    ) -> Result<StorageHandle, TransportError>;

    /// Public URL for uploaded bytes.
    ///
    /// Idempotent. `Ok(None)` means "not available yet", which is not an error.
    async fn resolve_url(&self, handle: &StorageHandle) -> Result<Option<String>, TransportError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Build the backend selected by `config`
pub async fn connect(config: &TransportConfig) -> UploadResult<Arc<dyn TransportClient>> {
    match config {
        TransportConfig::Memory => Ok(Arc::new(MemoryTransport::new())),
        TransportConfig::Direct { endpoint, token } => {
            Ok(Arc::new(DirectUploadTransport::new(endpoint, token)?))
        }
        #[cfg(feature = "s3")]
        TransportConfig::S3 { .. } => Ok(Arc::new(S3Transport::connect(config).await?)),
        #[cfg(not(feature = "s3"))]
        TransportConfig::S3 { .. } => Err(crate::UploadError::config(
            "S3 backend requested but dog-upload was built without the `s3` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let transport = connect(&TransportConfig::Memory).await.unwrap();
        assert_eq!(transport.name(), "memory");
    }

    #[tokio::test]
    async fn test_connect_direct() {
        let transport = connect(&TransportConfig::Direct {
            endpoint: "files.example.com/".to_string(),
            token: "secret".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(transport.name(), "direct");
    }
}
