use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::TransportClient;
use crate::{StorageHandle, TransportError, UploadError, UploadRequest, UploadResult, UploadTarget};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignRequest<'a> {
    file_name: &'a str,
    content_type: &'a str,
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    upload_url: String,
    file_key: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    url: Option<String>,
}

/// Third-party CDN upload API: presign a slot, PUT the bytes to it, then
/// poll the file record until the CDN publishes a URL.
///
/// The bearer token only goes to the upload API. The presigned URL already
/// carries its own signature and never sees it.
#[derive(Debug, Clone)]
pub struct DirectUploadTransport {
    client: Client,
    base_url: String,
    auth: HeaderValue,
}

impl DirectUploadTransport {
    pub fn new(endpoint: &str, token: &str) -> UploadResult<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| UploadError::config("direct upload token contains invalid characters"))?;
        auth.set_sensitive(true);

        let client = Client::builder()
            .build()
            .map_err(|e| UploadError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_url(endpoint),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn normalize_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn send_error(err: reqwest::Error) -> TransportError {
    match err.status() {
        Some(status) => TransportError::server(Some(status.as_u16()), err.to_string()),
        None => TransportError::network(err.to_string()),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    let reason = status.canonical_reason().unwrap_or("unexpected status");
    if body.trim().is_empty() {
        TransportError::server(Some(status.as_u16()), reason)
    } else {
        TransportError::server(Some(status.as_u16()), format!("{reason}: {}", body.trim()))
    }
}

#[async_trait]
impl TransportClient for DirectUploadTransport {
    async fn obtain_upload_target(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadTarget, TransportError> {
        let response = self
            .client
            .post(self.url("/api/uploads/presign"))
            .header(AUTHORIZATION, self.auth.clone())
            .json(&PresignRequest {
                file_name: &request.file_name,
                content_type: &request.mime_type,
                size: request.size_bytes,
            })
            .send()
            .await
            .map_err(send_error)?;

        let presigned: PresignResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(send_error)?;
        Ok(UploadTarget::new(presigned.file_key).with_upload_url(presigned.upload_url))
    }

    #[instrument(skip(self, request), fields(key = %target.key, size = request.size_bytes))]
    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        request: &UploadRequest,
    ) -> Result<StorageHandle, TransportError> {
        let upload_url = target
            .upload_url
            .as_deref()
            .ok_or_else(|| TransportError::server(None, "presign response carried no upload URL"))?;

        let body = request
            .read_bytes()
            .await
            .map_err(|e| TransportError::network(format!("failed to read upload body: {e}")))?;

        let response = self
            .client
            .put(upload_url)
            .header(CONTENT_TYPE, &request.mime_type)
            .body(body)
            .send()
            .await
            .map_err(send_error)?;
        check_status(response).await?;

        debug!("CDN accepted upload");
        Ok(StorageHandle::new(target.key.clone()))
    }

    async fn resolve_url(&self, handle: &StorageHandle) -> Result<Option<String>, TransportError> {
        let response = self
            .client
            .get(self.url(&format!("/api/uploads/{}", handle.as_str())))
            .header(AUTHORIZATION, self.auth.clone())
            .send()
            .await
            .map_err(send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let file: FileResponse = check_status(response).await?.json().await.map_err(send_error)?;
        Ok(file.url.filter(|u| !u.is_empty()))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> UploadRequest {
        UploadRequest::from_bytes("ep.mp3", "audio/mpeg", Bytes::from_static(b"ID3 data"))
    }

    fn transport(server: &MockServer) -> DirectUploadTransport {
        DirectUploadTransport::new(&server.uri(), "secret-token").unwrap()
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("files.example.com/"), "https://files.example.com");
        assert_eq!(normalize_url("http://localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_url(" https://cdn.example.com// "), "https://cdn.example.com");
    }

    #[test]
    fn test_status_error_maps_to_server_error() {
        let err = status_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err, TransportError::server(Some(502), "Bad Gateway"));

        let err = status_error(StatusCode::FORBIDDEN, " token expired \n");
        assert_eq!(err.to_string(), "Server error (HTTP 403): Forbidden: token expired");
    }

    #[test]
    fn test_invalid_token_is_a_config_error() {
        let err = DirectUploadTransport::new("files.example.com", "bad\ntoken").unwrap_err();
        assert!(matches!(err, UploadError::Config { .. }));
    }

    #[test]
    fn test_presign_request_shape() {
        let json = serde_json::to_value(PresignRequest {
            file_name: "ep.mp3",
            content_type: "audio/mpeg",
            size: 42,
        })
        .unwrap();
        assert_eq!(json["fileName"], "ep.mp3");
        assert_eq!(json["contentType"], "audio/mpeg");
        assert_eq!(json["size"], 42);
    }

    #[tokio::test]
    async fn test_presign_returns_upload_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/uploads/presign"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_json(json!({ "fileName": "ep.mp3", "contentType": "audio/mpeg", "size": 8 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": "https://bucket.cdn.example/ep.mp3?X-Amz-Signature=abc",
                "fileKey": "file_123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let target = transport(&server).obtain_upload_target(&request()).await.unwrap();

        assert_eq!(target.key, "file_123");
        assert_eq!(
            target.upload_url.as_deref(),
            Some("https://bucket.cdn.example/ep.mp3?X-Amz-Signature=abc")
        );
    }

    #[tokio::test]
    async fn test_presigned_put_carries_no_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/presigned"))
            .and(header("content-type", "audio/mpeg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let target = UploadTarget::new("file_123")
            .with_upload_url(format!("{}/presigned?X-Amz-Signature=abc", server.uri()));
        let handle = transport(&server).upload_bytes(&target, &request()).await.unwrap();
        assert_eq!(handle.as_str(), "file_123");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("authorization").is_none());
        assert_eq!(received[0].body, b"ID3 data".to_vec());
    }

    #[tokio::test]
    async fn test_rejected_put_is_a_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("signature expired"))
            .mount(&server)
            .await;

        let target =
            UploadTarget::new("file_123").with_upload_url(format!("{}/presigned", server.uri()));
        let err = transport(&server).upload_bytes(&target, &request()).await.unwrap_err();

        assert_eq!(err, TransportError::server(Some(403), "Forbidden: signature expired"));
    }

    #[tokio::test]
    async fn test_resolve_not_found_and_null_url_are_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/uploads/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/uploads/pending"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "url": null })))
            .mount(&server)
            .await;

        let transport = transport(&server);
        let missing = transport.resolve_url(&StorageHandle::new("missing")).await.unwrap();
        let pending = transport.resolve_url(&StorageHandle::new("pending")).await.unwrap();

        assert_eq!(missing, None);
        assert_eq!(pending, None);
    }

    #[tokio::test]
    async fn test_resolve_returns_published_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/uploads/file_123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "url": "https://cdn.example/f/file_123" })),
            )
            .mount(&server)
            .await;

        let url = transport(&server).resolve_url(&StorageHandle::new("file_123")).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://cdn.example/f/file_123"));
    }

    #[tokio::test]
    async fn test_resolve_server_failure_is_a_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport(&server)
            .resolve_url(&StorageHandle::new("file_123"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::ServerError);
        assert_eq!(err, TransportError::server(Some(503), "Service Unavailable"));
    }
}
