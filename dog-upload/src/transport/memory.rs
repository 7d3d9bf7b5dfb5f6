use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::TransportClient;
use crate::{StorageHandle, TransportError, UploadRequest, UploadTarget};

/// Call counters, for asserting on what the orchestrator did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportCalls {
    pub targets: u32,
    pub uploads_started: u32,
    pub uploads_completed: u32,
    pub resolves: u32,
    /// Highest number of calls that were outstanding at once
    pub max_in_flight: u32,
}

impl TransportCalls {
    /// Every call that reached the backend
    pub fn total(&self) -> u32 {
        self.targets + self.uploads_started + self.resolves
    }
}

#[derive(Debug, Default)]
struct Behavior {
    upload_latency: Duration,
    resolve_latency: Duration,
    target_failures: VecDeque<TransportError>,
    upload_failures: VecDeque<TransportError>,
    resolve_failures: VecDeque<TransportError>,
    /// `resolve_url` answers `None` this many times per handle before the URL appears
    pending_resolves: u32,
    never_resolves: bool,
}

#[derive(Debug, Default)]
struct Counters {
    calls: TransportCalls,
    in_flight: u32,
}

/// In-process backend.
///
/// Stores bytes in a map and lets callers script latency, failures and
/// eventual consistency of the public URL.
#[derive(Debug)]
pub struct MemoryTransport {
    objects: RwLock<HashMap<String, Bytes>>,
    polls: Mutex<HashMap<String, u32>>,
    behavior: Mutex<Behavior>,
    counters: Mutex<Counters>,
    public_base_url: String,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::default()),
            counters: Mutex::new(Counters::default()),
            public_base_url: "memory://assets".to_string(),
        }
    }

    pub fn with_public_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.public_base_url = url.into();
        self
    }

    /// How long `upload_bytes` takes to settle
    pub fn set_upload_latency(&self, latency: Duration) {
        self.behavior.lock().upload_latency = latency;
    }

    /// How long each `resolve_url` call takes to settle
    pub fn set_resolve_latency(&self, latency: Duration) {
        self.behavior.lock().resolve_latency = latency;
    }

    pub fn fail_next_target(&self, error: TransportError) {
        self.behavior.lock().target_failures.push_back(error);
    }

    pub fn fail_next_upload(&self, error: TransportError) {
        self.behavior.lock().upload_failures.push_back(error);
    }

    pub fn fail_next_resolve(&self, error: TransportError) {
        self.behavior.lock().resolve_failures.push_back(error);
    }

    /// Answer `None` to the first `count` resolve calls of each handle
    pub fn set_pending_resolves(&self, count: u32) {
        self.behavior.lock().pending_resolves = count;
    }

    /// Never publish a URL
    pub fn set_never_resolves(&self, never: bool) {
        self.behavior.lock().never_resolves = never;
    }

    pub fn calls(&self) -> TransportCalls {
        self.counters.lock().calls.clone()
    }

    /// Stored object content, if the upload completed
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn enter(&self, count: impl FnOnce(&mut TransportCalls)) -> InFlight<'_> {
        let mut counters = self.counters.lock();
        count(&mut counters.calls);
        counters.in_flight += 1;
        counters.calls.max_in_flight = counters.calls.max_in_flight.max(counters.in_flight);
        InFlight { counters: &self.counters }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count even when the call's future is dropped
struct InFlight<'a> {
    counters: &'a Mutex<Counters>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counters.lock().in_flight -= 1;
    }
}

#[async_trait]
impl TransportClient for MemoryTransport {
    async fn obtain_upload_target(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadTarget, TransportError> {
        let _guard = self.enter(|c| c.targets += 1);

        if let Some(err) = self.behavior.lock().target_failures.pop_front() {
            return Err(err);
        }

        Ok(UploadTarget::new(format!("{}/{}", Uuid::new_v4().simple(), request.file_name)))
    }

    async fn upload_bytes(
        &self,
        target: &UploadTarget,
        request: &UploadRequest,
    ) -> Result<StorageHandle, TransportError> {
        let _guard = self.enter(|c| c.uploads_started += 1);

        let (latency, failure) = {
            let mut behavior = self.behavior.lock();
            (behavior.upload_latency, behavior.upload_failures.pop_front())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let data = request
            .read_bytes()
            .await
            .map_err(|e| TransportError::network(format!("failed to read upload body: {e}")))?;

        self.objects.write().insert(target.key.clone(), data);
        self.counters.lock().calls.uploads_completed += 1;
        debug!("Stored {} bytes under {}", request.size_bytes, target.key);

        Ok(StorageHandle::new(target.key.clone()))
    }

    async fn resolve_url(&self, handle: &StorageHandle) -> Result<Option<String>, TransportError> {
        let _guard = self.enter(|c| c.resolves += 1);

        let latency = self.behavior.lock().resolve_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let seen = {
            let mut polls = self.polls.lock();
            let seen = polls.entry(handle.as_str().to_string()).or_insert(0);
            *seen += 1;
            *seen
        };

        let (failure, pending, never) = {
            let mut behavior = self.behavior.lock();
            (
                behavior.resolve_failures.pop_front(),
                behavior.pending_resolves,
                behavior.never_resolves,
            )
        };

        if let Some(err) = failure {
            return Err(err);
        }
        if never || seen <= pending || !self.objects.read().contains_key(handle.as_str()) {
            return Ok(None);
        }

        Ok(Some(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            handle.as_str()
        )))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
