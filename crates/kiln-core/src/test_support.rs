//! Test support utilities for kiln-core
//!
//! Provides MockEngine and helpers for unit testing the build worker and
//! lifecycle without a real container engine.

use async_trait::async_trait;
use kiln_engine::*;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    PullImage { image: String },
    ImageExists { image: String },
    ResolveImage { name: String },
    RemoveImage { id: String, force: bool },
    TagImage { image: String, repo: String, tag: String },
    CommitContainer { id: String, repo: String, tag: String },
    BuildImage { tag: String },
    PushImage { image_ref: String, with_credentials: bool },
    StartContainer { image: String, name: Option<String> },
    StopContainer { id: String },
    RemoveContainer { id: String, force: bool },
    InspectContainer { id: String },
    ContainerLogs { id: String },
    CreateNetwork { name: String },
    RemoveNetwork { id: String },
    Events,
    Ping,
}

/// Configurable mock container engine for testing
pub struct MockEngine {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Result for pull calls
    pub pull_result: Arc<Mutex<Result<ImageId>>>,
    /// Images `image_exists` reports as present
    pub existing_images: Arc<Mutex<HashSet<String>>>,
    /// Logical name to image ID mapping used by `resolve_image`
    pub image_ids: Arc<Mutex<HashMap<String, ImageId>>>,
    /// Result for remove_image calls
    pub remove_image_result: Arc<Mutex<Result<()>>>,
    /// Result for tag calls
    pub tag_result: Arc<Mutex<Result<()>>>,
    /// Result for commit calls
    pub commit_result: Arc<Mutex<Result<ImageId>>>,
    /// Result for build calls
    pub build_result: Arc<Mutex<Result<ImageId>>>,
    /// Result for push calls
    pub push_result: Arc<Mutex<Result<()>>>,
    /// Error for start calls (if Some, start_container returns this error)
    pub start_error: Arc<Mutex<Option<EngineError>>>,
    /// Result for stop calls
    pub stop_result: Arc<Mutex<Result<()>>>,
    /// Result for remove_container calls
    pub remove_container_result: Arc<Mutex<Result<()>>>,
    /// Exit code per container ID, used by inspect_container (default 0)
    pub exit_codes: Arc<Mutex<HashMap<String, i64>>>,
    /// Error for inspect calls (if Some, inspect returns this error)
    pub inspect_error: Arc<Mutex<Option<EngineError>>>,
    /// Result for create_network calls
    pub network_result: Arc<Mutex<Result<NetworkId>>>,
    /// Result for remove_network calls
    pub remove_network_result: Arc<Mutex<Result<()>>>,
    /// Result for ping calls
    pub ping_result: Arc<Mutex<Result<()>>>,
    /// When set, every started container immediately emits a `die` event
    pub auto_complete: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<Result<ContainerEvent>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<ContainerEvent>>>>,
    next_container: AtomicUsize,
}

impl MockEngine {
    /// Create a new mock engine with default success results
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            pull_result: Arc::new(Mutex::new(Ok(ImageId::new("sha256:mock_pulled_id")))),
            existing_images: Arc::new(Mutex::new(HashSet::new())),
            image_ids: Arc::new(Mutex::new(HashMap::new())),
            remove_image_result: Arc::new(Mutex::new(Ok(()))),
            tag_result: Arc::new(Mutex::new(Ok(()))),
            commit_result: Arc::new(Mutex::new(Ok(ImageId::new("sha256:mock_cache_id")))),
            build_result: Arc::new(Mutex::new(Ok(ImageId::new("sha256:mock_image_id")))),
            push_result: Arc::new(Mutex::new(Ok(()))),
            start_error: Arc::new(Mutex::new(None)),
            stop_result: Arc::new(Mutex::new(Ok(()))),
            remove_container_result: Arc::new(Mutex::new(Ok(()))),
            exit_codes: Arc::new(Mutex::new(HashMap::new())),
            inspect_error: Arc::new(Mutex::new(None)),
            network_result: Arc::new(Mutex::new(Ok(NetworkId::new("mock_network_id")))),
            remove_network_result: Arc::new(Mutex::new(Ok(()))),
            ping_result: Arc::new(Mutex::new(Ok(()))),
            auto_complete: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            next_container: AtomicUsize::new(0),
        }
    }

    /// Record a call
    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Check if a specific call was made
    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Inject a lifecycle event into the stream served by `events`
    pub fn send_event(&self, id: &str, action: EventAction) {
        let _ = self.event_tx.send(Ok(ContainerEvent {
            id: ContainerId::new(id),
            action,
        }));
    }

    /// Every container started from now on completes at once with `die`
    pub fn complete_containers_immediately(&self) {
        self.auto_complete.store(true, Ordering::SeqCst);
    }

    /// Set the exit code inspect reports for a container
    pub fn set_exit_code(&self, id: &str, code: i64) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(id.to_string(), code);
    }

    /// Mark an image as present locally
    pub fn add_existing_image(&self, reference: &str) {
        self.existing_images
            .lock()
            .unwrap()
            .insert(reference.to_string());
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to clone a Result<T> from an Arc<Mutex<Result<T>>>
fn clone_result<T: Clone>(r: &Arc<Mutex<Result<T>>>) -> Result<T> {
    let guard = r.lock().unwrap();
    match &*guard {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(clone_engine_error(e)),
    }
}

/// Clone an EngineError (thiserror types don't implement Clone)
pub fn clone_engine_error(e: &EngineError) -> EngineError {
    match e {
        EngineError::ConnectionError(s) => EngineError::ConnectionError(s.clone()),
        EngineError::ContainerNotFound(s) => EngineError::ContainerNotFound(s.clone()),
        EngineError::ImageNotFound(s) => EngineError::ImageNotFound(s.clone()),
        EngineError::BuildError(s) => EngineError::BuildError(s.clone()),
        EngineError::PushError(s) => EngineError::PushError(s.clone()),
        EngineError::RuntimeError(s) => EngineError::RuntimeError(s.clone()),
        EngineError::InvalidSpec(s) => EngineError::InvalidSpec(s.clone()),
        EngineError::IoError(_) => EngineError::RuntimeError("IO error (cloned)".into()),
    }
}

/// A no-op async reader for mock log streams
struct EmptyReader;

impl AsyncRead for EmptyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> Result<ImageId> {
        self.record(MockCall::PullImage {
            image: image.to_string(),
        });
        clone_result(&self.pull_result)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(MockCall::ImageExists {
            image: image.to_string(),
        });
        Ok(self.existing_images.lock().unwrap().contains(image))
    }

    async fn resolve_image(&self, name: &str) -> Result<Option<ImageId>> {
        self.record(MockCall::ResolveImage {
            name: name.to_string(),
        });
        Ok(self.image_ids.lock().unwrap().get(name).cloned())
    }

    async fn remove_image(&self, id: &ImageId, force: bool) -> Result<()> {
        self.record(MockCall::RemoveImage {
            id: id.0.clone(),
            force,
        });
        clone_result(&self.remove_image_result)
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        self.record(MockCall::TagImage {
            image: image.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
        });
        clone_result(&self.tag_result)
    }

    async fn commit_container(&self, id: &ContainerId, repo: &str, tag: &str) -> Result<ImageId> {
        self.record(MockCall::CommitContainer {
            id: id.0.clone(),
            repo: repo.to_string(),
            tag: tag.to_string(),
        });
        clone_result(&self.commit_result)
    }

    async fn build_image(
        &self,
        spec: &ImageBuildSpec,
        _progress: mpsc::UnboundedSender<String>,
    ) -> Result<ImageId> {
        self.record(MockCall::BuildImage {
            tag: spec.tag.clone(),
        });
        clone_result(&self.build_result)
    }

    async fn push_image(
        &self,
        image_ref: &str,
        credentials: Option<RegistryCredentials>,
        _progress: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        self.record(MockCall::PushImage {
            image_ref: image_ref.to_string(),
            with_credentials: credentials.is_some(),
        });
        clone_result(&self.push_result)
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.record(MockCall::StartContainer {
            image: spec.image.clone(),
            name: spec.name.clone(),
        });
        if let Some(err) = self.start_error.lock().unwrap().as_ref() {
            return Err(clone_engine_error(err));
        }
        let n = self.next_container.fetch_add(1, Ordering::SeqCst);
        let id = ContainerId::new(format!("mock-container-{}", n));
        if self.auto_complete.load(Ordering::SeqCst) {
            self.send_event(&id.0, EventAction::Die);
        }
        Ok(id)
    }

    async fn stop_container(&self, id: &ContainerId, _timeout: Option<u32>) -> Result<()> {
        self.record(MockCall::StopContainer { id: id.0.clone() });
        clone_result(&self.stop_result)
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        self.record(MockCall::RemoveContainer {
            id: id.0.clone(),
            force,
        });
        clone_result(&self.remove_container_result)
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerProcessState> {
        self.record(MockCall::InspectContainer { id: id.0.clone() });
        if let Some(err) = self.inspect_error.lock().unwrap().as_ref() {
            return Err(clone_engine_error(err));
        }
        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .get(&id.0)
            .copied()
            .unwrap_or(0);
        Ok(ContainerProcessState {
            running: false,
            exit_code: Some(exit_code),
        })
    }

    async fn container_logs(&self, id: &ContainerId, _follow: bool) -> Result<LogStream> {
        self.record(MockCall::ContainerLogs { id: id.0.clone() });
        Ok(LogStream {
            stream: Box::pin(EmptyReader),
        })
    }

    async fn create_network(&self, name: &str) -> Result<NetworkId> {
        self.record(MockCall::CreateNetwork {
            name: name.to_string(),
        });
        clone_result(&self.network_result)
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<()> {
        self.record(MockCall::RemoveNetwork { id: id.0.clone() });
        clone_result(&self.remove_network_result)
    }

    fn events(&self) -> EventStream {
        self.record(MockCall::Events);
        match self.event_rx.lock().unwrap().take() {
            Some(mut rx) => Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.record(MockCall::Ping);
        clone_result(&self.ping_result)
    }
}
