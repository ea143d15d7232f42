//! Container-backed build worker
//!
//! `BuildWorker` drives one run end to end: it assembles container specs
//! from the build file (Configure), starts the run network and service
//! containers (Setup), runs the build steps concurrently and waits on
//! engine lifecycle events (Build), builds artifact images
//! (GenerateArtifacts), pushes them (Publish) and cleans everything up
//! (Teardown). All state is in memory; nothing survives the process.

use crate::{
    cache, merge_errors, version, CacheDescriptor, ContainerRole, ContainerState, CoreError,
    Result, StateSet, StepStatus,
};
use kiln_config::BuildSpec;
use kiln_engine::{
    registry_from_image, ContainerEngine, ContainerId, ContainerSpec, EventAction, ImageBuildSpec,
    MountSpec, NetworkId, PortSpec, RegistryAuthConfig, RegistryCredentials,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot, watch};

use async_trait::async_trait;
use futures::StreamExt;

/// Grace period when stopping containers on abort
const STOP_TIMEOUT_SECS: u32 = 5;

/// Containers may 404 on log requests immediately after start
const LOG_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the Build wait
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Engine socket mounted into build containers when requested
const ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// Cooperative cancellation signal shared between the worker, its spawned
/// tasks and the signal handler.
///
/// Carries both a level (the flag, for points that poll) and an edge (the
/// watch channel, for tasks parked in `select!`), so a request that lands
/// before the wait starts is still observed.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(true);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_aborted() || *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender kept alive by self; unreachable without an abort
        std::future::pending::<()>().await;
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Performs all work for one run against a container engine
pub struct BuildWorker {
    engine: Arc<dyn ContainerEngine>,
    spec: Option<BuildSpec>,
    services: Vec<ContainerState>,
    builds: Arc<StateSet>,
    network: Option<NetworkId>,
    abort: AbortHandle,
    auth: RegistryAuthConfig,
    build_timeout: Duration,
}

impl BuildWorker {
    /// Worker with registry credentials read from the user's docker config
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self::with_auth(engine, RegistryAuthConfig::load())
    }

    pub fn with_auth(engine: Arc<dyn ContainerEngine>, auth: RegistryAuthConfig) -> Self {
        Self {
            engine,
            spec: None,
            services: Vec::new(),
            builds: Arc::new(StateSet::new(Vec::new())),
            network: None,
            abort: AbortHandle::new(),
            auth,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    pub fn set_build_timeout(&mut self, timeout: Duration) {
        self.build_timeout = timeout;
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn spec(&self) -> Result<&BuildSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState("worker not configured".to_string()))
    }

    /// Assemble service container specs, generating names for services
    /// declared without one.
    fn assemble_services(spec: &BuildSpec, network: &str) -> Result<Vec<ContainerState>> {
        let mut taken = std::collections::HashSet::new();
        for step in &spec.services {
            if step.name.is_empty() {
                continue;
            }
            if !taken.insert(step.name.clone()) {
                return Err(CoreError::DuplicateServiceName(step.name.clone()));
            }
        }

        let mut states = Vec::with_capacity(spec.services.len());
        let mut counter = 0usize;
        for step in &spec.services {
            let mut cs = ContainerSpec::new(&step.image);
            cs.cmd = step.commands.clone();
            cs.env = step.env_strings()?;
            for volume in &step.volumes {
                cs.mounts.push(MountSpec::parse(volume)?);
            }
            cs.network = Some(network.to_string());

            let name = if step.name.is_empty() {
                loop {
                    let candidate = format!(
                        "{}.{}.auto{}",
                        image_base_name(&step.image),
                        spec.repo_name,
                        counter
                    );
                    counter += 1;
                    if taken.insert(candidate.clone()) {
                        break candidate;
                    }
                }
            } else {
                step.name.clone()
            };
            cs.name = Some(name.clone());

            states.push(ContainerState::new(cs, ContainerRole::Service, name));
        }
        Ok(states)
    }

    /// Assemble build step container specs
    fn assemble_builds(spec: &BuildSpec, network: &str) -> Result<Vec<ContainerState>> {
        let run_name = spec.run_name();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let mut states = Vec::with_capacity(spec.build.len());
        for (i, step) in spec.build.iter().enumerate() {
            let mut cs = ContainerSpec::new(&step.image);
            cs.cmd = vec![step.shell.clone(), "-cex".to_string(), step.script()];
            cs.working_dir = Some(step.workdir.clone());
            cs.env = step.env_strings()?;
            cs.mounts
                .push(MountSpec::bind(&spec.context, &step.workdir));
            for volume in &step.volumes {
                cs.mounts.push(MountSpec::parse(volume)?);
            }
            if spec.engine_access {
                cs.mounts.push(MountSpec::bind(ENGINE_SOCKET, ENGINE_SOCKET));
            }
            for port in &step.ports {
                cs.ports.push(PortSpec::parse(port)?);
            }
            cs.network = Some(network.to_string());

            let name = format!("{}-{}-{}", run_name, i, nanos);
            cs.name = Some(name.clone());

            let mut state = ContainerState::new(cs, ContainerRole::Build, name);
            state.save = step.save;
            state.cleanup = step.cleanup;
            if step.cache {
                let key = cache::compute_key(&state.spec)?;
                state.cache = Some(CacheDescriptor::new(&spec.repo_name, key));
            }
            states.push(state);
        }
        Ok(states)
    }

    /// Stop all started build containers with the abort grace period
    async fn stop_build_containers(&self) -> Option<CoreError> {
        let mut err = None;
        for state in self.builds.snapshot() {
            let Some(id) = state.id else { continue };
            tracing::info!("[build] Stopping container: {}", id.short());
            if let Err(e) = self
                .engine
                .stop_container(&id, Some(STOP_TIMEOUT_SECS))
                .await
            {
                err = merge_errors(err, Some(e.into()));
            }
        }
        err
    }

    /// Commit successful cached steps to their cache images
    async fn populate_cache(&self) -> Option<CoreError> {
        let mut err = None;
        for state in self.builds.snapshot() {
            if !state.status.is_success() {
                continue;
            }
            let (Some(id), Some(cache)) = (&state.id, &state.cache) else {
                continue;
            };
            tracing::debug!("[build/{}] Caching as {}", state.short_name, cache.reference());
            if let Err(e) = self
                .engine
                .commit_container(id, &cache.image, &cache.tag)
                .await
            {
                err = merge_errors(
                    err,
                    Some(CoreError::BuildFailed(format!(
                        "cache failed: {}: {}",
                        cache.reference(),
                        e
                    ))),
                );
            }
        }
        err
    }

    /// Resolve the artifact images addressed by `names` (all when empty).
    /// Every name must exist before any work starts.
    fn select_artifacts(&self, names: &[String]) -> Result<Vec<kiln_config::ArtifactImage>> {
        let artifacts = &self.spec()?.artifacts;
        if names.is_empty() {
            return Ok(artifacts.images.clone());
        }
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let image = artifacts
                .image(name)
                .ok_or_else(|| CoreError::NoSuchArtifact(name.clone()))?;
            selected.push(image.clone());
        }
        Ok(selected)
    }

    async fn build_artifact(&self, image: &kiln_config::ArtifactImage) -> Result<()> {
        let mut names = image.local_names();
        for path in image.registry_paths() {
            if !names.contains(&path) {
                names.push(path);
            }
        }
        let primary = names.remove(0);

        let build_spec = ImageBuildSpec {
            context: image.context.clone().into(),
            dockerfile: image.dockerfile.clone(),
            tag: primary.clone(),
            use_cache: image.cache,
            pull: false,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let prefix = format!("[artifacts/{}]", image.name);
        let progress = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                tracing::info!("{} {}", prefix, line);
            }
        });

        let built = tokio::select! {
            result = self.engine.build_image(&build_spec, tx) => result,
            _ = self.abort.wait() => {
                tracing::info!("[artifacts] Aborting...");
                if let Some(e) = self.remove_built_artifacts().await {
                    tracing::warn!("[artifacts] Cleanup: {}", e);
                }
                progress.abort();
                return Err(CoreError::Aborted);
            }
        };
        let _ = progress.await;
        let built = built?;

        // Apply the remaining names to the built image
        for name in &names {
            let (repo, tag) = split_reference(name);
            self.engine.tag_image(&built.0, repo, tag).await?;
        }
        Ok(())
    }

    /// Remove the local images of all declared artifacts, tolerating ones
    /// that were never built.
    async fn remove_built_artifacts(&self) -> Option<CoreError> {
        let Ok(spec) = self.spec() else { return None };
        let mut err = None;
        for image in &spec.artifacts.images {
            match self.engine.resolve_image(&image.name).await {
                Ok(Some(id)) => {
                    if let Err(e) = self.engine.remove_image(&id, true).await {
                        err = merge_errors(err, Some(e.into()));
                    }
                }
                Ok(None) => {}
                Err(e) => err = merge_errors(err, Some(e.into())),
            }
        }
        err
    }

    /// Credentials for a push, resolved from the registry host embedded
    /// in the reference; unprefixed references push to Docker Hub.
    fn credentials_for(&self, reference: &str) -> Option<RegistryCredentials> {
        match registry_from_image(reference) {
            Some(host) => self.auth.resolve(&host),
            None => self.auth.hub_credentials(),
        }
    }

    async fn push_reference(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let prefix = format!("[publish/{}]", reference);
        let progress = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                tracing::info!("{} {}", prefix, line);
            }
        });
        let result = self.engine.push_image(reference, credentials, tx).await;
        let _ = progress.await;
        result.map_err(Into::into)
    }

    /// Remove an image by its logical name, skipping images that do not
    /// exist locally.
    async fn remove_image_by_name(&self, name: &str) -> Option<CoreError> {
        match self.engine.resolve_image(name).await {
            Ok(Some(id)) => match self.engine.remove_image(&id, true).await {
                Ok(()) => None,
                Err(e) => Some(e.into()),
            },
            Ok(None) => None,
            Err(e) => Some(e.into()),
        }
    }
}

#[async_trait]
impl crate::Worker for BuildWorker {
    /// Convert the build file into container specs and cache descriptors
    async fn configure(&mut self, mut spec: BuildSpec) -> Result<()> {
        let info = version::resolve(Path::new(&spec.context));
        spec.apply_version(
            &info.version(),
            info.tag_version(),
            info.commit_short(),
            info.distance,
        );

        let network = spec.run_name();
        self.services = Self::assemble_services(&spec, &network)?;
        self.builds = Arc::new(StateSet::new(Self::assemble_builds(&spec, &network)?));
        self.spec = Some(spec);
        Ok(())
    }

    /// Create the run network and start service containers. Any failure
    /// bails out the build.
    async fn setup(&mut self) -> Result<()> {
        let network = self.spec()?.run_name();
        let id = self.engine.create_network(&network).await?;
        tracing::info!("[setup/network/{}] Created {}", network, id);
        self.network = Some(id);

        for state in &mut self.services {
            let id = self.engine.start_container(&state.spec).await?;
            tracing::info!(
                "[setup/service/{}] Started {}",
                state.name,
                state.spec.image
            );
            state.id = Some(id);
        }
        Ok(())
    }

    /// Run all build steps to completion.
    ///
    /// The event watcher is spawned before any container starts so no
    /// completion event can be missed. The wait ends on the completion
    /// signal, an abort, or the build timeout.
    async fn build(&mut self) -> Result<()> {
        if self.builds.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let watcher = spawn_event_watcher(self.engine.clone(), self.builds.clone(), done_tx);

        for index in 0..self.builds.len() {
            let state = self.builds.snapshot().into_iter().nth(index)
                .ok_or_else(|| CoreError::InvalidState("build state vanished".to_string()))?;

            // Substitute the cache image when a prior identical run exists
            let mut spec = state.spec.clone();
            if let Some(cache) = &state.cache {
                let reference = cache.reference();
                if self.engine.image_exists(&reference).await.unwrap_or(false) {
                    tracing::info!("[build/{}] Using cache {}", state.short_name, reference);
                    self.builds.set_image(index, reference.clone());
                    spec.image = reference;
                }
            }

            let id = match self.engine.start_container(&spec).await {
                Ok(id) => id,
                Err(e) => {
                    watcher.abort();
                    return Err(e.into());
                }
            };
            self.builds.set_id(index, id.clone());
            tracing::info!("[build/{}] Started", state.short_name);

            spawn_log_tail(self.engine.clone(), id, format!("[build/{}]", state.short_name));
        }

        let completed = tokio::select! {
            result = done_rx => result.is_ok(),
            _ = self.abort.wait() => {
                tracing::info!("[build] Aborting...");
                if let Some(e) = self.stop_build_containers().await {
                    tracing::error!("Stopping build containers: {}", e);
                }
                watcher.abort();
                return Err(CoreError::Aborted);
            }
            _ = tokio::time::sleep(self.build_timeout) => {
                tracing::error!("[build] Timed out after {:?}", self.build_timeout);
                if let Some(e) = self.stop_build_containers().await {
                    tracing::error!("Stopping build containers: {}", e);
                }
                watcher.abort();
                return Err(CoreError::BuildTimeout);
            }
        };
        if !completed {
            return Err(CoreError::BuildFailed(
                "engine event stream ended before completion".to_string(),
            ));
        }

        let mut err = None;
        for state in self.builds.snapshot() {
            if !state.status.is_success() {
                err = merge_errors(
                    err,
                    Some(CoreError::BuildFailed(format!(
                        "{} {}",
                        state.name, state.spec.image
                    ))),
                );
            }
        }
        err = merge_errors(err, self.populate_cache().await);

        match err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Build artifact images sequentially, applying every local and
    /// registry tag to each.
    async fn generate_artifacts(&mut self, names: &[String]) -> Result<()> {
        let images = self.select_artifacts(names)?;

        let mut err = None;
        for image in &images {
            if self.abort.is_aborted() {
                return Err(CoreError::Aborted);
            }
            tracing::info!("[artifacts/{}] Building", image.name);
            if let Err(e) = self.build_artifact(image).await {
                if matches!(e, CoreError::Aborted) {
                    return Err(e);
                }
                err = merge_errors(err, Some(e));
            }
            tracing::info!("[artifacts/{}] DONE", image.name);
        }

        match err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Push artifact images to their registries. Publishing requires
    /// credentials; pushing without them is a hard error.
    async fn publish(&mut self, names: &[String]) -> Result<()> {
        if self.auth.is_empty() {
            return Err(CoreError::MissingRegistryAuth);
        }

        let images = self.select_artifacts(names)?;
        for image in &images {
            if self.abort.is_aborted() {
                return Err(CoreError::Aborted);
            }
            for reference in image.registry_paths() {
                let credentials = self.credentials_for(&reference);
                self.push_reference(&reference, credentials).await?;
                tracing::info!("[publish/{}] Pushed", reference);
            }
        }
        Ok(())
    }

    /// Remove everything the run created. Every removal is attempted and
    /// failures are aggregated.
    async fn teardown(&mut self) -> Result<()> {
        let mut err = None;

        for state in &self.services {
            if let Some(id) = &state.id {
                if let Err(e) = self.engine.remove_container(id, true).await {
                    err = merge_errors(err, Some(e.into()));
                }
            }
        }

        for state in self.builds.snapshot() {
            if state.save {
                continue;
            }
            if let Some(id) = &state.id {
                if let Err(e) = self.engine.remove_container(id, true).await {
                    err = merge_errors(err, Some(e.into()));
                }
            }
        }

        if let Ok(spec) = self.spec() {
            let step_images: Vec<String> = spec
                .build
                .iter()
                .filter(|s| s.cleanup)
                .map(|s| s.image.clone())
                .collect();
            let artifact_names: Vec<String> = spec
                .artifacts
                .images
                .iter()
                .filter(|i| i.cleanup)
                .map(|i| i.name.clone())
                .collect();

            for image in step_images {
                err = merge_errors(err, self.remove_image_by_name(&image).await);
            }

            if let Some(network) = self.network.take() {
                if let Err(e) = self.engine.remove_network(&network).await {
                    err = merge_errors(err, Some(e.into()));
                }
            }

            for name in artifact_names {
                err = merge_errors(err, self.remove_image_by_name(&name).await);
            }
        }

        match err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Remove the local images of declared artifacts
    async fn remove_artifacts(&mut self) -> Result<()> {
        match self.remove_built_artifacts().await {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

/// Watch engine lifecycle events and mark tracked build containers done.
///
/// `destroy` unblocks without a status so a build cannot hang on a
/// container removed out from under it; `die`/`kill`/`stop` inspect for
/// the exit code. The completion signal fires once, when the last tracked
/// container finishes.
fn spawn_event_watcher(
    engine: Arc<dyn ContainerEngine>,
    states: Arc<StateSet>,
    done: oneshot::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = engine.events();
        let mut done = Some(done);
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Event stream error: {}", e);
                    continue;
                }
            };
            if !states.is_tracked(&event.id) {
                continue;
            }

            let finished = match &event.action {
                EventAction::Destroy => states.mark_done(&event.id, None),
                EventAction::Die | EventAction::Kill | EventAction::Stop => {
                    let status = match engine.inspect_container(&event.id).await {
                        Ok(state) => {
                            if state.exit_code.unwrap_or(0) == 0 {
                                StepStatus::Success
                            } else {
                                StepStatus::Failed
                            }
                        }
                        Err(_) => StepStatus::Unknown(event.action.as_str().to_string()),
                    };
                    states.mark_done(&event.id, Some(status))
                }
                EventAction::Other(_) => false,
            };

            if finished {
                if let Some(tx) = done.take() {
                    let _ = tx.send(());
                }
                return;
            }
        }
    })
}

/// Follow a build container's output into the log, prefixed with its
/// short name. Waits out the settle delay first.
fn spawn_log_tail(engine: Arc<dyn ContainerEngine>, id: ContainerId, prefix: String) {
    tokio::spawn(async move {
        tokio::time::sleep(LOG_SETTLE_DELAY).await;
        match engine.container_logs(&id, true).await {
            Ok(logs) => {
                let mut lines = tokio::io::BufReader::new(logs.stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!("{} {}", prefix, line);
                }
            }
            Err(e) => tracing::warn!("Failed to tail logs for {}: {}", id.short(), e),
        }
    });
}

/// Last path segment of an image name, tag stripped
fn image_base_name(image: &str) -> &str {
    let without_tag = image.split(':').next().unwrap_or(image);
    without_tag.rsplit('/').next().unwrap_or(without_tag)
}

/// Split `repo[:tag]`, keeping registry ports intact
fn split_reference(reference: &str) -> (&str, &str) {
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[slash..].rfind(':') {
        Some(colon) => (&reference[..slash + colon], &reference[slash + colon + 1..]),
        None => (reference, "latest"),
    }
}
