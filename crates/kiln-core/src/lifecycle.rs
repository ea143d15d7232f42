//! Build lifecycle control
//!
//! A run moves through fixed phases: Configure, Setup, Build, Artifacts,
//! Publish, Teardown. `Lifecycle` gates each phase on the success of the
//! previous one and always runs Teardown, whatever happened before it.

use crate::{AbortHandle, CoreError, Result};
use async_trait::async_trait;
use kiln_config::BuildSpec;

/// One phase of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configure,
    Setup,
    Build,
    Artifacts,
    Publish,
    Teardown,
}

impl std::str::FromStr for Phase {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "configure" => Ok(Self::Configure),
            "setup" => Ok(Self::Setup),
            "build" => Ok(Self::Build),
            "artifacts" => Ok(Self::Artifacts),
            "publish" => Ok(Self::Publish),
            "teardown" => Ok(Self::Teardown),
            other => Err(CoreError::UnknownPhase(other.to_string())),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configure => "configure",
            Self::Setup => "setup",
            Self::Build => "build",
            Self::Artifacts => "artifacts",
            Self::Publish => "publish",
            Self::Teardown => "teardown",
        };
        write!(f, "{}", s)
    }
}

/// Performs all work for a run. Implemented per backend; the current
/// backend is containers through `BuildWorker`.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Translate the build file into backend structures
    async fn configure(&mut self, spec: BuildSpec) -> Result<()>;
    /// Satisfy dependencies needed by the build
    async fn setup(&mut self) -> Result<()>;
    /// Run the build steps
    async fn build(&mut self) -> Result<()>;
    /// Package outputs into artifacts; empty `names` means all
    async fn generate_artifacts(&mut self, names: &[String]) -> Result<()>;
    /// Push artifacts to their registries; empty `names` means all
    async fn publish(&mut self, names: &[String]) -> Result<()>;
    /// Release everything the run created
    async fn teardown(&mut self) -> Result<()>;
    /// Remove locally built artifact images
    async fn remove_artifacts(&mut self) -> Result<()>;
    /// Handle used to request cooperative cancellation
    fn abort_handle(&self) -> AbortHandle;
}

/// Drives a worker through the phases of a run
pub struct Lifecycle {
    worker: Box<dyn Worker>,
}

impl Lifecycle {
    pub fn new(worker: Box<dyn Worker>) -> Self {
        Self { worker }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.worker.abort_handle()
    }

    /// Run the complete lifecycle. Teardown always runs; its errors are
    /// logged rather than masking the build outcome.
    pub async fn run(&mut self, spec: BuildSpec) -> Result<()> {
        let branch_tag = spec.branch_tag.clone();
        let should_publish = spec.artifacts.should_publish(&branch_tag);
        let summary = start_summary(&spec);

        self.worker.configure(spec).await?;
        tracing::info!("{}", summary);

        let mut result = self.worker.setup().await;
        if result.is_ok() {
            result = self.worker.build().await;
        }
        if result.is_ok() {
            result = self.worker.generate_artifacts(&[]).await;
        }
        if result.is_ok() {
            if should_publish {
                result = self.worker.publish(&[]).await;
            } else {
                tracing::info!("[publish] Not publishing. Criteria not met.");
            }
        }

        if let Err(e) = self.worker.teardown().await {
            tracing::error!("[teardown] {}", e);
        }

        result
    }

    /// Run a single phase. Build brings its own setup and teardown;
    /// artifacts and publish only need configuration.
    pub async fn run_target(
        &mut self,
        spec: BuildSpec,
        target: Phase,
        args: &[String],
    ) -> Result<()> {
        match target {
            Phase::Configure => self.worker.configure(spec).await,

            Phase::Setup => {
                self.worker.configure(spec).await?;
                self.worker.setup().await
            }

            Phase::Build => {
                let mut result = self.worker.configure(spec).await;
                if result.is_ok() {
                    result = self.worker.setup().await;
                }
                if result.is_ok() {
                    result = self.worker.build().await;
                }
                if let Err(e) = self.worker.teardown().await {
                    tracing::error!("[teardown] {}", e);
                }
                result
            }

            Phase::Artifacts => {
                self.worker.configure(spec).await?;
                self.worker.generate_artifacts(args).await
            }

            Phase::Publish => {
                self.worker.configure(spec).await?;
                self.worker.publish(args).await
            }

            Phase::Teardown => {
                self.worker.configure(spec).await?;
                self.worker.teardown().await
            }
        }
    }
}

fn start_summary(spec: &BuildSpec) -> String {
    format!(
        "\nName       : {}\nBranch/Tag : {}\nRepo       : {}\n\nBuilds     : {}\nArtifacts  : {}\n",
        spec.run_name(),
        spec.branch_tag,
        spec.repo_url,
        spec.build.len(),
        spec.artifacts.images.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_phase_round_trip() {
        for name in ["configure", "setup", "build", "artifacts", "publish", "teardown"] {
            let phase = Phase::from_str(name).unwrap();
            assert_eq!(phase.to_string(), name);
        }
    }

    #[test]
    fn test_unknown_phase_is_an_error() {
        assert!(matches!(
            Phase::from_str("deploy"),
            Err(CoreError::UnknownPhase(_))
        ));
    }

    use std::sync::{Arc, Mutex};

    /// Worker that records which phases ran and can fail one of them
    struct RecordingWorker {
        phases: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        abort: AbortHandle,
    }

    impl RecordingWorker {
        fn new(fail_on: Option<&'static str>) -> (Self, Arc<Mutex<Vec<String>>>) {
            let phases = Arc::new(Mutex::new(Vec::new()));
            let worker = Self {
                phases: phases.clone(),
                fail_on,
                abort: AbortHandle::new(),
            };
            (worker, phases)
        }

        fn enter(&self, phase: &str) -> Result<()> {
            self.phases.lock().unwrap().push(phase.to_string());
            if self.fail_on == Some(phase) {
                return Err(CoreError::BuildFailed(phase.to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        async fn configure(&mut self, _spec: BuildSpec) -> Result<()> {
            self.enter("configure")
        }
        async fn setup(&mut self) -> Result<()> {
            self.enter("setup")
        }
        async fn build(&mut self) -> Result<()> {
            self.enter("build")
        }
        async fn generate_artifacts(&mut self, _names: &[String]) -> Result<()> {
            self.enter("artifacts")
        }
        async fn publish(&mut self, _names: &[String]) -> Result<()> {
            self.enter("publish")
        }
        async fn teardown(&mut self) -> Result<()> {
            self.enter("teardown")
        }
        async fn remove_artifacts(&mut self) -> Result<()> {
            self.enter("remove_artifacts")
        }
        fn abort_handle(&self) -> AbortHandle {
            self.abort.clone()
        }
    }

    fn spec_publishing(publish: Vec<&str>, branch_tag: &str) -> BuildSpec {
        BuildSpec {
            repo_name: "app".to_string(),
            branch_tag: branch_tag.to_string(),
            artifacts: kiln_config::Artifacts {
                publish: publish.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_walks_all_phases_when_publishable() {
        let (worker, phases) = RecordingWorker::new(None);
        let mut lifecycle = Lifecycle::new(Box::new(worker));

        lifecycle
            .run(spec_publishing(vec!["master"], "master"))
            .await
            .unwrap();

        assert_eq!(
            *phases.lock().unwrap(),
            vec!["configure", "setup", "build", "artifacts", "publish", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_run_skips_publish_when_criteria_not_met() {
        let (worker, phases) = RecordingWorker::new(None);
        let mut lifecycle = Lifecycle::new(Box::new(worker));

        lifecycle
            .run(spec_publishing(vec!["master"], "feature"))
            .await
            .unwrap();

        assert_eq!(
            *phases.lock().unwrap(),
            vec!["configure", "setup", "build", "artifacts", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_build_failure_still_tears_down() {
        let (worker, phases) = RecordingWorker::new(Some("build"));
        let mut lifecycle = Lifecycle::new(Box::new(worker));

        let err = lifecycle
            .run(spec_publishing(vec!["*"], "feature"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BuildFailed(_)));

        assert_eq!(
            *phases.lock().unwrap(),
            vec!["configure", "setup", "build", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_run_target_build_brings_setup_and_teardown() {
        let (worker, phases) = RecordingWorker::new(None);
        let mut lifecycle = Lifecycle::new(Box::new(worker));

        lifecycle
            .run_target(BuildSpec::default(), Phase::Build, &[])
            .await
            .unwrap();

        assert_eq!(
            *phases.lock().unwrap(),
            vec!["configure", "setup", "build", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_run_target_artifacts_only_configures_first() {
        let (worker, phases) = RecordingWorker::new(None);
        let mut lifecycle = Lifecycle::new(Box::new(worker));

        lifecycle
            .run_target(BuildSpec::default(), Phase::Artifacts, &[])
            .await
            .unwrap();

        assert_eq!(*phases.lock().unwrap(), vec!["configure", "artifacts"]);
    }
}
