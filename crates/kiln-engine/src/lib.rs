//! Container engine trait and implementations for kiln
//!
//! This crate provides an abstraction over container engines (Docker, Podman)
//! with the operations the build lifecycle needs: run containers, stream their
//! lifecycle events and logs, build/tag/push images, and manage networks.

mod auth;
mod docker;
mod error;
mod types;

pub use auth::*;
pub use docker::DockerEngine;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for container engines (Docker, Podman, etc.)
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image from a registry
    async fn pull_image(&self, image: &str) -> Result<ImageId>;

    /// Check whether an image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Resolve a logical image name (`repo:tag`) to an engine image ID
    async fn resolve_image(&self, name: &str) -> Result<Option<ImageId>>;

    /// Remove an image
    async fn remove_image(&self, id: &ImageId, force: bool) -> Result<()>;

    /// Apply an additional `repo:tag` name to an existing image
    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()>;

    /// Commit a container's filesystem as a new image
    async fn commit_container(
        &self,
        id: &ContainerId,
        repo: &str,
        tag: &str,
    ) -> Result<ImageId>;

    /// Build an image from a Dockerfile context.
    /// Progress lines are sent to the provided channel.
    async fn build_image(
        &self,
        spec: &ImageBuildSpec,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<ImageId>;

    /// Push an image reference (`[registry/]repo[:tag]`) to its registry.
    /// Progress lines are sent to the provided channel.
    async fn push_image(
        &self,
        image_ref: &str,
        credentials: Option<RegistryCredentials>,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<()>;

    /// Create and start a container, pulling the image if missing
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Stop a container
    async fn stop_container(&self, id: &ContainerId, timeout: Option<u32>) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Get the process state of a container
    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerProcessState>;

    /// Get container logs
    async fn container_logs(&self, id: &ContainerId, follow: bool) -> Result<LogStream>;

    /// Create a bridge network
    async fn create_network(&self, name: &str) -> Result<NetworkId>;

    /// Remove a network
    async fn remove_network(&self, id: &NetworkId) -> Result<()>;

    /// Stream container lifecycle events from the engine
    fn events(&self) -> EventStream;

    /// Check if the engine is available/connected
    async fn ping(&self) -> Result<()>;
}
