//! Docker engine implementation using bollard

use crate::{
    ContainerEngine, ContainerEvent, ContainerId, ContainerProcessState, ContainerSpec,
    EngineError, EventAction, EventStream, ImageBuildSpec, ImageId, LogStream, MountKind,
    NetworkId, RegistryCredentials, Result,
};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::{
    BuildImageOptions, CommitContainerOptions, CreateImageOptions, ListImagesOptions,
    PushImageOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::network::CreateNetworkOptions;
use bollard::service::{HostConfig, Mount, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Docker engine using bollard crate
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the engine at the given URI and verify it responds
    pub async fn new(uri: &str) -> Result<Self> {
        let client = if uri.starts_with("unix://") || uri.starts_with('/') {
            let path = uri.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::ConnectionError(e.to_string()))?
        } else if uri.starts_with("http://") || uri.starts_with("https://") || uri.starts_with("tcp://") {
            Docker::connect_with_http(uri, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::ConnectionError(e.to_string()))?
        } else {
            Docker::connect_with_socket(uri, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::ConnectionError(e.to_string()))?
        };

        client
            .ping()
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Get the underlying Docker client
    pub fn client(&self) -> &Docker {
        &self.client
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<ImageId> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(EngineError::ImageNotFound(error));
                    }
                    if let Some(status) = info.status {
                        tracing::debug!("{}", status);
                    }
                }
                Err(e) => return Err(EngineError::RuntimeError(e.to_string())),
            }
        }

        let inspect = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| EngineError::ImageNotFound(e.to_string()))?;

        Ok(ImageId::new(inspect.id.unwrap_or_else(|| image.to_string())))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_image(&self, name: &str) -> Result<Option<ImageId>> {
        let options = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };
        let images = self.client.list_images(Some(options)).await?;

        // A bare repo name matches its :latest tag
        let latest = format!("{}:latest", name);
        for image in images {
            if image
                .repo_tags
                .iter()
                .any(|t| t == name || *t == latest)
            {
                return Ok(Some(ImageId::new(image.id)));
            }
        }
        Ok(None)
    }

    async fn remove_image(&self, id: &ImageId, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.client.remove_image(&id.0, Some(options), None).await?;
        Ok(())
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        let options = TagImageOptions { repo, tag };
        self.client.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn commit_container(
        &self,
        id: &ContainerId,
        repo: &str,
        tag: &str,
    ) -> Result<ImageId> {
        let options = CommitContainerOptions {
            container: id.0.as_str(),
            repo,
            tag,
            pause: true,
            ..Default::default()
        };
        let response = self
            .client
            .commit_container(options, Config::<String>::default())
            .await?;

        response
            .id
            .map(ImageId::new)
            .ok_or_else(|| EngineError::RuntimeError("No image ID from commit".to_string()))
    }

    async fn build_image(
        &self,
        spec: &ImageBuildSpec,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<ImageId> {
        let tar_data = create_build_context(&spec.context, &spec.dockerfile)?;

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            nocache: !spec.use_cache,
            pull: spec.pull,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(tar_data.into()));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(EngineError::BuildError(error));
                    }
                    if let Some(aux) = output.aux {
                        if let Some(id) = aux.id {
                            image_id = Some(id);
                        }
                    }
                    if let Some(line) = output.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            let _ = progress.send(line.to_string());
                        }
                    }
                }
                Err(e) => return Err(EngineError::BuildError(e.to_string())),
            }
        }

        image_id
            .map(ImageId::new)
            .ok_or_else(|| EngineError::BuildError("No image ID returned".to_string()))
    }

    async fn push_image(
        &self,
        image_ref: &str,
        credentials: Option<RegistryCredentials>,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let (name, tag) = split_image_ref(image_ref);

        let options = PushImageOptions { tag };
        let creds = credentials.map(|c| DockerCredentials {
            username: Some(c.username),
            password: Some(c.password),
            serveraddress: Some(c.server_address),
            ..Default::default()
        });

        let mut stream = self.client.push_image(name, Some(options), creds);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(EngineError::PushError(error));
                    }
                    if let Some(status) = info.status {
                        let _ = progress.send(status);
                    }
                }
                Err(e) => return Err(EngineError::PushError(e.to_string())),
            }
        }

        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        if !self.image_exists(&spec.image).await? {
            tracing::debug!("Image {} not present, pulling", spec.image);
            self.pull_image(&spec.image).await?;
        }

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        });

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &spec.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = PortBinding {
                host_ip: None,
                host_port: port.host_port.map(|p| p.to_string()),
            };
            port_bindings.insert(container_port, Some(vec![binding]));
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(match m.kind {
                    MountKind::Bind => bollard::service::MountTypeEnum::BIND,
                    MountKind::Volume => bollard::service::MountTypeEnum::VOLUME,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: spec.working_dir.clone(),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self.client.create_container(options, config).await?;
        let id = ContainerId::new(response.id);

        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;

        Ok(id)
    }

    async fn stop_container(&self, id: &ContainerId, timeout: Option<u32>) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.unwrap_or(10) as i64,
        };
        self.client.stop_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerProcessState> {
        let info = self
            .client
            .inspect_container(&id.0, None)
            .await
            .map_err(|e| EngineError::ContainerNotFound(e.to_string()))?;

        let state = info.state.as_ref();
        Ok(ContainerProcessState {
            running: state.and_then(|s| s.running).unwrap_or(false),
            exit_code: state.and_then(|s| s.exit_code),
        })
    }

    async fn container_logs(&self, id: &ContainerId, follow: bool) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let stream = self.client.logs(&id.0, Some(options));
        let reader = LogOutputReader::new(stream);

        Ok(LogStream {
            stream: Box::pin(reader),
        })
    }

    async fn create_network(&self, name: &str) -> Result<NetworkId> {
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            check_duplicate: true,
            ..Default::default()
        };
        let response = self.client.create_network(options).await?;

        Ok(response
            .id
            .map(NetworkId::new)
            .unwrap_or_else(|| NetworkId::new(name)))
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<()> {
        self.client.remove_network(&id.0).await?;
        Ok(())
    }

    fn events(&self) -> EventStream {
        let filters = HashMap::from([("type".to_string(), vec!["container".to_string()])]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self
            .client
            .events(Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(msg) => {
                        let id = msg.actor.and_then(|a| a.id)?;
                        let action = msg.action?;
                        Some(Ok(ContainerEvent {
                            id: ContainerId::new(id),
                            action: EventAction::from(action.as_str()),
                        }))
                    }
                    Err(e) => Some(Err(EngineError::RuntimeError(e.to_string()))),
                }
            });

        Box::pin(stream)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

/// Split `[registry/]repo[:tag]` into name and tag, defaulting to `latest`.
/// The tag separator is the last colon after the last slash, so registry
/// ports are not mistaken for tags.
fn split_image_ref(image_ref: &str) -> (&str, &str) {
    let slash = image_ref.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image_ref[slash..].rfind(':') {
        Some(colon) => (
            &image_ref[..slash + colon],
            &image_ref[slash + colon + 1..],
        ),
        None => (image_ref, "latest"),
    }
}

/// Create a tar archive from the build context
fn create_build_context(context: &Path, dockerfile: &str) -> Result<Vec<u8>> {
    use std::io::Cursor;
    use tar::Builder;

    let mut tar_data = Vec::new();
    {
        let cursor = Cursor::new(&mut tar_data);
        let mut builder = Builder::new(cursor);

        // Add Dockerfile
        let dockerfile_path = context.join(dockerfile);
        if dockerfile_path.exists() {
            builder
                .append_path_with_name(&dockerfile_path, dockerfile)
                .map_err(EngineError::IoError)?;
        }

        // Add all files in context
        add_dir_to_tar(&mut builder, context, Path::new(""))?;

        builder.finish().map_err(EngineError::IoError)?;
    }

    Ok(tar_data)
}

/// Recursively add directory contents to tar
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    prefix: &Path,
) -> Result<()> {
    let entries = std::fs::read_dir(base).map_err(EngineError::IoError)?;

    for entry in entries {
        let entry = entry.map_err(EngineError::IoError)?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());

        // Skip common excludes
        let file_name = entry.file_name();
        let file_name_str = file_name.to_string_lossy();
        if file_name_str == ".git"
            || file_name_str == "node_modules"
            || file_name_str == "target"
            || file_name_str == ".dockerignore"
        {
            continue;
        }

        if path.is_dir() {
            add_dir_to_tar(builder, &path, &name)?;
        } else if path.is_file() {
            builder
                .append_path_with_name(&path, &name)
                .map_err(EngineError::IoError)?;
        }
    }

    Ok(())
}

/// Reader that converts log output stream to AsyncRead
struct LogOutputReader<S> {
    stream: S,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S> LogOutputReader<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }
}

impl<S> AsyncRead for LogOutputReader<S>
where
    S: futures::Stream<
            Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>,
        > + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // If we have buffered data, return it first
        if self.pos < self.buffer.len() {
            let remaining = &self.buffer[self.pos..];
            let to_copy = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return std::task::Poll::Ready(Ok(()));
        }

        // Clear buffer and try to get more data
        self.buffer.clear();
        self.pos = 0;

        match Pin::new(&mut self.stream).poll_next(cx) {
            std::task::Poll::Ready(Some(Ok(output))) => {
                let data = match output {
                    bollard::container::LogOutput::StdOut { message } => message,
                    bollard::container::LogOutput::StdErr { message } => message,
                    bollard::container::LogOutput::StdIn { message } => message,
                    bollard::container::LogOutput::Console { message } => message,
                };
                self.buffer = data.to_vec();

                let to_copy = std::cmp::min(self.buffer.len(), buf.remaining());
                buf.put_slice(&self.buffer[..to_copy]);
                self.pos = to_copy;
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Some(Err(e))) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )),
            std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("nginx"), ("nginx", "latest"));
        assert_eq!(split_image_ref("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(
            split_image_ref("registry.example.com:5000/org/app"),
            ("registry.example.com:5000/org/app", "latest")
        );
        assert_eq!(
            split_image_ref("registry.example.com:5000/org/app:v2"),
            ("registry.example.com:5000/org/app", "v2")
        );
    }

    #[test]
    fn test_create_build_context_includes_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("app.txt"), "payload").unwrap();

        let tar_data = create_build_context(dir.path(), "Dockerfile").unwrap();

        let mut archive = tar::Archive::new(std::io::Cursor::new(tar_data));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n == "Dockerfile"));
        assert!(names.iter().any(|n| n == "app.txt"));
    }
}
