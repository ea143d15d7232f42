//! Common types crossing the engine boundary

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::Result;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Image ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkId(pub String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to create and start one container.
///
/// Serializable so the build cache can derive a content key from it;
/// field order is the canonical serialization order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerSpec {
    /// Image to run
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Working directory in the container
    pub working_dir: Option<String>,
    /// Environment as KEY=VALUE strings, declaration order preserved
    pub env: Vec<String>,
    /// Volume/bind mounts
    pub mounts: Vec<MountSpec>,
    /// Exposed port mappings
    pub ports: Vec<PortSpec>,
    /// Container name (None lets the engine assign one)
    pub name: Option<String>,
    /// Network to attach to
    pub network: Option<String>,
}

impl ContainerSpec {
    /// Spec with just the image set
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    /// Mount type (bind, volume)
    pub kind: MountKind,
    /// Source path or volume name
    pub source: String,
    /// Target path in container
    pub target: String,
    /// Read-only
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Parse a compose-style `source:target[:ro]` volume string
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [source, target] => Ok(Self::bind(*source, *target)),
            [source, target, "ro"] => Ok(Self {
                read_only: true,
                ..Self::bind(*source, *target)
            }),
            _ => Err(crate::EngineError::InvalidSpec(format!(
                "invalid volume spec: {}",
                s
            ))),
        }
    }
}

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSpec {
    /// Host port (None for auto-assign)
    pub host_port: Option<u16>,
    /// Container port
    pub container_port: u16,
    /// Protocol (tcp/udp)
    pub protocol: String,
}

impl PortSpec {
    /// Parse a `host:container[/proto]` or `container[/proto]` port string
    pub fn parse(s: &str) -> Result<Self> {
        let (spec, protocol) = match s.split_once('/') {
            Some((spec, proto)) => (spec, proto.to_string()),
            None => (s, "tcp".to_string()),
        };
        let bad = || crate::EngineError::InvalidSpec(format!("invalid port spec: {}", s));
        match spec.split_once(':') {
            Some((host, container)) => Ok(Self {
                host_port: Some(host.parse().map_err(|_| bad())?),
                container_port: container.parse().map_err(|_| bad())?,
                protocol,
            }),
            None => Ok(Self {
                host_port: None,
                container_port: spec.parse().map_err(|_| bad())?,
                protocol,
            }),
        }
    }
}

/// Configuration for building an image from a Dockerfile context
#[derive(Debug, Clone, Default)]
pub struct ImageBuildSpec {
    /// Path to the build context
    pub context: PathBuf,
    /// Dockerfile path (relative to context)
    pub dockerfile: String,
    /// Primary image tag
    pub tag: String,
    /// Use the engine's layer cache
    pub use_cache: bool,
    /// Pull the base image even if present locally
    pub pull: bool,
}

/// Process state of a container as reported by inspect
#[derive(Debug, Clone, Default)]
pub struct ContainerProcessState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Lifecycle action reported on the engine event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Destroy,
    Die,
    Kill,
    Stop,
    Other(String),
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Destroy => "destroy",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Stop => "stop",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EventAction {
    fn from(s: &str) -> Self {
        match s {
            "destroy" => Self::Destroy,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "stop" => Self::Stop,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One container lifecycle event
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub id: ContainerId,
    pub action: EventAction,
}

/// Line-oriented log stream from a container
pub struct LogStream {
    pub stream: Pin<Box<dyn AsyncRead + Send>>,
}

/// Engine lifecycle event stream
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ContainerEvent>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_short() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        let id = ContainerId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_mount_parse() {
        let m = MountSpec::parse("/src:/build").unwrap();
        assert_eq!(m.source, "/src");
        assert_eq!(m.target, "/build");
        assert!(!m.read_only);

        let m = MountSpec::parse("/src:/build:ro").unwrap();
        assert!(m.read_only);

        assert!(MountSpec::parse("/src").is_err());
        assert!(MountSpec::parse("/a:/b:rw:extra").is_err());
    }

    #[test]
    fn test_port_parse() {
        let p = PortSpec::parse("8080:80").unwrap();
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, "tcp");

        let p = PortSpec::parse("53:53/udp").unwrap();
        assert_eq!(p.protocol, "udp");

        let p = PortSpec::parse("5432").unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.container_port, 5432);

        assert!(PortSpec::parse("x:80").is_err());
    }

    #[test]
    fn test_event_action_round_trip() {
        assert_eq!(EventAction::from("die"), EventAction::Die);
        assert_eq!(EventAction::from("destroy"), EventAction::Destroy);
        assert_eq!(
            EventAction::from("health_status"),
            EventAction::Other("health_status".to_string())
        );
        assert_eq!(EventAction::from("kill").as_str(), "kill");
    }
}
