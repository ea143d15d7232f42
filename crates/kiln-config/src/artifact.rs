//! Artifact image declarations and publish policy

use crate::{ConfigError, Result};
use serde::Deserialize;

/// Images to build from the run and the branches/tags to publish them on
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Artifacts {
    /// Default registry applied to images without one
    pub registry: String,
    /// Images to build
    pub images: Vec<ArtifactImage>,
    /// Branch/tag names to publish on; `*` matches any
    pub publish: Vec<String>,
}

impl Artifacts {
    /// Find an image declaration by name
    pub fn image(&self, name: &str) -> Option<&ArtifactImage> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Apply the default registry and Dockerfile to each image
    pub fn set_defaults(&mut self) {
        for image in &mut self.images {
            if image.dockerfile.is_empty() {
                image.dockerfile = "Dockerfile".to_string();
            }
            if image.registry.is_empty() && !self.registry.is_empty() {
                image.registry = self.registry.clone();
            }
        }
    }

    /// Validate every image declaration
    pub fn validate(&self) -> Result<()> {
        for image in &self.images {
            image.validate()?;
        }
        Ok(())
    }

    /// Whether the publish policy matches the given branch/tag
    pub fn should_publish(&self, branch_tag: &str) -> bool {
        self.publish
            .iter()
            .any(|p| p == "*" || p == branch_tag)
    }
}

/// One image to build from a Dockerfile after the build steps succeed
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactImage {
    /// Image name, optionally with an embedded `:tag`
    pub name: String,
    /// Dockerfile path, relative to the artifact context
    pub dockerfile: String,
    /// Additional tags to apply; exclusive with a tag embedded in `name`
    pub tags: Vec<String>,
    /// Use the engine's layer cache for this build
    pub cache: bool,
    /// Registry to publish to; empty means the default registry or Docker Hub
    pub registry: String,
    /// Build context directory
    pub context: String,
    /// Remove the image at teardown
    pub cleanup: bool,
}

impl ArtifactImage {
    /// A tag embedded in `name` and a `tags` list are mutually exclusive
    pub fn validate(&self) -> Result<()> {
        if self.name.contains(':') && !self.tags.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "image {}: name carries a tag and tags are also listed",
                self.name
            )));
        }
        Ok(())
    }

    /// Replace a `${VAR}` placeholder in the name and all tags
    pub fn replace_tag_vars(&mut self, var: &str, value: &str) {
        self.name = self.name.replace(var, value);
        for tag in &mut self.tags {
            *tag = tag.replace(var, value);
        }
    }

    /// Local image names: the base name plus one `name:tag` per listed tag
    pub fn local_names(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        for tag in &self.tags {
            names.push(format!("{}:{}", self.name, tag));
        }
        names
    }

    /// Full registry references for every local name
    pub fn registry_paths(&self) -> Vec<String> {
        self.local_names()
            .into_iter()
            .map(|n| {
                if self.registry.is_empty() {
                    n
                } else {
                    format!("{}/{}", self.registry, n)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_name_with_tags_is_invalid() {
        let image = ArtifactImage {
            name: "app:v1".to_string(),
            tags: vec!["latest".to_string()],
            ..Default::default()
        };
        assert!(image.validate().is_err());

        let image = ArtifactImage {
            name: "app:v1".to_string(),
            ..Default::default()
        };
        assert!(image.validate().is_ok());
    }

    #[test]
    fn test_replace_tag_vars_and_paths() {
        let mut image = ArtifactImage {
            name: "app".to_string(),
            tags: vec!["${REL}-rc1".to_string(), "${REL}".to_string()],
            registry: "registry.example.com".to_string(),
            ..Default::default()
        };
        image.replace_tag_vars("${REL}", "1.1.1");
        assert_eq!(image.tags, vec!["1.1.1-rc1", "1.1.1"]);

        let locals = image.local_names();
        assert_eq!(locals, vec!["app", "app:1.1.1-rc1", "app:1.1.1"]);

        let paths = image.registry_paths();
        assert_eq!(paths.len(), 3);
        assert!(paths
            .iter()
            .all(|p| p.starts_with("registry.example.com/app")));
    }

    #[test]
    fn test_defaults_and_publish_policy() {
        let mut artifacts = Artifacts {
            registry: "reg.example.com".to_string(),
            images: vec![ArtifactImage {
                name: "app".to_string(),
                ..Default::default()
            }],
            publish: vec!["master".to_string()],
        };
        artifacts.set_defaults();
        assert_eq!(artifacts.images[0].dockerfile, "Dockerfile");
        assert_eq!(artifacts.images[0].registry, "reg.example.com");

        assert!(artifacts.should_publish("master"));
        assert!(!artifacts.should_publish("feature"));

        artifacts.publish = vec!["*".to_string()];
        assert!(artifacts.should_publish("anything"));
    }
}
