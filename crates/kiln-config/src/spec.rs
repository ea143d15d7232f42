//! The build file model
//!
//! A build is declared in `.kiln.yml`: service containers, build steps,
//! artifact images and a publish policy. Repo identity (name, branch/tag,
//! commit) is discovered from `.git/HEAD` and may be overridden through
//! the `GIT_COMMIT`/`GIT_URL`/`GIT_BRANCH` environment variables common
//! on CI agents.

use crate::{Artifacts, ConfigError, Result, RunStep};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default build file name
pub const DEFAULT_BUILD_FILE: &str = ".kiln.yml";

const DEFAULT_SHELL: &str = "/bin/sh";

/// Complete build declaration plus discovered repo identity
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildSpec {
    /// Root of the build; defaults to the current working directory
    pub context: String,
    /// Containers kept running for the duration of the build
    pub services: Vec<RunStep>,
    /// Build steps, run concurrently; all must succeed
    pub build: Vec<RunStep>,
    /// Images to produce and optionally publish
    pub artifacts: Artifacts,
    /// Mount the engine socket into build containers
    #[serde(rename = "docker")]
    pub engine_access: bool,
    /// Free-form variables queryable through the CLI
    pub variables: HashMap<String, String>,

    /// Project name, from the context directory or the repo URL
    #[serde(skip)]
    pub repo_name: String,
    /// Git remote URL, if known
    #[serde(skip)]
    pub repo_url: String,
    /// Branch or tag being built
    #[serde(skip)]
    pub branch_tag: String,
    /// Commit being built, truncated to 8 characters
    #[serde(skip)]
    pub last_commit: String,
}

impl BuildSpec {
    /// Load and normalize a build file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content, path)
    }

    /// Parse a build file from YAML and apply defaults
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let mut spec: BuildSpec =
            serde_yaml::from_str(content).map_err(|source| ConfigError::YamlParseError {
                path: path.to_path_buf(),
                source,
            })?;
        spec.normalize()?;
        Ok(spec)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.context.is_empty() || self.context == "." || self.context == "./" {
            let cwd = std::env::current_dir().map_err(|source| ConfigError::ReadError {
                path: PathBuf::from("."),
                source,
            })?;
            self.context = cwd.to_string_lossy().into_owned();
        }

        for step in &mut self.build {
            if step.shell.is_empty() {
                step.shell = DEFAULT_SHELL.to_string();
            }
        }

        for image in &mut self.artifacts.images {
            if image.context.is_empty() {
                image.context = self.context.clone();
            }
        }
        self.artifacts.set_defaults();
        self.artifacts.validate()?;

        self.discover_repo_info();
        self.apply_env_overrides();

        // Prefer a name derived from the repo URL when one is known
        if !self.repo_url.is_empty() {
            if let Some(last) = self.repo_url.split('/').next_back() {
                let name = last.trim_end_matches(".git");
                if !name.is_empty() {
                    self.repo_name = name.to_string();
                }
            }
        }

        Ok(())
    }

    /// Unique run name: `<repo>-<branchtag>-<commit8>`
    pub fn run_name(&self) -> String {
        if let Some(commit) = self.last_commit.get(..8) {
            format!("{}-{}-{}", self.repo_name, self.branch_tag, commit)
        } else if !self.branch_tag.is_empty() {
            format!("{}-{}", self.repo_name, self.branch_tag)
        } else {
            self.repo_name.clone()
        }
    }

    /// Export resolved version info into every build step and substitute
    /// the `${APP_*}` placeholders in artifact names and tags.
    pub fn apply_version(&mut self, version: &str, short: &str, commit: &str, distance: usize) {
        let distance = distance.to_string();
        let vars = [
            format!("APP_VERSION={}", version),
            format!("APP_VERSION_SHORT={}", short),
            format!("APP_COMMIT={}", commit),
            format!("APP_COMMIT_INDEX={}", distance),
        ];
        for step in &mut self.build {
            step.environment.extend(vars.iter().cloned());
        }

        for image in &mut self.artifacts.images {
            image.replace_tag_vars("${APP_VERSION}", version);
            image.replace_tag_vars("${APP_VERSION_SHORT}", short);
            image.replace_tag_vars("${APP_COMMIT}", commit);
            image.replace_tag_vars("${APP_COMMIT_INDEX}", &distance);
        }
    }

    /// Look up a `variables:` entry
    pub fn variable(&self, key: &str) -> Result<&str> {
        self.variables
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::NoSuchVariable(key.to_string()))
    }

    fn discover_repo_info(&mut self) {
        let (name, branch_tag, last_commit) = repo_info(Path::new(&self.context));
        if self.repo_name.is_empty() && !name.is_empty() {
            self.repo_name = name;
        }
        if self.branch_tag.is_empty() && !branch_tag.is_empty() {
            self.branch_tag = branch_tag;
        }
        if self.last_commit.is_empty() && !last_commit.is_empty() {
            self.last_commit = last_commit;
        }
    }

    /// CI-provided overrides take precedence over discovered values
    fn apply_env_overrides(&mut self) {
        if let Ok(commit) = std::env::var("GIT_COMMIT") {
            if let Some(prefix) = commit.get(..8) {
                self.last_commit = prefix.to_string();
            }
        }
        if let Ok(url) = std::env::var("GIT_URL") {
            if !url.is_empty() {
                self.repo_url = url;
            }
        }
        if let Ok(branch) = std::env::var("GIT_BRANCH") {
            if let Some(last) = branch.split('/').next_back() {
                if !last.is_empty() {
                    self.branch_tag = last.to_string();
                }
            }
        }
    }
}

/// Read project name, branch/tag and commit from `.git/HEAD`.
/// Anything unavailable comes back empty.
fn repo_info(context: &Path) -> (String, String, String) {
    let name = context
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Ok(head) = std::fs::read_to_string(context.join(".git/HEAD")) else {
        return (name, String::new(), String::new());
    };
    let head = head.trim_end_matches('\n');

    let mut branch_tag = String::new();
    let mut last_commit = String::new();

    match head.split_once(' ') {
        // "ref: refs/heads/<branch>"
        Some((_, reference)) => {
            if let Some(last) = reference.split('/').next_back() {
                branch_tag = last.to_string();
            }
            if let Ok(commit) = std::fs::read_to_string(context.join(".git").join(reference)) {
                if let Some(prefix) = commit.trim_end().get(..8) {
                    last_commit = prefix.to_string();
                }
            }
        }
        // detached HEAD holds the commit itself
        None => {
            if let Some(prefix) = head.get(..8) {
                last_commit = prefix.to_string();
            }
        }
    }

    (name, branch_tag, last_commit)
}

/// Starter build file written by `kiln init`
pub fn starter_build_file(name: &str) -> String {
    format!(
        "build:\n  - image: alpine:3.19\n    workdir: /build\n    commands:\n      - echo hello\n\nartifacts:\n  images:\n    - name: {}\n  publish:\n    - master\n",
        name
    )
}

/// Write the starter build file to `path`
pub fn write_starter_build_file(path: &Path, name: &str) -> Result<()> {
    std::fs::write(path, starter_build_file(name)).map_err(|source| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  - image: postgres:16
    environment:
      - POSTGRES_PASSWORD=secret

build:
  - image: rust:1.79
    workdir: /build
    commands:
      - cargo build --release
    cache: true

artifacts:
  registry: registry.example.com
  images:
    - name: app
      tags:
        - "${APP_VERSION}"
  publish:
    - master

variables:
  team: platform
"#;

    fn git_fixture(dir: &Path, branch: &str, commit: &str) {
        let refs = dir.join(".git/refs/heads");
        std::fs::create_dir_all(&refs).unwrap();
        std::fs::write(
            dir.join(".git/HEAD"),
            format!("ref: refs/heads/{}\n", branch),
        )
        .unwrap();
        std::fs::write(refs.join(branch), format!("{}\n", commit)).unwrap();
    }

    #[test]
    fn test_parse_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        git_fixture(dir.path(), "main", "0123456789abcdef");

        let yaml = format!("context: {}\n{}", dir.path().display(), SAMPLE);
        let spec = BuildSpec::from_yaml(&yaml, Path::new(".kiln.yml")).unwrap();

        assert_eq!(spec.build[0].shell, "/bin/sh");
        assert_eq!(spec.artifacts.images[0].dockerfile, "Dockerfile");
        assert_eq!(spec.artifacts.images[0].registry, "registry.example.com");
        assert_eq!(
            spec.artifacts.images[0].context,
            dir.path().to_string_lossy()
        );
        assert_eq!(spec.branch_tag, "main");
        assert_eq!(spec.last_commit, "01234567");
        assert_eq!(spec.variable("team").unwrap(), "platform");
        assert!(spec.variable("missing").is_err());
    }

    #[test]
    fn test_run_name_forms() {
        let mut spec = BuildSpec {
            repo_name: "app".to_string(),
            branch_tag: "main".to_string(),
            last_commit: "0123456789".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.run_name(), "app-main-01234567");

        spec.last_commit.clear();
        assert_eq!(spec.run_name(), "app-main");

        spec.branch_tag.clear();
        assert_eq!(spec.run_name(), "app");
    }

    #[test]
    fn test_apply_version() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("context: {}\n{}", dir.path().display(), SAMPLE);
        let mut spec = BuildSpec::from_yaml(&yaml, Path::new(".kiln.yml")).unwrap();

        spec.apply_version("1.2.0-3-abc1234", "1.2.0", "abc1234", 3);

        let env = &spec.build[0].environment;
        assert!(env.contains(&"APP_VERSION=1.2.0-3-abc1234".to_string()));
        assert!(env.contains(&"APP_COMMIT_INDEX=3".to_string()));
        assert_eq!(spec.artifacts.images[0].tags[0], "1.2.0-3-abc1234");
    }

    #[test]
    fn test_detached_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "fedcba9876543210\n").unwrap();

        let (_, branch, commit) = repo_info(dir.path());
        assert!(branch.is_empty());
        assert_eq!(commit, "fedcba98");
    }

    #[test]
    fn test_multibyte_head_does_not_panic() {
        // a corrupted or hand-edited HEAD with a multibyte character in
        // the first eight bytes is ignored rather than crashing the load
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "0123456é9abcdef\n").unwrap();

        let (_, _, commit) = repo_info(dir.path());
        assert!(commit.is_empty());
    }

    #[test]
    fn test_run_name_with_multibyte_commit_falls_back() {
        let spec = BuildSpec {
            repo_name: "app".to_string(),
            branch_tag: "main".to_string(),
            last_commit: "0123456é9".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.run_name(), "app-main");
    }

    #[test]
    fn test_multibyte_git_commit_override_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("GIT_COMMIT", "0123456é9abc");
        let yaml = format!("context: {}\n", dir.path().display());
        let spec = BuildSpec::from_yaml(&yaml, Path::new(".kiln.yml")).unwrap();
        std::env::remove_var("GIT_COMMIT");

        assert!(spec.last_commit.is_empty());
    }

    #[test]
    fn test_write_starter_build_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_BUILD_FILE);
        write_starter_build_file(&path, "myapp").unwrap();

        let spec = BuildSpec::load(&path).unwrap();
        assert_eq!(spec.artifacts.images[0].name, "myapp");
        assert!(!spec.build.is_empty());

        // an unwritable location surfaces the write failure
        let bad = dir.path().join("missing-dir").join(DEFAULT_BUILD_FILE);
        assert!(matches!(
            write_starter_build_file(&bad, "myapp"),
            Err(ConfigError::WriteError { .. })
        ));
    }

    #[test]
    fn test_tagged_name_with_tags_rejected() {
        let yaml = r#"
context: /tmp
artifacts:
  images:
    - name: "app:v1"
      tags: ["latest"]
"#;
        assert!(matches!(
            BuildSpec::from_yaml(yaml, Path::new(".kiln.yml")),
            Err(ConfigError::Invalid(_))
        ));
    }
}
