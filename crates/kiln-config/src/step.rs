//! Service and build step declarations

use crate::{ConfigError, Result};
use serde::Deserialize;
use std::path::Path;

/// One container run declaration: a service to keep running during the
/// build, or a build step whose commands must succeed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunStep {
    /// Image to run the step in
    pub image: String,
    /// Commands executed via the shell
    pub commands: Vec<String>,
    /// Working directory inside the container
    pub workdir: String,
    /// KEY=VALUE entries, or bare names resolved from the process env
    pub environment: Vec<String>,
    /// Volume specs (`source:target[:ro]`)
    pub volumes: Vec<String>,
    /// Keep the container after the run completes
    pub save: bool,
    /// Shell the commands run under
    pub shell: String,
    /// Port mappings
    pub ports: Vec<String>,
    /// Reuse a committed image when the step is unchanged
    pub cache: bool,
    /// Explicit container name (services only; must be unique)
    pub name: String,
    /// Remove the step image at teardown
    pub cleanup: bool,
    /// Files with additional environment variables
    #[serde(rename = "env_file")]
    pub env_files: Vec<String>,
}

impl RunStep {
    /// The script passed to `<shell> -cex`
    pub fn script(&self) -> String {
        let mut s = self.commands.join("\n");
        s.push('\n');
        s
    }

    /// Collect env entries from env files and the environment list.
    ///
    /// Entries without `=` are looked up in the process environment and
    /// fail if unset.
    pub fn env_strings(&self) -> Result<Vec<String>> {
        let mut vars = Vec::new();
        for file in &self.env_files {
            vars.extend(parse_env_file(Path::new(file))?);
        }
        for entry in &self.environment {
            if let Some(formatted) = resolve_env_entry(entry)? {
                vars.push(formatted);
            }
        }
        Ok(vars)
    }
}

/// Parse an env file line-wise, skipping blanks and `#` comments
pub fn parse_env_file(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::EnvFileError {
        path: path.to_path_buf(),
        source,
    })?;

    let mut vars = Vec::new();
    for raw in bytes.split(|b| *b == b'\n') {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = std::str::from_utf8(raw)
            .map_err(|_| ConfigError::InvalidEnvVar(String::from_utf8_lossy(raw).into_owned()))?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(formatted) = resolve_env_entry(line)? {
            vars.push(formatted);
        }
    }
    Ok(vars)
}

/// Normalize one env entry. Bare names resolve from the process env;
/// blank entries drop out.
fn resolve_env_entry(entry: &str) -> Result<Option<String>> {
    let trimmed = entry.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    if trimmed.contains('=') {
        return Ok(Some(trimmed.to_string()));
    }

    match std::env::var(trimmed) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(format!("{}={}", trimmed, value))),
        _ => Err(ConfigError::MissingEnvVar(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_script_joins_commands() {
        let step = RunStep {
            commands: vec!["make".to_string(), "make test".to_string()],
            ..Default::default()
        };
        assert_eq!(step.script(), "make\nmake test\n");
    }

    #[test]
    fn test_env_entry_passthrough_and_resolution() {
        assert_eq!(
            resolve_env_entry("FOO=bar").unwrap(),
            Some("FOO=bar".to_string())
        );
        assert_eq!(resolve_env_entry("   ").unwrap(), None);

        std::env::set_var("KILN_STEP_TEST_VAR", "resolved");
        assert_eq!(
            resolve_env_entry("KILN_STEP_TEST_VAR").unwrap(),
            Some("KILN_STEP_TEST_VAR=resolved".to_string())
        );

        assert!(resolve_env_entry("KILN_STEP_TEST_UNSET").is_err());
    }

    #[test]
    fn test_parse_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "A=1").unwrap();
        writeln!(file, "  B=2").unwrap();

        let vars = parse_env_file(file.path()).unwrap();
        assert_eq!(vars, vec!["A=1".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn test_parse_env_file_rejects_invalid_utf8() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'A', b'=', 0xff, 0xfe, b'\n']).unwrap();

        assert!(matches!(
            parse_env_file(file.path()),
            Err(ConfigError::InvalidEnvVar(_))
        ));
    }
}
