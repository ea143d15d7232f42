//! Registry credential support
//!
//! Parses ~/.docker/config.json so pushes to private registries and
//! Docker Hub can authenticate with the user's existing login.

use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Credentials for one registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// Auth entry in the auths section
#[derive(Debug, Deserialize, Default)]
pub struct AuthEntry {
    /// Base64-encoded "username:password"
    pub auth: Option<String>,
}

/// Registry auth configuration from ~/.docker/config.json
#[derive(Debug, Deserialize, Default)]
pub struct RegistryAuthConfig {
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
}

impl RegistryAuthConfig {
    /// Load auth config from ~/.docker/config.json.
    /// A missing or unparseable file yields the empty config.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn config_path() -> Option<PathBuf> {
        Some(dirs::home_dir()?.join(".docker/config.json"))
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// Credentials for Docker Hub.
    ///
    /// Hub entries appear under varying hosts (index.docker.io,
    /// registry.docker.io, with or without scheme), so match any entry whose
    /// host has at least three labels with "docker" second to last.
    pub fn hub_credentials(&self) -> Option<RegistryCredentials> {
        for (server, entry) in &self.auths {
            let host = strip_scheme(server);
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() >= 3 && labels[labels.len() - 2] == "docker" {
                if let Some(creds) = entry_credentials(server, entry) {
                    return Some(creds);
                }
            }
        }
        None
    }

    /// Credentials for a specific registry host, matched by suffix so
    /// scheme-prefixed config keys still resolve.
    pub fn resolve(&self, registry: &str) -> Option<RegistryCredentials> {
        for (server, entry) in &self.auths {
            if strip_scheme(server).starts_with(registry) || server.ends_with(registry) {
                if let Some(creds) = entry_credentials(server, entry) {
                    return Some(creds);
                }
            }
        }
        None
    }
}

fn strip_scheme(server: &str) -> &str {
    server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
}

fn entry_credentials(server: &str, entry: &AuthEntry) -> Option<RegistryCredentials> {
    let (username, password) = decode_auth(entry.auth.as_deref()?)?;
    Some(RegistryCredentials {
        username,
        password,
        server_address: server.to_string(),
    })
}

/// Decode base64-encoded "username:password" auth string
fn decode_auth(auth: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .ok()?;
    let decoded_str = String::from_utf8(decoded).ok()?;
    let parts: Vec<&str> = decoded_str.splitn(2, ':').collect();
    if parts.len() == 2 {
        Some((parts[0].to_string(), parts[1].to_string()))
    } else {
        None
    }
}

/// Extract the registry hostname from an image reference.
/// `nginx` and `library/nginx` have no registry prefix (Docker Hub).
pub fn registry_from_image(image: &str) -> Option<String> {
    let image_no_digest = image.split('@').next().unwrap_or(image);
    let parts: Vec<&str> = image_no_digest.split('/').collect();

    if parts.len() < 2 {
        return None;
    }

    let first = parts[0];
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(server: &str, user: &str, pass: &str) -> RegistryAuthConfig {
        let mut auths = HashMap::new();
        auths.insert(
            server.to_string(),
            AuthEntry {
                auth: Some(
                    base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", user, pass)),
                ),
            },
        );
        RegistryAuthConfig { auths }
    }

    #[test]
    fn test_decode_auth() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("testuser:testpass");
        let result = decode_auth(&encoded);
        assert_eq!(
            result,
            Some(("testuser".to_string(), "testpass".to_string()))
        );
    }

    #[test]
    fn test_decode_auth_with_colon_in_password() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass:word");
        let result = decode_auth(&encoded);
        assert_eq!(result, Some(("user".to_string(), "pass:word".to_string())));
    }

    #[test]
    fn test_hub_credentials_suffix_rule() {
        let config = config_with("https://index.docker.io/v1/", "hubuser", "hubpass");
        let creds = config.hub_credentials().unwrap();
        assert_eq!(creds.username, "hubuser");
        assert_eq!(creds.password, "hubpass");

        // Two labels only, not a hub entry
        let config = config_with("docker.io", "u", "p");
        assert!(config.hub_credentials().is_none());

        let config = config_with("registry.example.com", "u", "p");
        assert!(config.hub_credentials().is_none());
    }

    #[test]
    fn test_resolve_registry() {
        let config = config_with("https://registry.example.com", "reguser", "regpass");
        let creds = config.resolve("registry.example.com").unwrap();
        assert_eq!(creds.username, "reguser");
        assert!(config.resolve("other.example.com").is_none());
    }

    #[test]
    fn test_registry_from_image() {
        assert_eq!(registry_from_image("nginx"), None);
        assert_eq!(registry_from_image("nginx:latest"), None);
        assert_eq!(registry_from_image("library/nginx"), None);
        assert_eq!(
            registry_from_image("registry.example.com/org/img:v1"),
            Some("registry.example.com".to_string())
        );
        assert_eq!(
            registry_from_image("localhost:5000/img"),
            Some("localhost:5000".to_string())
        );
    }
}
