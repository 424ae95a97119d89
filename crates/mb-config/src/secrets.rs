//! `secrets.yaml` lookup for `!secret` tags

use crate::error::{ConfigError, ConfigResult};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Flat key → string store loaded from `<config>/secrets.yaml`
#[derive(Debug, Clone)]
pub struct Secrets {
    secrets: HashMap<String, String>,
    path: PathBuf,
}

impl Secrets {
    /// Load secrets; a missing file yields an empty store
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join("secrets.yaml");

        if !path.exists() {
            debug!("No secrets.yaml found at {:?}, using empty secrets", path);
            return Ok(Self {
                secrets: HashMap::new(),
                path,
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        let raw: HashMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;

        let secrets: HashMap<String, String> = raw
            .into_iter()
            .map(|(key, value)| (key, scalar_to_string(value)))
            .collect();

        debug!("Loaded {} secrets from {:?}", secrets.len(), path);
        Ok(Self { secrets, path })
    }

    pub fn get(&self, key: &str) -> ConfigResult<&str> {
        self.secrets
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl Default for Secrets {
    fn default() -> Self {
        Self {
            secrets: HashMap::new(),
            path: PathBuf::from("secrets.yaml"),
        }
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scalars_become_strings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("secrets.yaml"),
            "bridge_password: hunter2\nbridge_port: 8080\nuse_tls: false\nempty:\n",
        )
        .unwrap();

        let secrets = Secrets::load(dir.path()).unwrap();
        assert_eq!(secrets.get("bridge_password").unwrap(), "hunter2");
        assert_eq!(secrets.get("bridge_port").unwrap(), "8080");
        assert_eq!(secrets.get("use_tls").unwrap(), "false");
        assert_eq!(secrets.get("empty").unwrap(), "");
        assert_eq!(secrets.len(), 4);
        assert!(secrets.contains("use_tls"));
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "key: value\n").unwrap();

        let secrets = Secrets::load(dir.path()).unwrap();
        assert!(matches!(
            secrets.get("bridge_password"),
            Err(ConfigError::SecretNotFound { .. })
        ));
    }

    #[test]
    fn test_no_secrets_file() {
        let dir = TempDir::new().unwrap();
        let secrets = Secrets::load(dir.path()).unwrap();
        assert!(secrets.is_empty());
        assert!(secrets.path().ends_with("secrets.yaml"));
    }
}
