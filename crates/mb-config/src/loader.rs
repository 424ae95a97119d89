//! YAML loader with custom tag support
//!
//! - `!include path` - Include another YAML file, relative to the including one
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR` - Environment variable substitution
//!
//! Unknown tags are kept with their inner value processed.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct YamlLoader {
    /// Base directory for relative paths
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, for cycle detection
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: HashSet::new(),
        }
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!("Loading YAML file: {:?}", path);

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.insert(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&path);

        result
    }

    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;

        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    let k = self.process_value(k, source_path)?;
                    let v = self.process_value(v, source_path)?;
                    result.insert(k, v);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Processing tag '{}'", tag);

        match tag.as_str() {
            "!include" => {
                let include_path = self.value_to_path(&tagged.value, source_path)?;
                debug!("Including file: {:?}", include_path);
                self.load_file(&include_path)
            }
            "!secret" => {
                let key = expect_string(tagged.value, "!secret")?;
                let secret = self.secrets.get(&key)?;
                debug!("Substituted secret: {}", key);
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let var = expect_string(tagged.value, "!env_var")?;
                let value = std::env::var(&var)
                    .map_err(|_| ConfigError::EnvVarNotFound { var: var.clone() })?;
                debug!("Substituted env var: {}", var);
                Ok(Value::String(value))
            }
            _ => {
                let processed = self.process_value(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value: processed,
                })))
            }
        }
    }

    /// Resolve an include path relative to the including file
    fn value_to_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(path_str) = value else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };

        let path = Path::new(path_str);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base_dir = source_path.parent().unwrap_or(&self.config_dir);
        Ok(base_dir.join(path))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

fn expect_string(value: Value, tag: &str) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "tag argument must be a string".to_string(),
        }),
    }
}

/// Load a YAML file with full tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    let mut loader = YamlLoader::new(config_dir)?;
    loader.load_file(file)
}

/// Load a YAML string with tag processing
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    let config_dir = config_dir.into();
    let mut loader = YamlLoader::new(&config_dir)?;
    loader.load_string(content, &config_dir.join(source_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn lookup<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap()
    }

    #[test]
    fn test_include_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "bridges/garden.yaml", "host: 10.0.0.5\n");
        write_file(dir.path(), "bridges/all.yaml", "- !include garden.yaml\n");
        write_file(
            dir.path(),
            "configuration.yaml",
            "meteobridge: !include bridges/all.yaml\n",
        );

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        let bridges = lookup(&value, "meteobridge").as_sequence().unwrap();
        assert_eq!(bridges.len(), 1);
        assert_eq!(lookup(&bridges[0], "host").as_str(), Some("10.0.0.5"));
    }

    #[test]
    fn test_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "bridge_password: secret123\n");
        write_file(
            dir.path(),
            "configuration.yaml",
            "password: !secret bridge_password\n",
        );

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        assert_eq!(lookup(&value, "password").as_str(), Some("secret123"));
    }

    #[test]
    fn test_env_var() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("MB_CONFIG_TEST_HOST", "192.168.1.20");
        write_file(
            dir.path(),
            "configuration.yaml",
            "host: !env_var MB_CONFIG_TEST_HOST\n",
        );

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        assert_eq!(lookup(&value, "host").as_str(), Some("192.168.1.20"));

        std::env::remove_var("MB_CONFIG_TEST_HOST");
    }

    #[test]
    fn test_missing_env_var() {
        let dir = TempDir::new().unwrap();
        let result = load_yaml_string(
            dir.path(),
            "host: !env_var MB_CONFIG_TEST_DEFINITELY_UNSET\n",
            "inline.yaml",
        );
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound { .. })));
    }

    #[test]
    fn test_circular_include_detection() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let result = load_yaml(dir.path(), "a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "existing: value\n");
        write_file(dir.path(), "configuration.yaml", "password: !secret nonexistent\n");

        let result = load_yaml(dir.path(), "configuration.yaml");
        assert!(matches!(result, Err(ConfigError::SecretNotFound { .. })));
    }

    #[test]
    fn test_unknown_tag_is_kept() {
        let dir = TempDir::new().unwrap();
        let value = load_yaml_string(dir.path(), "x: !custom [1, 2]\n", "inline.yaml").unwrap();
        assert!(matches!(lookup(&value, "x"), Value::Tagged(_)));
    }
}
