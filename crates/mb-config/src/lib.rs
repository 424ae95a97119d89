//! YAML configuration loading
//!
//! Reads `configuration.yaml` with support for custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use mb_config::ServerConfig;
//!
//! let config = ServerConfig::load("/config")?;
//! for bridge in &config.meteobridge {
//!     println!("{}", bridge.host);
//! }
//! ```

mod error;
mod loader;
mod schema;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};
pub use schema::{BridgeConfig, CoreConfig, HostUnitSystem, ServerConfig, CONFIG_FILE};
pub use secrets::Secrets;

pub use serde_yaml::Value;
