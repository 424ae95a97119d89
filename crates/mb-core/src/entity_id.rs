//! Entity ID type representing a platform.object_id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("unknown platform '{0}' (expected 'sensor' or 'binary_sensor')")]
    UnknownPlatform(String),

    #[error("object_id cannot be empty")]
    EmptyObjectId,

    #[error(
        "object_id contains invalid characters (must be lowercase alphanumeric with underscores, cannot start/end with underscore)"
    )]
    InvalidObjectIdChars,
}

/// Entity platform published by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Numeric or textual measurement
    Sensor,
    /// On/off measurement
    BinarySensor,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
            Platform::BinarySensor => "binary_sensor",
        }
    }
}

impl FromStr for Platform {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(Platform::Sensor),
            "binary_sensor" => Ok(Platform::BinarySensor),
            other => Err(EntityIdError::UnknownPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity ID such as `sensor.meteobridge_air_temperature`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    platform: Platform,
    object_id: String,
}

impl EntityId {
    pub fn new(platform: Platform, object_id: impl Into<String>) -> Result<Self, EntityIdError> {
        let object_id = object_id.into();

        if object_id.is_empty() {
            return Err(EntityIdError::EmptyObjectId);
        }
        if !is_valid_object_id(&object_id) {
            return Err(EntityIdError::InvalidObjectIdChars);
        }

        Ok(Self {
            platform,
            object_id,
        })
    }

    /// Build an entity id from free text, slugifying it first
    pub fn from_name(platform: Platform, name: &str) -> Result<Self, EntityIdError> {
        Self::new(platform, slugify(name))
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Same platform, object id suffixed with `_<n>`
    pub fn with_suffix(&self, n: u32) -> Self {
        Self {
            platform: self.platform,
            object_id: format!("{}_{}", self.object_id, n),
        }
    }
}

fn is_valid_object_id(s: &str) -> bool {
    if s.starts_with('_') || s.ends_with('_') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Lowercase, ASCII-only slug with single underscores between words
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    slug
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, object_id) = s.split_once('.').ok_or(EntityIdError::InvalidFormat)?;
        if object_id.contains('.') {
            return Err(EntityIdError::InvalidFormat);
        }
        Self::new(platform.parse()?, object_id)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.platform, self.object_id)
    }
}
