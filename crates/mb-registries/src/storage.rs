//! Versioned JSON persistence under `<config>/.storage/`

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported version for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// On-disk envelope
///
/// ```json
/// { "version": 1, "minor_version": 1, "key": "meteobridge.device_registry", "data": { ... } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

/// Data that lives in its own storage file
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;
}

/// Handle on the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load `T` from its storage file, or `None` if it was never saved
    ///
    /// A different major version is an error; an older minor version is
    /// accepted with a warning since minor bumps only add defaulted fields.
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<T>> {
        let path = self.file_path(T::KEY);
        if !path.exists() {
            debug!("Storage file not found: {}", T::KEY);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let file: StorageFile<T> = serde_json::from_str(&content)?;

        if file.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: file.version,
            });
        }
        if file.minor_version < T::MINOR_VERSION {
            warn!(
                "Storage {} has older minor version ({} < {})",
                T::KEY,
                file.minor_version,
                T::MINOR_VERSION
            );
        }

        debug!("Loaded storage file: {} (v{}.{})", T::KEY, file.version, file.minor_version);
        Ok(Some(file.data))
    }

    /// Save `data`, writing a temp file first and renaming it into place
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
        }

        let envelope = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        let path = self.file_path(T::KEY);
        let temp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved storage file: {}", T::KEY);
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Sample {
        host: String,
        tries: u32,
    }

    impl Storable for Sample {
        const KEY: &'static str = "test.sample";
        const VERSION: u32 = 1;
        const MINOR_VERSION: u32 = 2;
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        let sample = Sample {
            host: "192.168.1.20".to_string(),
            tries: 3,
        };

        storage.save(&sample).await.unwrap();
        assert!(storage.file_path("test.sample").exists());
        assert!(!storage.file_path("test.sample.tmp").exists());

        let loaded: Option<Sample> = storage.load().await.unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());

        let loaded: Option<Sample> = storage.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_major_version_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        std::fs::create_dir_all(storage.storage_dir()).unwrap();
        std::fs::write(
            storage.file_path("test.sample"),
            r#"{"version": 2, "minor_version": 1, "key": "test.sample", "data": {"host": "x", "tries": 0}}"#,
        )
        .unwrap();

        let result = storage.load::<Sample>().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionMismatch { found: 2, .. })
        ));
    }
}
