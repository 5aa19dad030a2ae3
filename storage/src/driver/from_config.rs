use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::sync::Arc;

use super::{FilesystemDriver, MemoryDriver, StorageDriver};
use crate::Error;

/// A distribution-style storage driver declaration, as it appears nested
/// under `storage.ipfs.cache` in the configuration:
///
/// ```yaml
/// cache:
///   filesystem:
///     rootdirectory: /var/cache/disco
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DriverConfigRepr {
    Filesystem { rootdirectory: PathBuf },
    Inmemory {},
}

#[derive(Debug, Clone)]
pub enum DriverConfig {
    Filesystem { rootdirectory: PathBuf },
    Inmemory {},
}

impl<'de> Deserialize<'de> for DriverConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_yaml::with::singleton_map::deserialize(deserializer)? {
            DriverConfigRepr::Filesystem { rootdirectory } => {
                Ok(DriverConfig::Filesystem { rootdirectory })
            }
            DriverConfigRepr::Inmemory {} => Ok(DriverConfig::Inmemory {}),
        }
    }
}

/// Constructs a driver from its configuration declaration.
pub async fn from_config(config: &DriverConfig) -> Result<Arc<dyn StorageDriver>, Error> {
    match config {
        DriverConfig::Filesystem { rootdirectory } => {
            let driver = FilesystemDriver::new(rootdirectory.clone())
                .await
                .map_err(|e| {
                    Error::StorageError(format!(
                        "failed to open root directory {}: {}",
                        rootdirectory.display(),
                        e
                    ))
                })?;
            Ok(Arc::new(driver))
        }
        DriverConfig::Inmemory {} => Ok(Arc::new(MemoryDriver::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_filesystem_declaration() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("filesystem:\n  rootdirectory: {}\n", dir.path().display());
        let config: DriverConfig = serde_yaml::from_str(&yaml).unwrap();
        let driver = from_config(&config).await.unwrap();
        assert_eq!("filesystem", driver.name());
    }

    #[tokio::test]
    async fn parses_inmemory_declaration() {
        let config: DriverConfig = serde_yaml::from_str("inmemory: {}\n").unwrap();
        let driver = from_config(&config).await.unwrap();
        assert_eq!("inmemory", driver.name());
    }
}
