//! Persistent node configuration
//!
//! Configuration is a flat set of named blobs, one per [`ConfigKey`]. On the
//! device each key is a small file on flash; the host keeps them in a
//! directory ([`FileStore`]) or in memory ([`MemoryStore`]).

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Names of the stored configuration values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    WifiSsid,
    WifiPassword,
    MqttHost,
    MqttUsername,
    MqttPassword,
    MeshController,
    MeshPeers,
    MeshChannel,
    MeshKey,
    Configured,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 10] = [
        ConfigKey::WifiSsid,
        ConfigKey::WifiPassword,
        ConfigKey::MqttHost,
        ConfigKey::MqttUsername,
        ConfigKey::MqttPassword,
        ConfigKey::MeshController,
        ConfigKey::MeshPeers,
        ConfigKey::MeshChannel,
        ConfigKey::MeshKey,
        ConfigKey::Configured,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConfigKey::WifiSsid => "wifiSSID",
            ConfigKey::WifiPassword => "wifiPass",
            ConfigKey::MqttHost => "mqttHost",
            ConfigKey::MqttUsername => "mqttUser",
            ConfigKey::MqttPassword => "mqttPass",
            ConfigKey::MeshController => "meshController",
            ConfigKey::MeshPeers => "meshPeers",
            ConfigKey::MeshChannel => "meshChannel",
            ConfigKey::MeshKey => "meshKey",
            ConfigKey::Configured => "configured",
        }
    }
}

/// Storage failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage is not mounted")]
    Unmounted,
}

/// Named-value persistence.
pub trait ConfigStore: Send {
    /// Read a value, `None` if it was never written or was deleted
    fn read(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&mut self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError>;

    fn exists(&self, key: ConfigKey) -> bool;

    /// Remove every stored value
    fn format(&mut self) -> Result<(), StoreError>;

    /// Flush and release the underlying storage before a restart
    fn unmount(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Read a value as text, the empty string if absent or unreadable.
    fn read_string(&self, key: ConfigKey) -> String {
        match self.read(key) {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(None) => String::new(),
            Err(e) => {
                warn!(target: "fs", "unable to read {}: {}", key.name(), e);
                String::new()
            }
        }
    }

    /// True if the key holds a non-empty value.
    fn has_value(&self, key: ConfigKey) -> bool {
        matches!(self.read(key), Ok(Some(bytes)) if !bytes.is_empty())
    }
}

/// Volatile store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<ConfigKey, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed values, mainly for tests.
    pub fn with(mut self, key: ConfigKey, value: &str) -> Self {
        self.values.insert(key, value.as_bytes().to_vec());
        self
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.get(&key).cloned())
    }

    fn write(&mut self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError> {
        self.values.insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError> {
        self.values.remove(&key);
        Ok(())
    }

    fn exists(&self, key: ConfigKey) -> bool {
        self.values.contains_key(&key)
    }

    fn format(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        Ok(())
    }
}

/// One file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Mount the store, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;

        debug!(target: "fs", "mounted store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: ConfigKey) -> PathBuf {
        self.root.join(key.name())
    }

    fn io_error(key: ConfigKey, source: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.name().to_string(),
            source,
        }
    }
}

impl ConfigStore for FileStore {
    fn read(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError> {
        trace!(target: "fs", "opening (r) {}", key.name());
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    fn write(&mut self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError> {
        trace!(target: "fs", "writing {} bytes to {}", value.len(), key.name());
        fs::write(self.path(key), value).map_err(|e| Self::io_error(key, e))
    }

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    fn exists(&self, key: ConfigKey) -> bool {
        self.path(key).exists()
    }

    fn format(&mut self) -> Result<(), StoreError> {
        debug!(target: "fs", "formatting store at {:?}", self.root);
        for key in ConfigKey::ALL {
            self.delete(key)?;
        }
        Ok(())
    }
}
