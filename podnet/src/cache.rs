//! Cross-process record store.
//!
//! Phase 1 and phase 2 run in different processes, so everything phase 2
//! needs is persisted as small versioned JSON records. Writes go through a
//! temporary file in the target directory followed by a rename, so a reader
//! sees either the old record or the complete new one.

use crate::config::NetConfig;
use crate::dhcp::DhcpConfig;
use crate::domain;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to access cache record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt cache record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache record {path} has version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("Cache record {kind} for interface '{iface}' does not exist")]
    Missing { kind: &'static str, iface: String },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Whose view of the filesystem a record lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheOwner {
    /// The VM-hosting process; `None` addresses the calling process itself.
    Launcher(Option<u32>),
    /// Per-VMI state kept by the node agent.
    Vmi(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub owner: CacheOwner,
    pub iface: String,
}

impl CacheKey {
    pub fn launcher(pid: Option<u32>, iface: impl Into<String>) -> Self {
        Self {
            owner: CacheOwner::Launcher(pid),
            iface: iface.into(),
        }
    }

    pub fn vmi(uid: impl Into<String>, iface: impl Into<String>) -> Self {
        Self {
            owner: CacheOwner::Vmi(uid.into()),
            iface: iface.into(),
        }
    }
}

/// A payload that can be stored in the cache.
pub trait CacheRecord: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const VERSION: u32;
}

impl CacheRecord for domain::Interface {
    const KIND: &'static str = "interface";
    const VERSION: u32 = 1;
}

impl CacheRecord for DhcpConfig {
    const KIND: &'static str = "dhcp";
    const VERSION: u32 = 1;
}

/// Progress of phase 1 for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodIfaceState {
    #[default]
    Pending,
    Started,
    Finished,
}

/// What the node agent remembers about a pod interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIfaceRecord {
    pub state: PodIfaceState,
    #[serde(default)]
    pub pod_ips: Vec<IpAddr>,
}

impl CacheRecord for PodIfaceRecord {
    const KIND: &'static str = "pod-interface";
    const VERSION: u32 = 1;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    record: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    record: T,
}

/// Typed key/value store over the configured cache directories.
#[derive(Debug, Clone)]
pub struct CacheStore {
    launcher_private_dir: PathBuf,
    proc_root: PathBuf,
    handler_cache_dir: PathBuf,
}

impl CacheStore {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            launcher_private_dir: config.launcher_private_dir.clone(),
            proc_root: config.proc_root.clone(),
            handler_cache_dir: config.handler_cache_dir.clone(),
        }
    }

    fn dir(&self, owner: &CacheOwner) -> PathBuf {
        match owner {
            CacheOwner::Launcher(None) => self.launcher_private_dir.clone(),
            CacheOwner::Launcher(Some(pid)) => {
                let private = self
                    .launcher_private_dir
                    .strip_prefix("/")
                    .unwrap_or(&self.launcher_private_dir);
                self.proc_root.join(pid.to_string()).join("root").join(private)
            }
            CacheOwner::Vmi(uid) => self.handler_cache_dir.join(uid),
        }
    }

    pub fn path<T: CacheRecord>(&self, key: &CacheKey) -> PathBuf {
        self.dir(&key.owner)
            .join(format!("{}-{}.json", T::KIND, key.iface))
    }

    /// Read a record. `Ok(None)` means it was never written.
    pub fn read<T: CacheRecord>(&self, key: &CacheKey) -> Result<Option<T>> {
        let path = self.path::<T>(key);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let envelope: Envelope<T> = serde_json::from_slice(&content)
            .map_err(|source| CacheError::Decode {
                path: path.clone(),
                source,
            })?;

        if envelope.version != T::VERSION {
            return Err(CacheError::Version {
                path,
                found: envelope.version,
                expected: T::VERSION,
            });
        }

        Ok(Some(envelope.record))
    }

    /// Read a record that must already exist.
    pub fn read_required<T: CacheRecord>(&self, key: &CacheKey) -> Result<T> {
        self.read(key)?.ok_or_else(|| CacheError::Missing {
            kind: T::KIND,
            iface: key.iface.clone(),
        })
    }

    /// Atomically replace a record.
    pub fn write<T: CacheRecord>(&self, key: &CacheKey, record: &T) -> Result<()> {
        let path = self.path::<T>(key);
        let dir = path.parent().unwrap_or(Path::new("."));
        let io_err = |source| CacheError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;

        let content = serde_json::to_vec(&EnvelopeRef {
            version: T::VERSION,
            record,
        })
        .map_err(|source| CacheError::Decode {
            path: path.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&content).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), kind = T::KIND, "Cache record written");
        Ok(())
    }

    pub fn remove<T: CacheRecord>(&self, key: &CacheKey) -> Result<()> {
        let path = self.path::<T>(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Alias;
    use tempfile::TempDir;

    fn store() -> (TempDir, CacheStore) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(&NetConfig::rooted_at(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_read_absent_is_none() {
        let (_dir, store) = store();
        let key = CacheKey::launcher(None, "default");
        assert!(store.read::<domain::Interface>(&key).unwrap().is_none());
        assert!(matches!(
            store.read_required::<domain::Interface>(&key),
            Err(CacheError::Missing { kind: "interface", .. })
        ));
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let key = CacheKey::launcher(Some(4242), "default");
        let iface = domain::Interface {
            mtu: Some(1410),
            alias: Some(Alias::user_defined("default")),
            ..Default::default()
        };

        store.write(&key, &iface).unwrap();
        assert_eq!(store.read::<domain::Interface>(&key).unwrap(), Some(iface));
        assert!(
            store
                .path::<domain::Interface>(&key)
                .to_string_lossy()
                .contains("proc/4242/root")
        );
    }

    #[test]
    fn test_launcher_pid_and_self_address_same_file() {
        let dir = TempDir::new().unwrap();
        let mut config = NetConfig::rooted_at(dir.path());
        config.launcher_private_dir = PathBuf::from("/var/run/private");
        config.proc_root = dir.path().join("proc");
        let store = CacheStore::new(&config);

        let by_pid = store.path::<DhcpConfig>(&CacheKey::launcher(Some(7), "default"));
        assert_eq!(
            by_pid,
            dir.path().join("proc/7/root/var/run/private/dhcp-default.json")
        );
        let by_self = store.path::<DhcpConfig>(&CacheKey::launcher(None, "default"));
        assert_eq!(by_self, PathBuf::from("/var/run/private/dhcp-default.json"));
    }

    #[test]
    fn test_version_mismatch_and_corruption_are_errors() {
        let (_dir, store) = store();
        let key = CacheKey::vmi("uid-1", "default");
        let path = store.path::<PodIfaceRecord>(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, r#"{"version": 9, "record": {"state": "started"}}"#).unwrap();
        assert!(matches!(
            store.read::<PodIfaceRecord>(&key),
            Err(CacheError::Version { found: 9, .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            store.read::<PodIfaceRecord>(&key),
            Err(CacheError::Decode { .. })
        ));
    }

    #[test]
    fn test_overwrite_and_remove() {
        let (_dir, store) = store();
        let key = CacheKey::vmi("uid-1", "default");
        let mut record = PodIfaceRecord {
            state: PodIfaceState::Started,
            pod_ips: vec!["10.35.0.6".parse().unwrap()],
        };
        store.write(&key, &record).unwrap();

        record.state = PodIfaceState::Finished;
        store.write(&key, &record).unwrap();
        assert_eq!(store.read::<PodIfaceRecord>(&key).unwrap(), Some(record));

        store.remove::<PodIfaceRecord>(&key).unwrap();
        store.remove::<PodIfaceRecord>(&key).unwrap();
        assert!(store.read::<PodIfaceRecord>(&key).unwrap().is_none());
    }
}
