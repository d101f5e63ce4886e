//! Runtime configuration.

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Network setup configuration shared by both phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetConfig {
    /// Private state directory of the VM-hosting process, as seen from inside it.
    pub launcher_private_dir: PathBuf,
    /// procfs mount used to reach another process's root filesystem.
    pub proc_root: PathBuf,
    /// Per-VMI cache directory owned by the node agent.
    pub handler_cache_dir: PathBuf,
    /// Resolver configuration of the pod.
    pub resolv_conf: PathBuf,
    pub default_vm_cidr_v4: Ipv4Net,
    pub default_vm_cidr_v6: Ipv6Net,
    /// Extra interfaces to declare up front so hotplug has free PCI slots.
    pub placeholder_count: usize,
    /// Owner of created tap devices (the qemu user).
    pub tap_owner_uid: u32,
    pub tap_queues: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            launcher_private_dir: PathBuf::from("/var/run/kubevirt-private"),
            proc_root: PathBuf::from("/proc"),
            handler_cache_dir: PathBuf::from("/var/run/kubevirt-network"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            default_vm_cidr_v4: Ipv4Net::new(Ipv4Addr::new(10, 0, 2, 0), 24).unwrap_or_default(),
            default_vm_cidr_v6: Ipv6Net::new(Ipv6Addr::new(0xfd10, 0, 2, 0, 0, 0, 0, 0), 120)
                .unwrap_or_default(),
            placeholder_count: 0,
            tap_owner_uid: 107,
            tap_queues: 1,
        }
    }
}

impl NetConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Configuration rooted at `base`, for tests and chroot-style deployments.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            launcher_private_dir: base.join("launcher"),
            proc_root: base.join("proc"),
            handler_cache_dir: base.join("handler"),
            resolv_conf: base.join("resolv.conf"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.default_vm_cidr_v4.to_string(), "10.0.2.0/24");
        assert_eq!(config.default_vm_cidr_v6.to_string(), "fd10:0:2::/120");
        assert_eq!(config.placeholder_count, 0);
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podnet.json");
        std::fs::write(&path, r#"{"placeholderCount": 4, "procRoot": "/host/proc"}"#).unwrap();

        let config = NetConfig::load(&path).unwrap();
        assert_eq!(config.placeholder_count, 4);
        assert_eq!(config.proc_root, PathBuf::from("/host/proc"));
        assert_eq!(config.resolv_conf, PathBuf::from("/etc/resolv.conf"));
    }
}
