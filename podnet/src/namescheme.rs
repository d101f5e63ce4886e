//! Pod interface and host device naming.

use crate::netdriver::MAX_IFNAME_LEN;
use crate::vmi::{Network, VirtualMachineInstance};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Pod interface backing the primary network.
pub const PRIMARY_POD_INTERFACE_NAME: &str = "eth0";

const HASHED_PREFIX: &str = "pod";
const HASH_LEN: usize = 11;
const ORDINAL_PREFIX: &str = "net";
const BRIDGE_PREFIX: &str = "k6t-";
const TAP_PREFIX: &str = "tap";
const RENAMED_LINK_SUFFIX: &str = "-nic";

/// `pod` + the first 11 hex digits of sha256(network name).
pub fn hashed_pod_interface_name(network: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(network.as_bytes()));
    format!("{HASHED_PREFIX}{}", &digest[..HASH_LEN])
}

pub fn ordinal_pod_interface_name(ordinal: usize) -> String {
    format!("{ORDINAL_PREFIX}{ordinal}")
}

/// Maps VMI network names to pod interface names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameScheme(HashMap<String, String>);

impl NameScheme {
    /// Pick the scheme for a VMI: ordinal when its status already reports
    /// ordinal pod interface names, hashed otherwise.
    pub fn for_vmi(vmi: &VirtualMachineInstance) -> Self {
        if uses_ordinal_names(vmi) {
            Self::ordinal(vmi.networks())
        } else {
            Self::hashed(vmi.networks())
        }
    }

    pub fn hashed(networks: &[Network]) -> Self {
        Self(
            networks
                .iter()
                .map(|net| {
                    let pod_iface = if net.is_primary() {
                        PRIMARY_POD_INTERFACE_NAME.to_string()
                    } else {
                        hashed_pod_interface_name(&net.name)
                    };
                    (net.name.clone(), pod_iface)
                })
                .collect(),
        )
    }

    pub fn ordinal(networks: &[Network]) -> Self {
        let mut ordinal = 0;
        Self(
            networks
                .iter()
                .map(|net| {
                    let pod_iface = if net.is_primary() {
                        PRIMARY_POD_INTERFACE_NAME.to_string()
                    } else {
                        ordinal += 1;
                        ordinal_pod_interface_name(ordinal)
                    };
                    (net.name.clone(), pod_iface)
                })
                .collect(),
        )
    }

    pub fn pod_interface_name(&self, network: &str) -> Option<&str> {
        self.0.get(network).map(String::as_str)
    }
}

fn uses_ordinal_names(vmi: &VirtualMachineInstance) -> bool {
    vmi.status.interfaces.iter().any(|status| {
        status.pod_interface_name.as_deref().is_some_and(|name| {
            name.strip_prefix(ORDINAL_PREFIX)
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
    })
}

fn truncate(mut name: String) -> String {
    name.truncate(MAX_IFNAME_LEN);
    name
}

/// `eth0` becomes `tap0`, `pod16477688c0e` becomes `tap16477688c0e`.
pub fn tap_name(pod_iface: &str) -> String {
    let suffix = pod_iface.get(3..).unwrap_or(pod_iface);
    truncate(format!("{TAP_PREFIX}{suffix}"))
}

pub fn bridge_name(pod_iface: &str) -> String {
    truncate(format!("{BRIDGE_PREFIX}{pod_iface}"))
}

/// Name the original pod link is moved to while a dummy takes its place.
pub fn renamed_link_name(pod_iface: &str) -> String {
    let keep = MAX_IFNAME_LEN - RENAMED_LINK_SUFFIX.len();
    let base = pod_iface.get(..keep).unwrap_or(pod_iface);
    format!("{base}{RENAMED_LINK_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmi::InterfaceStatus;

    #[test]
    fn test_hashed_name() {
        let name = hashed_pod_interface_name("blue");
        assert!(name.starts_with("pod"));
        assert_eq!(name.len(), 14);
        assert_eq!(name, hashed_pod_interface_name("blue"));
        assert_ne!(name, hashed_pod_interface_name("red"));
    }

    #[test]
    fn test_device_names() {
        assert_eq!(tap_name("eth0"), "tap0");
        assert_eq!(tap_name("net2"), "tap2");

        let hashed = hashed_pod_interface_name("blue");
        assert_eq!(tap_name(&hashed), format!("tap{}", &hashed[3..]));

        assert_eq!(bridge_name("eth0"), "k6t-eth0");
        assert_eq!(bridge_name(&hashed).len(), MAX_IFNAME_LEN);

        assert_eq!(renamed_link_name("eth0"), "eth0-nic");
        assert_eq!(renamed_link_name(&hashed).len(), MAX_IFNAME_LEN);
    }

    #[test]
    fn test_scheme_selection() {
        let mut vmi = VirtualMachineInstance::default();
        vmi.spec.networks = vec![
            Network::pod("default"),
            Network::multus("blue", "blue-net"),
            Network::multus("red", "red-net"),
        ];

        let hashed = NameScheme::for_vmi(&vmi);
        assert_eq!(hashed.pod_interface_name("default"), Some("eth0"));
        assert_eq!(
            hashed.pod_interface_name("red"),
            Some(hashed_pod_interface_name("red").as_str())
        );

        vmi.status.interfaces.push(InterfaceStatus {
            name: "blue".into(),
            info_source: None,
            pod_interface_name: Some("net1".into()),
        });
        let ordinal = NameScheme::for_vmi(&vmi);
        assert_eq!(ordinal.pod_interface_name("blue"), Some("net1"));
        assert_eq!(ordinal.pod_interface_name("red"), Some("net2"));
        assert_eq!(ordinal.pod_interface_name("missing"), None);
    }
}
