//! The subset of the VirtualMachineInstance resource consumed here.
//!
//! Field names follow the Kubernetes JSON representation so a VMI can be fed
//! in straight from the API server.

use crate::mac::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status info-source tag set once the pod interface is plugged by multus.
pub const INFO_SOURCE_MULTUS_STATUS: &str = "multus-status";

pub const ISTIO_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstance {
    pub metadata: ObjectMeta,
    pub spec: VmiSpec,
    #[serde(default)]
    pub status: VmiStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmiSpec {
    #[serde(default)]
    pub domain: DomainInput,
    #[serde(default)]
    pub networks: Vec<Network>,
    pub hostname: Option<String>,
    pub subdomain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInput {
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

/// Marker for binding methods that carry no settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// How an interface is connected. Exactly one field is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBindingMethod {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slirp: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macvtap: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sriov: Option<Empty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Bridge,
    Masquerade,
    Slirp,
    Macvtap,
    Sriov,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingKind::Bridge => "bridge",
            BindingKind::Masquerade => "masquerade",
            BindingKind::Slirp => "slirp",
            BindingKind::Macvtap => "macvtap",
            BindingKind::Sriov => "sriov",
        };
        f.write_str(name)
    }
}

impl InterfaceBindingMethod {
    /// All binding kinds that are set.
    pub fn kinds(&self) -> Vec<BindingKind> {
        [
            (self.bridge.is_some(), BindingKind::Bridge),
            (self.masquerade.is_some(), BindingKind::Masquerade),
            (self.slirp.is_some(), BindingKind::Slirp),
            (self.macvtap.is_some(), BindingKind::Macvtap),
            (self.sriov.is_some(), BindingKind::Sriov),
        ]
        .into_iter()
        .filter_map(|(set, kind)| set.then_some(kind))
        .collect()
    }

    pub fn of(kind: BindingKind) -> Self {
        let mut method = Self::default();
        match kind {
            BindingKind::Bridge => method.bridge = Some(Empty {}),
            BindingKind::Masquerade => method.masquerade = Some(Empty {}),
            BindingKind::Slirp => method.slirp = Some(Empty {}),
            BindingKind::Macvtap => method.macvtap = Some(Empty {}),
            BindingKind::Sriov => method.sriov = Some(Empty {}),
        }
        method
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceState {
    Up,
    Down,
    Absent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Unset means TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpPrivateOption {
    pub option: u8,
    pub value: String,
}

/// Extra DHCP options requested for an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpOptions {
    pub boot_file_name: Option<String>,
    pub tftp_server_name: Option<String>,
    #[serde(default)]
    pub ntp_servers: Vec<String>,
    #[serde(default)]
    pub private_options: Vec<DhcpPrivateOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(flatten)]
    pub binding: InterfaceBindingMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InterfaceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_options: Option<DhcpOptions>,
}

impl Interface {
    pub fn new(name: impl Into<String>, kind: BindingKind) -> Self {
        Self {
            name: name.into(),
            binding: InterfaceBindingMethod::of(kind),
            ..Default::default()
        }
    }

    pub fn is_sriov(&self) -> bool {
        self.binding.sriov.is_some()
    }

    pub fn is_absent(&self) -> bool {
        self.state == Some(InterfaceState::Absent)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodNetwork {
    #[serde(rename = "vmNetworkCIDR", default, skip_serializing_if = "Option::is_none")]
    pub vm_network_cidr: Option<String>,
    #[serde(rename = "vmIPv6NetworkCIDR", default, skip_serializing_if = "Option::is_none")]
    pub vm_ipv6_network_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetwork {
    pub network_name: String,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetwork>,
}

impl Network {
    pub fn pod(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pod: Some(PodNetwork::default()),
            multus: None,
        }
    }

    pub fn multus(name: impl Into<String>, network_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pod: None,
            multus: Some(MultusNetwork {
                network_name: network_name.into(),
                default: false,
            }),
        }
    }

    /// The network that backs the pod's primary interface.
    pub fn is_primary(&self) -> bool {
        self.pod.is_some() || self.multus.as_ref().is_some_and(|m| m.default)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmiStatus {
    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_interface_name: Option<String>,
}

impl InterfaceStatus {
    /// Whether the comma separated info-source list carries `source`.
    pub fn has_info_source(&self, source: &str) -> bool {
        self.info_source
            .as_deref()
            .is_some_and(|sources| sources.split(',').any(|s| s.trim() == source))
    }
}

impl VirtualMachineInstance {
    pub fn interfaces(&self) -> &[Interface] {
        &self.spec.domain.devices.interfaces
    }

    pub fn networks(&self) -> &[Network] {
        &self.spec.networks
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces().iter().find(|iface| iface.name == name)
    }

    /// Position of the interface in the spec; used for per-interface addressing.
    pub fn interface_index(&self, name: &str) -> Option<usize> {
        self.interfaces().iter().position(|iface| iface.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks().iter().find(|net| net.name == name)
    }

    pub fn status_interface(&self, name: &str) -> Option<&InterfaceStatus> {
        self.status.interfaces.iter().find(|s| s.name == name)
    }

    pub fn has_istio_sidecar(&self) -> bool {
        self.metadata
            .annotations
            .get(ISTIO_INJECT_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Name the guest knows itself by.
    pub fn hostname(&self) -> &str {
        self.spec
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.metadata.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_kubernetes_json() {
        let json = r#"{
            "metadata": {
                "name": "testvmi",
                "namespace": "default",
                "uid": "1234",
                "annotations": {"sidecar.istio.io/inject": "true"}
            },
            "spec": {
                "domain": {"devices": {"interfaces": [
                    {"name": "default", "masquerade": {}, "ports": [{"port": 80}]},
                    {"name": "blue", "bridge": {}, "macAddress": "02:00:00:00:00:01", "state": "absent"}
                ]}},
                "networks": [
                    {"name": "default", "pod": {"vmNetworkCIDR": "10.11.12.0/24"}},
                    {"name": "blue", "multus": {"networkName": "blue-net"}}
                ]
            },
            "status": {"interfaces": [
                {"name": "blue", "infoSource": "domain, multus-status"}
            ]}
        }"#;

        let vmi: VirtualMachineInstance = serde_json::from_str(json).unwrap();
        assert!(vmi.has_istio_sidecar());
        assert_eq!(vmi.interfaces().len(), 2);

        let default = vmi.interface("default").unwrap();
        assert_eq!(default.binding.kinds(), vec![BindingKind::Masquerade]);
        assert_eq!(default.ports[0].protocol, None);

        let blue = vmi.interface("blue").unwrap();
        assert!(blue.is_absent());
        assert_eq!(blue.mac_address.unwrap().to_string(), "02:00:00:00:00:01");

        assert!(vmi.network("default").unwrap().is_primary());
        assert!(!vmi.network("blue").unwrap().is_primary());
        assert_eq!(
            vmi.network("default").unwrap().pod.as_ref().unwrap().vm_network_cidr.as_deref(),
            Some("10.11.12.0/24")
        );

        assert!(
            vmi.status_interface("blue")
                .unwrap()
                .has_info_source(INFO_SOURCE_MULTUS_STATUS)
        );
    }

    #[test]
    fn test_hostname_falls_back_to_name() {
        let mut vmi = VirtualMachineInstance::default();
        vmi.metadata.name = "testvmi".into();
        assert_eq!(vmi.hostname(), "testvmi");

        vmi.spec.hostname = Some("guest".into());
        assert_eq!(vmi.hostname(), "guest");
    }
}
