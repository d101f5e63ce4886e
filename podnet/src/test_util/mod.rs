//! Test utilities for podnet unit and integration tests.
//!
//! Provides in-memory stand-ins for the host network, the firewall, the
//! hypervisor domain and the DHCP launcher, plus VMI builders, so both
//! phases and the reconciler can run without privileges.

pub mod domain;
pub mod firewall;
pub mod network;

pub use domain::{DeviceCall, DeviceOp, FakeConfigurator, FakeDhcp, FakeDomain};
pub use firewall::FakeFirewall;
pub use network::{FakeLink, FakeNetworkHandler, HandlerCall};

use crate::cache::CacheStore;
use crate::config::NetConfig;
use crate::nat::NatEngine;
use crate::podnic::NetContext;
use crate::vmi::{
    self, INFO_SOURCE_MULTUS_STATUS, InterfaceStatus, Network, ObjectMeta, VirtualMachineInstance,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_VMI_NAME: &str = "testvmi";
pub const TEST_VMI_UID: &str = "testvmi-uid";

/// A VMI in namespace `default` with the given interfaces and networks.
pub fn vmi_with(interfaces: Vec<vmi::Interface>, networks: Vec<Network>) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance {
        metadata: ObjectMeta {
            name: TEST_VMI_NAME.to_string(),
            namespace: "default".to_string(),
            uid: TEST_VMI_UID.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    vmi.spec.domain.devices.interfaces = interfaces;
    vmi.spec.networks = networks;
    vmi
}

/// Adds status interfaces to a VMI.
pub struct StatusBuilder {
    vmi: VirtualMachineInstance,
}

impl StatusBuilder {
    pub fn new(vmi: VirtualMachineInstance) -> Self {
        Self { vmi }
    }

    /// Report the pod interface of `name` as plugged by multus.
    pub fn multus_ready(mut self, name: &str) -> Self {
        self.vmi.status.interfaces.push(InterfaceStatus {
            name: name.to_string(),
            info_source: Some(format!("domain, guest-agent, {INFO_SOURCE_MULTUS_STATUS}")),
            pod_interface_name: None,
        });
        self
    }

    /// Report an interface that only the domain knows about.
    pub fn domain_only(mut self, name: &str) -> Self {
        self.vmi.status.interfaces.push(InterfaceStatus {
            name: name.to_string(),
            info_source: Some("domain".to_string()),
            pod_interface_name: None,
        });
        self
    }

    /// Report the pod interface name the VMI status carries for `name`.
    pub fn pod_interface(mut self, name: &str, pod_iface: &str) -> Self {
        self.vmi.status.interfaces.push(InterfaceStatus {
            name: name.to_string(),
            info_source: Some("domain".to_string()),
            pod_interface_name: Some(pod_iface.to_string()),
        });
        self
    }

    pub fn build(self) -> VirtualMachineInstance {
        self.vmi
    }
}

/// A [`NetContext`] wired to fakes, rooted in a temporary directory.
pub struct TestContext {
    pub ctx: NetContext,
    pub handler: Arc<FakeNetworkHandler>,
    pub firewall: Arc<FakeFirewall>,
    pub dhcp: Arc<FakeDhcp>,
    pub dir: TempDir,
}

/// Written unless [`NetContextBuilder::without_resolv_conf`] is set.
const DEFAULT_RESOLV_CONF: &str = "\
search default.svc.cluster.local svc.cluster.local cluster.local
nameserver 10.96.0.10
";

#[derive(Default)]
pub struct NetContextBuilder {
    links: Vec<FakeLink>,
    firewall_unavailable: bool,
    resolv_conf: Option<String>,
    without_resolv_conf: bool,
}

impl NetContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(mut self, link: FakeLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn firewall_unavailable(mut self) -> Self {
        self.firewall_unavailable = true;
        self
    }

    /// Content of the pod's resolver configuration.
    pub fn resolv_conf(mut self, content: &str) -> Self {
        self.resolv_conf = Some(content.to_string());
        self
    }

    /// Leave the resolver configuration file absent.
    pub fn without_resolv_conf(mut self) -> Self {
        self.without_resolv_conf = true;
        self
    }

    pub fn build(self) -> TestContext {
        let dir = TempDir::new().expect("create temp dir");
        let config = NetConfig::rooted_at(dir.path());
        if !self.without_resolv_conf {
            let content = self.resolv_conf.as_deref().unwrap_or(DEFAULT_RESOLV_CONF);
            std::fs::write(&config.resolv_conf, content).expect("write resolv.conf");
        }

        let handler = Arc::new(FakeNetworkHandler::new());
        for link in self.links {
            handler.insert(link);
        }

        let firewall = Arc::new(if self.firewall_unavailable {
            FakeFirewall::unavailable("fake")
        } else {
            FakeFirewall::new("fake")
        });
        let dhcp = Arc::new(FakeDhcp::default());

        let ctx = NetContext {
            cache: CacheStore::new(&config),
            config: Arc::new(config),
            handler: handler.clone(),
            nat: NatEngine::new(vec![firewall.clone()]),
            dhcp: dhcp.clone(),
        };

        TestContext {
            ctx,
            handler,
            firewall,
            dhcp,
            dir,
        }
    }
}
