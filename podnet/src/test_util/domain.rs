//! Recording hypervisor domain, DHCP launcher and configurator.

use crate::configurator::NetworkConfigurator;
use crate::dhcp::{self, DhcpLauncher, Lease};
use crate::domain::{self as dom, DomainSpec, InterfaceTarget};
use crate::error::{Error, Result};
use crate::hypervisor::{self, AffectFlags, DomainDevices, HypervisorError};
use crate::mac::MacAddr;
use crate::namescheme::{hashed_pod_interface_name, tap_name};
use crate::vmi::Network;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Attach,
    Detach,
    Update,
}

impl DeviceOp {
    fn virsh_name(self) -> &'static str {
        match self {
            DeviceOp::Attach => "attach-device",
            DeviceOp::Detach => "detach-device",
            DeviceOp::Update => "update-device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCall {
    pub op: DeviceOp,
    pub xml: String,
    pub flags: AffectFlags,
}

/// [`DomainDevices`] that records every call.
#[derive(Default)]
pub struct FakeDomain {
    calls: Mutex<Vec<DeviceCall>>,
    /// Calls whose XML contains any of these fail.
    failing: Mutex<Vec<String>>,
}

impl FakeDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail device calls whose XML contains `needle`, e.g. an alias.
    pub fn fail_matching(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, op: DeviceOp) -> Vec<DeviceCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn record(&self, op: DeviceOp, xml: &str, flags: AffectFlags) -> hypervisor::Result<()> {
        self.calls.lock().unwrap().push(DeviceCall {
            op,
            xml: xml.to_string(),
            flags,
        });
        if self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|needle| xml.contains(needle.as_str()))
        {
            return Err(HypervisorError::Failed {
                op: op.virsh_name(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DomainDevices for FakeDomain {
    async fn attach_device(&self, xml: &str, flags: AffectFlags) -> hypervisor::Result<()> {
        self.record(DeviceOp::Attach, xml, flags)
    }

    async fn detach_device(&self, xml: &str, flags: AffectFlags) -> hypervisor::Result<()> {
        self.record(DeviceOp::Detach, xml, flags)
    }

    async fn update_device(&self, xml: &str, flags: AffectFlags) -> hypervisor::Result<()> {
        self.record(DeviceOp::Update, xml, flags)
    }
}

/// [`DhcpLauncher`] that only remembers which bridges it served.
#[derive(Default)]
pub struct FakeDhcp {
    started: Mutex<Vec<(String, Lease)>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeDhcp {
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(iface, _)| iface.clone())
            .collect()
    }

    pub fn lease(&self, iface: &str) -> Option<Lease> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == iface)
            .map(|(_, lease)| lease.clone())
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl DhcpLauncher for FakeDhcp {
    fn start(&self, iface: &str, lease: Lease) -> dhcp::Result<()> {
        self.started.lock().unwrap().push((iface.to_string(), lease));
        Ok(())
    }

    fn stop(&self, iface: &str) {
        self.stopped.lock().unwrap().push(iface.to_string());
    }

    fn has_running(&self) -> bool {
        let stopped = self.stopped();
        self.started().iter().any(|iface| !stopped.contains(iface))
    }
}

/// [`NetworkConfigurator`] that decorates interfaces with their hashed tap.
#[derive(Default)]
pub struct FakeConfigurator {
    phase1: Mutex<Vec<String>>,
    phase2: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail phase 1 for `network`.
    pub fn fail_for(&self, network: &str) {
        self.failing.lock().unwrap().insert(network.to_string());
    }

    pub fn phase1_networks(&self) -> Vec<String> {
        self.phase1.lock().unwrap().clone()
    }

    pub fn phase2_networks(&self) -> Vec<String> {
        self.phase2.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkConfigurator for FakeConfigurator {
    async fn setup_pod_network_phase1(&self, networks: &[Network]) -> Result<()> {
        for network in networks {
            if self.failing.lock().unwrap().contains(&network.name) {
                return Err(Error::critical(
                    "failed to discover pod interface",
                    Error::InterfaceNotFound(network.name.clone()),
                ));
            }
            self.phase1.lock().unwrap().push(network.name.clone());
        }
        Ok(())
    }

    async fn setup_pod_network_phase2(
        &self,
        domain: &mut DomainSpec,
        networks: &[Network],
    ) -> Result<()> {
        for network in networks {
            let iface = domain
                .interface_by_alias_mut(&network.name)
                .ok_or_else(|| Error::InterfaceNotFound(network.name.clone()))?;
            iface.merge(&dom::Interface {
                mac: Some(MacAddr([0x02, 0, 0, 0, 0, 0x42])),
                mtu: Some(1500),
                target: Some(InterfaceTarget {
                    device: tap_name(&hashed_pod_interface_name(&network.name)),
                    managed: false,
                }),
                ..Default::default()
            });
            self.phase2.lock().unwrap().push(network.name.clone());
        }
        Ok(())
    }

    fn stop_dhcp(&self, networks: &[Network]) -> Result<()> {
        let mut stopped = self.stopped.lock().unwrap();
        stopped.extend(networks.iter().map(|n| n.name.clone()));
        Ok(())
    }
}
