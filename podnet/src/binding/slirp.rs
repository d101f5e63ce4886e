//! Slirp binding: QEMU user-mode networking.
//!
//! Nothing on the host changes. The hypervisor does not model user-mode
//! netdevs as interfaces, so the interface entry is swapped for a `-device`
//! argument on the QEMU command line.

use super::BindingMechanism;
use crate::dhcp::DhcpConfig;
use crate::domain::{self, Alias, DomainSpec};
use crate::error::{Error, Result};
use crate::vmi;
use async_trait::async_trait;
use tracing::debug;

const DEFAULT_MODEL: &str = "e1000";

pub struct SlirpBinding {
    iface: vmi::Interface,
}

impl SlirpBinding {
    pub fn new(iface: vmi::Interface) -> Self {
        Self { iface }
    }
}

#[async_trait]
impl BindingMechanism for SlirpBinding {
    async fn discover_pod_network_interface(&mut self, _pod_iface: &str) -> Result<()> {
        Ok(())
    }

    async fn prepare_pod_network_interface(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate_domain_iface_spec(&self) -> domain::Interface {
        domain::Interface {
            mac: self.iface.mac_address,
            model: self.iface.model.clone(),
            alias: Some(Alias::user_defined(&self.iface.name)),
            ..Default::default()
        }
    }

    fn generate_dhcp_config(&self) -> Option<DhcpConfig> {
        None
    }

    fn decorate_config(
        &self,
        domain: &mut DomainSpec,
        fragment: &domain::Interface,
    ) -> Result<()> {
        let name = &self.iface.name;
        let removed = domain
            .remove_interface_by_alias(name)
            .ok_or_else(|| Error::InterfaceNotFound(name.clone()))?;

        let model = removed
            .model
            .or_else(|| fragment.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut device = format!("{model},netdev={name},id={name}");
        if let Some(mac) = fragment.mac.or(removed.mac) {
            device.push_str(&format!(",mac={mac}"));
        }

        debug!(iface = %name, device = %device, "Replacing interface with QEMU user netdev");
        domain.qemu_args.push("-device".to_string());
        domain.qemu_args.push(device);
        Ok(())
    }
}
