//! Macvtap binding: the pod's macvtap device is handed to the VM as is.

use super::{BindingMechanism, ethernet_fragment, merge_by_alias, validate_mtu};
use crate::dhcp::DhcpConfig;
use crate::domain::{self, DomainSpec};
use crate::error::Result;
use crate::mac::MacAddr;
use crate::netdriver::NetworkHandler;
use crate::podnic::NetContext;
use crate::vmi;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Discovered {
    pod_iface: String,
    mac: Option<MacAddr>,
    mtu: u16,
}

pub struct MacvtapBinding {
    iface: vmi::Interface,
    handler: Arc<dyn NetworkHandler>,
    discovered: Option<Discovered>,
}

impl MacvtapBinding {
    pub fn new(iface: vmi::Interface, ctx: &NetContext) -> Self {
        Self {
            iface,
            handler: Arc::clone(&ctx.handler),
            discovered: None,
        }
    }
}

#[async_trait]
impl BindingMechanism for MacvtapBinding {
    async fn discover_pod_network_interface(&mut self, pod_iface: &str) -> Result<()> {
        let link = self.handler.link_by_name(pod_iface).await?;
        let mtu = validate_mtu(link.mtu)?;
        debug!(iface = pod_iface, mtu, kind = ?link.kind, "Discovered macvtap device");

        self.discovered = Some(Discovered {
            pod_iface: pod_iface.to_string(),
            mac: link.mac,
            mtu,
        });
        Ok(())
    }

    async fn prepare_pod_network_interface(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate_domain_iface_spec(&self) -> domain::Interface {
        match &self.discovered {
            Some(d) => ethernet_fragment(&self.iface, d.mac, d.mtu, d.pod_iface.clone()),
            None => domain::Interface::default(),
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
        merge_by_alias(domain, &self.iface.name, fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Alias;
    use crate::test_util::{FakeLink, NetContextBuilder};
    use crate::vmi::BindingKind;

    #[tokio::test]
    async fn test_fragment_copies_device() {
        let t = NetContextBuilder::new()
            .link(FakeLink::new("pod16477688c0e", "02:11:22:33:44:55").mtu(9000))
            .build();
        let mut binding =
            MacvtapBinding::new(vmi::Interface::new("blue", BindingKind::Macvtap), &t.ctx);
        binding
            .discover_pod_network_interface("pod16477688c0e")
            .await
            .unwrap();
        binding.prepare_pod_network_interface().await.unwrap();

        let fragment = binding.generate_domain_iface_spec();
        assert_eq!(fragment.mac, Some("02:11:22:33:44:55".parse().unwrap()));
        assert_eq!(fragment.mtu, Some(9000));
        assert_eq!(fragment.target_device(), Some("pod16477688c0e"));
        assert!(binding.generate_dhcp_config().is_none());
        assert!(t.handler.calls().is_empty());

        let mut domain = DomainSpec::default();
        domain.devices.interfaces.push(domain::Interface {
            alias: Some(Alias::user_defined("blue")),
            ..Default::default()
        });
        binding.decorate_config(&mut domain, &fragment).unwrap();
        assert_eq!(domain.interfaces().len(), 1);
        assert_eq!(domain.interfaces()[0].mtu, Some(9000));
    }
}
