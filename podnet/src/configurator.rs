//! VM-wide network setup over all interfaces of a VMI.

use crate::domain::DomainSpec;
use crate::error::{Error, Result};
use crate::namescheme::NameScheme;
use crate::podnic::{NetContext, PodNic};
use crate::vmi::{Network, VirtualMachineInstance};
use async_trait::async_trait;
use tracing::info;

/// Runs both setup phases for a set of networks.
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    async fn setup_pod_network_phase1(&self, networks: &[Network]) -> Result<()>;

    async fn setup_pod_network_phase2(
        &self,
        domain: &mut DomainSpec,
        networks: &[Network],
    ) -> Result<()>;

    /// Stop the DHCP servers of the given networks, e.g. after an unplug.
    fn stop_dhcp(&self, networks: &[Network]) -> Result<()>;
}

pub struct VmNetworkConfigurator {
    vmi: VirtualMachineInstance,
    ctx: NetContext,
    /// Pid of the VM-hosting process when running outside of it.
    launcher_pid: Option<u32>,
}

impl VmNetworkConfigurator {
    pub fn new(vmi: VirtualMachineInstance, ctx: NetContext, launcher_pid: Option<u32>) -> Self {
        Self {
            vmi,
            ctx,
            launcher_pid,
        }
    }

    pub fn vmi(&self) -> &VirtualMachineInstance {
        &self.vmi
    }

    fn pod_nics(&self, networks: &[Network]) -> Result<Vec<PodNic>> {
        let scheme = NameScheme::for_vmi(&self.vmi);
        networks
            .iter()
            .map(|network| {
                let pod_iface = scheme.pod_interface_name(&network.name).ok_or_else(|| {
                    Error::Validation(format!("network '{}' is not part of the VMI", network.name))
                })?;
                PodNic::new(&self.vmi, network, pod_iface, self.launcher_pid, &self.ctx)
            })
            .collect()
    }
}

#[async_trait]
impl NetworkConfigurator for VmNetworkConfigurator {
    async fn setup_pod_network_phase1(&self, networks: &[Network]) -> Result<()> {
        // Sequential: interfaces share bridge and tap name space.
        for mut nic in self.pod_nics(networks)? {
            nic.phase1().await?;
        }
        info!(vmi = %self.vmi.metadata.name, networks = networks.len(), "Pod network phase 1 done");
        Ok(())
    }

    async fn setup_pod_network_phase2(
        &self,
        domain: &mut DomainSpec,
        networks: &[Network],
    ) -> Result<()> {
        for nic in self.pod_nics(networks)? {
            nic.phase2(domain).await?;
        }
        info!(vmi = %self.vmi.metadata.name, networks = networks.len(), "Pod network phase 2 done");
        Ok(())
    }

    fn stop_dhcp(&self, networks: &[Network]) -> Result<()> {
        for nic in self.pod_nics(networks)? {
            nic.stop_dhcp();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{self, Alias};
    use crate::test_util::{FakeLink, NetContextBuilder, vmi_with};
    use crate::vmi::{self, BindingKind};

    fn domain_for(names: &[&str]) -> DomainSpec {
        let mut domain = DomainSpec::default();
        for name in names {
            domain.devices.interfaces.push(domain::Interface {
                model: Some("virtio-non-transitional".into()),
                alias: Some(Alias::user_defined(*name)),
                ..Default::default()
            });
        }
        domain
    }

    #[tokio::test]
    async fn test_every_binding_leaves_one_entry_except_slirp() {
        let t = NetContextBuilder::new()
            .link(FakeLink::new("eth0", "0a:58:0a:23:00:06").addr("10.35.0.6/24"))
            .link(FakeLink::new(
                &crate::namescheme::hashed_pod_interface_name("blue"),
                "02:11:22:33:44:55",
            ))
            .build();

        let vmi = vmi_with(
            vec![
                vmi::Interface::new("default", BindingKind::Masquerade),
                vmi::Interface::new("blue", BindingKind::Macvtap),
                vmi::Interface::new("user", BindingKind::Slirp),
            ],
            vec![
                Network::pod("default"),
                Network::multus("blue", "blue-net"),
                Network::multus("user", "user-net"),
            ],
        );
        let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);
        configurator
            .setup_pod_network_phase1(vmi.networks())
            .await
            .unwrap();

        let mut domain = domain_for(&["default", "blue", "user"]);
        configurator
            .setup_pod_network_phase2(&mut domain, vmi.networks())
            .await
            .unwrap();

        for name in ["default", "blue"] {
            let matching = domain
                .interfaces()
                .iter()
                .filter(|i| i.alias_name() == Some(name))
                .count();
            assert_eq!(matching, 1, "{name}");
        }
        assert!(domain.interface_by_alias("user").is_none());
        assert_eq!(domain.qemu_args.len(), 2);

        assert_eq!(t.dhcp.started(), vec!["k6t-eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let t = NetContextBuilder::new().build();
        let vmi = vmi_with(vec![], vec![]);
        let configurator = VmNetworkConfigurator::new(vmi, t.ctx.clone(), None);
        let err = configurator
            .setup_pod_network_phase1(&[Network::pod("default")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
