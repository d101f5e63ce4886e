//! Per-interface orchestration of the two setup phases.
//!
//! Phase 1 runs once in the pod's pristine network namespace and records
//! what it learned. Phase 2 runs in the VM-hosting process, reads those
//! records back and decorates the domain.

use crate::binding::{Binding, BindingMechanism};
use crate::cache::{CacheKey, CacheStore, PodIfaceRecord, PodIfaceState};
use crate::config::NetConfig;
use crate::dhcp::{DhcpConfig, DhcpError, DhcpLauncher, Lease, ResolvConf, ServerOptions};
use crate::domain::{self, DomainSpec};
use crate::error::{Error, Result};
use crate::nat::NatEngine;
use crate::namescheme::bridge_name;
use crate::netdriver::NetworkHandler;
use crate::vmi::{self, Network, VirtualMachineInstance};
use std::sync::Arc;
use tracing::{debug, info};

/// Collaborators shared by every PodNIC of a process.
#[derive(Clone)]
pub struct NetContext {
    pub config: Arc<NetConfig>,
    pub handler: Arc<dyn NetworkHandler>,
    pub nat: NatEngine,
    pub cache: CacheStore,
    pub dhcp: Arc<dyn DhcpLauncher>,
}

/// One VMI interface and the pod interface backing it.
pub struct PodNic {
    vmi: VirtualMachineInstance,
    iface: vmi::Interface,
    pod_iface: String,
    launcher_pid: Option<u32>,
    binding: Option<Binding>,
    ctx: NetContext,
}

impl PodNic {
    pub fn new(
        vmi: &VirtualMachineInstance,
        network: &Network,
        pod_iface: impl Into<String>,
        launcher_pid: Option<u32>,
        ctx: &NetContext,
    ) -> Result<Self> {
        let iface = vmi
            .interface(&network.name)
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!("no interface for network '{}'", network.name))
            })?;

        // SR-IOV devices are attached elsewhere; keep the NIC but give it no binding.
        let binding = if iface.is_sriov() {
            None
        } else {
            Some(Binding::new(vmi, &iface, network, ctx)?)
        };

        Ok(Self {
            vmi: vmi.clone(),
            iface,
            pod_iface: pod_iface.into(),
            launcher_pid,
            binding,
            ctx: ctx.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.iface.name
    }

    pub fn pod_iface(&self) -> &str {
        &self.pod_iface
    }

    fn launcher_key(&self) -> CacheKey {
        CacheKey::launcher(self.launcher_pid, &self.iface.name)
    }

    /// Prepare the pod interface and persist what phase 2 needs.
    ///
    /// Runs at most once per interface: a finished record or an existing
    /// domain fragment makes it a no-op, a started-but-unfinished record is a
    /// critical error since the namespace is already half rewired.
    pub async fn phase1(&mut self) -> Result<()> {
        let Some(binding) = self.binding.as_mut() else {
            debug!(iface = %self.iface.name, "Skipping SR-IOV interface in phase 1");
            return Ok(());
        };

        let vmi_key = CacheKey::vmi(&self.vmi.metadata.uid, &self.iface.name);
        let launcher_key = CacheKey::launcher(self.launcher_pid, &self.iface.name);

        match self.ctx.cache.read::<PodIfaceRecord>(&vmi_key)? {
            Some(record) if record.state == PodIfaceState::Finished => {
                debug!(iface = %self.iface.name, "Phase 1 already finished");
                return Ok(());
            }
            Some(record) if record.state == PodIfaceState::Started => {
                return Err(Error::Critical {
                    message: format!(
                        "pod interface '{}' was left half configured and cannot be resumed",
                        self.pod_iface
                    ),
                    source: None,
                });
            }
            _ => {}
        }

        if self
            .ctx
            .cache
            .read::<domain::Interface>(&launcher_key)?
            .is_some()
        {
            debug!(iface = %self.iface.name, "Domain fragment already cached");
            return Ok(());
        }

        binding
            .discover_pod_network_interface(&self.pod_iface)
            .await
            .map_err(|e| Error::critical("failed to discover pod interface", e))?;
        let pod_ips = binding.pod_ips();

        self.ctx.cache.write(
            &vmi_key,
            &PodIfaceRecord {
                state: PodIfaceState::Started,
                pod_ips: pod_ips.clone(),
            },
        )?;

        binding
            .prepare_pod_network_interface()
            .await
            .map_err(|e| Error::critical("failed to prepare pod interface", e))?;

        // Persist only after every mutation succeeded.
        if let Some(config) = binding.generate_dhcp_config() {
            self.ctx.cache.write(&launcher_key, &config)?;
        }
        self.ctx
            .cache
            .write(&launcher_key, &binding.generate_domain_iface_spec())?;

        self.ctx.cache.write(
            &vmi_key,
            &PodIfaceRecord {
                state: PodIfaceState::Finished,
                pod_ips,
            },
        )?;
        info!(
            iface = %self.iface.name,
            pod_iface = %self.pod_iface,
            binding = %binding.kind(),
            "Phase 1 finished"
        );
        Ok(())
    }

    /// Decorate `domain` from the phase 1 records and start DHCP if needed.
    pub async fn phase2(&self, domain: &mut DomainSpec) -> Result<()> {
        let Some(binding) = self.binding.as_ref() else {
            debug!(iface = %self.iface.name, "Skipping SR-IOV interface in phase 2");
            return Ok(());
        };
        let key = self.launcher_key();

        let fragment: domain::Interface = self.ctx.cache.read_required(&key)?;
        binding.decorate_config(domain, &fragment)?;

        if binding.serves_dhcp() {
            let config: DhcpConfig = self.ctx.cache.read_required(&key)?;
            self.start_dhcp(&config)?;
        }

        info!(iface = %self.iface.name, binding = %binding.kind(), "Phase 2 finished");
        Ok(())
    }

    fn start_dhcp(&self, config: &DhcpConfig) -> Result<()> {
        if config.ipam_disabled {
            debug!(iface = %self.iface.name, "IPAM disabled, no DHCP server");
            return Ok(());
        }

        let path = &self.ctx.config.resolv_conf;
        let resolv = ResolvConf::load(path).map_err(|source| DhcpError::ResolvConf {
            path: path.clone(),
            source,
        })?;
        let options = ServerOptions::new(&self.vmi, &self.iface, &resolv);
        let lease = Lease::new(config, &options)?;

        self.ctx.dhcp.start(&bridge_name(&self.pod_iface), lease)?;
        Ok(())
    }

    pub fn stop_dhcp(&self) {
        if self.binding.as_ref().is_some_and(Binding::serves_dhcp) {
            self.ctx.dhcp.stop(&bridge_name(&self.pod_iface));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeLink, NetContextBuilder, vmi_with};
    use crate::vmi::BindingKind;

    fn bridge_vmi() -> VirtualMachineInstance {
        let mut vmi = vmi_with(
            vec![vmi::Interface::new("default", BindingKind::Bridge)],
            vec![Network::pod("default")],
        );
        vmi.metadata.uid = "uid-1".into();
        vmi
    }

    fn pod_link() -> FakeLink {
        FakeLink::new("eth0", "0a:58:0a:23:00:06")
            .mtu(1410)
            .addr("10.35.0.6/24")
    }

    #[tokio::test]
    async fn test_phase1_writes_records_once() {
        let t = NetContextBuilder::new().link(pod_link()).build();
        let vmi = bridge_vmi();
        let mut nic = PodNic::new(&vmi, &vmi.spec.networks[0], "eth0", None, &t.ctx).unwrap();

        nic.phase1().await.unwrap();
        let key = CacheKey::vmi("uid-1", "default");
        let record: PodIfaceRecord = t.ctx.cache.read_required(&key).unwrap();
        assert_eq!(record.state, PodIfaceState::Finished);
        assert_eq!(record.pod_ips, vec!["10.35.0.6".parse::<std::net::IpAddr>().unwrap()]);

        let calls = t.handler.calls().len();
        let mut again = PodNic::new(&vmi, &vmi.spec.networks[0], "eth0", None, &t.ctx).unwrap();
        again.phase1().await.unwrap();
        assert_eq!(t.handler.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_phase1_started_is_critical() {
        let t = NetContextBuilder::new().link(pod_link()).build();
        let vmi = bridge_vmi();
        t.ctx
            .cache
            .write(
                &CacheKey::vmi("uid-1", "default"),
                &PodIfaceRecord {
                    state: PodIfaceState::Started,
                    pod_ips: vec![],
                },
            )
            .unwrap();

        let mut nic = PodNic::new(&vmi, &vmi.spec.networks[0], "eth0", None, &t.ctx).unwrap();
        let err = nic.phase1().await.unwrap_err();
        assert!(err.is_critical());
        assert!(t.handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_phase1_discovery_failure_is_critical() {
        let t = NetContextBuilder::new().build();
        let vmi = bridge_vmi();
        let mut nic = PodNic::new(&vmi, &vmi.spec.networks[0], "eth0", None, &t.ctx).unwrap();
        let err = nic.phase1().await.unwrap_err();
        assert!(err.is_critical());
        assert!(
            t.ctx
                .cache
                .read::<PodIfaceRecord>(&CacheKey::vmi("uid-1", "default"))
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_phase2_without_phase1_fails() {
        let t = NetContextBuilder::new().build();
        let vmi = bridge_vmi();
        let nic = PodNic::new(&vmi, &vmi.spec.networks[0], "eth0", None, &t.ctx).unwrap();
        let mut domain = DomainSpec::default();
        let err = nic.phase2(&mut domain).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Cache(crate::cache::CacheError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn test_sriov_is_skipped() {
        let t = NetContextBuilder::new().build();
        let vmi = vmi_with(
            vec![vmi::Interface::new("sriov", BindingKind::Sriov)],
            vec![Network::multus("sriov", "sriov-net")],
        );
        let mut nic = PodNic::new(&vmi, &vmi.spec.networks[0], "net1", None, &t.ctx).unwrap();
        nic.phase1().await.unwrap();
        nic.phase2(&mut DomainSpec::default()).await.unwrap();
        assert!(t.handler.calls().is_empty());
        assert!(t.dhcp.started().is_empty());
    }
}
