//! Bridge binding: the VM takes over the pod interface's identity.
//!
//! The pod link is enslaved to a fresh bridge together with the VM's tap
//! device. Its IPv4 address moves to a same-named dummy link so the kernel
//! keeps answering for it without running duplicate address detection
//! against the guest, and the guest is handed that address over DHCP.

use super::{
    BindingMechanism, ethernet_fragment, guest_routes, merge_by_alias, not_discovered,
    validate_mtu,
};
use crate::dhcp::DhcpConfig;
use crate::domain::{self, DomainSpec};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::namescheme::{bridge_name, renamed_link_name, tap_name};
use crate::netdriver::{
    IpFamily, Link, LinkSpec, NetworkHandler, Route, TapSpec, first_global_addr,
};
use crate::podnic::NetContext;
use crate::vmi;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Prefix of the per-interface address the bridge answers DHCP from.
const FAKE_BRIDGE_IP_PREFIX: [u8; 3] = [169, 254, 75];

/// `169.254.75.<index>/32`.
pub fn fake_bridge_ip(index: usize) -> Result<Ipv4Net> {
    let last = u8::try_from(index)
        .map_err(|_| Error::Validation(format!("interface index {index} too large for bridge address")))?;
    let [a, b, c] = FAKE_BRIDGE_IP_PREFIX;
    Ipv4Net::new(Ipv4Addr::new(a, b, c, last), 32)
        .map_err(|e| Error::Validation(e.to_string()))
}

/// Facts learned from the pod interface.
#[derive(Debug, Clone)]
struct Discovered {
    pod_iface: String,
    link: Link,
    mtu: u16,
    /// VM MAC: the one requested on the VMI, else the pod link's.
    mac: MacAddr,
    /// `None` when the pod network has no IPAM.
    ipv4: Option<Ipv4Net>,
    routes: Vec<Route>,
}

/// Steps of the dummy swap that have taken effect.
#[derive(Debug)]
enum SwapStep {
    AddressRemoved(IpNet),
    Renamed,
    DummyCreated(Link),
}

pub struct BridgeBinding {
    iface: vmi::Interface,
    index: usize,
    handler: Arc<dyn NetworkHandler>,
    tap_queues: u32,
    tap_owner_uid: u32,
    discovered: Option<Discovered>,
}

impl BridgeBinding {
    pub fn new(iface: vmi::Interface, index: usize, ctx: &NetContext) -> Self {
        Self {
            iface,
            index,
            handler: Arc::clone(&ctx.handler),
            tap_queues: ctx.config.tap_queues,
            tap_owner_uid: ctx.config.tap_owner_uid,
            discovered: None,
        }
    }

    pub fn pod_ips(&self) -> Vec<IpAddr> {
        self.discovered
            .as_ref()
            .and_then(|d| d.ipv4)
            .map(|ip| vec![IpAddr::V4(ip.addr())])
            .unwrap_or_default()
    }

    fn discovered(&self) -> Result<&Discovered> {
        self.discovered
            .as_ref()
            .ok_or_else(|| not_discovered(&self.iface.name))
    }

    /// Move the pod address onto a dummy that takes over the link's name.
    /// Returns the renamed original link.
    async fn swap_to_dummy(&self, link: &Link, ip: Ipv4Net) -> Result<Link> {
        let mut done = Vec::new();
        match self.try_swap_to_dummy(link, IpNet::V4(ip), &mut done).await {
            Ok(renamed) => Ok(renamed),
            Err(e) => {
                error!(
                    iface = %link.name,
                    error = %e,
                    steps = done.len(),
                    "Dummy swap failed, rolling back"
                );
                self.rollback_swap(link, done).await;
                Err(e)
            }
        }
    }

    async fn try_swap_to_dummy(
        &self,
        link: &Link,
        ip: IpNet,
        done: &mut Vec<SwapStep>,
    ) -> Result<Link> {
        self.handler.addr_del(link, ip).await?;
        done.push(SwapStep::AddressRemoved(ip));

        let new_name = renamed_link_name(&link.name);
        self.handler.link_set_name(link, &new_name).await?;
        done.push(SwapStep::Renamed);
        info!(from = %link.name, to = %new_name, "Renamed pod link");
        let renamed = self.handler.link_by_name(&new_name).await?;

        let dummy = self
            .handler
            .link_add(&LinkSpec::Dummy {
                name: link.name.clone(),
            })
            .await?;
        done.push(SwapStep::DummyCreated(dummy.clone()));
        info!(name = %dummy.name, "Created dummy link");

        self.handler.addr_replace(&dummy, ip).await?;
        info!(iface = %dummy.name, addr = %ip, "Moved pod address to dummy");

        Ok(renamed)
    }

    /// Best effort; failures are logged and the original error is surfaced.
    async fn rollback_swap(&self, original: &Link, done: Vec<SwapStep>) {
        for step in done.into_iter().rev() {
            let result = match &step {
                SwapStep::DummyCreated(dummy) => self.handler.link_del(dummy).await,
                SwapStep::Renamed => self.handler.link_set_name(original, &original.name).await,
                SwapStep::AddressRemoved(ip) => self.handler.addr_add(original, *ip).await,
            };
            if let Err(e) = result {
                warn!(iface = %original.name, step = ?step, error = %e, "Rollback step failed");
            }
        }
        if let Err(e) = self.handler.link_set_up(original).await {
            warn!(iface = %original.name, error = %e, "Failed to bring pod link back up");
        }
    }
}

#[async_trait]
impl BindingMechanism for BridgeBinding {
    async fn discover_pod_network_interface(&mut self, pod_iface: &str) -> Result<()> {
        let link = self.handler.link_by_name(pod_iface).await?;
        let mtu = validate_mtu(link.mtu)?;

        let mac = self.iface.mac_address.or(link.mac).ok_or_else(|| {
            Error::Validation(format!("pod interface '{pod_iface}' has no MAC address"))
        })?;

        let ipv4 = match first_global_addr(&self.handler.addr_list(&link, IpFamily::V4).await?) {
            Some(IpNet::V4(net)) => Some(net),
            _ => None,
        };
        let routes = match ipv4 {
            Some(_) => self.handler.route_list(&link, IpFamily::V4).await?,
            None => Vec::new(),
        };

        debug!(
            iface = pod_iface,
            mtu,
            %mac,
            ipv4 = ?ipv4,
            routes = routes.len(),
            "Discovered pod interface"
        );

        self.discovered = Some(Discovered {
            pod_iface: pod_iface.to_string(),
            link,
            mtu,
            mac,
            ipv4,
            routes,
        });
        Ok(())
    }

    async fn prepare_pod_network_interface(&mut self) -> Result<()> {
        let d = self.discovered()?.clone();
        let handler = Arc::clone(&self.handler);
        let bridge_ip = fake_bridge_ip(self.index)?;

        handler.link_set_down(&d.link).await?;

        let port = match d.ipv4 {
            Some(ip) => self.swap_to_dummy(&d.link, ip).await?,
            None => d.link.clone(),
        };

        // The guest owns the original MAC from now on
        let port_mac = MacAddr::random();
        handler.link_set_mac(&port, port_mac).await?;
        info!(iface = %port.name, mac = %port_mac, "Randomized pod link MAC");

        let bridge = handler
            .link_add(&LinkSpec::Bridge {
                name: bridge_name(&d.pod_iface),
                mac: None,
                mtu: u32::from(d.mtu),
            })
            .await?;
        info!(bridge = %bridge.name, "Created bridge");

        handler.link_set_master(&port, &bridge).await?;
        handler.link_set_up(&bridge).await?;
        handler.addr_add(&bridge, IpNet::V4(bridge_ip)).await?;
        handler.disable_tx_offload_checksum(&bridge.name).await?;

        let tap = tap_name(&d.pod_iface);
        handler
            .create_tap_device(&TapSpec {
                name: tap.clone(),
                queues: self.tap_queues,
                owner_uid: self.tap_owner_uid,
                mtu: u32::from(d.mtu),
            })
            .await?;
        handler.bind_tap_to_bridge(&tap, &bridge.name).await?;
        info!(tap = %tap, bridge = %bridge.name, "Tap device bound to bridge");

        if d.ipv4.is_some() {
            handler.configure_ipv4_arp_ignore().await?;
        }

        handler.link_set_up(&port).await?;
        handler.link_set_learning_off(&port).await?;

        Ok(())
    }

    fn generate_domain_iface_spec(&self) -> domain::Interface {
        match &self.discovered {
            Some(d) => ethernet_fragment(&self.iface, Some(d.mac), d.mtu, tap_name(&d.pod_iface)),
            None => domain::Interface::default(),
        }
    }

    fn generate_dhcp_config(&self) -> Option<DhcpConfig> {
        let d = self.discovered.as_ref()?;
        let advertising_ip = fake_bridge_ip(self.index).ok().map(|net| net.addr());
        let routes = d
            .ipv4
            .map(|ip| guest_routes(&d.routes, ip.addr(), None))
            .unwrap_or_default();

        Some(DhcpConfig {
            name: d.pod_iface.clone(),
            ipam_disabled: d.ipv4.is_none(),
            mac: Some(d.mac),
            ip: d.ipv4,
            ipv6: None,
            advertising_ip,
            mtu: d.mtu,
            routes,
        })
    }

    fn decorate_config(
        &self,
        domain: &mut DomainSpec,
        fragment: &domain::Interface,
    ) -> Result<()> {
        merge_by_alias(domain, &self.iface.name, fragment)
    }
}
