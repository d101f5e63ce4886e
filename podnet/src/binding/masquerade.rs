//! Masquerade binding: the VM lives on a private subnet behind NAT.
//!
//! The pod's own address stays where it is. A bridge carrying the private
//! subnet's gateway address connects the VM's tap, and the NAT engine maps
//! traffic between the pod address and the VM address.

use super::{
    BindingMechanism, ethernet_fragment, guest_routes, merge_by_alias, not_discovered,
    validate_mtu,
};
use crate::dhcp::DhcpConfig;
use crate::domain::{self, DomainSpec};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::namescheme::{bridge_name, tap_name};
use crate::nat::{NatEngine, NatPlan, NatSpec, PortSpec};
use crate::netdriver::{
    IpFamily, Link, LinkSpec, NetworkHandler, Route, TapSpec, first_global_addr,
};
use crate::podnic::NetContext;
use crate::vmi::{self, Network};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed MAC of every masquerade bridge.
pub const BRIDGE_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);

/// Gateway and VM address inside the private subnet, both carrying its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSubnet {
    pub gateway: IpNet,
    pub vm: IpNet,
}

impl VmSubnet {
    /// The first two host addresses of `cidr`.
    pub fn from_cidr(cidr: IpNet) -> Result<Self> {
        let cidr = cidr.trunc();
        // Network, gateway, VM and (for IPv4) broadcast.
        if cidr.max_prefix_len() - cidr.prefix_len() < 2 {
            return Err(Error::Validation(format!(
                "VM network CIDR {cidr} is too small for a gateway and a VM"
            )));
        }

        let nth = |n: u8| -> Result<IpNet> {
            let addr = match cidr.network() {
                IpAddr::V4(net) => IpAddr::V4(Ipv4Addr::from(u32::from(net) + u32::from(n))),
                IpAddr::V6(net) => IpAddr::V6(Ipv6Addr::from(u128::from(net) + u128::from(n))),
            };
            IpNet::new(addr, cidr.prefix_len()).map_err(|e| Error::Validation(e.to_string()))
        };

        Ok(Self {
            gateway: nth(1)?,
            vm: nth(2)?,
        })
    }
}

fn parse_cidr(raw: &str, family: IpFamily) -> Result<IpNet> {
    let cidr: IpNet = raw
        .parse()
        .map_err(|_| Error::Validation(format!("invalid VM network CIDR '{raw}'")))?;
    if IpFamily::of(&cidr.addr()) != family {
        return Err(Error::Validation(format!(
            "VM network CIDR '{raw}' is not an {family} network"
        )));
    }
    Ok(cidr)
}

#[derive(Debug, Clone)]
struct Discovered {
    pod_iface: String,
    mtu: u16,
    pod_ipv4: Option<IpAddr>,
    pod_ipv6: Option<IpAddr>,
    v4: VmSubnet,
    /// Only when the pod interface has IPv6 enabled.
    v6: Option<VmSubnet>,
    routes: Vec<Route>,
}

pub struct MasqueradeBinding {
    iface: vmi::Interface,
    /// Private subnets, possibly overridden by the network.
    cidr_v4: IpNet,
    cidr_v6: IpNet,
    cidr_override_v4: Option<String>,
    cidr_override_v6: Option<String>,
    istio: bool,
    vm_mac: MacAddr,
    handler: Arc<dyn NetworkHandler>,
    nat: NatEngine,
    tap_queues: u32,
    tap_owner_uid: u32,
    discovered: Option<Discovered>,
}

impl MasqueradeBinding {
    pub fn new(iface: vmi::Interface, network: &Network, istio: bool, ctx: &NetContext) -> Self {
        let pod = network.pod.as_ref();

        Self {
            vm_mac: iface.mac_address.unwrap_or_else(MacAddr::random),
            iface,
            cidr_v4: IpNet::V4(ctx.config.default_vm_cidr_v4),
            cidr_v6: IpNet::V6(ctx.config.default_vm_cidr_v6),
            cidr_override_v4: pod.and_then(|p| p.vm_network_cidr.clone()),
            cidr_override_v6: pod.and_then(|p| p.vm_ipv6_network_cidr.clone()),
            istio,
            handler: Arc::clone(&ctx.handler),
            nat: ctx.nat.clone(),
            tap_queues: ctx.config.tap_queues,
            tap_owner_uid: ctx.config.tap_owner_uid,
            discovered: None,
        }
    }

    pub fn pod_ips(&self) -> Vec<IpAddr> {
        self.discovered
            .as_ref()
            .map(|d| d.pod_ipv4.into_iter().chain(d.pod_ipv6).collect())
            .unwrap_or_default()
    }

    fn discovered(&self) -> Result<&Discovered> {
        self.discovered
            .as_ref()
            .ok_or_else(|| not_discovered(&self.iface.name))
    }

    fn subnet(&self, family: IpFamily) -> Result<VmSubnet> {
        let (default, override_cidr) = match family {
            IpFamily::V4 => (self.cidr_v4, &self.cidr_override_v4),
            IpFamily::V6 => (self.cidr_v6, &self.cidr_override_v6),
        };
        let cidr = match override_cidr.as_deref() {
            Some(raw) => parse_cidr(raw, family)?,
            None => default,
        };
        VmSubnet::from_cidr(cidr)
    }

    async fn apply_nat(&self, d: &Discovered, family: IpFamily, subnet: VmSubnet) -> Result<()> {
        let pod_ip = match family {
            IpFamily::V4 => d.pod_ipv4,
            IpFamily::V6 => d.pod_ipv6,
        };
        let plan = NatPlan::build(&NatSpec {
            pod_iface: d.pod_iface.clone(),
            bridge: bridge_name(&d.pod_iface),
            vm_ip: subnet.vm.addr(),
            gateway_ip: subnet.gateway.addr(),
            pod_ip,
            ports: PortSpec::from_ports(&self.iface.ports),
            istio: self.istio,
        });
        self.nat.apply(family, &plan).await?;
        Ok(())
    }
}

#[async_trait]
impl BindingMechanism for MasqueradeBinding {
    async fn discover_pod_network_interface(&mut self, pod_iface: &str) -> Result<()> {
        let link: Link = self.handler.link_by_name(pod_iface).await?;
        let mtu = validate_mtu(link.mtu)?;

        let pod_ipv4 = first_global_addr(&self.handler.addr_list(&link, IpFamily::V4).await?)
            .map(|net| net.addr());
        let pod_ipv6 = first_global_addr(&self.handler.addr_list(&link, IpFamily::V6).await?)
            .map(|net| net.addr());
        let routes = self.handler.route_list(&link, IpFamily::V4).await?;

        let v4 = self.subnet(IpFamily::V4)?;
        let v6 = match pod_ipv6 {
            Some(_) => Some(self.subnet(IpFamily::V6)?),
            None => None,
        };

        debug!(
            iface = pod_iface,
            mtu,
            pod_ipv4 = ?pod_ipv4,
            pod_ipv6 = ?pod_ipv6,
            vm_ipv4 = %v4.vm,
            "Discovered pod interface"
        );

        self.discovered = Some(Discovered {
            pod_iface: pod_iface.to_string(),
            mtu,
            pod_ipv4,
            pod_ipv6,
            v4,
            v6,
            routes,
        });
        Ok(())
    }

    async fn prepare_pod_network_interface(&mut self) -> Result<()> {
        let d = self.discovered()?.clone();
        let handler = Arc::clone(&self.handler);

        let bridge = handler
            .link_add(&LinkSpec::Bridge {
                name: bridge_name(&d.pod_iface),
                mac: Some(BRIDGE_MAC),
                mtu: u32::from(d.mtu),
            })
            .await?;
        info!(bridge = %bridge.name, "Created bridge");
        handler.link_set_up(&bridge).await?;

        handler.configure_ip_forwarding(IpFamily::V4).await?;
        handler.addr_add(&bridge, d.v4.gateway).await?;
        if let Some(v6) = d.v6 {
            handler.configure_ip_forwarding(IpFamily::V6).await?;
            handler.addr_add(&bridge, v6.gateway).await?;
        }

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

        handler.disable_tx_offload_checksum(&bridge.name).await?;

        self.apply_nat(&d, IpFamily::V4, d.v4).await?;
        if let Some(v6) = d.v6 {
            self.apply_nat(&d, IpFamily::V6, v6).await?;
        }

        Ok(())
    }

    fn generate_domain_iface_spec(&self) -> domain::Interface {
        match &self.discovered {
            Some(d) => ethernet_fragment(
                &self.iface,
                Some(self.vm_mac),
                d.mtu,
                tap_name(&d.pod_iface),
            ),
            None => domain::Interface::default(),
        }
    }

    fn generate_dhcp_config(&self) -> Option<DhcpConfig> {
        let d = self.discovered.as_ref()?;
        let (IpNet::V4(vm), IpNet::V4(gateway)) = (d.v4.vm, d.v4.gateway) else {
            return None;
        };
        let ipv6 = d.v6.and_then(|v6| match v6.vm {
            IpNet::V6(net) => Some(net),
            IpNet::V4(_) => None,
        });

        Some(DhcpConfig {
            name: d.pod_iface.clone(),
            ipam_disabled: false,
            mac: Some(self.vm_mac),
            ip: Some(vm),
            ipv6,
            advertising_ip: Some(gateway.addr()),
            mtu: d.mtu,
            routes: guest_routes(&d.routes, vm.addr(), Some(gateway.addr())),
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
