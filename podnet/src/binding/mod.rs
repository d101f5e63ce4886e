//! Binding mechanisms: the ways a pod interface is extended into the VM.
//!
//! Every mechanism implements the same five-step [`BindingMechanism`]
//! lifecycle. [`Binding`] picks the mechanism once from the VMI interface and
//! dispatches to it; there is no switching afterwards.

mod bridge;
mod macvtap;
mod masquerade;
mod slirp;

pub use bridge::BridgeBinding;
pub use macvtap::MacvtapBinding;
pub use masquerade::MasqueradeBinding;
pub use slirp::SlirpBinding;

use crate::dhcp::{DhcpConfig, StaticRoute};
use crate::domain::{self, Alias, DomainSpec, InterfaceTarget, LinkState};
use crate::error::{Error, Result};
use crate::netdriver::Route;
use crate::podnic::NetContext;
use crate::vmi::{self, BindingKind, InterfaceState, Network, VirtualMachineInstance};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr};

/// The lifecycle every binding mechanism implements.
#[async_trait]
pub trait BindingMechanism: Send + Sync {
    /// Read-only inspection of the pod interface.
    async fn discover_pod_network_interface(&mut self, pod_iface: &str) -> Result<()>;

    /// The only step allowed to change host networking.
    async fn prepare_pod_network_interface(&mut self) -> Result<()>;

    fn generate_domain_iface_spec(&self) -> domain::Interface;

    /// DHCP configuration to persist for phase 2, if the mechanism serves DHCP.
    fn generate_dhcp_config(&self) -> Option<DhcpConfig>;

    /// Merge `fragment` into the domain, matched by alias.
    fn decorate_config(&self, domain: &mut DomainSpec, fragment: &domain::Interface)
    -> Result<()>;
}

pub enum Binding {
    Bridge(BridgeBinding),
    Masquerade(MasqueradeBinding),
    Slirp(SlirpBinding),
    Macvtap(MacvtapBinding),
}

impl Binding {
    /// Select the mechanism for `iface`. Exactly one binding method must be set.
    pub fn new(
        vmi: &VirtualMachineInstance,
        iface: &vmi::Interface,
        network: &Network,
        ctx: &NetContext,
    ) -> Result<Self> {
        let kinds = iface.binding.kinds();
        let binding = match kinds.as_slice() {
            [BindingKind::Bridge] => {
                let index = vmi.interface_index(&iface.name).unwrap_or(0);
                Binding::Bridge(BridgeBinding::new(iface.clone(), index, ctx))
            }
            [BindingKind::Masquerade] => Binding::Masquerade(MasqueradeBinding::new(
                iface.clone(),
                network,
                vmi.has_istio_sidecar(),
                ctx,
            )),
            [BindingKind::Slirp] => Binding::Slirp(SlirpBinding::new(iface.clone())),
            [BindingKind::Macvtap] => Binding::Macvtap(MacvtapBinding::new(iface.clone(), ctx)),
            [BindingKind::Sriov] => {
                return Err(Error::Validation(format!(
                    "interface '{}' uses SR-IOV, which is attached by the device plugin",
                    iface.name
                )));
            }
            [] => {
                return Err(Error::Validation(format!(
                    "interface '{}' has no binding method",
                    iface.name
                )));
            }
            _ => {
                return Err(Error::Validation(format!(
                    "interface '{}' has more than one binding method",
                    iface.name
                )));
            }
        };
        Ok(binding)
    }

    pub fn kind(&self) -> BindingKind {
        match self {
            Binding::Bridge(_) => BindingKind::Bridge,
            Binding::Masquerade(_) => BindingKind::Masquerade,
            Binding::Slirp(_) => BindingKind::Slirp,
            Binding::Macvtap(_) => BindingKind::Macvtap,
        }
    }

    /// Whether phase 2 expects a DHCP record for this mechanism.
    pub fn serves_dhcp(&self) -> bool {
        matches!(self, Binding::Bridge(_) | Binding::Masquerade(_))
    }

    /// Pod addresses learned during discovery.
    pub fn pod_ips(&self) -> Vec<IpAddr> {
        match self {
            Binding::Bridge(b) => b.pod_ips(),
            Binding::Masquerade(m) => m.pod_ips(),
            Binding::Slirp(_) | Binding::Macvtap(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl BindingMechanism for Binding {
    async fn discover_pod_network_interface(&mut self, pod_iface: &str) -> Result<()> {
        match self {
            Binding::Bridge(b) => b.discover_pod_network_interface(pod_iface).await,
            Binding::Masquerade(m) => m.discover_pod_network_interface(pod_iface).await,
            Binding::Slirp(s) => s.discover_pod_network_interface(pod_iface).await,
            Binding::Macvtap(m) => m.discover_pod_network_interface(pod_iface).await,
        }
    }

    async fn prepare_pod_network_interface(&mut self) -> Result<()> {
        match self {
            Binding::Bridge(b) => b.prepare_pod_network_interface().await,
            Binding::Masquerade(m) => m.prepare_pod_network_interface().await,
            Binding::Slirp(s) => s.prepare_pod_network_interface().await,
            Binding::Macvtap(m) => m.prepare_pod_network_interface().await,
        }
    }

    fn generate_domain_iface_spec(&self) -> domain::Interface {
        match self {
            Binding::Bridge(b) => b.generate_domain_iface_spec(),
            Binding::Masquerade(m) => m.generate_domain_iface_spec(),
            Binding::Slirp(s) => s.generate_domain_iface_spec(),
            Binding::Macvtap(m) => m.generate_domain_iface_spec(),
        }
    }

    fn generate_dhcp_config(&self) -> Option<DhcpConfig> {
        match self {
            Binding::Bridge(b) => b.generate_dhcp_config(),
            Binding::Masquerade(m) => m.generate_dhcp_config(),
            Binding::Slirp(s) => s.generate_dhcp_config(),
            Binding::Macvtap(m) => m.generate_dhcp_config(),
        }
    }

    fn decorate_config(
        &self,
        domain: &mut DomainSpec,
        fragment: &domain::Interface,
    ) -> Result<()> {
        match self {
            Binding::Bridge(b) => b.decorate_config(domain, fragment),
            Binding::Masquerade(m) => m.decorate_config(domain, fragment),
            Binding::Slirp(s) => s.decorate_config(domain, fragment),
            Binding::Macvtap(m) => m.decorate_config(domain, fragment),
        }
    }
}

/// Accept MTUs in 0..=65535.
pub fn validate_mtu(mtu: i64) -> Result<u16> {
    u16::try_from(mtu).map_err(|_| Error::Validation(format!("MTU value out of range: {mtu}")))
}

fn not_discovered(iface: &str) -> Error {
    Error::Validation(format!(
        "pod interface for '{iface}' must be discovered before it is prepared"
    ))
}

/// Merge `fragment` into the domain interface carrying `name` as alias.
fn merge_by_alias(domain: &mut DomainSpec, name: &str, fragment: &domain::Interface) -> Result<()> {
    let iface = domain
        .interface_by_alias_mut(name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;
    iface.merge(fragment);
    Ok(())
}

/// Fragment for a VM interface backed by an unmanaged host device.
fn ethernet_fragment(
    iface: &vmi::Interface,
    mac: Option<crate::mac::MacAddr>,
    mtu: u16,
    target: String,
) -> domain::Interface {
    domain::Interface {
        iface_type: domain::IFACE_TYPE_ETHERNET.to_string(),
        mac,
        mtu: Some(mtu),
        target: Some(InterfaceTarget {
            device: target,
            managed: false,
        }),
        model: iface.model.clone(),
        link_state: link_state(iface),
        alias: Some(Alias::user_defined(&iface.name)),
    }
}

/// Only an explicit `down` is rendered; `up` is the hypervisor default.
fn link_state(iface: &vmi::Interface) -> Option<LinkState> {
    (iface.state == Some(InterfaceState::Down)).then_some(LinkState::Down)
}

/// Pod routes worth handing to the guest: no default route and nothing
/// sourced from the VM's own address. `via` overrides each next hop.
fn guest_routes(routes: &[Route], vm_ip: Ipv4Addr, via: Option<Ipv4Addr>) -> Vec<StaticRoute> {
    routes
        .iter()
        .filter(|r| !r.is_default())
        .filter(|r| r.src != Some(IpAddr::V4(vm_ip)))
        .filter_map(|r| {
            let IpNet::V4(dst) = r.dst? else {
                return None;
            };
            let gateway = via.or(match r.gateway {
                Some(IpAddr::V4(gw)) => Some(gw),
                _ => None,
            });
            Some(StaticRoute {
                dst,
                gateway: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{NetContextBuilder, vmi_with};

    #[test]
    fn test_mtu_boundaries() {
        assert!(validate_mtu(-1).is_err());
        assert!(validate_mtu(65536).is_err());
        assert_eq!(validate_mtu(0).unwrap(), 0);
        assert_eq!(validate_mtu(65535).unwrap(), 65535);
    }

    #[test]
    fn test_binding_selection() {
        let ctx = NetContextBuilder::new().build();
        let network = Network::pod("default");

        for kind in [
            BindingKind::Bridge,
            BindingKind::Masquerade,
            BindingKind::Slirp,
            BindingKind::Macvtap,
        ] {
            let iface = vmi::Interface::new("default", kind);
            let vmi = vmi_with(vec![iface.clone()], vec![network.clone()]);
            let binding = Binding::new(&vmi, &iface, &network, &ctx.ctx).unwrap();
            assert_eq!(binding.kind(), kind);
        }
    }

    #[test]
    fn test_binding_requires_exactly_one_method() {
        let ctx = NetContextBuilder::new().build();
        let network = Network::pod("default");

        let mut iface = vmi::Interface::new("default", BindingKind::Bridge);
        iface.binding.masquerade = Some(vmi::Empty {});
        let vmi = vmi_with(vec![iface.clone()], vec![network.clone()]);
        assert!(matches!(
            Binding::new(&vmi, &iface, &network, &ctx.ctx),
            Err(Error::Validation(_))
        ));

        let none = vmi::Interface {
            name: "default".into(),
            ..Default::default()
        };
        assert!(Binding::new(&vmi, &none, &network, &ctx.ctx).is_err());

        let sriov = vmi::Interface::new("default", BindingKind::Sriov);
        assert!(Binding::new(&vmi, &sriov, &network, &ctx.ctx).is_err());
    }

    #[test]
    fn test_guest_routes_filtering() {
        let routes = vec![
            Route {
                dst: None,
                gateway: Some("10.35.0.1".parse().unwrap()),
                src: None,
            },
            Route {
                dst: Some("10.35.0.0/24".parse().unwrap()),
                gateway: None,
                src: Some("10.35.0.6".parse().unwrap()),
            },
            Route {
                dst: Some("192.168.0.0/16".parse().unwrap()),
                gateway: Some("10.35.0.254".parse().unwrap()),
                src: None,
            },
            Route {
                dst: Some("172.16.0.0/12".parse().unwrap()),
                gateway: None,
                src: None,
            },
        ];

        let vm_ip: Ipv4Addr = "10.35.0.6".parse().unwrap();
        assert_eq!(
            guest_routes(&routes, vm_ip, None),
            vec![
                StaticRoute {
                    dst: "192.168.0.0/16".parse().unwrap(),
                    gateway: "10.35.0.254".parse().unwrap(),
                },
                StaticRoute {
                    dst: "172.16.0.0/12".parse().unwrap(),
                    gateway: Ipv4Addr::UNSPECIFIED,
                },
            ]
        );

        let via: Ipv4Addr = "10.0.2.1".parse().unwrap();
        let rewritten = guest_routes(&routes, "10.0.2.2".parse().unwrap(), Some(via));
        assert_eq!(rewritten.len(), 3);
        assert!(rewritten.iter().all(|r| r.gateway == via));
    }
}
