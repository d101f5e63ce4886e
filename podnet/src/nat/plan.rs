//! Masquerade rule planning.

use super::{Action, Chain, Match, NatRule};
use crate::vmi::{self, Protocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Live-migration ports that must never be redirected into the VM.
pub const MIGRATION_PORTS: [u16; 3] = [22222, 49152, 49153];

/// Source address Envoy uses when forwarding inbound traffic.
const ENVOY_LOOPBACK: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub protocol: Protocol,
    pub port: u16,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }

    /// Declared ports with unset protocols defaulted to TCP, duplicates dropped.
    pub fn from_ports(ports: &[vmi::Port]) -> Vec<PortSpec> {
        dedup(ports.iter().map(|p| PortSpec {
            protocol: p.protocol.unwrap_or_default(),
            port: p.port,
        }))
    }
}

fn dedup(ports: impl Iterator<Item = PortSpec>) -> Vec<PortSpec> {
    let mut unique: Vec<PortSpec> = Vec::new();
    for port in ports {
        if !unique.contains(&port) {
            unique.push(port);
        }
    }
    unique
}

/// Inputs for one family's masquerade rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatSpec {
    pub pod_iface: String,
    pub bridge: String,
    pub vm_ip: IpAddr,
    pub gateway_ip: IpAddr,
    /// The pod's real address of this family.
    pub pod_ip: Option<IpAddr>,
    pub ports: Vec<PortSpec>,
    pub istio: bool,
}

/// All rules for one family, grouped by purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPlan {
    /// Egress masquerade, chain jumps and migration port exemptions.
    pub base_rules: Vec<NatRule>,
    /// Redirect everything to the VM; used when no ports are declared.
    pub default_rules: Vec<NatRule>,
    /// Three rules per declared (protocol, port).
    pub port_rules: Vec<NatRule>,
}

impl NatPlan {
    pub fn build(spec: &NatSpec) -> Self {
        let loopback = match spec.vm_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        let istio_v4 = spec.istio && spec.vm_ip.is_ipv4();

        let mut snat_sources = vec![loopback];
        let mut dnat_destinations = vec![loopback];
        if istio_v4 {
            snat_sources.push(IpAddr::V4(ENVOY_LOOPBACK));
            if let Some(pod_ip) = spec.pod_ip {
                dnat_destinations.push(pod_ip);
            }
        }

        let migration_ports = Match::DstPort {
            protocol: Protocol::Tcp,
            ports: MIGRATION_PORTS.to_vec(),
        };

        let base_rules = vec![
            NatRule::new(
                Chain::Postrouting,
                vec![Match::SrcAddr(vec![spec.vm_ip])],
                Action::Masquerade,
            ),
            NatRule::new(
                Chain::Prerouting,
                vec![Match::InIface(spec.pod_iface.clone())],
                Action::Jump(Chain::PreInbound),
            ),
            NatRule::new(
                Chain::Postrouting,
                vec![Match::OutIface(spec.bridge.clone())],
                Action::Jump(Chain::PostInbound),
            ),
            NatRule::new(
                Chain::Output,
                vec![migration_ports.clone(), Match::SrcAddr(vec![loopback])],
                Action::Return,
            ),
            NatRule::new(
                Chain::PostInbound,
                vec![migration_ports, Match::SrcAddr(vec![loopback])],
                Action::Return,
            ),
        ];

        let ports = dedup(spec.ports.iter().copied());
        let (default_rules, port_rules) = if ports.is_empty() {
            let rules = vec![
                NatRule::new(Chain::PreInbound, vec![], Action::Dnat(spec.vm_ip)),
                NatRule::new(
                    Chain::PostInbound,
                    vec![Match::SrcAddr(snat_sources)],
                    Action::Snat(spec.gateway_ip),
                ),
                NatRule::new(
                    Chain::Output,
                    vec![Match::DstAddr(dnat_destinations)],
                    Action::Dnat(spec.vm_ip),
                ),
            ];
            (rules, Vec::new())
        } else {
            let rules = ports
                .iter()
                .flat_map(|p| {
                    let port = Match::DstPort {
                        protocol: p.protocol,
                        ports: vec![p.port],
                    };
                    // Envoy owns inbound interception when the sidecar is injected.
                    let inbound = (!istio_v4).then(|| {
                        NatRule::new(
                            Chain::PreInbound,
                            vec![port.clone()],
                            Action::Dnat(spec.vm_ip),
                        )
                    });
                    [
                        Some(NatRule::new(
                            Chain::PostInbound,
                            vec![port.clone(), Match::SrcAddr(snat_sources.clone())],
                            Action::Snat(spec.gateway_ip),
                        )),
                        inbound,
                        Some(NatRule::new(
                            Chain::Output,
                            vec![Match::DstAddr(dnat_destinations.clone()), port],
                            Action::Dnat(spec.vm_ip),
                        )),
                    ]
                    .into_iter()
                    .flatten()
                })
                .collect();
            (Vec::new(), rules)
        };

        Self {
            base_rules,
            default_rules,
            port_rules,
        }
    }

    /// Rules in installation order.
    pub fn rules(&self) -> impl Iterator<Item = &NatRule> {
        self.base_rules
            .iter()
            .chain(&self.default_rules)
            .chain(&self.port_rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ports: Vec<PortSpec>) -> NatSpec {
        NatSpec {
            pod_iface: "eth0".into(),
            bridge: "k6t-eth0".into(),
            vm_ip: "10.0.2.2".parse().unwrap(),
            gateway_ip: "10.0.2.1".parse().unwrap(),
            pod_ip: Some("10.35.0.6".parse().unwrap()),
            ports,
            istio: false,
        }
    }

    #[test]
    fn test_no_ports_redirects_everything() {
        let plan = NatPlan::build(&spec(vec![]));
        assert!(plan.port_rules.is_empty());
        assert!(plan.default_rules.contains(&NatRule::new(
            Chain::PreInbound,
            vec![],
            Action::Dnat("10.0.2.2".parse().unwrap())
        )));
    }

    #[test]
    fn test_single_port_defaults_to_tcp() {
        let ports = PortSpec::from_ports(&[vmi::Port {
            name: None,
            protocol: None,
            port: 80,
        }]);
        let plan = NatPlan::build(&spec(ports));

        assert!(plan.default_rules.is_empty());
        assert_eq!(plan.port_rules.len(), 3);
        for rule in &plan.port_rules {
            assert_eq!(rule.dst_port(), Some((Protocol::Tcp, &[80u16][..])));
        }

        let chains: Vec<Chain> = plan.port_rules.iter().map(|r| r.chain).collect();
        assert_eq!(chains, vec![Chain::PostInbound, Chain::PreInbound, Chain::Output]);
        assert_eq!(
            plan.port_rules[0].action,
            Action::Snat("10.0.2.1".parse().unwrap())
        );
        assert!(
            plan.port_rules[0]
                .matches
                .contains(&Match::SrcAddr(vec!["127.0.0.1".parse().unwrap()]))
        );
    }

    #[test]
    fn test_duplicate_ports_are_collapsed() {
        let declared = vec![
            vmi::Port {
                name: None,
                protocol: None,
                port: 80,
            },
            vmi::Port {
                name: Some("http".into()),
                protocol: Some(Protocol::Tcp),
                port: 80,
            },
            vmi::Port {
                name: None,
                protocol: Some(Protocol::Udp),
                port: 80,
            },
        ];
        let ports = PortSpec::from_ports(&declared);
        assert_eq!(
            ports,
            vec![
                PortSpec::tcp(80),
                PortSpec {
                    protocol: Protocol::Udp,
                    port: 80
                }
            ]
        );
        assert_eq!(NatPlan::build(&spec(ports)).port_rules.len(), 6);
    }

    #[test]
    fn test_migration_ports_always_exempt() {
        for ports in [vec![], vec![PortSpec::tcp(22)]] {
            let plan = NatPlan::build(&spec(ports));
            let exemptions: Vec<&NatRule> = plan
                .base_rules
                .iter()
                .filter(|r| r.action == Action::Return)
                .collect();
            assert_eq!(exemptions.len(), 2);
            for rule in exemptions {
                assert_eq!(rule.dst_port(), Some((Protocol::Tcp, &MIGRATION_PORTS[..])));
            }
        }
    }

    #[test]
    fn test_istio_extends_match_sets_for_ipv4_only() {
        let mut istio = spec(vec![PortSpec::tcp(80)]);
        istio.istio = true;
        let plan = NatPlan::build(&istio);
        assert!(plan.port_rules[0].matches.contains(&Match::SrcAddr(vec![
            "127.0.0.1".parse().unwrap(),
            "127.0.0.6".parse().unwrap()
        ])));
        assert!(plan.port_rules[1].matches.contains(&Match::DstAddr(vec![
            "127.0.0.1".parse().unwrap(),
            "10.35.0.6".parse().unwrap()
        ])));
        let chains: Vec<Chain> = plan.port_rules.iter().map(|r| r.chain).collect();
        assert_eq!(
            chains,
            vec![Chain::PostInbound, Chain::Output],
            "inbound DNAT is left to the sidecar"
        );

        let v6 = NatSpec {
            vm_ip: "fd10:0:2::2".parse().unwrap(),
            gateway_ip: "fd10:0:2::1".parse().unwrap(),
            pod_ip: Some("fd00::6".parse().unwrap()),
            ..istio
        };
        let plan = NatPlan::build(&v6);
        assert!(
            plan.port_rules[0]
                .matches
                .contains(&Match::SrcAddr(vec!["::1".parse().unwrap()]))
        );
        assert!(plan.port_rules.iter().any(|r| r.chain == Chain::PreInbound));
    }
}
