//! nftables backend.

use super::{
    Action, Chain, FirewallBackend, Match, NatRule, POSTINBOUND_CHAIN, PREINBOUND_CHAIN, Result,
    run, run_idempotent,
};
use crate::netdriver::IpFamily;
use async_trait::async_trait;
use std::fmt::Display;
use tracing::{debug, info};

const NFT: &str = "nft";
const TABLE_NAME: &str = "nat";

/// Base chains hooked into netfilter, with their priorities.
const BASE_CHAINS: [(&str, i32); 3] = [("prerouting", -100), ("postrouting", 100), ("output", -100)];

#[derive(Debug, Default)]
pub struct Nftables;

impl Nftables {
    pub fn new() -> Self {
        Self
    }
}

fn family_name(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "ip",
        IpFamily::V6 => "ip6",
    }
}

fn chain_name(chain: Chain) -> &'static str {
    match chain {
        Chain::Prerouting => "prerouting",
        Chain::Postrouting => "postrouting",
        Chain::Output => "output",
        Chain::PreInbound => PREINBOUND_CHAIN,
        Chain::PostInbound => POSTINBOUND_CHAIN,
    }
}

/// `x` for one element, `{ x, y }` for more.
fn set<T: Display>(items: &[T]) -> String {
    match items {
        [single] => single.to_string(),
        _ => {
            let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
            format!("{{ {} }}", joined.join(", "))
        }
    }
}

/// Rule body as passed to `nft add rule <family> nat <chain>`.
pub(super) fn render_rule(family: IpFamily, rule: &NatRule) -> String {
    let mut parts: Vec<String> = Vec::new();

    for m in &rule.matches {
        match m {
            Match::InIface(name) => parts.push(format!("iifname {name}")),
            Match::OutIface(name) => parts.push(format!("oifname {name}")),
            Match::SrcAddr(addrs) => {
                parts.push(format!("{} saddr {}", family_name(family), set(addrs)))
            }
            Match::DstAddr(addrs) => {
                parts.push(format!("{} daddr {}", family_name(family), set(addrs)))
            }
            Match::DstPort { protocol, ports } => {
                parts.push(format!("{} dport {}", protocol.as_str(), set(ports)))
            }
        }
    }

    parts.push("counter".to_string());
    parts.push(match &rule.action {
        Action::Masquerade => "masquerade".to_string(),
        Action::Jump(chain) => format!("jump {}", chain_name(*chain)),
        Action::Dnat(ip) => format!("dnat to {ip}"),
        Action::Snat(ip) => format!("snat to {ip}"),
        Action::Return => "return".to_string(),
    });

    parts.join(" ")
}

#[async_trait]
impl FirewallBackend for Nftables {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn is_available(&self, family: IpFamily) -> bool {
        let fam = family_name(family).to_string();
        let table: Vec<String> = vec!["add".into(), "table".into(), fam.clone(), TABLE_NAME.into()];
        if let Err(e) = run(NFT, &table).await {
            debug!(%family, error = %e, "nftables availability check failed");
            return false;
        }

        for (name, priority) in BASE_CHAINS {
            let args: Vec<String> = vec![
                "add".into(),
                "chain".into(),
                fam.clone(),
                TABLE_NAME.into(),
                name.into(),
                format!("{{ type nat hook {name} priority {priority}; }}"),
            ];
            if let Err(e) = run(NFT, &args).await {
                debug!(%family, chain = name, error = %e, "nftables base chain failed");
                return false;
            }
        }

        true
    }

    async fn new_chain(&self, family: IpFamily, chain: Chain) -> Result<()> {
        let args: Vec<String> = vec![
            "add".into(),
            "chain".into(),
            family_name(family).into(),
            TABLE_NAME.into(),
            chain_name(chain).into(),
        ];
        run_idempotent(NFT, &args).await?;
        info!(table = TABLE_NAME, %family, chain = chain_name(chain), "nftables chain ready");
        Ok(())
    }

    async fn append_rule(&self, family: IpFamily, rule: &NatRule) -> Result<()> {
        let body = render_rule(family, rule);
        let args: Vec<String> = vec![
            "add".into(),
            "rule".into(),
            family_name(family).into(),
            TABLE_NAME.into(),
            chain_name(rule.chain).into(),
            body.clone(),
        ];
        run(NFT, &args).await?;
        debug!(%family, chain = chain_name(rule.chain), rule = %body, "nftables rule added");
        Ok(())
    }

    fn render(&self, family: IpFamily, rule: &NatRule) -> String {
        format!("{} {}", chain_name(rule.chain), render_rule(family, rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::{MIGRATION_PORTS, NatPlan, NatSpec, PortSpec};
    use crate::vmi::Protocol;

    #[test]
    fn test_render_masquerade_plan() {
        let plan = NatPlan::build(&NatSpec {
            pod_iface: "eth0".into(),
            bridge: "k6t-eth0".into(),
            vm_ip: "10.0.2.2".parse().unwrap(),
            gateway_ip: "10.0.2.1".parse().unwrap(),
            pod_ip: None,
            ports: vec![PortSpec::tcp(80)],
            istio: false,
        });
        let rendered: Vec<String> = plan
            .rules()
            .map(|r| Nftables.render(IpFamily::V4, r))
            .collect();

        assert_eq!(
            rendered,
            vec![
                "postrouting ip saddr 10.0.2.2 counter masquerade",
                "prerouting iifname eth0 counter jump KUBEVIRT_PREINBOUND",
                "postrouting oifname k6t-eth0 counter jump KUBEVIRT_POSTINBOUND",
                "output tcp dport { 22222, 49152, 49153 } ip saddr 127.0.0.1 counter return",
                "KUBEVIRT_POSTINBOUND tcp dport { 22222, 49152, 49153 } ip saddr 127.0.0.1 counter return",
                "KUBEVIRT_POSTINBOUND tcp dport 80 ip saddr 127.0.0.1 counter snat to 10.0.2.1",
                "KUBEVIRT_PREINBOUND tcp dport 80 counter dnat to 10.0.2.2",
                "output ip daddr 127.0.0.1 tcp dport 80 counter dnat to 10.0.2.2",
            ]
        );
    }

    #[test]
    fn test_render_ipv6_sets() {
        let rule = NatRule::new(
            Chain::Output,
            vec![
                Match::DstAddr(vec!["::1".parse().unwrap(), "fd00::6".parse().unwrap()]),
                Match::DstPort {
                    protocol: Protocol::Udp,
                    ports: vec![MIGRATION_PORTS[0]],
                },
            ],
            Action::Dnat("fd10:0:2::2".parse().unwrap()),
        );
        assert_eq!(
            render_rule(IpFamily::V6, &rule),
            "ip6 daddr { ::1, fd00::6 } udp dport 22222 counter dnat to fd10:0:2::2"
        );
    }
}
