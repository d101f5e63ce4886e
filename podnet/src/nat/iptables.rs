//! Legacy iptables backend, used when nftables is not available.

use super::{
    Action, Chain, FirewallBackend, Match, NatRule, POSTINBOUND_CHAIN, PREINBOUND_CHAIN, Result,
    run, run_idempotent,
};
use crate::netdriver::IpFamily;
use async_trait::async_trait;
use std::fmt::Display;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct Iptables;

impl Iptables {
    pub fn new() -> Self {
        Self
    }
}

fn program(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables",
        IpFamily::V6 => "ip6tables",
    }
}

fn chain_name(chain: Chain) -> &'static str {
    match chain {
        Chain::Prerouting => "PREROUTING",
        Chain::Postrouting => "POSTROUTING",
        Chain::Output => "OUTPUT",
        Chain::PreInbound => PREINBOUND_CHAIN,
        Chain::PostInbound => POSTINBOUND_CHAIN,
    }
}

fn comma_list<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Match and target arguments following `-t nat -A <chain>`.
pub(super) fn render_args(rule: &NatRule) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    for m in &rule.matches {
        match m {
            Match::InIface(name) => args.extend(["-i".to_string(), name.clone()]),
            Match::OutIface(name) => args.extend(["-o".to_string(), name.clone()]),
            Match::SrcAddr(addrs) => args.extend(["-s".to_string(), comma_list(addrs)]),
            Match::DstAddr(addrs) => args.extend(["-d".to_string(), comma_list(addrs)]),
            Match::DstPort { protocol, ports } => {
                args.extend(["-p".to_string(), protocol.as_str().to_string()]);
                if let [port] = ports.as_slice() {
                    args.extend(["--dport".to_string(), port.to_string()]);
                } else {
                    args.extend([
                        "-m".to_string(),
                        "multiport".to_string(),
                        "--dports".to_string(),
                        comma_list(ports),
                    ]);
                }
            }
        }
    }

    args.push("-j".to_string());
    match &rule.action {
        Action::Masquerade => args.push("MASQUERADE".to_string()),
        Action::Jump(chain) => args.push(chain_name(*chain).to_string()),
        Action::Dnat(ip) => {
            args.extend(["DNAT".to_string(), "--to-destination".to_string(), ip.to_string()])
        }
        Action::Snat(ip) => args.extend(["SNAT".to_string(), "--to-source".to_string(), ip.to_string()]),
        Action::Return => args.push("RETURN".to_string()),
    }

    args
}

fn nat_args(op: &str, chain: Chain) -> Vec<String> {
    vec!["-t".into(), "nat".into(), op.into(), chain_name(chain).into()]
}

#[async_trait]
impl FirewallBackend for Iptables {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn is_available(&self, family: IpFamily) -> bool {
        let args: Vec<String> = vec!["-t".into(), "nat".into(), "-L".into(), "-n".into()];
        match run(program(family), &args).await {
            Ok(()) => true,
            Err(e) => {
                debug!(%family, error = %e, "iptables availability check failed");
                false
            }
        }
    }

    async fn new_chain(&self, family: IpFamily, chain: Chain) -> Result<()> {
        run_idempotent(program(family), &nat_args("-N", chain)).await?;
        info!(%family, chain = chain_name(chain), "iptables chain ready");
        Ok(())
    }

    async fn append_rule(&self, family: IpFamily, rule: &NatRule) -> Result<()> {
        let mut args = nat_args("-A", rule.chain);
        args.extend(render_args(rule));
        run(program(family), &args).await?;
        debug!(%family, chain = chain_name(rule.chain), "iptables rule added");
        Ok(())
    }

    fn render(&self, _family: IpFamily, rule: &NatRule) -> String {
        format!("-A {} {}", chain_name(rule.chain), render_args(rule).join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::MIGRATION_PORTS;
    use crate::vmi::Protocol;

    #[test]
    fn test_render_single_port_dnat() {
        let rule = NatRule::new(
            Chain::PreInbound,
            vec![Match::DstPort {
                protocol: Protocol::Udp,
                ports: vec![53],
            }],
            Action::Dnat("10.0.2.2".parse().unwrap()),
        );
        assert_eq!(
            Iptables.render(IpFamily::V4, &rule),
            "-A KUBEVIRT_PREINBOUND -p udp --dport 53 -j DNAT --to-destination 10.0.2.2"
        );
    }

    #[test]
    fn test_render_multiport_return() {
        let rule = NatRule::new(
            Chain::Output,
            vec![
                Match::DstPort {
                    protocol: Protocol::Tcp,
                    ports: MIGRATION_PORTS.to_vec(),
                },
                Match::SrcAddr(vec!["127.0.0.1".parse().unwrap()]),
            ],
            Action::Return,
        );
        assert_eq!(
            render_args(&rule).join(" "),
            "-p tcp -m multiport --dports 22222,49152,49153 -s 127.0.0.1 -j RETURN"
        );
    }

    #[test]
    fn test_render_snat_with_source_list() {
        let rule = NatRule::new(
            Chain::PostInbound,
            vec![Match::SrcAddr(vec![
                "127.0.0.1".parse().unwrap(),
                "127.0.0.6".parse().unwrap(),
            ])],
            Action::Snat("10.0.2.1".parse().unwrap()),
        );
        assert_eq!(
            render_args(&rule),
            vec!["-s", "127.0.0.1,127.0.0.6", "-j", "SNAT", "--to-source", "10.0.2.1"]
        );
    }

    #[test]
    fn test_program_per_family() {
        assert_eq!(program(IpFamily::V4), "iptables");
        assert_eq!(program(IpFamily::V6), "ip6tables");
    }
}
