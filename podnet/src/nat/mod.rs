//! NAT between a VM's private address and the pod's real address.
//!
//! Rules are described once in a backend-neutral form ([`NatRule`]) and
//! rendered by whichever [`FirewallBackend`] is usable on the node: nftables
//! when available, legacy iptables otherwise.

mod iptables;
mod nftables;
mod plan;

pub use iptables::Iptables;
pub use nftables::Nftables;
pub use plan::{MIGRATION_PORTS, NatPlan, NatSpec, PortSpec};

use crate::netdriver::IpFamily;
use crate::vmi::Protocol;
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NatError {
    #[error("Failed to execute {program}: {source}")]
    Command {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} command failed: {stderr}")]
    Failed {
        program: &'static str,
        stderr: String,
    },

    #[error("No usable firewall backend for {0}")]
    NoBackend(IpFamily),

    /// Some rules were installed before a later one failed.
    #[error("Partial NAT state for {family}: {applied} rule(s) applied before '{rule}' failed: {source}")]
    Partial {
        family: IpFamily,
        applied: usize,
        rule: String,
        #[source]
        source: Box<NatError>,
    },
}

pub type Result<T> = std::result::Result<T, NatError>;

pub const PREINBOUND_CHAIN: &str = "KUBEVIRT_PREINBOUND";
pub const POSTINBOUND_CHAIN: &str = "KUBEVIRT_POSTINBOUND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Prerouting,
    Postrouting,
    Output,
    PreInbound,
    PostInbound,
}

impl Chain {
    pub fn is_custom(&self) -> bool {
        matches!(self, Chain::PreInbound | Chain::PostInbound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    InIface(String),
    OutIface(String),
    SrcAddr(Vec<IpAddr>),
    DstAddr(Vec<IpAddr>),
    DstPort { protocol: Protocol, ports: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Masquerade,
    Jump(Chain),
    Dnat(IpAddr),
    Snat(IpAddr),
    Return,
}

/// One NAT table rule, independent of the backend that installs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub chain: Chain,
    pub matches: Vec<Match>,
    pub action: Action,
}

impl NatRule {
    pub fn new(chain: Chain, matches: Vec<Match>, action: Action) -> Self {
        Self {
            chain,
            matches,
            action,
        }
    }

    pub fn dst_port(&self) -> Option<(Protocol, &[u16])> {
        self.matches.iter().find_map(|m| match m {
            Match::DstPort { protocol, ports } => Some((*protocol, ports.as_slice())),
            _ => None,
        })
    }
}

/// A firewall implementation able to hold NAT rules for one IP family.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend works here; prepares its base NAT table on success.
    async fn is_available(&self, family: IpFamily) -> bool;
    async fn new_chain(&self, family: IpFamily, chain: Chain) -> Result<()>;
    async fn append_rule(&self, family: IpFamily, rule: &NatRule) -> Result<()>;
    /// Human readable form of a rule, for errors and logs.
    fn render(&self, family: IpFamily, rule: &NatRule) -> String;
}

/// Run a firewall command, turning a non-zero exit into [`NatError::Failed`].
async fn run(program: &'static str, args: &[String]) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| NatError::Command { program, source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NatError::Failed {
            program,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(())
}

/// Run a command that may fail only because its object already exists.
async fn run_idempotent(program: &'static str, args: &[String]) -> Result<()> {
    match run(program, args).await {
        // Ignore "already exists" error
        Err(NatError::Failed { stderr, .. }) if stderr.contains("exists") => Ok(()),
        other => other,
    }
}

/// Chooses a backend per family and installs a [`NatPlan`] through it.
#[derive(Clone)]
pub struct NatEngine {
    backends: Vec<Arc<dyn FirewallBackend>>,
}

impl NatEngine {
    /// Backends in preference order.
    pub fn new(backends: Vec<Arc<dyn FirewallBackend>>) -> Self {
        Self { backends }
    }

    /// nftables first, iptables as fallback.
    pub fn system() -> Self {
        Self::new(vec![Arc::new(Nftables::new()), Arc::new(Iptables::new())])
    }

    pub async fn select_backend(&self, family: IpFamily) -> Result<Arc<dyn FirewallBackend>> {
        for backend in &self.backends {
            if backend.is_available(family).await {
                debug!(backend = backend.name(), %family, "Firewall backend selected");
                return Ok(Arc::clone(backend));
            }
            debug!(backend = backend.name(), %family, "Firewall backend unavailable");
        }
        Err(NatError::NoBackend(family))
    }

    /// Create the custom chains and append every rule of `plan`.
    ///
    /// Nothing is rolled back on failure. If at least one rule made it in, the
    /// error is [`NatError::Partial`] so callers can tell a half-configured
    /// table from an untouched one.
    pub async fn apply(&self, family: IpFamily, plan: &NatPlan) -> Result<()> {
        let backend = self.select_backend(family).await?;

        for chain in [Chain::PreInbound, Chain::PostInbound] {
            backend.new_chain(family, chain).await?;
        }

        let mut applied = 0;
        for rule in plan.rules() {
            if let Err(e) = backend.append_rule(family, rule).await {
                let rendered = backend.render(family, rule);
                if applied == 0 {
                    warn!(backend = backend.name(), %family, rule = %rendered, error = %e, "NAT rule failed");
                    return Err(e);
                }
                return Err(NatError::Partial {
                    family,
                    applied,
                    rule: rendered,
                    source: Box::new(e),
                });
            }
            applied += 1;
        }

        info!(
            backend = backend.name(),
            %family,
            rules = applied,
            "NAT rules installed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeFirewall;

    fn plan() -> NatPlan {
        NatPlan::build(&NatSpec {
            pod_iface: "eth0".into(),
            bridge: "k6t-eth0".into(),
            vm_ip: "10.0.2.2".parse().unwrap(),
            gateway_ip: "10.0.2.1".parse().unwrap(),
            pod_ip: None,
            ports: vec![],
            istio: false,
        })
    }

    #[tokio::test]
    async fn test_falls_back_to_second_backend() {
        let nft = Arc::new(FakeFirewall::unavailable("nftables"));
        let ipt = Arc::new(FakeFirewall::new("iptables"));
        let engine = NatEngine::new(vec![nft.clone(), ipt.clone()]);

        engine.apply(IpFamily::V4, &plan()).await.unwrap();

        assert!(nft.rules().is_empty());
        assert_eq!(ipt.rules().len(), plan().rules().count());
        assert_eq!(
            ipt.chains(),
            vec![
                (IpFamily::V4, Chain::PreInbound),
                (IpFamily::V4, Chain::PostInbound)
            ]
        );
    }

    #[tokio::test]
    async fn test_no_backend() {
        let engine = NatEngine::new(vec![Arc::new(FakeFirewall::unavailable("nftables"))]);
        let err = engine.apply(IpFamily::V6, &plan()).await.unwrap_err();
        assert!(matches!(err, NatError::NoBackend(IpFamily::V6)));
    }

    #[tokio::test]
    async fn test_failure_after_first_rule_is_partial() {
        let backend = Arc::new(FakeFirewall::new("nftables").fail_on_append(2));
        let engine = NatEngine::new(vec![backend.clone()]);

        let err = engine.apply(IpFamily::V4, &plan()).await.unwrap_err();
        assert!(matches!(err, NatError::Partial { applied: 2, .. }));
        assert_eq!(backend.rules().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_first_rule_is_not_partial() {
        let backend = Arc::new(FakeFirewall::new("nftables").fail_on_append(0));
        let engine = NatEngine::new(vec![backend]);

        let err = engine.apply(IpFamily::V4, &plan()).await.unwrap_err();
        assert!(matches!(err, NatError::Failed { .. }));
    }
}
