//! Network primitive facade.
//!
//! Everything that touches links, addresses, routes, bridges, tap devices or
//! kernel toggles goes through [`NetworkHandler`]. Components receive the
//! handler explicitly so tests can swap in an in-memory fake.

mod netlink;
mod sysctl;
mod tap;

pub use netlink::RtNetlinkHandler;

use crate::mac::MacAddr;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Network facade errors.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("link '{0}' not found")]
    LinkNotFound(String),

    #[error("{op} failed for '{link}': {reason}")]
    Netlink {
        op: &'static str,
        link: String,
        reason: String,
    },

    #[error("Failed to open netlink connection: {0}")]
    Connection(io::Error),

    #[error("Failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),

    #[error("Failed to create TAP device '{0}': {1}")]
    CreateTap(String, io::Error),

    #[error("Interface name too long: {0} (max 15 chars)")]
    NameTooLong(String),

    #[error("ioctl on '{0}' failed: {1}")]
    Ioctl(String, io::Error),

    #[error("Failed to write {path}: {source}")]
    Sysctl {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Linux interface names are limited to IFNAMSIZ - 1 bytes.
pub const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("ipv4"),
            IpFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// A network link as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    /// Raw MTU. Wider than the valid range so out-of-range values can be rejected.
    pub mtu: i64,
    pub kind: Option<String>,
}

/// A route from the pod's routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` for the default route.
    pub dst: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub src: Option<IpAddr>,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.dst.is_none_or(|dst| dst.prefix_len() == 0)
    }
}

/// Links the facade knows how to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Bridge {
        name: String,
        mac: Option<MacAddr>,
        mtu: u32,
    },
    Dummy {
        name: String,
    },
}

impl LinkSpec {
    pub fn name(&self) -> &str {
        match self {
            LinkSpec::Bridge { name, .. } | LinkSpec::Dummy { name } => name,
        }
    }
}

/// Tap device parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapSpec {
    pub name: String,
    pub queues: u32,
    pub owner_uid: u32,
    pub mtu: u32,
}

#[async_trait]
pub trait NetworkHandler: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Link>;
    async fn link_add(&self, spec: &LinkSpec) -> Result<Link>;
    async fn link_del(&self, link: &Link) -> Result<()>;
    async fn link_set_up(&self, link: &Link) -> Result<()>;
    async fn link_set_down(&self, link: &Link) -> Result<()>;
    async fn link_set_name(&self, link: &Link, name: &str) -> Result<()>;
    async fn link_set_mac(&self, link: &Link, mac: MacAddr) -> Result<()>;
    async fn link_set_master(&self, link: &Link, master: &Link) -> Result<()>;
    /// Turn off MAC learning on a bridge port.
    async fn link_set_learning_off(&self, link: &Link) -> Result<()>;

    async fn addr_list(&self, link: &Link, family: IpFamily) -> Result<Vec<IpNet>>;
    async fn addr_add(&self, link: &Link, addr: IpNet) -> Result<()>;
    async fn addr_del(&self, link: &Link, addr: IpNet) -> Result<()>;
    /// Add `addr`, replacing an identical address already on the link.
    async fn addr_replace(&self, link: &Link, addr: IpNet) -> Result<()>;
    async fn route_list(&self, link: &Link, family: IpFamily) -> Result<Vec<Route>>;

    async fn create_tap_device(&self, spec: &TapSpec) -> Result<()>;
    async fn bind_tap_to_bridge(&self, tap: &str, bridge: &str) -> Result<()>;
    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()>;

    async fn configure_ip_forwarding(&self, family: IpFamily) -> Result<()>;
    async fn configure_ipv4_arp_ignore(&self) -> Result<()>;
}

/// First global (non link-local) address of the given family.
pub fn first_global_addr(addrs: &[IpNet]) -> Option<IpNet> {
    addrs
        .iter()
        .find(|net| match net.addr() {
            IpAddr::V4(v4) => !v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_route_detection() {
        let default = Route {
            dst: None,
            gateway: Some("10.35.0.1".parse().unwrap()),
            src: None,
        };
        assert!(default.is_default());

        let zero = Route {
            dst: Some("0.0.0.0/0".parse().unwrap()),
            ..default.clone()
        };
        assert!(zero.is_default());

        let subnet = Route {
            dst: Some("10.35.0.0/24".parse().unwrap()),
            gateway: None,
            src: Some("10.35.0.6".parse().unwrap()),
        };
        assert!(!subnet.is_default());
    }

    #[test]
    fn test_first_global_addr_skips_link_local() {
        let addrs: Vec<IpNet> = vec![
            "fe80::1/64".parse().unwrap(),
            "fd00::6/64".parse().unwrap(),
        ];
        assert_eq!(first_global_addr(&addrs), Some("fd00::6/64".parse().unwrap()));

        let v4: Vec<IpNet> = vec!["169.254.0.3/16".parse().unwrap()];
        assert_eq!(first_global_addr(&v4), None);
    }
}
