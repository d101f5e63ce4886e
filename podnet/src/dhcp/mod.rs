//! Single-client DHCPv4 responder for bridge-backed interfaces.
//!
//! Each bridge gets its own server that only answers the VM's MAC and hands
//! out the one address discovered during phase 1 with an infinite lease.

mod reply;
mod resolv;
mod server;

pub use reply::{INFINITE_LEASE, build_reply};
pub use resolv::ResolvConf;
pub use server::DhcpServers;

use crate::mac::MacAddr;
use crate::vmi::{self, VirtualMachineInstance};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::warn;

/// Site-specific option codes a VMI may set.
const PRIVATE_OPTION_RANGE: std::ops::RangeInclusive<u8> = 224..=254;

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("DHCP socket error on '{iface}': {source}")]
    Socket {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode DHCP reply: {0}")]
    Encode(String),

    #[error("Incomplete DHCP configuration for '{iface}': missing {field}")]
    Incomplete { iface: String, field: &'static str },

    #[error("Failed to read resolver configuration {}: {source}", path.display())]
    ResolvConf {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DhcpError>;

/// A classless static route handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticRoute {
    pub dst: Ipv4Net,
    /// `0.0.0.0` for on-link routes.
    pub gateway: Ipv4Addr,
}

/// What phase 1 learned that the DHCP server needs, persisted for phase 2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpConfig {
    /// Pod interface the configuration was discovered on.
    pub name: String,
    #[serde(default)]
    pub ipam_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    /// Address and prefix handed to the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Net>,
    /// Server identifier and default gateway announced to the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertising_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub mtu: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<StaticRoute>,
}

/// Per-VM settings that do not come from the pod interface itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub dns_servers: Vec<Ipv4Addr>,
    pub search_domains: Vec<String>,
    pub hostname: Option<String>,
    pub extra: Option<vmi::DhcpOptions>,
}

impl ServerOptions {
    /// Combine the pod resolver with VMI-level DHCP settings.
    pub fn new(vmi: &VirtualMachineInstance, iface: &vmi::Interface, resolv: &ResolvConf) -> Self {
        let dns_servers = resolv
            .nameservers
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        let mut search_domains = resolv.search.clone();
        if let Some(subdomain) = vmi.spec.subdomain.as_deref().filter(|s| !s.is_empty())
            && let Some(cluster) = resolv.cluster_domain(&vmi.metadata.namespace)
        {
            search_domains.insert(
                0,
                format!("{subdomain}.{}.svc.{cluster}", vmi.metadata.namespace),
            );
        }

        Self {
            dns_servers,
            search_domains,
            hostname: Some(vmi.hostname().to_string()),
            extra: iface.dhcp_options.clone(),
        }
    }
}

/// Everything needed to answer the one client of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_mac: MacAddr,
    pub client_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub mtu: u16,
    pub routes: Vec<StaticRoute>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub search_domains: Vec<String>,
    pub hostname: Option<String>,
    /// Raw options appended verbatim, keyed by option code.
    pub raw_options: Vec<(u8, Vec<u8>)>,
}

impl Lease {
    pub fn new(config: &DhcpConfig, options: &ServerOptions) -> Result<Self> {
        let missing = |field| DhcpError::Incomplete {
            iface: config.name.clone(),
            field,
        };

        let client_mac = config.mac.ok_or_else(|| missing("mac"))?;
        let ip = config.ip.ok_or_else(|| missing("ip"))?;
        let server_ip = config.advertising_ip.ok_or_else(|| missing("advertising ip"))?;

        Ok(Self {
            client_mac,
            client_ip: ip.addr(),
            subnet_mask: ip.netmask(),
            server_ip,
            mtu: config.mtu,
            routes: config.routes.clone(),
            dns_servers: options.dns_servers.clone(),
            search_domains: options.search_domains.clone(),
            hostname: options.hostname.clone(),
            raw_options: options
                .extra
                .as_ref()
                .map(raw_options_from)
                .unwrap_or_default(),
        })
    }
}

// Option codes from RFC 2132.
const OPT_NTP_SERVERS: u8 = 42;
const OPT_TFTP_SERVER_NAME: u8 = 66;
const OPT_BOOTFILE_NAME: u8 = 67;

fn raw_options_from(extra: &vmi::DhcpOptions) -> Vec<(u8, Vec<u8>)> {
    let mut options = Vec::new();

    if let Some(name) = &extra.tftp_server_name {
        options.push((OPT_TFTP_SERVER_NAME, name.as_bytes().to_vec()));
    }
    if let Some(name) = &extra.boot_file_name {
        options.push((OPT_BOOTFILE_NAME, name.as_bytes().to_vec()));
    }

    let ntp: Vec<u8> = extra
        .ntp_servers
        .iter()
        .filter_map(|s| match s.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip.octets()),
            Err(_) => {
                warn!(server = %s, "Ignoring invalid NTP server address");
                None
            }
        })
        .flatten()
        .collect();
    if !ntp.is_empty() {
        options.push((OPT_NTP_SERVERS, ntp));
    }

    for private in &extra.private_options {
        if PRIVATE_OPTION_RANGE.contains(&private.option) {
            options.push((private.option, private.value.as_bytes().to_vec()));
        } else {
            warn!(option = private.option, "Ignoring DHCP private option outside 224-254");
        }
    }

    options
}

/// Starts and stops per-bridge DHCP servers.
pub trait DhcpLauncher: Send + Sync {
    /// Start serving `lease` on `iface` unless a server already runs there.
    fn start(&self, iface: &str, lease: Lease) -> Result<()>;
    fn stop(&self, iface: &str);
    /// Whether any server is still serving.
    fn has_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmi::{BindingKind, DhcpPrivateOption};

    fn config() -> DhcpConfig {
        DhcpConfig {
            name: "eth0".into(),
            ipam_disabled: false,
            mac: Some("02:00:00:00:00:01".parse().unwrap()),
            ip: Some("10.35.0.6/24".parse().unwrap()),
            ipv6: None,
            advertising_ip: Some(Ipv4Addr::new(169, 254, 75, 0)),
            mtu: 1410,
            routes: vec![],
        }
    }

    #[test]
    fn test_lease_from_config() {
        let lease = Lease::new(&config(), &ServerOptions::default()).unwrap();
        assert_eq!(lease.client_ip, Ipv4Addr::new(10, 35, 0, 6));
        assert_eq!(lease.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(lease.server_ip, Ipv4Addr::new(169, 254, 75, 0));
    }

    #[test]
    fn test_lease_requires_address() {
        let mut config = config();
        config.ip = None;
        let err = Lease::new(&config, &ServerOptions::default()).unwrap_err();
        assert!(matches!(err, DhcpError::Incomplete { field: "ip", .. }));
    }

    #[test]
    fn test_server_options_from_vmi() {
        let mut vmi = VirtualMachineInstance::default();
        vmi.metadata.name = "testvmi".into();
        vmi.metadata.namespace = "default".into();
        vmi.spec.subdomain = Some("mysub".into());

        let mut iface = vmi::Interface::new("default", BindingKind::Bridge);
        iface.dhcp_options = Some(vmi::DhcpOptions {
            boot_file_name: Some("pxelinux.0".into()),
            tftp_server_name: None,
            ntp_servers: vec!["192.168.0.1".into(), "bogus".into()],
            private_options: vec![
                DhcpPrivateOption {
                    option: 240,
                    value: "extra".into(),
                },
                DhcpPrivateOption {
                    option: 12,
                    value: "ignored".into(),
                },
            ],
        });

        let resolv = ResolvConf::parse(
            "search default.svc.cluster.local cluster.local\nnameserver 10.96.0.10\nnameserver fd00::a\n",
        );
        let options = ServerOptions::new(&vmi, &iface, &resolv);
        assert_eq!(options.dns_servers, vec![Ipv4Addr::new(10, 96, 0, 10)]);
        assert_eq!(options.search_domains[0], "mysub.default.svc.cluster.local");
        assert_eq!(options.hostname.as_deref(), Some("testvmi"));

        let lease = Lease::new(&config(), &options).unwrap();
        assert_eq!(
            lease.raw_options,
            vec![
                (OPT_BOOTFILE_NAME, b"pxelinux.0".to_vec()),
                (OPT_NTP_SERVERS, vec![192, 168, 0, 1]),
                (240, b"extra".to_vec()),
            ]
        );
    }
}
