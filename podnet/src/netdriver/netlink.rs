//! rtnetlink-backed implementation of the network facade.

use super::{
    IpFamily, Link, LinkSpec, NetError, NetworkHandler, Result, Route, TapSpec, sysctl, tap,
};
use crate::mac::MacAddr;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::{Handle, IpVersion};
use std::net::IpAddr;
use std::num::NonZeroI32;
use tracing::{debug, info};

/// Handle for netlink operations in the current network namespace.
pub struct RtNetlinkHandler {
    handle: Handle,
}

impl RtNetlinkHandler {
    /// Open a netlink connection. Must be called inside a tokio runtime.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(NetError::Connection)?;

        tokio::spawn(connection);

        Ok(Self { handle })
    }

    async fn address_messages(&self, link: &Link) -> Result<Vec<AddressMessage>> {
        self.handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| netlink_err("address list", &link.name, e))
    }
}

fn netlink_err(op: &'static str, link: &str, e: rtnetlink::Error) -> NetError {
    NetError::Netlink {
        op,
        link: link.to_string(),
        reason: e.to_string(),
    }
}

fn is_no_such_device(e: &rtnetlink::Error) -> bool {
    matches!(
        e,
        rtnetlink::Error::NetlinkError(msg) if msg.code.map(NonZeroI32::get) == Some(-libc::ENODEV)
    )
}

fn link_from_message(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mac: None,
        mtu: 0,
        kind: None,
    };

    for nla in msg.attributes {
        match nla {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Address(addr) => link.mac = MacAddr::from_slice(&addr),
            LinkAttribute::Mtu(mtu) => link.mtu = i64::from(mtu),
            LinkAttribute::LinkInfo(infos) => {
                link.kind = infos.iter().find_map(|info| match info {
                    LinkInfo::Kind(kind) => Some(format!("{:?}", kind).to_lowercase()),
                    _ => None,
                });
            }
            _ => {}
        }
    }

    link
}

fn address_from_message(msg: &AddressMessage) -> Option<IpNet> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => IpNet::new(*ip, msg.header.prefix_len).ok(),
        _ => None,
    })
}

fn route_addr(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn route_from_message(msg: &RouteMessage, link_index: u32) -> Option<Route> {
    let mut oif = None;
    let mut route = Route {
        dst: None,
        gateway: None,
        src: None,
    };

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            RouteAttribute::Destination(addr) => {
                route.dst = route_addr(addr)
                    .and_then(|ip| IpNet::new(ip, msg.header.destination_prefix_length).ok());
            }
            RouteAttribute::Gateway(addr) => route.gateway = route_addr(addr),
            RouteAttribute::PrefSource(addr) => route.src = route_addr(addr),
            _ => {}
        }
    }

    (oif == Some(link_index)).then_some(route)
}

#[async_trait]
impl NetworkHandler for RtNetlinkHandler {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(link_from_message(msg)),
            Ok(None) => Err(NetError::LinkNotFound(name.to_string())),
            Err(e) if is_no_such_device(&e) => {
                debug!(link = name, "link lookup returned ENODEV");
                Err(NetError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(netlink_err("link get", name, e)),
        }
    }

    async fn link_add(&self, spec: &LinkSpec) -> Result<Link> {
        let request = self.handle.link().add();
        let request = match spec {
            LinkSpec::Bridge { name, .. } => request.bridge(name.clone()),
            LinkSpec::Dummy { name } => request.dummy(name.clone()),
        };
        request
            .execute()
            .await
            .map_err(|e| netlink_err("link add", spec.name(), e))?;

        let link = self.link_by_name(spec.name()).await?;

        if let LinkSpec::Bridge { mac, mtu, .. } = spec {
            let mut set = self.handle.link().set(link.index).mtu(*mtu);
            if let Some(mac) = mac {
                set = set.address(mac.octets().to_vec());
            }
            set.execute()
                .await
                .map_err(|e| netlink_err("link set", &link.name, e))?;
        }

        info!(link = %link.name, kind = ?link.kind, "Link created");
        Ok(link)
    }

    async fn link_del(&self, link: &Link) -> Result<()> {
        self.handle
            .link()
            .del(link.index)
            .execute()
            .await
            .map_err(|e| netlink_err("link delete", &link.name, e))?;
        info!(link = %link.name, "Link deleted");
        Ok(())
    }

    async fn link_set_up(&self, link: &Link) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .map_err(|e| netlink_err("link up", &link.name, e))
    }

    async fn link_set_down(&self, link: &Link) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .down()
            .execute()
            .await
            .map_err(|e| netlink_err("link down", &link.name, e))
    }

    async fn link_set_name(&self, link: &Link, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(|e| netlink_err("link rename", &link.name, e))?;
        info!(from = %link.name, to = name, "Link renamed");
        Ok(())
    }

    async fn link_set_mac(&self, link: &Link, mac: MacAddr) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .address(mac.octets().to_vec())
            .execute()
            .await
            .map_err(|e| netlink_err("link set address", &link.name, e))
    }

    async fn link_set_master(&self, link: &Link, master: &Link) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .controller(master.index)
            .execute()
            .await
            .map_err(|e| netlink_err("link set master", &link.name, e))
    }

    async fn link_set_learning_off(&self, link: &Link) -> Result<()> {
        sysctl::disable_bridge_port_learning(&link.name)
    }

    async fn addr_list(&self, link: &Link, family: IpFamily) -> Result<Vec<IpNet>> {
        let wanted = match family {
            IpFamily::V4 => AddressFamily::Inet,
            IpFamily::V6 => AddressFamily::Inet6,
        };

        Ok(self
            .address_messages(link)
            .await?
            .iter()
            .filter(|msg| msg.header.family == wanted)
            .filter_map(address_from_message)
            .collect())
    }

    async fn addr_add(&self, link: &Link, addr: IpNet) -> Result<()> {
        self.handle
            .address()
            .add(link.index, addr.addr(), addr.prefix_len())
            .execute()
            .await
            .map_err(|e| netlink_err("address add", &link.name, e))?;
        info!(link = %link.name, addr = %addr, "Address added");
        Ok(())
    }

    async fn addr_del(&self, link: &Link, addr: IpNet) -> Result<()> {
        for msg in self.address_messages(link).await? {
            if address_from_message(&msg) == Some(addr) {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| netlink_err("address delete", &link.name, e))?;
                info!(link = %link.name, addr = %addr, "Address removed");
            }
        }
        Ok(())
    }

    async fn addr_replace(&self, link: &Link, addr: IpNet) -> Result<()> {
        self.addr_del(link, addr).await?;
        self.addr_add(link, addr).await
    }

    async fn route_list(&self, link: &Link, family: IpFamily) -> Result<Vec<Route>> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };

        let messages: Vec<RouteMessage> = self
            .handle
            .route()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(|e| netlink_err("route list", &link.name, e))?;

        Ok(messages
            .iter()
            .filter_map(|msg| route_from_message(msg, link.index))
            .collect())
    }

    async fn create_tap_device(&self, spec: &TapSpec) -> Result<()> {
        tap::create_persistent_tap(spec)?;

        let link = self.link_by_name(&spec.name).await?;
        self.handle
            .link()
            .set(link.index)
            .mtu(spec.mtu)
            .execute()
            .await
            .map_err(|e| netlink_err("link set mtu", &spec.name, e))?;

        info!(
            tap = %spec.name,
            queues = spec.queues,
            owner = spec.owner_uid,
            mtu = spec.mtu,
            "TAP device created"
        );
        Ok(())
    }

    async fn bind_tap_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        let tap_link = self.link_by_name(tap).await?;
        let bridge_link = self.link_by_name(bridge).await?;
        self.link_set_master(&tap_link, &bridge_link).await?;
        self.link_set_up(&tap_link).await?;
        info!(tap, bridge, "TAP device bound to bridge");
        Ok(())
    }

    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()> {
        tap::disable_tx_checksum(name)
    }

    async fn configure_ip_forwarding(&self, family: IpFamily) -> Result<()> {
        sysctl::enable_ip_forwarding(family)
    }

    async fn configure_ipv4_arp_ignore(&self) -> Result<()> {
        sysctl::enable_arp_ignore()
    }
}
