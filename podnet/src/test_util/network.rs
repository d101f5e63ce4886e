//! In-memory network namespace.

use crate::mac::MacAddr;
use crate::netdriver::{
    IpFamily, Link, LinkSpec, NetError, NetworkHandler, Result, Route, TapSpec,
};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// A mutation applied to the fake namespace, named by link names at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCall {
    LinkAdd(String),
    LinkDel(String),
    SetUp(String),
    SetDown(String),
    Rename(String, String),
    SetMac(String, MacAddr),
    SetMaster(String, String),
    LearningOff(String),
    AddrAdd(String, IpNet),
    AddrDel(String, IpNet),
    AddrReplace(String, IpNet),
    CreateTap(String),
    BindTap(String, String),
    DisableChecksum(String),
    Forwarding(IpFamily),
    ArpIgnore,
}

/// Initial state of a link.
#[derive(Debug, Clone)]
pub struct FakeLink {
    name: String,
    mac: MacAddr,
    mtu: i64,
    kind: Option<String>,
    addrs: Vec<IpNet>,
    routes: Vec<Route>,
}

impl FakeLink {
    pub fn new(name: &str, mac: &str) -> Self {
        Self {
            name: name.to_string(),
            mac: mac.parse().expect("valid MAC"),
            mtu: 1500,
            kind: None,
            addrs: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn mtu(mut self, mtu: i64) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn addr(mut self, addr: &str) -> Self {
        self.addrs.push(addr.parse().expect("valid address"));
        self
    }

    pub fn route(mut self, dst: Option<&str>, gateway: Option<&str>, src: Option<&str>) -> Self {
        self.routes.push(Route {
            dst: dst.map(|d| d.parse().expect("valid destination")),
            gateway: gateway.map(|g| g.parse().expect("valid gateway")),
            src: src.map(|s| s.parse().expect("valid source")),
        });
        self
    }
}

#[derive(Debug, Clone)]
struct LinkState {
    link: Link,
    up: bool,
    master: Option<u32>,
    learning: bool,
    addrs: Vec<IpNet>,
    routes: Vec<Route>,
}

#[derive(Default)]
struct State {
    next_index: u32,
    links: BTreeMap<u32, LinkState>,
    calls: Vec<HandlerCall>,
    failing: HashSet<&'static str>,
}

impl State {
    fn check(&self, op: &'static str, link: &str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(NetError::Netlink {
                op,
                link: link.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn get(&mut self, link: &Link) -> Result<&mut LinkState> {
        self.links
            .get_mut(&link.index)
            .ok_or_else(|| NetError::LinkNotFound(link.name.clone()))
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        self.links
            .iter()
            .find(|(_, state)| state.link.name == name)
            .map(|(index, _)| *index)
    }

    fn insert(&mut self, link: Link, addrs: Vec<IpNet>, routes: Vec<Route>) -> Result<Link> {
        if self.index_of(&link.name).is_some() {
            return Err(NetError::Netlink {
                op: "link_add",
                link: link.name.clone(),
                reason: "File exists".to_string(),
            });
        }
        self.next_index += 1;
        let link = Link {
            index: self.next_index,
            ..link
        };
        self.links.insert(
            link.index,
            LinkState {
                link: link.clone(),
                up: true,
                master: None,
                learning: true,
                addrs,
                routes,
            },
        );
        Ok(link)
    }
}

/// [`NetworkHandler`] over an in-memory set of links.
#[derive(Default)]
pub struct FakeNetworkHandler {
    state: Mutex<State>,
}

impl FakeNetworkHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, link: FakeLink) {
        let mut state = self.state.lock().unwrap();
        state
            .insert(
                Link {
                    index: 0,
                    name: link.name,
                    mac: Some(link.mac),
                    mtu: link.mtu,
                    kind: link.kind,
                },
                link.addrs,
                link.routes,
            )
            .expect("unique link name");
    }

    /// Make every later call of `op` (a trait method name) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        let state = self.state.lock().unwrap();
        let index = state.index_of(name)?;
        state.links.get(&index).map(|s| s.link.clone())
    }

    pub fn addrs(&self, name: &str) -> Vec<IpNet> {
        let state = self.state.lock().unwrap();
        state
            .index_of(name)
            .and_then(|index| state.links.get(&index))
            .map(|s| s.addrs.clone())
            .unwrap_or_default()
    }

    pub fn is_up(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .index_of(name)
            .and_then(|index| state.links.get(&index))
            .is_some_and(|s| s.up)
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let index = state.index_of(name)?;
        let master = state.links.get(&index)?.master?;
        state.links.get(&master).map(|s| s.link.name.clone())
    }

    pub fn learning(&self, name: &str) -> Option<bool> {
        let state = self.state.lock().unwrap();
        let index = state.index_of(name)?;
        state.links.get(&index).map(|s| s.learning)
    }
}

fn family_of_route(route: &Route) -> Option<IpFamily> {
    route
        .dst
        .map(|dst| IpFamily::of(&dst.addr()))
        .or(route.gateway.as_ref().map(IpFamily::of))
        .or(route.src.as_ref().map(IpFamily::of))
}

#[async_trait]
impl NetworkHandler for FakeNetworkHandler {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        self.link(name)
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))
    }

    async fn link_add(&self, spec: &LinkSpec) -> Result<Link> {
        let mut state = self.state.lock().unwrap();
        state.check("link_add", spec.name())?;
        let link = match spec {
            LinkSpec::Bridge { name, mac, mtu } => Link {
                index: 0,
                name: name.clone(),
                mac: Some(mac.unwrap_or_else(MacAddr::random)),
                mtu: i64::from(*mtu),
                kind: Some("bridge".to_string()),
            },
            LinkSpec::Dummy { name } => Link {
                index: 0,
                name: name.clone(),
                mac: Some(MacAddr::random()),
                mtu: 1500,
                kind: Some("dummy".to_string()),
            },
        };
        let link = state.insert(link, Vec::new(), Vec::new())?;
        if let Some(s) = state.links.get_mut(&link.index) {
            s.up = false;
        }
        state.calls.push(HandlerCall::LinkAdd(link.name.clone()));
        Ok(link)
    }

    async fn link_del(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_del", &link.name)?;
        let removed = state
            .links
            .remove(&link.index)
            .ok_or_else(|| NetError::LinkNotFound(link.name.clone()))?;
        state.calls.push(HandlerCall::LinkDel(removed.link.name));
        Ok(())
    }

    async fn link_set_up(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_up", &link.name)?;
        let entry = state.get(link)?;
        entry.up = true;
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::SetUp(name));
        Ok(())
    }

    async fn link_set_down(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_down", &link.name)?;
        let entry = state.get(link)?;
        entry.up = false;
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::SetDown(name));
        Ok(())
    }

    async fn link_set_name(&self, link: &Link, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_name", &link.name)?;
        if state.index_of(name).is_some_and(|index| index != link.index) {
            return Err(NetError::Netlink {
                op: "link_set_name",
                link: link.name.clone(),
                reason: "File exists".to_string(),
            });
        }
        let entry = state.get(link)?;
        let old = std::mem::replace(&mut entry.link.name, name.to_string());
        state.calls.push(HandlerCall::Rename(old, name.to_string()));
        Ok(())
    }

    async fn link_set_mac(&self, link: &Link, mac: MacAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_mac", &link.name)?;
        let entry = state.get(link)?;
        entry.link.mac = Some(mac);
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::SetMac(name, mac));
        Ok(())
    }

    async fn link_set_master(&self, link: &Link, master: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_master", &link.name)?;
        let master_name = state.get(master)?.link.name.clone();
        let entry = state.get(link)?;
        entry.master = Some(master.index);
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::SetMaster(name, master_name));
        Ok(())
    }

    async fn link_set_learning_off(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("link_set_learning_off", &link.name)?;
        let entry = state.get(link)?;
        entry.learning = false;
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::LearningOff(name));
        Ok(())
    }

    async fn addr_list(&self, link: &Link, family: IpFamily) -> Result<Vec<IpNet>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.get(link)?;
        Ok(entry
            .addrs
            .iter()
            .filter(|addr| IpFamily::of(&addr.addr()) == family)
            .copied()
            .collect())
    }

    async fn addr_add(&self, link: &Link, addr: IpNet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("addr_add", &link.name)?;
        let entry = state.get(link)?;
        if entry.addrs.contains(&addr) {
            return Err(NetError::Netlink {
                op: "addr_add",
                link: link.name.clone(),
                reason: "File exists".to_string(),
            });
        }
        entry.addrs.push(addr);
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::AddrAdd(name, addr));
        Ok(())
    }

    async fn addr_del(&self, link: &Link, addr: IpNet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("addr_del", &link.name)?;
        let entry = state.get(link)?;
        let before = entry.addrs.len();
        entry.addrs.retain(|a| *a != addr);
        if entry.addrs.len() == before {
            return Err(NetError::Netlink {
                op: "addr_del",
                link: link.name.clone(),
                reason: "Cannot assign requested address".to_string(),
            });
        }
        // Routes sourced from the address go with it.
        entry.routes.retain(|r| r.src != Some(addr.addr()));
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::AddrDel(name, addr));
        Ok(())
    }

    async fn addr_replace(&self, link: &Link, addr: IpNet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("addr_replace", &link.name)?;
        let entry = state.get(link)?;
        entry.addrs.retain(|a| *a != addr);
        entry.addrs.push(addr);
        let name = entry.link.name.clone();
        state.calls.push(HandlerCall::AddrReplace(name, addr));
        Ok(())
    }

    async fn route_list(&self, link: &Link, family: IpFamily) -> Result<Vec<Route>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.get(link)?;
        Ok(entry
            .routes
            .iter()
            .filter(|r| family_of_route(r) == Some(family))
            .cloned()
            .collect())
    }

    async fn create_tap_device(&self, spec: &TapSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("create_tap_device", &spec.name)?;
        state.insert(
            Link {
                index: 0,
                name: spec.name.clone(),
                mac: Some(MacAddr::random()),
                mtu: i64::from(spec.mtu),
                kind: Some("tun".to_string()),
            },
            Vec::new(),
            Vec::new(),
        )?;
        state.calls.push(HandlerCall::CreateTap(spec.name.clone()));
        Ok(())
    }

    async fn bind_tap_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("bind_tap_to_bridge", tap)?;
        let tap_index = state
            .index_of(tap)
            .ok_or_else(|| NetError::LinkNotFound(tap.to_string()))?;
        let bridge_index = state
            .index_of(bridge)
            .ok_or_else(|| NetError::LinkNotFound(bridge.to_string()))?;
        if let Some(entry) = state.links.get_mut(&tap_index) {
            entry.master = Some(bridge_index);
            entry.up = true;
        }
        state
            .calls
            .push(HandlerCall::BindTap(tap.to_string(), bridge.to_string()));
        Ok(())
    }

    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("disable_tx_offload_checksum", name)?;
        if state.index_of(name).is_none() {
            return Err(NetError::LinkNotFound(name.to_string()));
        }
        state
            .calls
            .push(HandlerCall::DisableChecksum(name.to_string()));
        Ok(())
    }

    async fn configure_ip_forwarding(&self, family: IpFamily) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("configure_ip_forwarding", "all")?;
        state.calls.push(HandlerCall::Forwarding(family));
        Ok(())
    }

    async fn configure_ipv4_arp_ignore(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("configure_ipv4_arp_ignore", "all")?;
        state.calls.push(HandlerCall::ArpIgnore);
        Ok(())
    }
}

