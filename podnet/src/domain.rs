//! Hypervisor domain interface fragments.
//!
//! Only the part of the domain descriptor owned by pod networking is modeled:
//! the interface list and the extra QEMU command line.

use crate::mac::MacAddr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Write;

/// Prefix marking an alias as derived from a user-chosen interface name.
pub const USER_ALIAS_PREFIX: &str = "ua-";

pub const IFACE_TYPE_ETHERNET: &str = "ethernet";

const PLACEHOLDER_ALIAS_PREFIX: &str = "placeholder-";
const PLACEHOLDER_MODEL: &str = "virtio-non-transitional";

/// Device alias. User-defined aliases are stored with [`USER_ALIAS_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    name: String,
    user_defined: bool,
}

impl Alias {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_defined: false,
        }
    }

    pub fn user_defined(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_defined: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_user_defined(&self) -> bool {
        self.user_defined
    }

    pub fn encode(&self) -> String {
        if self.user_defined {
            format!("{USER_ALIAS_PREFIX}{}", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn decode(raw: &str) -> Self {
        match raw.strip_prefix(USER_ALIAS_PREFIX) {
            Some(name) => Self::user_defined(name),
            None => Self::new(raw),
        }
    }
}

impl Serialize for Alias {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Alias {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Alias::decode(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceTarget {
    pub device: String,
    /// `false` tells the hypervisor the device already exists and must not be created.
    pub managed: bool,
}

/// A domain network interface, as much of it as networking controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    #[serde(rename = "type", default)]
    pub iface_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<InterfaceTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state: Option<LinkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<Alias>,
}

impl Interface {
    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_ref().map(Alias::name)
    }

    pub fn target_device(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.device.as_str())
    }

    /// Copy every field the fragment sets onto this interface.
    pub fn merge(&mut self, fragment: &Interface) {
        if !fragment.iface_type.is_empty() {
            self.iface_type = fragment.iface_type.clone();
        }
        if fragment.mac.is_some() {
            self.mac = fragment.mac;
        }
        if fragment.mtu.is_some() {
            self.mtu = fragment.mtu;
        }
        if fragment.target.is_some() {
            self.target = fragment.target.clone();
        }
        if fragment.model.is_some() {
            self.model = fragment.model.clone();
        }
        if fragment.link_state.is_some() {
            self.link_state = fragment.link_state;
        }
    }

    /// Render the `<interface>` element handed to attach/detach/update calls.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        let _ = write!(xml, r#"<interface type="{}">"#, escape(&self.iface_type));
        if let Some(mac) = &self.mac {
            let _ = write!(xml, r#"<mac address="{}"/>"#, mac);
        }
        if let Some(mtu) = self.mtu {
            let _ = write!(xml, r#"<mtu size="{}"/>"#, mtu);
        }
        if let Some(target) = &self.target {
            let managed = if target.managed { "yes" } else { "no" };
            let _ = write!(
                xml,
                r#"<target dev="{}" managed="{}"/>"#,
                escape(&target.device),
                managed
            );
        }
        if let Some(model) = &self.model {
            let _ = write!(xml, r#"<model type="{}"/>"#, escape(model));
        }
        if let Some(state) = self.link_state {
            let _ = write!(xml, r#"<link state="{}"/>"#, state.as_str());
        }
        if let Some(alias) = &self.alias {
            let _ = write!(xml, r#"<alias name="{}"/>"#, escape(&alias.encode()));
        }
        xml.push_str("</interface>");
        xml
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

/// The networking-relevant slice of a domain definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub devices: Devices,
    /// Extra arguments appended to the QEMU command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qemu_args: Vec<String>,
}

impl DomainSpec {
    pub fn interfaces(&self) -> &[Interface] {
        &self.devices.interfaces
    }

    pub fn interface_by_alias(&self, name: &str) -> Option<&Interface> {
        self.devices
            .interfaces
            .iter()
            .find(|iface| iface.alias_name() == Some(name))
    }

    pub fn interface_by_alias_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.devices
            .interfaces
            .iter_mut()
            .find(|iface| iface.alias_name() == Some(name))
    }

    pub fn remove_interface_by_alias(&mut self, name: &str) -> Option<Interface> {
        let pos = self
            .devices
            .interfaces
            .iter()
            .position(|iface| iface.alias_name() == Some(name))?;
        Some(self.devices.interfaces.remove(pos))
    }

    /// A copy of this spec with `count` placeholder interfaces appended.
    pub fn with_placeholders(&self, count: usize) -> DomainSpec {
        let mut spec = self.clone();
        spec.devices
            .interfaces
            .extend((0..count).map(placeholder_interface));
        spec
    }
}

/// Placeholder occupying one PCI slot for a future hotplug.
pub fn placeholder_interface(index: usize) -> Interface {
    Interface {
        iface_type: IFACE_TYPE_ETHERNET.to_string(),
        model: Some(PLACEHOLDER_MODEL.to_string()),
        alias: Some(Alias::new(format!("{PLACEHOLDER_ALIAS_PREFIX}{index}"))),
        ..Default::default()
    }
}
