//! Hotplug, hot-unplug and link-state reconciliation against a running domain.
//!
//! [`sync_network_interfaces`] is called once per domain sync. It compares
//! the VMI with the live domain and issues the device calls needed to
//! converge, in a fixed order: attach, then detach, then link state. Each
//! interface is handled independently; a failure is reported and retried on
//! the next sync while the rest of the batch proceeds.

use crate::configurator::NetworkConfigurator;
use crate::domain::{self, Alias, DomainSpec, IFACE_TYPE_ETHERNET, LinkState};
use crate::error::{Error, Result};
use crate::hypervisor::{AffectFlags, DomainDevices};
use crate::namescheme::{hashed_pod_interface_name, tap_name};
use crate::vmi::{self, INFO_SOURCE_MULTUS_STATUS, InterfaceState, Network, VirtualMachineInstance};
use std::future::Future;
use tracing::{debug, info, warn};

const DEFAULT_MODEL: &str = "virtio-non-transitional";

/// Skeleton domain interface for a VMI interface, before any binding decorates it.
pub fn desired_interface(iface: &vmi::Interface) -> domain::Interface {
    domain::Interface {
        iface_type: IFACE_TYPE_ETHERNET.to_string(),
        model: Some(
            iface
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        ),
        link_state: (iface.state == Some(InterfaceState::Down)).then_some(LinkState::Down),
        alias: Some(Alias::user_defined(&iface.name)),
        ..Default::default()
    }
}

/// Desired interfaces of a VMI: everything not absent and not SR-IOV.
pub fn desired_domain_interfaces(vmi: &VirtualMachineInstance) -> Vec<domain::Interface> {
    vmi.interfaces()
        .iter()
        .filter(|iface| !iface.is_absent() && !iface.is_sriov())
        .map(desired_interface)
        .collect()
}

/// Networks that are ready in the pod but not yet attached to the domain.
pub fn networks_to_hotplug(
    vmi: &VirtualMachineInstance,
    current: &[domain::Interface],
) -> Vec<Network> {
    vmi.networks()
        .iter()
        .filter(|network| {
            let pod_iface_ready = vmi
                .status_interface(&network.name)
                .is_some_and(|status| status.has_info_source(INFO_SOURCE_MULTUS_STATUS));
            let attached = current
                .iter()
                .any(|iface| iface.alias_name() == Some(network.name.as_str()));
            let Some(iface) = vmi.interface(&network.name) else {
                return false;
            };

            pod_iface_ready && !attached && !iface.is_absent() && !iface.is_sriov()
        })
        .cloned()
        .collect()
}

/// Live interfaces whose VMI interface is marked absent.
///
/// An interface is only returned when its target device is the hashed tap
/// name. Anything else may be an attach still in flight, or a device from
/// the ordinal naming scheme, which stays attached.
pub fn interfaces_to_hot_unplug(
    vmi: &VirtualMachineInstance,
    current: &[domain::Interface],
) -> Vec<domain::Interface> {
    vmi.interfaces()
        .iter()
        .filter(|iface| iface.is_absent())
        .filter_map(|iface| {
            let live = current
                .iter()
                .find(|live| live.alias_name() == Some(iface.name.as_str()))?;
            let expected = tap_name(&hashed_pod_interface_name(&iface.name));

            if live.target_device() == Some(expected.as_str()) {
                Some(live.clone())
            } else {
                debug!(
                    iface = %iface.name,
                    target = ?live.target_device(),
                    expected = %expected,
                    "Skipping unplug, target does not match"
                );
                None
            }
        })
        .collect()
}

/// Desired interfaces whose link state differs from the live one.
pub fn interfaces_with_link_state_change(
    desired: &[domain::Interface],
    current: &[domain::Interface],
) -> Vec<domain::Interface> {
    desired
        .iter()
        .filter(|want| {
            let Some(alias) = want.alias_name() else {
                return false;
            };
            current
                .iter()
                .find(|live| live.alias_name() == Some(alias))
                .is_some_and(|live| live.link_state != want.link_state)
        })
        .cloned()
        .collect()
}

/// Set up and attach each network's interface.
pub async fn hotplug_virtio_interfaces(
    vmi: &VirtualMachineInstance,
    configurator: &dyn NetworkConfigurator,
    domain: &dyn DomainDevices,
    networks: &[Network],
) -> Result<()> {
    let mut errors = Vec::new();

    for network in networks {
        if let Err(e) = hotplug_interface(vmi, configurator, domain, network).await {
            warn!(network = %network.name, error = %e, "Interface hotplug failed");
            errors.push(e);
        }
    }

    Error::from_many(errors)
}

async fn hotplug_interface(
    vmi: &VirtualMachineInstance,
    configurator: &dyn NetworkConfigurator,
    domain: &dyn DomainDevices,
    network: &Network,
) -> Result<()> {
    let name = network.name.as_str();
    let iface = vmi
        .interface(name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;

    // A domain holding only this interface, so phase 2 decorates nothing else.
    let mut synthetic = DomainSpec {
        name: String::new(),
        devices: domain::Devices {
            interfaces: vec![desired_interface(iface)],
        },
        qemu_args: Vec::new(),
    };

    let single = std::slice::from_ref(network);
    configurator.setup_pod_network_phase1(single).await?;
    configurator
        .setup_pod_network_phase2(&mut synthetic, single)
        .await?;

    let decorated = synthetic
        .interface_by_alias(name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;

    domain
        .attach_device(&decorated.to_xml(), AffectFlags::LIVE_AND_CONFIG)
        .await?;
    info!(iface = name, target = ?decorated.target_device(), "Interface hotplugged");
    Ok(())
}

/// Detach each interface and stop whatever served it.
pub async fn hot_unplug_virtio_interfaces(
    vmi: &VirtualMachineInstance,
    configurator: &dyn NetworkConfigurator,
    domain: &dyn DomainDevices,
    ifaces: &[domain::Interface],
) -> Result<()> {
    let mut errors = Vec::new();

    for iface in ifaces {
        let Some(name) = iface.alias_name() else {
            continue;
        };
        if let Err(e) = domain
            .detach_device(&iface.to_xml(), AffectFlags::LIVE_AND_CONFIG)
            .await
        {
            warn!(iface = name, error = %e, "Interface hot-unplug failed");
            errors.push(e.into());
            continue;
        }
        info!(iface = name, "Interface hot-unplugged");

        if let Some(network) = vmi.network(name)
            && let Err(e) = configurator.stop_dhcp(std::slice::from_ref(network))
        {
            warn!(iface = name, error = %e, "Failed to stop DHCP server");
        }
    }

    Error::from_many(errors)
}

/// Push the desired link state of each interface to the domain.
pub async fn update_domain_link_state(
    domain: &dyn DomainDevices,
    ifaces: &[domain::Interface],
) -> Result<()> {
    let mut errors = Vec::new();

    for iface in ifaces {
        match domain
            .update_device(&iface.to_xml(), AffectFlags::LIVE_AND_CONFIG)
            .await
        {
            Ok(()) => info!(
                iface = ?iface.alias_name(),
                state = ?iface.link_state,
                "Interface link state updated"
            ),
            Err(e) => {
                warn!(iface = ?iface.alias_name(), error = %e, "Link state update failed");
                errors.push(e.into());
            }
        }
    }

    Error::from_many(errors)
}

/// One reconciliation pass: hotplug, then hot-unplug, then link state.
pub async fn sync_network_interfaces(
    vmi: &VirtualMachineInstance,
    current: &[domain::Interface],
    desired: &[domain::Interface],
    configurator: &dyn NetworkConfigurator,
    domain: &dyn DomainDevices,
) -> Result<()> {
    let mut errors = Vec::new();

    let to_plug = networks_to_hotplug(vmi, current);
    if !to_plug.is_empty()
        && let Err(e) = hotplug_virtio_interfaces(vmi, configurator, domain, &to_plug).await
    {
        errors.extend(e.into_many());
    }

    let to_unplug = interfaces_to_hot_unplug(vmi, current);
    if !to_unplug.is_empty()
        && let Err(e) = hot_unplug_virtio_interfaces(vmi, configurator, domain, &to_unplug).await
    {
        errors.extend(e.into_many());
    }

    let to_update = interfaces_with_link_state_change(desired, current);
    if !to_update.is_empty()
        && let Err(e) = update_domain_link_state(domain, &to_update).await
    {
        errors.extend(e.into_many());
    }

    debug!(
        hotplugged = to_plug.len(),
        unplugged = to_unplug.len(),
        updated = to_update.len(),
        failed = errors.len(),
        "Network interfaces synced"
    );
    Error::from_many(errors)
}

/// Run `f` on a copy of `spec` with `count` placeholder interfaces appended.
///
/// The copy is dropped when `f` completes; `spec` itself is never modified.
pub async fn with_placeholder_interfaces<F, Fut, T>(spec: &DomainSpec, count: usize, f: F) -> T
where
    F: FnOnce(DomainSpec) -> Fut,
    Fut: Future<Output = T>,
{
    f(spec.with_placeholders(count)).await
}
