//! podnet: extends a Kubernetes pod's network into a QEMU/KVM virtual machine.
//!
//! Setup happens in two processes. Phase 1 runs with privileges in the pod's
//! untouched network namespace, wires the pod interface to a tap device and
//! records what it found. Phase 2 runs in the VM-hosting process, reads those
//! records back, decorates the domain definition and serves DHCP to the guest.
//! For running VMs the hotplug reconciler keeps the domain's interfaces in
//! line with the VMI.
//!
//! # Architecture
//!
//! ```text
//! pod eth0 ──┐                                  ┌── DHCP responder
//!            ├── k6t-eth0 (bridge) ── tap0 ── VM │
//! dummy eth0 ┘   (bridge binding)                └── NAT (masquerade binding)
//! ```

pub mod binding;
pub mod cache;
pub mod config;
pub mod configurator;
pub mod dhcp;
pub mod domain;
pub mod error;
pub mod hotplug;
pub mod hypervisor;
pub mod mac;
pub mod namescheme;
pub mod nat;
pub mod netdriver;
pub mod podnic;
pub mod vmi;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use binding::{Binding, BindingMechanism};
pub use cache::{CacheKey, CacheStore};
pub use config::NetConfig;
pub use configurator::{NetworkConfigurator, VmNetworkConfigurator};
pub use error::{Error, Result};
pub use hotplug::sync_network_interfaces;
pub use hypervisor::{AffectFlags, DomainDevices, VirshDomain};
pub use podnic::{NetContext, PodNic};
