//! End-to-end tests for a bridge-bound pod network.
//!
//! Phase 1 and phase 2 run against the in-memory host network, so these
//! need no privileges:
//!   cargo test --package podnet --test bridge_test --features test-util

use podnet::cache::CacheKey;
use podnet::dhcp::{DhcpConfig, DhcpError, StaticRoute};
use podnet::domain::{Alias, DomainSpec, Interface};
use podnet::mac::MacAddr;
use podnet::test_util::{FakeLink, HandlerCall, NetContextBuilder, TestContext, vmi_with};
use podnet::vmi::{self, BindingKind, Network, VirtualMachineInstance};
use podnet::{Error, NetworkConfigurator, VmNetworkConfigurator};
use std::net::Ipv4Addr;

const POD_MAC: &str = "0a:58:0a:23:00:06";
const POD_MTU: i64 = 1410;

const POD_RESOLV: &str = "\
search default.svc.cluster.local svc.cluster.local cluster.local
nameserver 10.96.0.10
options ndots:5
";

fn pod_link() -> FakeLink {
    FakeLink::new("eth0", POD_MAC)
        .mtu(POD_MTU)
        .addr("10.35.0.6/24")
        .route(None, Some("10.35.0.1"), None)
        .route(Some("10.35.0.0/24"), None, Some("10.35.0.6"))
        .route(Some("10.40.0.0/16"), Some("10.35.0.254"), None)
}

fn bridge_vmi() -> VirtualMachineInstance {
    let mut vmi = vmi_with(
        vec![vmi::Interface::new("default", BindingKind::Bridge)],
        vec![Network::pod("default")],
    );
    vmi.spec.hostname = Some("web-0".into());
    vmi.spec.subdomain = Some("web".into());
    vmi
}

fn domain_with(alias: &str) -> DomainSpec {
    let mut domain = DomainSpec::default();
    domain.devices.interfaces.push(Interface {
        model: Some("virtio-non-transitional".into()),
        alias: Some(Alias::user_defined(alias)),
        ..Default::default()
    });
    domain
}

async fn run_both_phases(t: &TestContext, vmi: VirtualMachineInstance) -> DomainSpec {
    let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);
    configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .expect("phase 1");

    let mut domain = domain_with("default");
    configurator
        .setup_pod_network_phase2(&mut domain, vmi.networks())
        .await
        .expect("phase 2");
    domain
}

#[tokio::test]
async fn test_bridge_end_to_end() {
    let t = NetContextBuilder::new()
        .link(pod_link())
        .resolv_conf(POD_RESOLV)
        .build();
    let domain = run_both_phases(&t, bridge_vmi()).await;

    let iface = domain
        .interface_by_alias("default")
        .expect("interface kept in domain");
    assert_eq!(iface.iface_type, "ethernet");
    assert_eq!(iface.mtu, Some(1410));
    assert_eq!(iface.target_device(), Some("tap0"));
    assert!(!iface.target.as_ref().unwrap().managed, "tap is precreated");
    assert_eq!(
        iface.mac,
        Some(POD_MAC.parse::<MacAddr>().unwrap()),
        "guest must keep the pod MAC"
    );

    let lease = t.dhcp.lease("k6t-eth0").expect("DHCP started on bridge");
    assert_eq!(lease.client_ip, Ipv4Addr::new(10, 35, 0, 6));
    assert_eq!(lease.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(lease.server_ip, Ipv4Addr::new(169, 254, 75, 0));
    assert_eq!(lease.mtu, 1410);
    assert_eq!(lease.dns_servers, vec![Ipv4Addr::new(10, 96, 0, 10)]);
    assert_eq!(lease.hostname.as_deref(), Some("web-0"));
    assert_eq!(
        lease.search_domains.first().map(String::as_str),
        Some("web.default.svc.cluster.local")
    );
    assert_eq!(
        lease.routes,
        vec![StaticRoute {
            dst: "10.40.0.0/16".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 35, 0, 254),
        }],
        "default and subnet routes are not handed out"
    );

    let cached: DhcpConfig = t
        .ctx
        .cache
        .read_required(&CacheKey::launcher(None, "default"))
        .unwrap();
    assert_eq!(cached.advertising_ip, Some(Ipv4Addr::new(169, 254, 75, 0)));
    assert!(!cached.ipam_disabled);
}

#[tokio::test]
async fn test_bridge_rewires_pod_namespace() {
    let t = NetContextBuilder::new().link(pod_link()).build();
    run_both_phases(&t, bridge_vmi()).await;

    assert!(t.handler.is_up("k6t-eth0"));
    assert!(t.handler.is_up("eth0-nic"));
    assert_eq!(t.handler.master_of("eth0-nic").as_deref(), Some("k6t-eth0"));
    assert_eq!(t.handler.master_of("tap0").as_deref(), Some("k6t-eth0"));
    assert_eq!(t.handler.learning("eth0-nic"), Some(false));
    assert_eq!(
        t.handler.link("eth0").and_then(|l| l.kind),
        Some("dummy".to_string()),
        "pod address is parked on a dummy"
    );
    assert!(
        t.handler
            .calls()
            .contains(&HandlerCall::DisableChecksum("k6t-eth0".into()))
    );
}

#[tokio::test]
async fn test_phase1_is_idempotent() {
    let t = NetContextBuilder::new().link(pod_link()).build();
    let vmi = bridge_vmi();
    let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);

    configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .unwrap();
    let after_first = t.handler.calls().len();

    configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .unwrap();
    assert_eq!(
        t.handler.calls().len(),
        after_first,
        "second phase 1 must not touch the namespace"
    );
}

#[tokio::test]
async fn test_bridge_without_ipam_serves_no_dhcp() {
    let t = NetContextBuilder::new()
        .link(FakeLink::new("eth0", POD_MAC).mtu(POD_MTU))
        .build();
    let domain = run_both_phases(&t, bridge_vmi()).await;

    assert!(domain.interface_by_alias("default").is_some());
    assert!(t.dhcp.started().is_empty());
    assert!(
        !t.handler.calls().contains(&HandlerCall::ArpIgnore),
        "arp_ignore is only needed with an address to hide"
    );
}

#[tokio::test]
async fn test_missing_pod_interface_is_critical() {
    let t = NetContextBuilder::new().build();
    let vmi = bridge_vmi();
    let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);

    let err = configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .unwrap_err();
    assert!(err.is_critical(), "got {err}");
    assert!(t.handler.calls().is_empty());
}

#[tokio::test]
async fn test_phase2_fails_when_domain_lacks_interface() {
    let t = NetContextBuilder::new().link(pod_link()).build();
    let vmi = bridge_vmi();
    let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);
    configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .unwrap();

    let mut domain = domain_with("other");
    let err = configurator
        .setup_pod_network_phase2(&mut domain, vmi.networks())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InterfaceNotFound(ref name) if name == "default"));
}

#[tokio::test]
async fn test_phase2_fails_without_resolver_configuration() {
    let t = NetContextBuilder::new()
        .link(pod_link())
        .without_resolv_conf()
        .build();
    let vmi = bridge_vmi();
    let configurator = VmNetworkConfigurator::new(vmi.clone(), t.ctx.clone(), None);
    configurator
        .setup_pod_network_phase1(vmi.networks())
        .await
        .unwrap();

    let mut domain = domain_with("default");
    let err = configurator
        .setup_pod_network_phase2(&mut domain, vmi.networks())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Dhcp(DhcpError::ResolvConf { .. })),
        "got {err}"
    );
    assert!(t.dhcp.started().is_empty(), "no lease without DNS settings");
}
