//! DHCP reply construction.

use super::Lease;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::debug;

/// RFC 2131 "infinity".
pub const INFINITE_LEASE: u32 = u32::MAX;

const OPT_DOMAIN_SEARCH: u8 = 119;

/// Answer one client message, or `None` when it is not ours to answer.
pub fn build_reply(lease: &Lease, request: &Message) -> Option<Message> {
    // Only handle requests from client
    if request.opcode() != Opcode::BootRequest {
        debug!("Not a BootRequest, ignoring");
        return None;
    }

    let msg_type = match request.opts().get(OptionCode::MessageType)? {
        DhcpOption::MessageType(t) => *t,
        _ => return None,
    };

    let client_mac = request.chaddr();
    if client_mac.get(..6) != Some(&lease.client_mac.octets()[..]) {
        debug!(expected = %lease.client_mac, "DHCP from foreign MAC, ignoring");
        return None;
    }

    let response_type = match msg_type {
        MessageType::Discover => MessageType::Offer,
        MessageType::Request if requested_address_matches(lease, request) => MessageType::Ack,
        MessageType::Request => MessageType::Nak,
        MessageType::Inform => MessageType::Ack,
        _ => return None,
    };

    debug!(
        xid = request.xid(),
        request = ?msg_type,
        reply = ?response_type,
        "DHCP message answered"
    );

    let mut reply = Message::default();
    reply.set_opcode(Opcode::BootReply);
    reply.set_xid(request.xid());
    reply.set_flags(request.flags());
    reply.set_giaddr(request.giaddr());
    reply.set_chaddr(client_mac);

    reply
        .opts_mut()
        .insert(DhcpOption::MessageType(response_type));
    reply
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(lease.server_ip));

    if response_type == MessageType::Nak {
        return Some(reply);
    }

    if msg_type == MessageType::Inform {
        reply.set_ciaddr(request.ciaddr());
    } else {
        reply.set_yiaddr(lease.client_ip);
        reply
            .opts_mut()
            .insert(DhcpOption::AddressLeaseTime(INFINITE_LEASE));
    }
    reply.set_siaddr(lease.server_ip);

    insert_network_options(lease, &mut reply);
    Some(reply)
}

fn requested_address_matches(lease: &Lease, request: &Message) -> bool {
    let requested = match request.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
        _ => request.ciaddr(),
    };
    requested.is_unspecified() || requested == lease.client_ip
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    u32::from(a) & mask == u32::from(b) & mask
}

fn insert_network_options(lease: &Lease, reply: &mut Message) {
    let opts = reply.opts_mut();

    opts.insert(DhcpOption::SubnetMask(lease.subnet_mask));
    opts.insert(DhcpOption::Router(vec![lease.server_ip]));

    // Classless static routes (RFC 3442) replace option 3 on clients that
    // understand them, so the default route has to be repeated here. A gateway
    // outside the client subnet needs an on-link host route first.
    let mut routes = Vec::new();
    if !same_subnet(lease.client_ip, lease.server_ip, lease.subnet_mask) {
        routes.push((Ipv4Net::from(lease.server_ip), Ipv4Addr::UNSPECIFIED));
    }
    if let Ok(default_net) = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0) {
        routes.push((default_net, lease.server_ip));
    }
    routes.extend(lease.routes.iter().map(|r| (r.dst, r.gateway)));
    opts.insert(DhcpOption::ClasslessStaticRoute(routes));

    if !lease.dns_servers.is_empty() {
        opts.insert(DhcpOption::DomainNameServer(lease.dns_servers.clone()));
    }

    if let Some(first) = lease.search_domains.first() {
        opts.insert(DhcpOption::DomainName(first.clone()));
        let encoded = encode_search_domains(&lease.search_domains);
        if !encoded.is_empty() {
            opts.insert(raw_option(OPT_DOMAIN_SEARCH, encoded));
        }
    }

    if let Some(hostname) = lease.hostname.as_ref().filter(|h| !h.is_empty()) {
        opts.insert(DhcpOption::Hostname(hostname.clone()));
    }

    if lease.mtu > 0 {
        opts.insert(DhcpOption::InterfaceMtu(lease.mtu));
    }

    for (code, data) in &lease.raw_options {
        opts.insert(raw_option(*code, data.clone()));
    }
}

fn raw_option(code: u8, data: Vec<u8>) -> DhcpOption {
    DhcpOption::Unknown(UnknownOption::new(OptionCode::from(code), data))
}

/// RFC 1035 wire names, uncompressed, as used by option 119.
fn encode_search_domains(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
        if labels.iter().any(|l| l.is_empty() || l.len() > 63) {
            debug!(domain = %domain, "Skipping unencodable search domain");
            continue;
        }
        for label in labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }
    out
}
