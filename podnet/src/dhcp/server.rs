//! DHCP server socket loop and per-bridge registry.

use super::{DhcpError, DhcpLauncher, Lease, Result, build_reply};
use dhcproto::v4::Message;
use dhcproto::{Decodable, Decoder, Encodable};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Bind UDP/67 on exactly one interface.
fn bind_socket(iface: &str) -> Result<UdpSocket> {
    let socket_err = |source| DhcpError::Socket {
        iface: iface.to_string(),
        source,
    };

    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(socket_err)?;
    socket.set_reuse_address(true).map_err(socket_err)?;
    socket.set_broadcast(true).map_err(socket_err)?;
    // SO_BINDTODEVICE keeps the server off every other interface in the pod
    socket
        .bind_device(Some(iface.as_bytes()))
        .map_err(socket_err)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
    socket.bind(&addr.into()).map_err(socket_err)?;
    socket.set_nonblocking(true).map_err(socket_err)?;

    UdpSocket::from_std(socket.into()).map_err(socket_err)
}

/// Where a reply to `request` has to go.
fn reply_destination(request: &Message) -> SocketAddr {
    if !request.giaddr().is_unspecified() {
        return SocketAddrV4::new(request.giaddr(), DHCP_SERVER_PORT).into();
    }
    if !request.ciaddr().is_unspecified() {
        return SocketAddrV4::new(request.ciaddr(), DHCP_CLIENT_PORT).into();
    }
    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT).into()
}

/// Answer requests on `socket` until an I/O error occurs.
async fn serve(iface: &str, socket: UdpSocket, lease: Lease) -> Result<()> {
    let socket_err = |source| DhcpError::Socket {
        iface: iface.to_string(),
        source,
    };
    let mut buf = vec![0u8; 1500];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await.map_err(socket_err)?;

        let request = match Message::decode(&mut Decoder::new(&buf[..len])) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(iface, peer = %peer, error = %e, "Failed to decode DHCP message");
                continue;
            }
        };

        let Some(reply) = build_reply(&lease, &request) else {
            continue;
        };

        let bytes = reply
            .to_vec()
            .map_err(|e| DhcpError::Encode(e.to_string()))?;
        socket
            .send_to(&bytes, reply_destination(&request))
            .await
            .map_err(socket_err)?;
    }
}

/// Running DHCP servers of this process, one per bridge.
///
/// A server that stops serving takes the whole process down: without it the
/// guest never gets an address.
#[derive(Default)]
pub struct DhcpServers {
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DhcpServers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, iface: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.get(iface).is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl DhcpLauncher for DhcpServers {
    fn start(&self, iface: &str, lease: Lease) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.get(iface).is_some_and(|h| !h.is_finished()) {
            debug!(iface, "DHCP server already running");
            return Ok(());
        }

        let socket = bind_socket(iface)?;
        info!(
            iface,
            client_mac = %lease.client_mac,
            client_ip = %lease.client_ip,
            "Starting DHCP server"
        );

        let name = iface.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(&name, socket, lease).await {
                error!(iface = %name, error = %e, "DHCP server failed");
                std::process::exit(1);
            }
        });
        running.insert(iface.to_string(), handle);
        Ok(())
    }

    fn stop(&self, iface: &str) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = running.remove(iface) {
            handle.abort();
            info!(iface, "DHCP server stopped");
        } else {
            warn!(iface, "No DHCP server to stop");
        }
    }

    fn has_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.values().any(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_destination() {
        let mac = [0x02, 0, 0, 0, 0, 1];
        let unspecified = Ipv4Addr::UNSPECIFIED;

        let msg = Message::new(unspecified, unspecified, unspecified, unspecified, &mac);
        assert_eq!(
            reply_destination(&msg),
            "255.255.255.255:68".parse::<SocketAddr>().unwrap()
        );

        let renewing = Message::new(
            Ipv4Addr::new(10, 35, 0, 6),
            unspecified,
            unspecified,
            unspecified,
            &mac,
        );
        assert_eq!(
            reply_destination(&renewing),
            "10.35.0.6:68".parse::<SocketAddr>().unwrap()
        );

        let relayed = Message::new(
            unspecified,
            unspecified,
            unspecified,
            Ipv4Addr::new(10, 0, 0, 1),
            &mac,
        );
        assert_eq!(
            reply_destination(&relayed),
            "10.0.0.1:67".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_stop_unknown_is_noop() {
        let servers = DhcpServers::new();
        servers.stop("k6t-eth0");
        assert!(!servers.is_running("k6t-eth0"));
        assert!(!servers.has_running());
    }

    #[tokio::test]
    async fn test_has_running_follows_server_tasks() {
        let servers = DhcpServers::new();
        servers.running.lock().unwrap().insert(
            "k6t-eth0".to_string(),
            tokio::spawn(std::future::pending::<()>()),
        );
        assert!(servers.has_running());
        assert!(servers.is_running("k6t-eth0"));

        servers.stop("k6t-eth0");
        assert!(!servers.has_running());
    }
}
