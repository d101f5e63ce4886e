//! TAP device and ethtool ioctls.

use super::{MAX_IFNAME_LEN, NetError, Result, TapSpec};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

// ioctl constants for TUN/TAP
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const TUNSETOWNER: libc::c_ulong = 0x400454cc;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const IFF_MULTI_QUEUE: i16 = 0x0100;
const IFF_VNET_HDR: i16 = 0x4000;

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_STXCSUM: u32 = 0x0000_0017;

#[repr(C)]
#[derive(Default)]
struct IfReq {
    ifr_name: [u8; 16],
    ifr_flags: i16,
    _padding: [u8; 22],
}

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(NetError::NameTooLong(name.to_string()));
    }
    Ok(())
}

fn open_tun() -> Result<OwnedFd> {
    let fd = open(c"/dev/net/tun", OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| NetError::OpenTun(io::Error::from_raw_os_error(e as i32)))?;
    // SAFETY: `open` returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a persistent, optionally multi-queue TAP device owned by `spec.owner_uid`.
///
/// Every queue needs its own TUNSETIFF; the queue descriptors are closed again
/// once the device is persistent so the hypervisor can open it later.
pub(super) fn create_persistent_tap(spec: &TapSpec) -> Result<()> {
    check_name(&spec.name)?;

    let mut flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;
    if spec.queues > 1 {
        flags |= IFF_MULTI_QUEUE;
    }

    let mut queues = Vec::with_capacity(spec.queues.max(1) as usize);
    for _ in 0..spec.queues.max(1) {
        let fd = open_tun()?;

        let mut ifreq = IfReq::default();
        ifreq.ifr_name[..spec.name.len()].copy_from_slice(spec.name.as_bytes());
        ifreq.ifr_flags = flags;

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as libc::Ioctl, &mut ifreq) };
        if ret < 0 {
            return Err(NetError::CreateTap(
                spec.name.clone(),
                io::Error::last_os_error(),
            ));
        }
        queues.push(fd);
    }

    let first = queues[0].as_raw_fd();

    let ret = unsafe {
        libc::ioctl(
            first,
            TUNSETOWNER as libc::Ioctl,
            spec.owner_uid as libc::c_ulong,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(NetError::CreateTap(
            spec.name.clone(),
            io::Error::new(err.kind(), format!("TUNSETOWNER failed: {}", err)),
        ));
    }

    // TUNSETPERSIST - make it persistent (survives fd close)
    let ret = unsafe { libc::ioctl(first, TUNSETPERSIST as libc::Ioctl, 1 as libc::c_ulong) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(NetError::CreateTap(
            spec.name.clone(),
            io::Error::new(err.kind(), format!("TUNSETPERSIST failed: {}", err)),
        ));
    }

    Ok(())
}

/// Turn off transmit checksum offloading on an interface.
///
/// Packets leaving a bridge towards a tap otherwise carry partial checksums
/// that some guests drop.
pub(super) fn disable_tx_checksum(name: &str) -> Result<()> {
    check_name(name)?;

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(NetError::Ioctl(name.to_string(), io::Error::last_os_error()));
    }
    // SAFETY: the socket was just created and is exclusively owned here.
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let mut value = EthtoolValue {
        cmd: ETHTOOL_STXCSUM,
        data: 0,
    };

    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifreq.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifreq.ifr_ifru.ifru_data = (&mut value as *mut EthtoolValue).cast();

    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCETHTOOL as libc::Ioctl, &mut ifreq) };
    if ret < 0 {
        return Err(NetError::Ioctl(name.to_string(), io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_too_long() {
        let spec = TapSpec {
            name: "this_name_is_way_too_long".into(),
            queues: 1,
            owner_uid: 107,
            mtu: 1500,
        };
        let result = create_persistent_tap(&spec);
        assert!(matches!(result, Err(NetError::NameTooLong(_))));

        let result = disable_tx_checksum("");
        assert!(matches!(result, Err(NetError::NameTooLong(_))));
    }
}
