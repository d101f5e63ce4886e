//! procfs/sysfs toggles.

use super::{IpFamily, NetError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

const PROC_SYS_NET: &str = "/proc/sys/net";
const SYS_CLASS_NET: &str = "/sys/class/net";

fn write_value(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|source| NetError::Sysctl {
        path: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), value, "kernel setting written");
    Ok(())
}

pub(super) fn ip_forwarding_path(family: IpFamily) -> PathBuf {
    match family {
        IpFamily::V4 => Path::new(PROC_SYS_NET).join("ipv4/ip_forward"),
        IpFamily::V6 => Path::new(PROC_SYS_NET).join("ipv6/conf/all/forwarding"),
    }
}

pub(super) fn enable_ip_forwarding(family: IpFamily) -> Result<()> {
    write_value(&ip_forwarding_path(family), "1")
}

/// Reply to ARP only for addresses configured on the receiving interface.
pub(super) fn enable_arp_ignore() -> Result<()> {
    write_value(
        &Path::new(PROC_SYS_NET).join("ipv4/conf/all/arp_ignore"),
        "1",
    )
}

pub(super) fn disable_bridge_port_learning(port: &str) -> Result<()> {
    write_value(
        &Path::new(SYS_CLASS_NET).join(port).join("brport/learning"),
        "0",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_paths() {
        assert_eq!(
            ip_forwarding_path(IpFamily::V4),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
        assert_eq!(
            ip_forwarding_path(IpFamily::V6),
            PathBuf::from("/proc/sys/net/ipv6/conf/all/forwarding")
        );
    }

    #[test]
    fn test_write_value_reports_path() {
        let err = write_value(Path::new("/nonexistent/podnet/setting"), "1").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/podnet/setting"));
    }
}
