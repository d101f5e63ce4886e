//! The slice of the hypervisor's domain-device API used for interface hotplug.

use async_trait::async_trait;
use std::io::{self, Write};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

const VIRSH_BIN: &str = "virsh";

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("Failed to execute virsh: {0}")]
    Command(#[source] io::Error),

    #[error("virsh {op} failed: {stderr}")]
    Failed { op: &'static str, stderr: String },

    #[error("Failed to write device XML: {0}")]
    TempFile(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Which definitions of the domain a device call affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffectFlags {
    /// The running domain.
    pub live: bool,
    /// The persistent definition used on next boot.
    pub config: bool,
}

impl AffectFlags {
    pub const LIVE_AND_CONFIG: AffectFlags = AffectFlags {
        live: true,
        config: true,
    };

    fn args(self) -> impl Iterator<Item = &'static str> {
        [(self.live, "--live"), (self.config, "--config")]
            .into_iter()
            .filter_map(|(set, flag)| set.then_some(flag))
    }
}

#[async_trait]
pub trait DomainDevices: Send + Sync {
    async fn attach_device(&self, xml: &str, flags: AffectFlags) -> Result<()>;
    async fn detach_device(&self, xml: &str, flags: AffectFlags) -> Result<()>;
    async fn update_device(&self, xml: &str, flags: AffectFlags) -> Result<()>;
}

/// A libvirt domain driven through the `virsh` CLI.
#[derive(Debug, Clone)]
pub struct VirshDomain {
    name: String,
    connect_uri: Option<String>,
}

impl VirshDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_uri: None,
        }
    }

    pub fn with_connect_uri(mut self, uri: impl Into<String>) -> Self {
        self.connect_uri = Some(uri.into());
        self
    }

    fn base_args(&self, op: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(uri) = &self.connect_uri {
            args.push("-c".to_string());
            args.push(uri.clone());
        }
        args.push(op.to_string());
        args.push(self.name.clone());
        args
    }

    async fn virsh(&self, op: &'static str, args: Vec<String>) -> Result<()> {
        let output = Command::new(VIRSH_BIN)
            .args(&args)
            .output()
            .await
            .map_err(HypervisorError::Command)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Failed {
                op,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Run a device operation with `xml` passed through a temporary file.
    async fn device_op(&self, op: &'static str, xml: &str, flags: AffectFlags) -> Result<()> {
        let mut file = NamedTempFile::new().map_err(HypervisorError::TempFile)?;
        file.write_all(xml.as_bytes())
            .map_err(HypervisorError::TempFile)?;

        let mut args = self.base_args(op);
        args.push(file.path().display().to_string());
        args.extend(flags.args().map(String::from));

        debug!(domain = %self.name, op, xml, "Domain device call");
        self.virsh(op, args).await?;
        info!(domain = %self.name, op, "Domain device updated");
        Ok(())
    }
}

#[async_trait]
impl DomainDevices for VirshDomain {
    async fn attach_device(&self, xml: &str, flags: AffectFlags) -> Result<()> {
        self.device_op("attach-device", xml, flags).await
    }

    async fn detach_device(&self, xml: &str, flags: AffectFlags) -> Result<()> {
        self.device_op("detach-device", xml, flags).await
    }

    async fn update_device(&self, xml: &str, flags: AffectFlags) -> Result<()> {
        self.device_op("update-device", xml, flags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_args() {
        let flags: Vec<&str> = AffectFlags::LIVE_AND_CONFIG.args().collect();
        assert_eq!(flags, vec!["--live", "--config"]);

        let config_only = AffectFlags {
            live: false,
            config: true,
        };
        assert_eq!(config_only.args().collect::<Vec<_>>(), vec!["--config"]);
    }

    #[test]
    fn test_base_args_with_uri() {
        let domain = VirshDomain::new("default_testvmi").with_connect_uri("qemu:///system");
        assert_eq!(
            domain.base_args("attach-device"),
            vec!["-c", "qemu:///system", "attach-device", "default_testvmi"]
        );
        assert_eq!(
            VirshDomain::new("vm").base_args("detach-device"),
            vec!["detach-device", "vm"]
        );
    }
}
