//! Crate-level error type.

use crate::cache::CacheError;
use crate::dhcp::DhcpError;
use crate::hypervisor::HypervisorError;
use crate::nat::NatError;
use crate::netdriver::NetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Nat(#[from] NatError),

    #[error(transparent)]
    Dhcp(#[from] DhcpError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("invalid network configuration: {0}")]
    Validation(String),

    #[error("interface '{0}' not found in domain")]
    InterfaceNotFound(String),

    /// Several independent interface operations failed in one pass.
    #[error("{} interface operations failed, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Reconcile(Vec<Error>),

    /// The pod has to be rescheduled; retrying in place cannot succeed.
    #[error("critical network error: {message}")]
    Critical {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn critical(message: impl Into<String>, source: impl Into<Error>) -> Self {
        Error::Critical {
            message: message.into(),
            source: Some(Box::new(source.into())),
        }
    }

    pub fn is_critical(&self) -> bool {
        match self {
            Error::Critical { .. } => true,
            Error::Reconcile(errors) => errors.iter().any(Error::is_critical),
            _ => false,
        }
    }

    /// `Ok` for no errors, the error itself for one, [`Error::Reconcile`] otherwise.
    pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Reconcile(errors)),
        }
    }

    /// Flatten into individual errors.
    pub fn into_many(self) -> Vec<Error> {
        match self {
            Error::Reconcile(errors) => errors,
            other => vec![other],
        }
    }
}
