use thiserror::Error;

use crate::interface::settings::ArgsError;
use crate::rpc::credentials::CredentialsError;
use crate::rpc::workload::WorkloadError;

/// Process exit status reported by the probe.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// remote reports SERVING.
    Serving = 0,
    /// invalid flags or tls material.
    InvalidArguments = 1,
    /// connection failed or timed out.
    ConnectionFailure = 2,
    /// rpc failed, timed out or the health protocol is not implemented.
    RpcFailure = 3,
    /// rpc succeeded but the service is not SERVING.
    Unhealthy = 4,
    /// x509 identity could not be fetched from the spiffe workload api.
    IdentityFailure = 20,
}

impl ProbeStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Classified failure of a single probe invocation.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("error: {0}")]
    InvalidArguments(#[from] ArgsError),
    #[error("failed to initialize tls credentials. error={0}")]
    Credentials(#[from] CredentialsError),
    #[error("timeout: failed to connect service {addr:?} within {timeout}")]
    ConnectTimeout { addr: String, timeout: String },
    #[error("error: failed to connect service at {addr:?}: {cause}")]
    Connect { addr: String, cause: String },
    #[error("error: this server does not implement the grpc health protocol (grpc.health.v1.Health)")]
    Unimplemented,
    #[error("timeout: health rpc did not complete within {0}")]
    RpcTimeout(String),
    #[error("error: health rpc failed: {0}")]
    Rpc(String),
    #[error("service unhealthy (responded with {0:?})")]
    Unhealthy(String),
    #[error("failed to retrieve x509 identity from the spiffe workload api: {0}")]
    Identity(#[from] WorkloadError),
}

impl ProbeError {
    /// Exit category of the failure.
    pub fn status(&self) -> ProbeStatus {
        match self {
            ProbeError::InvalidArguments(_) | ProbeError::Credentials(_) => {
                ProbeStatus::InvalidArguments
            }
            ProbeError::ConnectTimeout { .. } | ProbeError::Connect { .. } => {
                ProbeStatus::ConnectionFailure
            }
            ProbeError::Unimplemented | ProbeError::RpcTimeout(_) | ProbeError::Rpc(_) => {
                ProbeStatus::RpcFailure
            }
            ProbeError::Unhealthy(_) => ProbeStatus::Unhealthy,
            ProbeError::Identity(_) => ProbeStatus::IdentityFailure,
        }
    }
}
