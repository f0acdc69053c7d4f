use rustls::{Certificate, PrivateKey};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tonic::metadata::AsciiMetadataValue;
use tonic::{Request, Status};
use x509_parser::parse_x509_certificate;

use crate::utils::{error_chain, fmt_duration};

/// Generated SPIFFE Workload API stubs (`proto/workload.proto`).
pub mod pb {
    tonic::include_proto!("_");
}

use pb::spiffe_workload_api_client::SpiffeWorkloadApiClient;
use pb::{X509svidRequest, X509svidResponse};

/// Header every Workload API call must carry.
const SECURITY_HEADER: &str = "workload.spiffe.io";

/// Failure to obtain an identity from the workload endpoint.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload endpoint socket address is not configured (SPIFFE_ENDPOINT_SOCKET is not set)")]
    MissingEndpoint,
    #[error("workload endpoint socket address is not a unix socket: {0:?}")]
    InvalidEndpoint(String),
    #[error("cannot connect to workload endpoint: {0}")]
    Connect(String),
    #[error("workload api call failed: {0}")]
    Rpc(String),
    #[error("timed out fetching x509 svid within {0}")]
    Timeout(String),
    #[error("fetching x509 svid was canceled")]
    Cancelled,
    #[error("workload api returned no x509 svid")]
    NoIdentity,
    #[error("malformed x509 svid: {0}")]
    Malformed(String),
}

/// X.509-SVID and trust bundle issued to this workload.
#[derive(Debug, Clone)]
pub struct X509Identity {
    pub spiffe_id: String,
    pub cert_chain: Vec<Certificate>,
    pub private_key: PrivateKey,
    pub bundle: Vec<Certificate>,
}

impl X509Identity {
    /// Default svid of a FetchX509SVID response, the first one listed.
    pub fn from_response(response: X509svidResponse) -> Result<X509Identity, WorkloadError> {
        let svid = response
            .svids
            .into_iter()
            .next()
            .ok_or(WorkloadError::NoIdentity)?;

        let cert_chain = split_der_certificates(&svid.x509_svid)?;
        if cert_chain.is_empty() {
            return Err(WorkloadError::Malformed("empty certificate chain".into()));
        }
        if svid.x509_svid_key.is_empty() {
            return Err(WorkloadError::Malformed("empty private key".into()));
        }
        let bundle = split_der_certificates(&svid.bundle)?;
        if bundle.is_empty() {
            return Err(WorkloadError::Malformed("empty trust bundle".into()));
        }

        Ok(X509Identity {
            spiffe_id: svid.spiffe_id,
            cert_chain,
            private_key: PrivateKey(svid.x509_svid_key),
            bundle,
        })
    }
}

/// Fetch the workload identity, bounded by `timeout` and the cancellation token.
pub async fn fetch_x509_identity(
    endpoint: Option<&str>,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<X509Identity, WorkloadError> {
    let socket = socket_path(endpoint.ok_or(WorkloadError::MissingEndpoint)?)?;

    debug!("fetching x509 svid from {}", socket.display());

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WorkloadError::Cancelled),
        fetched = tokio::time::timeout(timeout, fetch(socket)) => match fetched {
            Ok(identity) => identity,
            Err(_) => Err(WorkloadError::Timeout(fmt_duration(timeout))),
        },
    }
}

/// Resolve `unix:///path`, `unix:/path` or a bare absolute path to the socket file.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, WorkloadError> {
    let path = match endpoint.strip_prefix("unix://") {
        Some(rest) => rest,
        None => endpoint.strip_prefix("unix:").unwrap_or(endpoint),
    };

    if path.starts_with('/') {
        Ok(PathBuf::from(path))
    } else {
        Err(WorkloadError::InvalidEndpoint(endpoint.to_string()))
    }
}

#[cfg(unix)]
async fn fetch(socket: PathBuf) -> Result<X509Identity, WorkloadError> {
    use tokio::net::UnixStream;
    use tonic::transport::{Endpoint, Uri};
    use tower::service_fn;

    // the authority is ignored, every connection dials the socket
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket.clone())))
        .await
        .map_err(|e| WorkloadError::Connect(error_chain(&e)))?;

    let mut request = Request::new(X509svidRequest {});
    request
        .metadata_mut()
        .insert(SECURITY_HEADER, AsciiMetadataValue::from_static("true"));

    let mut stream = SpiffeWorkloadApiClient::new(channel)
        .fetch_x509svid(request)
        .await
        .map_err(|status| WorkloadError::Rpc(status_line(&status)))?
        .into_inner();

    let response = stream
        .message()
        .await
        .map_err(|status| WorkloadError::Rpc(status_line(&status)))?
        .ok_or(WorkloadError::NoIdentity)?;

    X509Identity::from_response(response)
}

#[cfg(not(unix))]
async fn fetch(socket: PathBuf) -> Result<X509Identity, WorkloadError> {
    Err(WorkloadError::Connect(format!(
        "unix sockets are not supported on this platform ({})",
        socket.display()
    )))
}

fn status_line(status: &Status) -> String {
    format!("code = {:?} desc = {}", status.code(), status.message())
}

/// Split concatenated ASN.1 DER certificates, validating each one.
fn split_der_certificates(der: &[u8]) -> Result<Vec<Certificate>, WorkloadError> {
    let mut certs = Vec::new();
    let mut rest = der;

    while !rest.is_empty() {
        let (remaining, _) = parse_x509_certificate(rest)
            .map_err(|e| WorkloadError::Malformed(format!("invalid certificate: {e}")))?;
        let len = rest.len() - remaining.len();
        certs.push(Certificate(rest[..len].to_vec()));
        rest = remaining;
    }

    Ok(certs)
}
