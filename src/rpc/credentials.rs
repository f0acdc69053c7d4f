use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{
    Certificate, CertificateError, ClientConfig, PrivateKey, RootCertStore, ServerName,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::workload::{self, WorkloadError, X509Identity};
use crate::error::ProbeError;
use crate::interface::settings::{ClientCertPaths, Settings, TlsOptions, Transport};

/// ALPN id gRPC negotiates over TLS.
pub(crate) const ALPN_H2: &[u8] = b"h2";

/// Failure loading the `-tls` certificate material.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to load tls client cert/key pair. error={0}")]
    KeyPair(String),
    #[error("failed to load root CA certificates from file ({}) error={source}", .path.display())]
    ReadCa { path: PathBuf, source: io::Error },
    #[error("no root CA certs parsed from file {}", .0.display())]
    NoCaCerts(PathBuf),
    #[error("failed to load system root certificates: {0}")]
    NativeRoots(io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// Transport credentials of the single probe connection.
/// Both dial `http://`, TLS is layered by the connector.
pub enum Credentials {
    /// explicit cleartext http/2, no encryption.
    Plaintext,
    Tls {
        config: ClientConfig,
        /// overrides the address host for verification and SNI.
        server_name: Option<String>,
    },
}

impl Credentials {
    /// Build the credentials of the selected transport.
    pub async fn build(
        settings: &Settings,
        token: &CancellationToken,
    ) -> Result<Credentials, ProbeError> {
        match &settings.transport {
            Transport::Plaintext => Ok(Credentials::Plaintext),
            Transport::Tls(options) => Ok(Credentials::Tls {
                config: tls_client_config(options)?,
                server_name: options.server_name.clone(),
            }),
            Transport::Spiffe { endpoint } => {
                let identity = workload::fetch_x509_identity(
                    endpoint.as_deref(),
                    settings.connect_timeout,
                    token,
                )
                .await?;

                debug!("fetched x509 svid {}", identity.spiffe_id);

                Ok(Credentials::Tls {
                    config: spiffe_client_config(&identity)?,
                    server_name: None,
                })
            }
        }
    }
}

/// rustls config for `-tls` and its sub options.
pub fn tls_client_config(options: &TlsOptions) -> Result<ClientConfig, CredentialsError> {
    let verifier: Arc<dyn ServerCertVerifier> = if options.no_verify {
        Arc::new(DisabledVerifier)
    } else {
        let roots = match &options.ca_cert {
            Some(path) => load_ca_bundle(path)?,
            None => native_roots()?,
        };
        Arc::new(WebPkiVerifier::new(roots, None))
    };

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(verifier);

    let mut config = match &options.client_cert {
        Some(paths) => {
            let (chain, key) = load_key_pair(paths)?;
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

/// mTLS config presenting the svid and trusting any peer chained to the svid bundle.
pub fn spiffe_client_config(identity: &X509Identity) -> Result<ClientConfig, WorkloadError> {
    let mut roots = RootCertStore::empty();

    for cert in &identity.bundle {
        roots
            .add(cert)
            .map_err(|e| WorkloadError::Malformed(format!("invalid bundle certificate: {e}")))?;
    }

    let verifier = BundleVerifier {
        inner: WebPkiVerifier::new(roots, None),
    };

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(identity.cert_chain.clone(), identity.private_key.clone())
        .map_err(|e| WorkloadError::Malformed(format!("invalid svid key pair: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

fn load_ca_bundle(path: &Path) -> Result<RootCertStore, CredentialsError> {
    let pem = fs::read(path).map_err(|source| CredentialsError::ReadCa {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|_| CredentialsError::NoCaCerts(path.to_path_buf()))?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(&certs[..]);

    if added == 0 {
        return Err(CredentialsError::NoCaCerts(path.to_path_buf()));
    }

    Ok(roots)
}

fn native_roots() -> Result<RootCertStore, CredentialsError> {
    let certs = rustls_native_certs::load_native_certs().map_err(CredentialsError::NativeRoots)?;
    let der: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();

    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(&der[..]);

    Ok(roots)
}

fn load_key_pair(
    paths: &ClientCertPaths,
) -> Result<(Vec<Certificate>, PrivateKey), CredentialsError> {
    let cert_pem = fs::read(&paths.cert).map_err(|e| {
        CredentialsError::KeyPair(format!("open {}: {e}", paths.cert.display()))
    })?;
    let key_pem = fs::read(&paths.key).map_err(|e| {
        CredentialsError::KeyPair(format!("open {}: {e}", paths.key.display()))
    })?;

    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .map_err(|e| CredentialsError::KeyPair(e.to_string()))?
        .into_iter()
        .map(Certificate)
        .collect();

    if chain.is_empty() {
        return Err(CredentialsError::KeyPair(format!(
            "no certificates found in {}",
            paths.cert.display()
        )));
    }

    let key = read_private_key(&key_pem)?.ok_or_else(|| {
        CredentialsError::KeyPair(format!(
            "no private key found in {}",
            paths.key.display()
        ))
    })?;

    Ok((chain, key))
}

fn read_private_key(pem: &[u8]) -> Result<Option<PrivateKey>, CredentialsError> {
    let items = rustls_pemfile::read_all(&mut &pem[..])
        .map_err(|e| CredentialsError::KeyPair(e.to_string()))?;

    Ok(items.into_iter().find_map(|item| match item {
        rustls_pemfile::Item::PKCS8Key(key)
        | rustls_pemfile::Item::RSAKey(key)
        | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
        _ => None,
    }))
}

/// Accepts any server certificate, `-tls-no-verify`.
struct DisabledVerifier;

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Chain validation against the trust bundle only. SPIFFE peers are authorized by
/// presence, the svid carries a URI SAN so the dialed host name never matches.
struct BundleVerifier {
    inner: WebPkiVerifier,
}

impl ServerCertVerifier for BundleVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // the name check runs after the chain has been verified
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            verified => verified,
        }
    }
}
