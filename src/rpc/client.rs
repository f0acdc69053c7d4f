use rustls::ServerName;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use super::credentials::{Credentials, ALPN_H2};
use crate::error::ProbeError;
use crate::interface::settings::Settings;
use crate::utils::{error_chain, fmt_duration};

/// Endpoint of the target address with the probe user agent.
pub fn endpoint(settings: &Settings) -> Result<Endpoint, tonic::transport::Error> {
    let uri = format!("http://{}", target_authority(&settings.addr));

    Endpoint::from_shared(uri)?.user_agent(settings.user_agent.as_str())
}

/// Open the probe connection, blocking until it is ready, `-connect-timeout` elapses or
/// the probe is cancelled.
pub async fn connect(
    settings: &Settings,
    credentials: &Credentials,
    token: &CancellationToken,
) -> Result<Channel, ProbeError> {
    let connect_failed = |cause: String| ProbeError::Connect {
        addr: settings.addr.clone(),
        cause,
    };

    let endpoint = endpoint(settings).map_err(|e| connect_failed(error_chain(&e)))?;
    let authority = target_authority(&settings.addr);

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(connect_failed("context canceled".into())),
        connected = tokio::time::timeout(
            settings.connect_timeout,
            establish(endpoint, credentials, authority),
        ) => {
            match connected {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(connect_failed(error_chain(&e))),
                Err(_) => Err(ProbeError::ConnectTimeout {
                    addr: settings.addr.clone(),
                    timeout: fmt_duration(settings.connect_timeout),
                }),
            }
        }
    }
}

async fn establish(
    endpoint: Endpoint,
    credentials: &Credentials,
    authority: String,
) -> Result<Channel, tonic::transport::Error> {
    match credentials {
        Credentials::Plaintext => {
            endpoint
                .connect_with_connector(service_fn(move |_: Uri| dial_plaintext(authority.clone())))
                .await
        }
        Credentials::Tls {
            config,
            server_name,
        } => {
            let name = server_name
                .clone()
                .unwrap_or_else(|| host_of(&authority).to_string());
            let tls = TlsConnector::from(Arc::new(config.clone()));

            endpoint
                .connect_with_connector(service_fn(move |_: Uri| {
                    dial_tls(authority.clone(), name.clone(), tls.clone())
                }))
                .await
        }
    }
}

async fn dial(authority: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(authority).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Cleartext connections are ready once the server preface arrives.
async fn dial_plaintext(authority: String) -> io::Result<TcpStream> {
    let stream = dial(&authority).await?;
    await_server_preface(&stream).await?;
    Ok(stream)
}

/// Wait for the first bytes of the server's HTTP/2 SETTINGS frame without consuming them.
async fn await_server_preface(stream: &TcpStream) -> io::Result<()> {
    let mut first = [0u8; 1];

    if stream.peek(&mut first).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the server preface",
        ));
    }

    Ok(())
}

async fn dial_tls(
    authority: String,
    name: String,
    connector: TlsConnector,
) -> io::Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(name.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let stream = dial(&authority).await?;
    let tls = connector.connect(server_name, stream).await?;

    if tls.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "HTTP/2 was not negotiated",
        ));
    }

    Ok(tls)
}

/// `:port` dials the local host like the Go dialer does.
fn target_authority(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("localhost{addr}")
    } else {
        addr.to_string()
    }
}

/// Host part of `host:port`, IPv6 brackets removed.
fn host_of(authority: &str) -> &str {
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => authority,
    };

    host.trim_start_matches('[').trim_end_matches(']')
}
