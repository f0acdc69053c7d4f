use std::env::var;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};

use super::cli::Cli;
use crate::utils::fmt_duration;

/// Environment variable naming the SPIFFE Workload API socket.
pub const SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Flag combinations rejected before any network I/O.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("-addr not specified")]
    MissingAddr,
    #[error("-connect-timeout must be greater than zero (specified: {0})")]
    ConnectTimeout(String),
    #[error("-rpc-timeout must be greater than zero (specified: {0})")]
    RpcTimeout(String),
    #[error("specified {0} without specifying -tls")]
    RequiresTls(&'static str),
    #[error("specified -tls-client-cert without specifying -tls-client-key")]
    MissingClientKey,
    #[error("specified -tls-client-key without specifying -tls-client-cert")]
    MissingClientCert,
    #[error("cannot specify -tls-ca-cert with -tls-no-verify (CA cert would not be used)")]
    CaCertWithNoVerify,
    #[error("cannot specify -tls-server-name with -tls-no-verify (server name would not be used)")]
    ServerNameWithNoVerify,
    #[error("-tls and -spiffe are mutually exclusive")]
    TlsWithSpiffe,
    #[error("-rpc-header: invalid RPC header, expected 'key: value', got {0:?}")]
    RpcHeaderFormat(String),
    #[error("-rpc-header: invalid metadata key in {0:?}")]
    RpcHeaderKey(String),
    #[error("-rpc-header: invalid metadata value in {0:?}")]
    RpcHeaderValue(String),
}

/// Client certificate and private key, both PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Options of the `-tls` transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// skip server certificate verification (INSECURE).
    pub no_verify: bool,
    /// PEM bundle replacing the system trust roots.
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<ClientCertPaths>,
    /// name used in place of the address host when verifying the server.
    pub server_name: Option<String>,
}

/// Transport security of the connection, exactly one is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Plaintext,
    Tls(TlsOptions),
    /// mTLS with an identity issued by the SPIFFE Workload API at `endpoint`.
    Spiffe { endpoint: Option<String> },
}

/// Validated probe configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// target host:port.
    pub addr: String,
    /// sub-service passed to Check, empty for the whole server.
    pub service: String,
    pub user_agent: String,
    /// request metadata in flag order, repeated keys accumulate.
    pub rpc_headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub transport: Transport,
    pub gzip: bool,
    pub verbose: bool,
}

impl Settings {
    /// Validate the parsed flags, reading the workload socket from the environment.
    pub fn from_cli(cli: Cli) -> Result<Settings, ArgsError> {
        Self::from_cli_with_endpoint(cli, var(SPIFFE_ENDPOINT_SOCKET).ok())
    }

    pub fn from_cli_with_endpoint(
        cli: Cli,
        spiffe_endpoint: Option<String>,
    ) -> Result<Settings, ArgsError> {
        let ca_cert = non_empty_path(cli.tls_ca_cert);
        let client_cert = non_empty_path(cli.tls_client_cert);
        let client_key = non_empty_path(cli.tls_client_key);
        let server_name = cli.tls_server_name.filter(|name| !name.is_empty());

        if cli.addr.is_empty() {
            return Err(ArgsError::MissingAddr);
        }
        if cli.connect_timeout.is_zero() {
            return Err(ArgsError::ConnectTimeout(fmt_duration(cli.connect_timeout)));
        }
        if cli.rpc_timeout.is_zero() {
            return Err(ArgsError::RpcTimeout(fmt_duration(cli.rpc_timeout)));
        }
        if !cli.tls {
            if cli.tls_no_verify {
                return Err(ArgsError::RequiresTls("-tls-no-verify"));
            }
            if ca_cert.is_some() {
                return Err(ArgsError::RequiresTls("-tls-ca-cert"));
            }
            if client_cert.is_some() {
                return Err(ArgsError::RequiresTls("-tls-client-cert"));
            }
            if server_name.is_some() {
                return Err(ArgsError::RequiresTls("-tls-server-name"));
            }
        }

        let client_cert = match (client_cert, client_key) {
            (Some(cert), Some(key)) => Some(ClientCertPaths { cert, key }),
            (Some(_), None) => return Err(ArgsError::MissingClientKey),
            (None, Some(_)) => return Err(ArgsError::MissingClientCert),
            (None, None) => None,
        };

        if cli.tls_no_verify && ca_cert.is_some() {
            return Err(ArgsError::CaCertWithNoVerify);
        }
        if cli.tls_no_verify && server_name.is_some() {
            return Err(ArgsError::ServerNameWithNoVerify);
        }

        let transport = match (cli.tls, cli.spiffe) {
            (true, true) => return Err(ArgsError::TlsWithSpiffe),
            (true, false) => Transport::Tls(TlsOptions {
                no_verify: cli.tls_no_verify,
                ca_cert,
                client_cert,
                server_name,
            }),
            (false, true) => Transport::Spiffe {
                endpoint: spiffe_endpoint.filter(|endpoint| !endpoint.is_empty()),
            },
            (false, false) => Transport::Plaintext,
        };

        let rpc_headers = cli
            .rpc_header
            .iter()
            .map(|raw| parse_rpc_header(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Settings {
            addr: cli.addr,
            service: cli.service,
            user_agent: cli.user_agent,
            rpc_headers,
            connect_timeout: cli.connect_timeout,
            rpc_timeout: cli.rpc_timeout,
            transport,
            gzip: cli.gzip,
            verbose: cli.verbose,
        })
    }

    /// Dump the parsed options at debug level.
    pub fn log_options(&self) {
        for line in self.option_lines() {
            debug!("{line}");
        }
    }

    /// Lines of the verbose option dump.
    pub fn option_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "parsed options:".to_string(),
            format!(
                "> addr={} conn_timeout={} rpc_timeout={}",
                self.addr,
                fmt_duration(self.connect_timeout),
                fmt_duration(self.rpc_timeout)
            ),
        ];

        if !self.rpc_headers.is_empty() {
            lines.push(format!("> headers: {:?}", self.rpc_headers));
        }

        match &self.transport {
            Transport::Plaintext => lines.push("> tls=false".to_string()),
            Transport::Tls(tls) => {
                lines.push("> tls=true".to_string());
                lines.push(format!("  > no-verify={}", tls.no_verify));
                lines.push(format!("  > ca-cert={}", display_path(tls.ca_cert.as_ref())));
                lines.push(format!(
                    "  > client-cert={}",
                    display_path(tls.client_cert.as_ref().map(|pair| &pair.cert))
                ));
                lines.push(format!(
                    "  > client-key={}",
                    display_path(tls.client_cert.as_ref().map(|pair| &pair.key))
                ));
                lines.push(format!(
                    "  > server-name={}",
                    tls.server_name.as_deref().unwrap_or_default()
                ));
            }
            Transport::Spiffe { endpoint } => {
                lines.push("> spiffe=true".to_string());
                lines.push(format!(
                    "  > endpoint={}",
                    endpoint.as_deref().unwrap_or_default()
                ));
            }
        }

        lines
    }
}

/// Split a `key: value` header flag, trimming leading whitespace off the value.
pub fn parse_rpc_header(raw: &str) -> Result<(AsciiMetadataKey, AsciiMetadataValue), ArgsError> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| ArgsError::RpcHeaderFormat(raw.to_string()))?;

    let key = AsciiMetadataKey::from_bytes(key.as_bytes())
        .map_err(|_| ArgsError::RpcHeaderKey(raw.to_string()))?;
    let value = value
        .trim_start()
        .parse::<AsciiMetadataValue>()
        .map_err(|_| ArgsError::RpcHeaderValue(raw.to_string()))?;

    Ok((key, value))
}

fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn display_path(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}
