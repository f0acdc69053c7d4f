use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Default `-user-agent` header value.
pub const DEFAULT_USER_AGENT: &str = "grpc_health_probe";

/// Command line flags, before validation.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "grpc_health_probe",
    version,
    about = "Check the health of a gRPC service implementing grpc.health.v1.Health"
)]
pub struct Cli {
    /// (required) tcp host:port to connect
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub addr: String,
    /// service name to check (default: "")
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub service: String,
    /// user-agent header value of health check requests
    #[arg(long, default_value = DEFAULT_USER_AGENT, allow_hyphen_values = true)]
    pub user_agent: String,
    /// additional RPC headers in 'name: value' format. May specify more than one.
    #[arg(long, value_name = "NAME: VALUE", allow_hyphen_values = true)]
    pub rpc_header: Vec<String>,
    /// timeout for establishing connection
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, allow_hyphen_values = true)]
    pub connect_timeout: Duration,
    /// timeout for health check rpc
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, allow_hyphen_values = true)]
    pub rpc_timeout: Duration,
    /// use TLS (default: false, INSECURE plaintext transport)
    #[arg(long)]
    pub tls: bool,
    /// (with -tls) don't verify the certificate (INSECURE) presented by the server
    #[arg(long)]
    pub tls_no_verify: bool,
    /// (with -tls, optional) file containing trusted certificates for verifying server
    #[arg(long, allow_hyphen_values = true)]
    pub tls_ca_cert: Option<PathBuf>,
    /// (with -tls, optional) client certificate for authenticating to the server (requires -tls-client-key)
    #[arg(long, allow_hyphen_values = true)]
    pub tls_client_cert: Option<PathBuf>,
    /// (with -tls) client private key for authenticating to the server (requires -tls-client-cert)
    #[arg(long, allow_hyphen_values = true)]
    pub tls_client_key: Option<PathBuf>,
    /// (with -tls) override the hostname used to verify the server certificate
    #[arg(long, allow_hyphen_values = true)]
    pub tls_server_name: Option<String>,
    /// use SPIFFE Workload API to retrieve TLS credentials (socket from SPIFFE_ENDPOINT_SOCKET)
    #[arg(long)]
    pub spiffe: bool,
    /// use GZIPCompressor for requests and GZIPDecompressor for response
    #[arg(long)]
    pub gzip: bool,
    /// verbose logs
    #[arg(short = 'v')]
    pub verbose: bool,
}

/// Long flags consuming the following argument when given without `=`.
const VALUE_FLAGS: &[&str] = &[
    "addr",
    "service",
    "user-agent",
    "rpc-header",
    "connect-timeout",
    "rpc-timeout",
    "tls-ca-cert",
    "tls-client-cert",
    "tls-client-key",
    "tls-server-name",
];

/// Rewrite Go style single dash long flags (`-addr=:5000`) to the `--addr=:5000` form.
/// Only arguments in flag position are rewritten, a flag value such as `-service -canary`
/// is passed on untouched.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut passthrough = false;
    let mut expects_value = false;

    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let arg: OsString = arg.into();

            if i == 0 || passthrough {
                return arg;
            }
            if expects_value {
                expects_value = false;
                return arg;
            }

            match arg.to_str() {
                Some("--") => {
                    passthrough = true;
                    arg
                }
                Some(flag) if is_single_dash_long(flag) => {
                    expects_value = takes_separate_value(&flag[1..]);
                    format!("-{flag}").into()
                }
                Some(flag) if flag.starts_with("--") => {
                    expects_value = takes_separate_value(&flag[2..]);
                    arg
                }
                _ => arg,
            }
        })
        .collect()
}

fn takes_separate_value(flag: &str) -> bool {
    !flag.contains('=') && VALUE_FLAGS.contains(&flag)
}

fn is_single_dash_long(arg: &str) -> bool {
    match arg.strip_prefix('-') {
        Some(rest) if !rest.starts_with('-') => {
            let name = rest.split('=').next().unwrap_or_default();
            name.len() > 1 && name.starts_with(|c: char| c.is_ascii_alphabetic())
        }
        _ => false,
    }
}
