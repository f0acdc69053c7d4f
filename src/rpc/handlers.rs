use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::client::connect;
use super::credentials::Credentials;
use super::health_client::{check, ServingStatus};
use crate::error::{ProbeError, ProbeStatus};
use crate::interface::cli::{normalize_args, Cli};
use crate::interface::settings::Settings;
use crate::utils::{fmt_duration, init_logger};

/// Probe the target once: credentials, connect, Check, classify.
pub async fn probe(
    settings: &Settings,
    token: &CancellationToken,
) -> Result<ServingStatus, ProbeError> {
    let credentials = Credentials::build(settings, token).await?;

    debug!("establishing connection");

    let connect_start = Instant::now();
    let channel = connect(settings, &credentials, token).await?;
    let connect_duration = connect_start.elapsed();

    debug!(
        "connection established (took {})",
        fmt_duration(connect_duration)
    );

    let rpc_start = Instant::now();
    let status = check(channel, settings, token).await?;
    let rpc_duration = rpc_start.elapsed();

    debug!("{}", elapsed_line(connect_duration, rpc_duration));

    Ok(status)
}

/// Parse `args`, run the probe and report the outcome. Returns the process exit code.
pub async fn run<I, T>(args: I, token: CancellationToken) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let cli = match Cli::try_parse_from(normalize_args(args)) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ProbeStatus::Serving.code(),
                _ => ProbeStatus::InvalidArguments.code(),
            };
        }
    };

    init_logger(cli.verbose);

    let settings = match Settings::from_cli(cli) {
        Ok(settings) => settings,
        Err(e) => return report(Err(e.into())),
    };

    settings.log_options();

    report(probe(&settings, &token).await)
}

fn report(outcome: Result<ServingStatus, ProbeError>) -> i32 {
    match outcome {
        Ok(status) => {
            info!("status: {}", status.as_str_name());
            ProbeStatus::Serving.code()
        }
        Err(e) => {
            error!("{e}");
            e.status().code()
        }
    }
}

/// Verbose timing summary of a successful Check.
pub fn elapsed_line(connect: Duration, rpc: Duration) -> String {
    format!(
        "time elapsed: connect={} rpc={}",
        fmt_duration(connect),
        fmt_duration(rpc)
    )
}
