use log::LevelFilter;
use std::env::var;
use std::error::Error;
use std::io::Write;
use std::time::Duration;

/// Stderr logger printing records bare. `-v` lowers the crate filter to debug.
pub fn logger(verbose: bool) -> env_logger::Builder {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();

    builder
        .target(env_logger::Target::Stderr)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter_level(LevelFilter::Warn)
        .filter_module("grpc_health_probe", level);

    if let Ok(filters) = var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder
}

/// Install the stderr logger.
pub fn init_logger(verbose: bool) {
    // tests may install the logger more than once
    let _ = logger(verbose).try_init();
}

/// Go style duration text, `100ms`, `1s`, `1m 30s`.
pub fn fmt_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

/// Flatten an error and its sources into one line.
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }

    message
}
