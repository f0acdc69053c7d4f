use grpc_health_probe::hooks::interrupt;
use grpc_health_probe::run;
use tokio_util::sync::CancellationToken;

/// gRPC health probe start.
#[tokio::main]
async fn main() {
    let token = CancellationToken::new();

    interrupt::listen(token.clone());

    let code = run(std::env::args_os(), token).await;

    std::process::exit(code);
}
