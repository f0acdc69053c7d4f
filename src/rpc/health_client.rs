pub use tonic_health::pb::health_check_response::ServingStatus;
pub use tonic_health::pb::health_client::HealthClient;
pub use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use crate::error::ProbeError;
use crate::interface::settings::Settings;
use crate::utils::fmt_duration;

/// Issue the single Check rpc of the probe over `channel`.
pub async fn check(
    channel: Channel,
    settings: &Settings,
    token: &CancellationToken,
) -> Result<ServingStatus, ProbeError> {
    let mut client = HealthClient::new(channel);

    if settings.gzip {
        client = client
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);
    }

    let mut request = Request::new(HealthCheckRequest {
        service: settings.service.clone(),
    });

    for (key, value) in &settings.rpc_headers {
        request.metadata_mut().append(key.clone(), value.clone());
    }

    // the deadline is enforced locally; a propagated grpc-timeout would race it and
    // surface as CANCELLED from the server
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Status::cancelled("context canceled")),
        called = tokio::time::timeout(settings.rpc_timeout, client.check(request)) => {
            match called {
                Ok(response) => response.map(|r| r.into_inner()),
                Err(_) => Err(Status::deadline_exceeded("context deadline exceeded")),
            }
        }
    };

    classify(outcome, settings.rpc_timeout)
}

/// Map the Check outcome onto the probe error taxonomy.
pub fn classify(
    outcome: Result<HealthCheckResponse, Status>,
    rpc_timeout: Duration,
) -> Result<ServingStatus, ProbeError> {
    let response = outcome.map_err(|status| match status.code() {
        Code::Unimplemented => ProbeError::Unimplemented,
        Code::DeadlineExceeded => ProbeError::RpcTimeout(fmt_duration(rpc_timeout)),
        _ => ProbeError::Rpc(format!(
            "rpc error: code = {:?} desc = {}",
            status.code(),
            status.message()
        )),
    })?;

    match ServingStatus::from_i32(response.status) {
        Some(ServingStatus::Serving) => Ok(ServingStatus::Serving),
        Some(status) => Err(ProbeError::Unhealthy(status.as_str_name().to_string())),
        None => Err(ProbeError::Unhealthy(response.status.to_string())),
    }
}
