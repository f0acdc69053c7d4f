#![allow(unused)]
use grpc_health_probe::interface::cli::{normalize_args, Cli};
use grpc_health_probe::Settings;
use clap::Parser;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::Stream;
use tonic::codec::CompressionEncoding;
use tonic::transport::server::Router;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus as WireStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tonic_health::ServingStatus;

/// In-process gRPC server, stopped on drop.
pub struct TestServer {
    pub addr: String,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// `localhost:<port>` for certificates issued to localhost.
    pub fn localhost(&self) -> String {
        self.addr.replace("127.0.0.1", "localhost")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `router` on an ephemeral loopback port.
pub async fn start(router: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let _ = router
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    TestServer { addr, handle }
}

/// Standard health service reporting `status` for the whole server and for "api".
pub async fn health_server(status: ServingStatus) -> TestServer {
    start(Server::builder().add_service(health_service(status).await)).await
}

pub async fn health_service(
    status: ServingStatus,
) -> HealthServer<impl Health> {
    let (mut reporter, service) = tonic_health::server::health_reporter();
    reporter.set_service_status("", status).await;
    reporter.set_service_status("api", ServingStatus::NotServing).await;
    service
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip)
}

/// Server without the health service registered.
pub async fn unimplemented_server() -> TestServer {
    start(Server::builder().add_optional_service(None::<HealthServer<HeaderHealth>>)).await
}

/// SERVING only when metadata `key` carries exactly `want`.
pub struct HeaderHealth {
    pub key: &'static str,
    pub want: Vec<&'static str>,
}

#[tonic::async_trait]
impl Health for HeaderHealth {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let got: Vec<&str> = request
            .metadata()
            .get_all(self.key)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();

        if got != self.want {
            return Err(Status::invalid_argument(format!(
                "invalid metadata, want {}:{:?}, got {:?}",
                self.key, self.want, got
            )));
        }

        Ok(Response::new(HealthCheckResponse {
            status: WireStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not supported"))
    }
}

pub async fn header_server(key: &'static str, want: Vec<&'static str>) -> TestServer {
    start(Server::builder().add_service(HealthServer::new(HeaderHealth { key, want }))).await
}

/// SERVING only for gzip compressed requests.
pub struct GzipOnlyHealth;

#[tonic::async_trait]
impl Health for GzipOnlyHealth {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let encoding = request
            .metadata()
            .get("grpc-encoding")
            .and_then(|value| value.to_str().ok());

        if encoding != Some("gzip") {
            return Err(Status::invalid_argument(format!(
                "expected a gzip compressed request, got encoding {encoding:?}"
            )));
        }

        Ok(Response::new(HealthCheckResponse {
            status: WireStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not supported"))
    }
}

pub async fn gzip_only_server() -> TestServer {
    let service = HealthServer::new(GzipOnlyHealth)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

    start(Server::builder().add_service(service)).await
}

/// Answers Check only after `delay`.
pub struct SlowHealth {
    pub delay: Duration,
}

#[tonic::async_trait]
impl Health for SlowHealth {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        tokio::time::sleep(self.delay).await;

        Ok(Response::new(HealthCheckResponse {
            status: WireStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not supported"))
    }
}

pub async fn slow_server(delay: Duration) -> TestServer {
    start(Server::builder().add_service(HealthServer::new(SlowHealth { delay }))).await
}

/// Accepts tcp connections through the kernel backlog and never speaks.
pub fn silent_listener() -> (std::net::TcpListener, String) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Test CA with certificates written as PEM files into a temporary directory.
pub struct Pki {
    dir: TempDir,
    ca: rcgen::Certificate,
}

impl Pki {
    pub fn new() -> Pki {
        let mut params = CertificateParams::new(Vec::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "grpc_health_probe test ca");
        let ca = rcgen::Certificate::from_params(params).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let pki = Pki { dir, ca };
        std::fs::write(pki.ca_path(), pki.ca.serialize_pem().unwrap()).unwrap();
        pki
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    pub fn ca_pem(&self) -> String {
        self.ca.serialize_pem().unwrap()
    }

    /// Issue a certificate for `name`, returns (cert pem, key pem, cert path, key path).
    pub fn issue(&self, name: &str) -> (String, String, PathBuf, PathBuf) {
        let leaf =
            rcgen::Certificate::from_params(CertificateParams::new(vec![name.to_string()]))
                .unwrap();
        let cert_pem = leaf.serialize_pem_with_signer(&self.ca).unwrap();
        let key_pem = leaf.serialize_private_key_pem();

        let cert_path = self.dir.path().join(format!("{name}.pem"));
        let key_path = self.dir.path().join(format!("{name}-key.pem"));
        std::fs::write(&cert_path, &cert_pem).unwrap();
        std::fs::write(&key_path, &key_pem).unwrap();

        (cert_pem, key_pem, cert_path, key_path)
    }

    pub fn write(&self, file: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(file);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// TLS health server presenting a certificate issued to `name`, optionally requiring
/// client certificates signed by the test CA.
pub async fn tls_health_server(pki: &Pki, name: &str, client_auth: bool) -> TestServer {
    let (cert, key, _, _) = pki.issue(name);
    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if client_auth {
        tls = tls.client_ca_root(Certificate::from_pem(pki.ca_pem()));
    }

    let router = Server::builder()
        .tls_config(tls)
        .unwrap()
        .add_service(health_service(ServingStatus::Serving).await);

    start(router).await
}

/// Settings from Go style flags, as the binary would see them.
pub fn settings(args: &[&str]) -> Settings {
    let mut argv = vec!["grpc_health_probe"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(normalize_args(argv)).unwrap();
    Settings::from_cli_with_endpoint(cli, None).unwrap()
}

pub fn flag(name: &str, value: impl AsRef<Path>) -> String {
    format!("-{name}={}", value.as_ref().display())
}
