pub mod client;
pub mod credentials;
pub mod handlers;
pub mod health_client;
pub mod workload;
