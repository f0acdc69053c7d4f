extern crate tokio;
extern crate tonic;
#[macro_use]
extern crate log;

// internal packages.
pub mod error;
pub mod hooks;
pub mod interface;
pub mod rpc;
pub mod utils;

pub use error::{ProbeError, ProbeStatus};
pub use interface::settings::Settings;
pub use rpc::handlers::{probe, run};
