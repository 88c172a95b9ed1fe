#![deny(unsafe_code)]

pub mod backend;
pub mod capture;
pub mod codec;
pub mod config;
mod error;
pub mod greeting;
pub mod link;
mod metrics;
pub mod origin;
pub mod relay;
mod server;
pub mod stack;
pub mod tap;
pub mod ws;

pub use backend::{Backend, BridgeBackend, StackBackend};
pub use config::{Args, BackendConfig, ForwardRule, GatewayConfig, StackConfig};
pub use error::{CleanupError, CleanupErrors, ConfigError, RelayError, SetupError};
pub use metrics::Metrics;
pub use server::{start_server, ServerHandle};

/// Version reported to clients in the greeting and printed in the banner.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
