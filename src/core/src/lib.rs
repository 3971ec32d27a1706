//! vmpod Core - Foundational Types
//!
//! Errors, backend configuration, and the generated CRI protobuf types
//! shared by the runtime and the CRI front end.

pub mod config;
pub mod error;

/// Generated CRI v1 protobuf types (server and client).
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}

// Re-export commonly used types
pub use config::{load_backend_config, BackendConfig, Ec2Config, GceConfig, VirtualBoxConfig};
pub use error::{PodError, Result};

/// vmpod version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
