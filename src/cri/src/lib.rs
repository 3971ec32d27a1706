//! vmpod CRI - Kubernetes Container Runtime Interface shim.
//!
//! Maps CRI concepts onto VM-backed sandboxes:
//! - Pod Sandbox → one VM from the configured backend
//! - Container → forwarded to the agent inside the sandbox VM
//! - Image → catalog image the backend can boot

pub mod config_mapper;
pub mod error;
pub mod image_service;
pub mod runtime_service;
pub mod server;

/// Generated CRI v1 protobuf types.
pub use vmpod_core::cri_api;
