//! vmpod Runtime - VM-backed pod sandboxes.
//!
//! Each pod sandbox is a whole VM from a pluggable backend (EC2, GCE or
//! VirtualBox). This crate provides the backends, the sandbox lifecycle
//! provider built on them, the connection to the agent running inside each
//! VM, the image catalog provider, and the registry that selects them by name.

pub mod agent;
pub mod image;
pub mod provider;
pub mod sandbox;
pub mod vmm;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export common types
pub use agent::{AgentConnection, AgentConnector, GrpcAgentConnector, DEFAULT_AGENT_PORT};
pub use image::{CatalogImageProvider, ImageCatalog, ImageProvider, ImageRecord};
pub use provider::{
    PodProvider, ProviderContext, ProviderRegistry, SupportsImageIntegration, VmPodProvider,
};
pub use sandbox::{SandboxFilter, SandboxSpec, SandboxState, SandboxStatus, STATE_STALENESS};
pub use vmm::{VmBackend, VmHandle, VmSpec, VmState};

/// vmpod runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
