//! Pod providers - sandbox lifecycle on top of a VM backend.

mod builtin;
mod registry;
mod vm_pod;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use vmpod_core::error::Result;

use crate::agent::AgentConnection;
use crate::sandbox::{SandboxFilter, SandboxSpec, SandboxStatus};

pub use builtin::{register_ec2, register_gce, register_virtualbox};
pub use registry::{
    ImageProviderFactory, PodProviderFactory, ProviderContext, ProviderRegistry, Registry,
};
pub use vm_pod::{Ec2PodProvider, GcePodProvider, VirtualBoxPodProvider, VmPodProvider};

/// Sandbox lifecycle operations.
///
/// Every operation on an unknown id fails with `PodError::NotFound`.
#[async_trait]
pub trait PodProvider: Send + Sync {
    /// Backend name this provider was registered under.
    fn name(&self) -> &'static str;

    /// Provision a VM, connect to its agent and record the sandbox.
    async fn create(&self, spec: SandboxSpec) -> Result<String>;

    /// Mark a sandbox not ready. The VM keeps running.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Destroy the VM, close the agent and forget the sandbox.
    async fn remove(&self, id: &str) -> Result<()>;

    async fn status(&self, id: &str) -> Result<SandboxStatus>;

    async fn list(&self, filter: &SandboxFilter) -> Result<Vec<SandboxStatus>>;

    /// Agent connection of a sandbox, for one forwarded call.
    async fn agent_connection(&self, id: &str) -> Result<Arc<dyn AgentConnection>>;

    async fn address(&self, id: &str) -> Result<IpAddr>;

    /// Ids of every known sandbox.
    fn sandbox_ids(&self) -> Vec<String>;

    /// Image boot capability, if the backend has one.
    fn image_integration(&self) -> Option<&dyn SupportsImageIntegration> {
        None
    }
}

/// A pod provider that can boot sandboxes from catalog images.
pub trait SupportsImageIntegration: Send + Sync {
    /// Catalog the provider boots from.
    fn image_catalog(&self) -> &str;

    /// From now on, honour the image named by each sandbox.
    fn enable_image_boot(&self);

    fn image_boot_enabled(&self) -> bool;
}
