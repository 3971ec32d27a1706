//! VmBackend - Trait for VM backend implementations.

use std::net::IpAddr;

use async_trait::async_trait;
use vmpod_core::error::Result;

use super::spec::{VmHandle, VmSpec, VmState};

/// Trait for VM backend implementations.
///
/// Every call blocks (from the caller's point of view) until the backend
/// answers. Implementations report failures as:
/// - `provision` → `PodError::ProvisionError`
/// - `destroy` → `PodError::DestroyError`
/// - `addresses` → `PodError::NetworkError`
/// - `state` → `PodError::BackendError`
#[async_trait]
pub trait VmBackend: Send + Sync + 'static {
    /// Registry name of this backend.
    fn name(&self) -> &'static str;

    /// Name of the image catalog this backend can boot from, if any.
    fn image_catalog(&self) -> Option<&'static str> {
        None
    }

    /// Create and boot a VM.
    async fn provision(&self, spec: &VmSpec) -> Result<VmHandle>;

    /// Tear a VM down.
    async fn destroy(&self, handle: &VmHandle) -> Result<()>;

    /// Addresses of a VM, preferred address first.
    async fn addresses(&self, handle: &VmHandle) -> Result<Vec<IpAddr>>;

    /// Current machine state.
    async fn state(&self, handle: &VmHandle) -> Result<VmState>;
}
