//! VmPodProvider - one VM per pod sandbox, on any `VmBackend`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;
use vmpod_core::error::{PodError, Result};

use super::{PodProvider, SupportsImageIntegration};
use crate::agent::{AgentConnection, AgentConnector};
use crate::sandbox::{
    RecordState, SandboxFilter, SandboxRecord, SandboxSpec, SandboxState, SandboxStatus,
};
use crate::vmm::{
    Ec2Backend, GceBackend, VirtualBoxBackend, VmBackend, VmHandle, VmSpec,
};

/// Pod provider backed by EC2 instances.
pub type Ec2PodProvider = VmPodProvider<Ec2Backend>;
/// Pod provider backed by GCE instances.
pub type GcePodProvider = VmPodProvider<GceBackend>;
/// Pod provider backed by local VirtualBox VMs.
pub type VirtualBoxPodProvider = VmPodProvider<VirtualBoxBackend>;

/// Sandbox lifecycle on top of a VM backend.
///
/// The directory lock guards only the id → record map and is never held
/// across a backend call. Each record carries its own async mutex, held while
/// its backend state is refreshed. The two are never held together.
pub struct VmPodProvider<B: VmBackend> {
    backend: Arc<B>,
    connector: Arc<dyn AgentConnector>,
    sandboxes: RwLock<HashMap<String, Arc<SandboxRecord>>>,
    image_boot: AtomicBool,
}

impl<B: VmBackend> VmPodProvider<B> {
    pub fn new(backend: B, connector: Arc<dyn AgentConnector>) -> Self {
        Self::with_backend(Arc::new(backend), connector)
    }

    /// Share an existing backend (tests keep a handle to inspect it).
    pub fn with_backend(backend: Arc<B>, connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            backend,
            connector,
            sandboxes: RwLock::new(HashMap::new()),
            image_boot: AtomicBool::new(false),
        }
    }

    fn lookup(&self, id: &str) -> Result<Arc<SandboxRecord>> {
        self.sandboxes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PodError::sandbox_not_found(id))
    }

    /// Best-effort teardown of a VM that never became a sandbox.
    async fn discard(&self, handle: &VmHandle) {
        if let Err(e) = self.backend.destroy(handle).await {
            tracing::warn!(
                backend = self.backend.name(),
                vm = %handle.id,
                error = %e,
                "Failed to tear down VM after failed create"
            );
        }
    }

    /// Refresh a stale backend sample and derive the lifecycle state.
    ///
    /// A failed query keeps the previous sample and its timestamp.
    async fn refresh(&self, record: &SandboxRecord, state: &mut RecordState) {
        if state.is_stale(Instant::now()) {
            match self.backend.state(&record.handle).await {
                Ok(sample) => {
                    state.backend_state = sample;
                    state.last_checked = Instant::now();
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %record.id, error = %e, "Failed to refresh VM state");
                }
            }
        }

        if !state.backend_state.is_running() {
            state.lifecycle = SandboxState::NotReady;
        }
    }

    async fn refreshed_status(&self, record: &SandboxRecord) -> Option<SandboxStatus> {
        let mut state = record.state.lock().await;
        if state.removed {
            return None;
        }
        self.refresh(record, &mut state).await;
        Some(record.snapshot(&state))
    }
}

fn provision_error(backend: &str, error: PodError) -> PodError {
    match error {
        PodError::ProvisionError { .. } => error,
        other => PodError::ProvisionError {
            backend: backend.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl<B: VmBackend> PodProvider for VmPodProvider<B> {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    async fn create(&self, spec: SandboxSpec) -> Result<String> {
        let image = if self.image_boot_enabled() {
            spec.boot_image.clone()
        } else {
            None
        };
        let vm_spec = VmSpec::for_pod(&spec.namespace, &spec.name, image);

        tracing::info!(
            backend = self.backend.name(),
            vm = %vm_spec.name,
            image = ?vm_spec.image,
            "Provisioning sandbox VM"
        );

        let handle = self
            .backend
            .provision(&vm_spec)
            .await
            .map_err(|e| provision_error(self.backend.name(), e))?;

        let address = match self.backend.addresses(&handle).await {
            Ok(addrs) if !addrs.is_empty() => addrs[0],
            Ok(_) => {
                self.discard(&handle).await;
                return Err(PodError::NetworkError {
                    id: handle.id.clone(),
                    message: "backend reported no address".to_string(),
                });
            }
            Err(e) => {
                self.discard(&handle).await;
                return Err(match e {
                    PodError::NetworkError { .. } => e,
                    other => PodError::NetworkError {
                        id: handle.id.clone(),
                        message: other.to_string(),
                    },
                });
            }
        };

        let agent = match self.connector.connect(address).await {
            Ok(agent) => agent,
            Err(e) => {
                self.discard(&handle).await;
                return Err(match e {
                    PodError::AgentUnreachable { .. } => e,
                    other => PodError::AgentUnreachable {
                        address: address.to_string(),
                        message: other.to_string(),
                    },
                });
            }
        };

        let record = Arc::new(SandboxRecord::new(spec, handle, address, agent));
        let id = record.id.clone();

        if self
            .sandboxes
            .write()
            .insert(id.clone(), record)
            .is_some()
        {
            tracing::warn!(sandbox_id = %id, "Backend reused a sandbox id; replaced old record");
        }

        tracing::info!(sandbox_id = %id, address = %address, "Sandbox ready");

        Ok(id)
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let record = self.lookup(id)?;
        let mut state = record.state.lock().await;
        if state.removed {
            return Err(PodError::sandbox_not_found(id));
        }
        state.lifecycle = SandboxState::NotReady;

        tracing::info!(sandbox_id = %id, "Sandbox stopped");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let record = self.lookup(id)?;

        {
            let mut state = record.state.lock().await;
            if state.removed {
                return Err(PodError::sandbox_not_found(id));
            }

            self.backend
                .destroy(&record.handle)
                .await
                .map_err(|e| match e {
                    PodError::DestroyError { .. } => e,
                    other => PodError::DestroyError {
                        id: id.to_string(),
                        message: other.to_string(),
                    },
                })?;

            record.agent.close().await;
            state.removed = true;
        }

        let mut sandboxes = self.sandboxes.write();
        if sandboxes
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &record))
        {
            sandboxes.remove(id);
        }
        drop(sandboxes);

        tracing::info!(sandbox_id = %id, "Sandbox removed");
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<SandboxStatus> {
        let record = self.lookup(id)?;
        self.refreshed_status(&record)
            .await
            .ok_or_else(|| PodError::sandbox_not_found(id))
    }

    async fn list(&self, filter: &SandboxFilter) -> Result<Vec<SandboxStatus>> {
        let records: Vec<Arc<SandboxRecord>> = match &filter.id {
            Some(id) => self.sandboxes.read().get(id).cloned().into_iter().collect(),
            None => self.sandboxes.read().values().cloned().collect(),
        };

        let statuses = join_all(records.iter().map(|r| self.refreshed_status(r))).await;

        let matched: Vec<SandboxStatus> = statuses
            .into_iter()
            .flatten()
            .filter(|status| {
                let keep = filter.matches(status);
                tracing::debug!(sandbox_id = %status.id, keep, "Filtered sandbox");
                keep
            })
            .collect();

        Ok(matched)
    }

    async fn agent_connection(&self, id: &str) -> Result<Arc<dyn AgentConnection>> {
        Ok(self.lookup(id)?.agent.clone())
    }

    async fn address(&self, id: &str) -> Result<IpAddr> {
        Ok(self.lookup(id)?.address)
    }

    fn sandbox_ids(&self) -> Vec<String> {
        self.sandboxes.read().keys().cloned().collect()
    }

    fn image_integration(&self) -> Option<&dyn SupportsImageIntegration> {
        match self.backend.image_catalog() {
            Some(_) => Some(self as &dyn SupportsImageIntegration),
            None => None,
        }
    }
}

impl<B: VmBackend> SupportsImageIntegration for VmPodProvider<B> {
    fn image_catalog(&self) -> &str {
        self.backend.image_catalog().unwrap_or_default()
    }

    fn enable_image_boot(&self) {
        self.image_boot.store(true, Ordering::SeqCst);
        tracing::info!(backend = self.backend.name(), "Image boot enabled");
    }

    fn image_boot_enabled(&self) -> bool {
        self.image_boot.load(Ordering::SeqCst)
    }
}
