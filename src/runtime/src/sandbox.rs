//! Sandbox records - the per-VM state kept by a pod provider.
//!
//! Identity and creation-time metadata are immutable. The caller-visible
//! lifecycle state and the cached backend sample live behind a per-record
//! async mutex so that refreshes of one record are serialized while other
//! records proceed independently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::agent::AgentConnection;
use crate::vmm::{VmHandle, VmState};

/// How long a backend state sample stays fresh.
pub const STATE_STALENESS: Duration = Duration::from_secs(30);

/// Caller-visible sandbox state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Ready,
    NotReady,
}

/// Everything the caller supplies when asking for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
    pub hostname: String,
    pub log_directory: String,
    pub runtime_handler: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Catalog image to boot, honoured only when image boot is enabled
    pub boot_image: Option<String>,
}

/// Mutable part of a record.
#[derive(Debug)]
pub(crate) struct RecordState {
    pub lifecycle: SandboxState,
    pub backend_state: VmState,
    pub last_checked: Instant,
    /// Set once the VM is destroyed and the agent closed
    pub removed: bool,
}

/// One sandbox: a provisioned VM plus its agent connection.
pub struct SandboxRecord {
    pub id: String,
    pub spec: SandboxSpec,
    /// Nanoseconds since the Unix epoch
    pub created_at: i64,
    pub address: IpAddr,
    pub handle: VmHandle,
    pub(crate) agent: Arc<dyn AgentConnection>,
    pub(crate) state: Mutex<RecordState>,
}

impl SandboxRecord {
    pub(crate) fn new(
        spec: SandboxSpec,
        handle: VmHandle,
        address: IpAddr,
        agent: Arc<dyn AgentConnection>,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            id: handle.id.clone(),
            spec,
            created_at,
            address,
            handle,
            agent,
            state: Mutex::new(RecordState {
                lifecycle: SandboxState::Ready,
                backend_state: VmState::Running,
                last_checked: Instant::now(),
                removed: false,
            }),
        }
    }

    /// Build a status snapshot from already-locked state.
    pub(crate) fn snapshot(&self, state: &RecordState) -> SandboxStatus {
        SandboxStatus {
            id: self.id.clone(),
            spec: self.spec.clone(),
            created_at: self.created_at,
            address: self.address,
            state: state.lifecycle,
            backend_state: state.backend_state.clone(),
        }
    }
}

impl RecordState {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_checked) > STATE_STALENESS
    }
}

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub id: String,
    pub spec: SandboxSpec,
    pub created_at: i64,
    pub address: IpAddr,
    pub state: SandboxState,
    pub backend_state: VmState,
}

/// Criteria for listing sandboxes. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub id: Option<String>,
    pub state: Option<SandboxState>,
    /// Every pair must be present with an equal value
    pub labels: HashMap<String, String>,
}

impl SandboxFilter {
    pub fn matches(&self, status: &SandboxStatus) -> bool {
        if let Some(id) = &self.id {
            if id != &status.id {
                return false;
            }
        }

        if let Some(state) = self.state {
            if state != status.state {
                return false;
            }
        }

        self.labels
            .iter()
            .all(|(k, v)| status.spec.labels.get(k) == Some(v))
    }
}
