//! VmSpec, VmHandle and VmState - the values exchanged with a backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a backend needs to provision one sandbox VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Backend-visible VM name (lowercase, `[a-z0-9-]`, at most 63 chars)
    pub name: String,

    /// Image to boot instead of the backend's configured template
    pub image: Option<String>,
}

impl VmSpec {
    /// Build a spec with a name derived from the pod's namespace and name.
    ///
    /// A random suffix keeps names unique across pod attempts.
    pub fn for_pod(namespace: &str, pod_name: &str, image: Option<String>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let base = sanitize(&format!("vmpod-{}-{}", namespace, pod_name));
        // 63 - '-' - 8 hex chars
        let base: String = base.chars().take(54).collect();
        let base = base.trim_end_matches('-');
        Self {
            name: format!("{}-{}", base, &suffix[..8]),
            image,
        }
    }
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Backend handle for a provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// Backend-assigned identity; becomes the sandbox id
    pub id: String,

    /// Name the VM was created with
    pub name: String,
}

/// Raw machine state as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
    /// Anything the backend reports that has no mapping above
    Other(String),
}

impl VmState {
    /// Only a running VM backs a ready sandbox.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Pending => write!(f, "pending"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Terminated => write!(f, "terminated"),
            VmState::Other(raw) => write!(f, "{}", raw),
        }
    }
}
