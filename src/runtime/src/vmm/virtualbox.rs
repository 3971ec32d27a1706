//! VirtualBox backend, driven through `VBoxManage`.
//!
//! Every sandbox is a linked clone of a registered source VM whose first NIC
//! is bridged to a host interface. The guest reports its address through the
//! guest additions property store.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use vmpod_core::config::VirtualBoxConfig;
use vmpod_core::error::{PodError, Result};

use super::controller::CliController;
use super::provider::VmBackend;
use super::spec::{VmHandle, VmSpec, VmState};

/// Registry name of this backend.
pub const VIRTUALBOX_BACKEND: &str = "virtualbox";

const GUEST_IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/0/V4/IP";
const IP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Local VirtualBox VMs as pod sandboxes.
pub struct VirtualBoxBackend {
    config: VirtualBoxConfig,
    cli: CliController,
}

impl VirtualBoxBackend {
    pub fn new(config: VirtualBoxConfig) -> Self {
        Self {
            config,
            cli: CliController::new("VBoxManage"),
        }
    }

    async fn unregister(&self, name: &str) -> std::result::Result<(), String> {
        self.cli
            .run(&["unregistervm", name, "--delete"])
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn clone_and_start(&self, name: &str) -> std::result::Result<(), String> {
        let bridge = self.config.net_device.as_str();
        self.cli
            .run(&["modifyvm", name, "--nic1", "bridged", "--bridgeadapter1", bridge])
            .await
            .map_err(|e| e.to_string())?;
        self.cli
            .run(&["startvm", name, "--type", "headless"])
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl VmBackend for VirtualBoxBackend {
    fn name(&self) -> &'static str {
        VIRTUALBOX_BACKEND
    }

    async fn provision(&self, spec: &VmSpec) -> Result<VmHandle> {
        let provision_error = |message: String| PodError::ProvisionError {
            backend: VIRTUALBOX_BACKEND.to_string(),
            message,
        };

        // Image boot is never enabled here; the source VM is always cloned.
        self.cli
            .run(&[
                "clonevm",
                self.config.vm_src.as_str(),
                "--name",
                spec.name.as_str(),
                "--register",
            ])
            .await
            .map_err(|e| provision_error(e.to_string()))?;

        if let Err(message) = self.clone_and_start(&spec.name).await {
            if let Err(cleanup) = self.unregister(&spec.name).await {
                tracing::warn!(vm = %spec.name, error = %cleanup, "Failed to delete half-built VM");
            }
            return Err(provision_error(message));
        }

        tracing::info!(vm = %spec.name, source = %self.config.vm_src, "VirtualBox VM started");

        Ok(VmHandle {
            id: spec.name.clone(),
            name: spec.name.clone(),
        })
    }

    async fn destroy(&self, handle: &VmHandle) -> Result<()> {
        // Already powered off is fine
        if let Err(e) = self
            .cli
            .run(&["controlvm", handle.id.as_str(), "poweroff"])
            .await
        {
            tracing::debug!(vm = %handle.id, error = %e, "poweroff failed");
        }

        self.unregister(&handle.id)
            .await
            .map_err(|message| PodError::DestroyError {
                id: handle.id.clone(),
                message,
            })
    }

    async fn addresses(&self, handle: &VmHandle) -> Result<Vec<IpAddr>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.ip_wait_secs);

        loop {
            let output = self
                .cli
                .run(&["guestproperty", "get", handle.id.as_str(), GUEST_IP_PROPERTY])
                .await
                .map_err(|e| PodError::NetworkError {
                    id: handle.id.clone(),
                    message: e.to_string(),
                })?;

            if let Some(ip) = parse_guest_property(&output).and_then(|v| v.parse().ok()) {
                return Ok(vec![ip]);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PodError::NetworkError {
                    id: handle.id.clone(),
                    message: format!(
                        "guest did not report an address within {}s",
                        self.config.ip_wait_secs
                    ),
                });
            }

            tokio::time::sleep(IP_POLL_INTERVAL).await;
        }
    }

    async fn state(&self, handle: &VmHandle) -> Result<VmState> {
        let output = self
            .cli
            .run(&["showvminfo", handle.id.as_str(), "--machinereadable"])
            .await
            .map_err(|e| PodError::BackendError {
                backend: VIRTUALBOX_BACKEND.to_string(),
                message: e.to_string(),
            })?;

        parse_vm_state(&output).ok_or_else(|| PodError::BackendError {
            backend: VIRTUALBOX_BACKEND.to_string(),
            message: format!("no VMState in showvminfo output for {}", handle.id),
        })
    }
}

/// Parse `VBoxManage guestproperty get` output (`Value: 10.0.0.5`).
pub fn parse_guest_property(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Value:"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the `VMState="..."` line of `showvminfo --machinereadable`.
pub fn parse_vm_state(output: &str) -> Option<VmState> {
    let raw = output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("VMState=")
            .map(|v| v.trim_matches('"'))
    })?;

    Some(match raw {
        "running" => VmState::Running,
        "starting" | "restoring" => VmState::Pending,
        "stopping" | "saving" => VmState::Stopping,
        "poweroff" | "saved" | "aborted" | "paused" => VmState::Stopped,
        other => VmState::Other(other.to_string()),
    })
}
