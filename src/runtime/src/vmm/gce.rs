//! GCE backend, driven through the `gcloud` CLI.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use vmpod_core::config::GceConfig;
use vmpod_core::error::{PodError, Result};

use super::controller::CliController;
use super::provider::VmBackend;
use super::spec::{VmHandle, VmSpec, VmState};
use crate::image::{ImageCatalog, ImageRecord};

/// Registry and catalog name of this backend.
pub const GCE_BACKEND: &str = "gcp";

/// GCE instances as pod sandboxes.
pub struct GceBackend {
    config: GceConfig,
    cli: CliController,
}

impl GceBackend {
    pub fn new(config: GceConfig) -> Self {
        Self {
            config,
            cli: CliController::new("gcloud"),
        }
    }

    /// Activate the configured service account for subsequent calls.
    pub async fn activate(&self) -> Result<()> {
        activate_service_account(&self.cli, &self.config).await
    }

    fn instance_args(&self, verb: &str, name: &str) -> Vec<String> {
        vec![
            "compute".to_string(),
            "instances".to_string(),
            verb.to_string(),
            name.to_string(),
            format!("--project={}", self.config.project),
            format!("--zone={}", self.config.zone),
        ]
    }

    async fn describe(&self, name: &str) -> std::result::Result<GceInstance, String> {
        let mut args = self.instance_args("describe", name);
        args.push("--format=json".to_string());
        self.cli.run_json(&args).await.map_err(|e| e.to_string())
    }
}

async fn activate_service_account(cli: &CliController, config: &GceConfig) -> Result<()> {
    if !config.auth_file.exists() {
        return Err(PodError::ConfigError(format!(
            "gcp: auth_file {} does not exist",
            config.auth_file.display()
        )));
    }

    let key_file = format!("--key-file={}", config.auth_file.display());
    cli.run(&["auth", "activate-service-account", key_file.as_str()])
        .await
        .map_err(|e| PodError::ConfigError(format!("gcp: failed to authenticate: {}", e)))?;

    tracing::info!(project = %config.project, "Activated GCP service account");
    Ok(())
}

/// Split `project/name` image references into their parts.
fn image_flags(image: &str) -> Vec<String> {
    match image.split_once('/') {
        Some((project, name)) => vec![
            format!("--image={}", name),
            format!("--image-project={}", project),
        ],
        None => vec![format!("--image={}", image)],
    }
}

#[async_trait]
impl VmBackend for GceBackend {
    fn name(&self) -> &'static str {
        GCE_BACKEND
    }

    fn image_catalog(&self) -> Option<&'static str> {
        Some(GCE_BACKEND)
    }

    async fn provision(&self, spec: &VmSpec) -> Result<VmHandle> {
        let image = spec.image.as_deref().unwrap_or(&self.config.source_image);

        let mut args = self.instance_args("create", &spec.name);
        args.extend([
            format!("--machine-type={}", self.config.machine_type),
            format!("--network={}", self.config.network),
            format!("--subnet={}", self.config.subnet),
            format!("--scopes={}", self.config.scope),
            "--format=json".to_string(),
        ]);
        args.extend(image_flags(image));

        let created: Vec<GceInstance> =
            self.cli
                .run_json(&args)
                .await
                .map_err(|e| PodError::ProvisionError {
                    backend: GCE_BACKEND.to_string(),
                    message: e.to_string(),
                })?;

        let name = created
            .into_iter()
            .next()
            .map(|i| i.name)
            .unwrap_or_else(|| spec.name.clone());

        tracing::info!(instance = %name, image = %image, "GCE instance created");

        Ok(VmHandle {
            id: name.clone(),
            name,
        })
    }

    async fn destroy(&self, handle: &VmHandle) -> Result<()> {
        let mut args = self.instance_args("delete", &handle.id);
        args.push("--quiet".to_string());
        self.cli
            .run(&args)
            .await
            .map(|_| ())
            .map_err(|e| PodError::DestroyError {
                id: handle.id.clone(),
                message: e.to_string(),
            })
    }

    async fn addresses(&self, handle: &VmHandle) -> Result<Vec<IpAddr>> {
        let instance = self
            .describe(&handle.id)
            .await
            .map_err(|message| PodError::NetworkError {
                id: handle.id.clone(),
                message,
            })?;
        Ok(instance.addresses())
    }

    async fn state(&self, handle: &VmHandle) -> Result<VmState> {
        let instance = self
            .describe(&handle.id)
            .await
            .map_err(|message| PodError::BackendError {
                backend: GCE_BACKEND.to_string(),
                message,
            })?;
        Ok(parse_instance_status(&instance.status))
    }
}

/// Map a GCE instance status.
pub fn parse_instance_status(status: &str) -> VmState {
    match status {
        "PROVISIONING" | "STAGING" => VmState::Pending,
        "RUNNING" => VmState::Running,
        "STOPPING" | "SUSPENDING" => VmState::Stopping,
        "STOPPED" | "SUSPENDED" | "TERMINATED" => VmState::Stopped,
        other => VmState::Other(other.to_lowercase()),
    }
}

/// Image lookup through `gcloud compute images list`.
pub struct GceImageCatalog {
    config: GceConfig,
    cli: CliController,
}

impl GceImageCatalog {
    pub fn new(config: GceConfig) -> Self {
        Self {
            config,
            cli: CliController::new("gcloud"),
        }
    }

    /// Activate the configured service account for subsequent calls.
    pub async fn activate(&self) -> Result<()> {
        activate_service_account(&self.cli, &self.config).await
    }
}

#[async_trait]
impl ImageCatalog for GceImageCatalog {
    fn name(&self) -> &'static str {
        GCE_BACKEND
    }

    async fn find(&self, qualifier: Option<&str>, name: &str) -> Result<Vec<ImageRecord>> {
        let project = qualifier.unwrap_or(&self.config.project);
        let args = [
            "compute".to_string(),
            "images".to_string(),
            "list".to_string(),
            format!("--project={}", project),
            "--no-standard-images".to_string(),
            format!("--filter=name={}", name),
            "--format=json".to_string(),
        ];

        let images: Vec<GceImage> =
            self.cli
                .run_json(&args)
                .await
                .map_err(|e| PodError::BackendError {
                    backend: GCE_BACKEND.to_string(),
                    message: e.to_string(),
                })?;

        Ok(images.into_iter().map(GceImage::into_record).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

impl GceInstance {
    fn addresses(&self) -> Vec<IpAddr> {
        let internal = self
            .network_interfaces
            .iter()
            .filter_map(|nic| nic.network_ip.as_deref());
        let external = self
            .network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .filter_map(|ac| ac.nat_ip.as_deref());

        internal
            .chain(external)
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceImage {
    name: String,
    /// int64 fields are rendered as strings
    #[serde(default)]
    archive_size_bytes: Option<String>,
}

impl GceImage {
    // Instances boot from an image by name, so the name doubles as the id.
    fn into_record(self) -> ImageRecord {
        let size = self
            .archive_size_bytes
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        ImageRecord {
            id: self.name.clone(),
            repo_tags: vec![self.name.clone()],
            repo_digests: vec![self.name],
            size,
        }
    }
}
