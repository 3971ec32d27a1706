//! Backend configuration.
//!
//! Each backend reads one file from the configuration directory, named after
//! the backend (`aws.json`, `gcp.yaml`, `virtualbox.json`, ...). Files are
//! loaded once when the provider is constructed; a missing or incomplete file
//! is a fatal startup error.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PodError, Result};

/// A configuration file owned by one backend.
pub trait BackendConfig: DeserializeOwned {
    /// File stem looked up in the configuration directory.
    const FILE_STEM: &'static str;

    /// Reject incomplete configurations.
    fn validate(&self) -> Result<()>;
}

/// Load and validate a backend configuration from `dir`.
///
/// Looks for `<stem>.json`, then `<stem>.yaml`, then `<stem>.yml`.
pub fn load_backend_config<T: BackendConfig>(dir: &Path) -> Result<T> {
    let candidates = ["json", "yaml", "yml"];
    let path = candidates
        .iter()
        .map(|ext| dir.join(format!("{}.{}", T::FILE_STEM, ext)))
        .find(|p| p.exists())
        .ok_or_else(|| {
            PodError::ConfigError(format!(
                "No {stem}.json or {stem}.yaml in {}",
                dir.display(),
                stem = T::FILE_STEM,
            ))
        })?;

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        PodError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let parsed: Result<T> = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw).map_err(PodError::from),
        _ => serde_yaml::from_str(&raw).map_err(PodError::from),
    };
    let config = parsed.map_err(|e| {
        PodError::ConfigError(format!("Invalid {}: {}", path.display(), e))
    })?;

    config.validate()?;

    tracing::debug!(path = %path.display(), "Loaded backend configuration");

    Ok(config)
}

fn require(backend: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PodError::ConfigError(format!(
            "{}: required field '{}' is missing or empty",
            backend, field
        )));
    }
    Ok(())
}

/// EC2 backend configuration (`aws.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ec2Config {
    /// AMI booted for every sandbox unless image boot is enabled
    pub ami: String,

    /// AWS region
    pub region: String,

    /// Security group id attached to new instances
    pub security_group: String,

    /// VPC id
    pub vpc: String,

    /// Subnet id new instances are placed in
    pub subnet: String,

    /// Private key registered as an EC2 key pair; the key pair name is the file stem
    pub ssh_key: PathBuf,

    /// Instance type
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// Owners searched by the image catalog
    #[serde(default = "default_image_owners")]
    pub image_owners: Vec<String>,
}

fn default_instance_type() -> String {
    "t2.micro".to_string()
}

fn default_image_owners() -> Vec<String> {
    vec!["self".to_string()]
}

impl Ec2Config {
    /// EC2 key pair name derived from the key file name.
    pub fn key_pair_name(&self) -> String {
        self.ssh_key
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl BackendConfig for Ec2Config {
    const FILE_STEM: &'static str = "aws";

    fn validate(&self) -> Result<()> {
        require("aws", "ami", &self.ami)?;
        require("aws", "region", &self.region)?;
        require("aws", "security_group", &self.security_group)?;
        require("aws", "vpc", &self.vpc)?;
        require("aws", "subnet", &self.subnet)?;
        require("aws", "ssh_key", &self.ssh_key.to_string_lossy())?;
        require("aws", "instance_type", &self.instance_type)?;
        Ok(())
    }
}

/// GCE backend configuration (`gcp.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GceConfig {
    /// Image booted for every sandbox unless image boot is enabled
    pub source_image: String,

    /// Compute zone
    pub zone: String,

    /// Project owning the instances
    pub project: String,

    /// Service account scope granted to instances
    pub scope: String,

    /// Service account key file
    pub auth_file: PathBuf,

    /// VPC network
    pub network: String,

    /// Subnetwork
    pub subnet: String,

    /// Machine type
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
}

fn default_machine_type() -> String {
    "n1-standard-1".to_string()
}

impl BackendConfig for GceConfig {
    const FILE_STEM: &'static str = "gcp";

    fn validate(&self) -> Result<()> {
        require("gcp", "source_image", &self.source_image)?;
        require("gcp", "zone", &self.zone)?;
        require("gcp", "project", &self.project)?;
        require("gcp", "scope", &self.scope)?;
        require("gcp", "auth_file", &self.auth_file.to_string_lossy())?;
        require("gcp", "network", &self.network)?;
        require("gcp", "subnet", &self.subnet)?;
        Ok(())
    }
}

/// VirtualBox backend configuration (`virtualbox.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualBoxConfig {
    /// Host interface the guest NIC is bridged to
    pub net_device: String,

    /// Registered VM cloned for every sandbox
    pub vm_src: String,

    /// How long to wait for the guest to report an address, in seconds
    #[serde(default = "default_ip_wait_secs")]
    pub ip_wait_secs: u64,
}

fn default_ip_wait_secs() -> u64 {
    300
}

impl BackendConfig for VirtualBoxConfig {
    const FILE_STEM: &'static str = "virtualbox";

    fn validate(&self) -> Result<()> {
        require("virtualbox", "net_device", &self.net_device)?;
        require("virtualbox", "vm_src", &self.vm_src)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_load_ec2_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "aws.json",
            r#"{
                "ami": "ami-123",
                "region": "us-west-2",
                "security_group": "sg-1",
                "vpc": "vpc-1",
                "subnet": "subnet-1",
                "ssh_key": "/keys/infra.pem"
            }"#,
        );

        let config: Ec2Config = load_backend_config(dir.path()).unwrap();
        assert_eq!(config.ami, "ami-123");
        assert_eq!(config.instance_type, "t2.micro");
        assert_eq!(config.image_owners, vec!["self".to_string()]);
        assert_eq!(config.key_pair_name(), "infra");
    }

    #[test]
    fn test_load_gce_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "gcp.yaml",
            "source_image: vmpod-agent\nzone: us-central1-a\nproject: demo\n\
             scope: https://www.googleapis.com/auth/cloud-platform\n\
             auth_file: /keys/sa.json\nnetwork: default\nsubnet: default\n",
        );

        let config: GceConfig = load_backend_config(dir.path()).unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.machine_type, "n1-standard-1");
    }

    #[test]
    fn test_incomplete_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "gcp.json",
            r#"{
                "source_image": "vmpod-agent",
                "zone": "us-central1-a",
                "project": "",
                "scope": "s",
                "auth_file": "/keys/sa.json",
                "network": "default",
                "subnet": "default"
            }"#,
        );

        let err = load_backend_config::<GceConfig>(dir.path()).unwrap_err();
        assert!(matches!(err, PodError::ConfigError(_)));
        assert!(err.to_string().contains("project"));
    }

    #[test]
    fn test_missing_field_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "virtualbox.json", r#"{ "net_device": "en0" }"#);

        let err = load_backend_config::<VirtualBoxConfig>(dir.path()).unwrap_err();
        assert!(matches!(err, PodError::ConfigError(_)));
        assert!(err.to_string().contains("vm_src"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_backend_config::<VirtualBoxConfig>(dir.path()).unwrap_err();
        assert!(matches!(err, PodError::ConfigError(_)));
        assert!(err.to_string().contains("virtualbox.json"));
    }

    #[test]
    fn test_virtualbox_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "virtualbox.json",
            r#"{ "net_device": "en0", "vm_src": "vmpod-base" }"#,
        );

        let config: VirtualBoxConfig = load_backend_config(dir.path()).unwrap();
        assert_eq!(config.ip_wait_secs, 300);
    }
}
