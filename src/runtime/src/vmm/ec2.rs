//! EC2 backend, driven through the `aws` CLI.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use vmpod_core::config::Ec2Config;
use vmpod_core::error::{PodError, Result};

use super::controller::CliController;
use super::provider::VmBackend;
use super::spec::{VmHandle, VmSpec, VmState};
use crate::image::{ImageCatalog, ImageRecord};

/// Registry and catalog name of this backend.
pub const EC2_BACKEND: &str = "aws";

const GIB: u64 = 1024 * 1024 * 1024;

/// EC2 instances as pod sandboxes.
pub struct Ec2Backend {
    config: Ec2Config,
    cli: CliController,
}

impl Ec2Backend {
    /// Create a backend from a validated configuration.
    pub fn new(config: Ec2Config) -> Self {
        Self {
            config,
            cli: CliController::new("aws"),
        }
    }

    /// Fail unless the ambient AWS credentials are usable.
    pub async fn validate_credentials(&self) -> Result<()> {
        tracing::info!(region = %self.config.region, "Validating AWS credentials");

        if !self.config.ssh_key.exists() {
            return Err(PodError::ConfigError(format!(
                "aws: ssh_key {} does not exist",
                self.config.ssh_key.display()
            )));
        }

        let identity: CallerIdentity = self
            .cli
            .run_json(&self.args(&["sts", "get-caller-identity"]))
            .await
            .map_err(|e| {
                PodError::ConfigError(format!("aws: failed to validate credentials: {}", e))
            })?;

        tracing::info!(account = %identity.account, "Validated AWS credentials");
        Ok(())
    }

    fn args(&self, command: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        args.extend([
            "--region".to_string(),
            self.config.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        args
    }

    async fn describe(&self, instance_id: &str) -> std::result::Result<Instance, String> {
        let mut args = self.args(&["ec2", "describe-instances"]);
        args.extend(["--instance-ids".to_string(), instance_id.to_string()]);

        let output: DescribeInstancesOutput =
            self.cli.run_json(&args).await.map_err(|e| e.to_string())?;

        output
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| format!("instance {} not returned by describe-instances", instance_id))
    }

    async fn terminate(&self, instance_id: &str) -> std::result::Result<(), String> {
        let mut args = self.args(&["ec2", "terminate-instances"]);
        args.extend(["--instance-ids".to_string(), instance_id.to_string()]);
        self.cli.run(&args).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl VmBackend for Ec2Backend {
    fn name(&self) -> &'static str {
        EC2_BACKEND
    }

    fn image_catalog(&self) -> Option<&'static str> {
        Some(EC2_BACKEND)
    }

    async fn provision(&self, spec: &VmSpec) -> Result<VmHandle> {
        let provision_error = |message: String| PodError::ProvisionError {
            backend: EC2_BACKEND.to_string(),
            message,
        };

        let ami = spec.image.as_deref().unwrap_or(&self.config.ami);
        let mut args = self.args(&["ec2", "run-instances"]);
        args.extend([
            "--image-id".to_string(),
            ami.to_string(),
            "--instance-type".to_string(),
            self.config.instance_type.clone(),
            "--count".to_string(),
            "1".to_string(),
            "--key-name".to_string(),
            self.config.key_pair_name(),
            "--security-group-ids".to_string(),
            self.config.security_group.clone(),
            "--subnet-id".to_string(),
            self.config.subnet.clone(),
            "--tag-specifications".to_string(),
            format!(
                "ResourceType=instance,Tags=[{{Key=Name,Value={}}}]",
                spec.name
            ),
        ]);

        let output: RunInstancesOutput = self
            .cli
            .run_json(&args)
            .await
            .map_err(|e| provision_error(e.to_string()))?;

        let instance_id = output
            .instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| provision_error("run-instances returned no instance".to_string()))?;

        tracing::info!(instance_id = %instance_id, ami = %ami, "EC2 instance launched");

        let mut wait = self.args(&["ec2", "wait", "instance-running"]);
        wait.extend(["--instance-ids".to_string(), instance_id.clone()]);
        if let Err(e) = self.cli.run(&wait).await {
            if let Err(cleanup) = self.terminate(&instance_id).await {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %cleanup,
                    "Failed to terminate instance that never reached running"
                );
            }
            return Err(provision_error(e.to_string()));
        }

        Ok(VmHandle {
            id: instance_id,
            name: spec.name.clone(),
        })
    }

    async fn destroy(&self, handle: &VmHandle) -> Result<()> {
        self.terminate(&handle.id)
            .await
            .map_err(|message| PodError::DestroyError {
                id: handle.id.clone(),
                message,
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
                backend: EC2_BACKEND.to_string(),
                message,
            })?;
        Ok(parse_instance_state(&instance.state.name))
    }
}

/// Map an EC2 instance state name.
pub fn parse_instance_state(name: &str) -> VmState {
    match name {
        "pending" => VmState::Pending,
        "running" => VmState::Running,
        "stopping" | "shutting-down" => VmState::Stopping,
        "stopped" => VmState::Stopped,
        "terminated" => VmState::Terminated,
        other => VmState::Other(other.to_string()),
    }
}

/// AMI lookup through `aws ec2 describe-images`.
pub struct Ec2ImageCatalog {
    config: Ec2Config,
    cli: CliController,
}

impl Ec2ImageCatalog {
    pub fn new(config: Ec2Config) -> Self {
        Self {
            config,
            cli: CliController::new("aws"),
        }
    }
}

#[async_trait]
impl ImageCatalog for Ec2ImageCatalog {
    fn name(&self) -> &'static str {
        EC2_BACKEND
    }

    async fn find(&self, qualifier: Option<&str>, name: &str) -> Result<Vec<ImageRecord>> {
        let owners: Vec<String> = match qualifier {
            Some(owner) => vec![owner.to_string()],
            None => self.config.image_owners.clone(),
        };

        let mut args = vec![
            "ec2".to_string(),
            "describe-images".to_string(),
            "--region".to_string(),
            self.config.region.clone(),
            "--output".to_string(),
            "json".to_string(),
            "--owners".to_string(),
        ];
        args.extend(owners);
        args.extend([
            "--filters".to_string(),
            format!("Name=name,Values={}", name),
        ]);

        let output: DescribeImagesOutput =
            self.cli
                .run_json(&args)
                .await
                .map_err(|e| PodError::BackendError {
                    backend: EC2_BACKEND.to_string(),
                    message: e.to_string(),
                })?;

        Ok(output.images.into_iter().map(Ami::into_record).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<LaunchedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchedInstance {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
}

impl Instance {
    fn addresses(&self) -> Vec<IpAddr> {
        [&self.private_ip_address, &self.public_ip_address]
            .into_iter()
            .flatten()
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesOutput {
    #[serde(default)]
    images: Vec<Ami>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ami {
    image_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    block_device_mappings: Vec<BlockDeviceMapping>,
}

impl Ami {
    fn into_record(self) -> ImageRecord {
        let size = self
            .block_device_mappings
            .iter()
            .filter_map(|m| m.ebs.as_ref().and_then(|e| e.volume_size))
            .sum::<u64>()
            * GIB;
        let tag = if self.name.is_empty() {
            self.image_id.clone()
        } else {
            self.name
        };
        ImageRecord {
            id: self.image_id.clone(),
            repo_tags: vec![tag],
            repo_digests: vec![self.image_id],
            size,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockDeviceMapping {
    ebs: Option<Ebs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ebs {
    volume_size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_state() {
        assert_eq!(parse_instance_state("running"), VmState::Running);
        assert_eq!(parse_instance_state("pending"), VmState::Pending);
        assert_eq!(parse_instance_state("shutting-down"), VmState::Stopping);
        assert_eq!(parse_instance_state("terminated"), VmState::Terminated);
        assert_eq!(
            parse_instance_state("rebooting"),
            VmState::Other("rebooting".to_string())
        );
    }

    #[test]
    fn test_describe_instances_addresses() {
        let raw = r#"{
            "Reservations": [{
                "Instances": [{
                    "InstanceId": "i-0abc",
                    "State": { "Code": 16, "Name": "running" },
                    "PrivateIpAddress": "10.0.1.12",
                    "PublicIpAddress": "54.1.2.3"
                }]
            }]
        }"#;
        let output: DescribeInstancesOutput = serde_json::from_str(raw).unwrap();
        let instance = &output.reservations[0].instances[0];
        let addrs = instance.addresses();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "10.0.1.12");
        assert_eq!(instance.state.name, "running");
    }

    #[test]
    fn test_pending_instance_has_no_addresses() {
        let raw = r#"{
            "Reservations": [{
                "Instances": [{
                    "InstanceId": "i-0abc",
                    "State": { "Name": "pending" }
                }]
            }]
        }"#;
        let output: DescribeInstancesOutput = serde_json::from_str(raw).unwrap();
        assert!(output.reservations[0].instances[0].addresses().is_empty());
    }

    #[test]
    fn test_run_instances_output() {
        let raw = r#"{ "Groups": [], "Instances": [{ "InstanceId": "i-0def", "ImageId": "ami-1" }] }"#;
        let output: RunInstancesOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(output.instances[0].instance_id, "i-0def");
    }

    #[test]
    fn test_ami_into_record() {
        let raw = r#"{
            "Images": [{
                "ImageId": "ami-0123",
                "Name": "vmpod-agent-2024",
                "BlockDeviceMappings": [
                    { "DeviceName": "/dev/sda1", "Ebs": { "VolumeSize": 8 } },
                    { "DeviceName": "/dev/sdb", "VirtualName": "ephemeral0" }
                ]
            }]
        }"#;
        let output: DescribeImagesOutput = serde_json::from_str(raw).unwrap();
        let record = output.images.into_iter().next().unwrap().into_record();
        assert_eq!(record.id, "ami-0123");
        assert_eq!(record.repo_tags, vec!["vmpod-agent-2024".to_string()]);
        assert_eq!(record.size, 8 * GIB);
    }
}
