//! Map between CRI messages and vmpod sandbox and image types.
//!
//! Reads vmpod-specific annotations from pod configs:
//! - `vmpod.io/boot-image` → image the sandbox VM boots (with image integration)

use tonic::Status;
use vmpod_runtime::image::ImageRecord;
use vmpod_runtime::sandbox::{SandboxFilter, SandboxSpec, SandboxState, SandboxStatus};

use crate::cri_api::{
    Image, ImageSpec, PodIp, PodSandbox, PodSandboxConfig, PodSandboxFilter, PodSandboxMetadata,
    PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
};

/// Annotation naming the catalog image a sandbox VM should boot.
pub const ANN_BOOT_IMAGE: &str = "vmpod.io/boot-image";

/// Convert a CRI PodSandboxConfig to a SandboxSpec.
pub fn pod_sandbox_config_to_spec(config: &PodSandboxConfig, runtime_handler: &str) -> SandboxSpec {
    let metadata = config.metadata.clone().unwrap_or_default();
    let boot_image = config
        .annotations
        .get(ANN_BOOT_IMAGE)
        .filter(|image| !image.is_empty())
        .cloned();

    SandboxSpec {
        name: metadata.name,
        namespace: metadata.namespace,
        uid: metadata.uid,
        attempt: metadata.attempt,
        hostname: config.hostname.clone(),
        log_directory: config.log_directory.clone(),
        runtime_handler: runtime_handler.to_string(),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
        boot_image,
    }
}

fn metadata(spec: &SandboxSpec) -> PodSandboxMetadata {
    PodSandboxMetadata {
        name: spec.name.clone(),
        uid: spec.uid.clone(),
        namespace: spec.namespace.clone(),
        attempt: spec.attempt,
    }
}

fn state_to_cri(state: SandboxState) -> PodSandboxState {
    match state {
        SandboxState::Ready => PodSandboxState::SandboxReady,
        SandboxState::NotReady => PodSandboxState::SandboxNotready,
    }
}

/// Full CRI status of a sandbox.
pub fn sandbox_status_to_cri(status: &SandboxStatus) -> PodSandboxStatus {
    PodSandboxStatus {
        id: status.id.clone(),
        metadata: Some(metadata(&status.spec)),
        state: state_to_cri(status.state) as i32,
        created_at: status.created_at,
        network: Some(PodSandboxNetworkStatus {
            ip: status.address.to_string(),
            additional_ips: Vec::<PodIp>::new(),
        }),
        labels: status.spec.labels.clone(),
        annotations: status.spec.annotations.clone(),
        runtime_handler: status.spec.runtime_handler.clone(),
    }
}

/// CRI list entry of a sandbox.
pub fn sandbox_status_to_pod_sandbox(status: &SandboxStatus) -> PodSandbox {
    PodSandbox {
        id: status.id.clone(),
        metadata: Some(metadata(&status.spec)),
        state: state_to_cri(status.state) as i32,
        created_at: status.created_at,
        labels: status.spec.labels.clone(),
        annotations: status.spec.annotations.clone(),
        runtime_handler: status.spec.runtime_handler.clone(),
    }
}

/// Convert a CRI sandbox filter; empty fields match everything.
///
/// An unknown state value is rejected rather than matched against anything.
pub fn pod_sandbox_filter(filter: Option<&PodSandboxFilter>) -> Result<SandboxFilter, Status> {
    let Some(filter) = filter else {
        return Ok(SandboxFilter::default());
    };

    let state = match &filter.state {
        Some(value) => match PodSandboxState::try_from(value.state) {
            Ok(PodSandboxState::SandboxReady) => Some(SandboxState::Ready),
            Ok(PodSandboxState::SandboxNotready) => Some(SandboxState::NotReady),
            Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "unknown pod sandbox state {}",
                    value.state
                )))
            }
        },
        None => None,
    };

    Ok(SandboxFilter {
        id: Some(filter.id.clone()).filter(|id| !id.is_empty()),
        state,
        labels: filter.label_selector.clone(),
    })
}

/// Convert an image record to a CRI Image.
pub fn image_record_to_cri(reference: Option<&str>, record: ImageRecord) -> Image {
    let spec_image = reference
        .map(str::to_string)
        .or_else(|| record.repo_tags.first().cloned())
        .unwrap_or_else(|| record.id.clone());

    Image {
        id: record.id,
        repo_tags: record.repo_tags,
        repo_digests: record.repo_digests,
        size: record.size,
        username: String::new(),
        spec: Some(ImageSpec {
            image: spec_image,
            annotations: Default::default(),
        }),
        pinned: false,
    }
}
