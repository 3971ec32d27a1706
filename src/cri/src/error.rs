//! CRI-specific error conversions.

use tonic::Status;
use vmpod_core::error::PodError;

/// Convert a PodError to a gRPC Status.
///
/// Errors returned by a sandbox agent pass through with their original code.
pub fn pod_error_to_status(err: PodError) -> Status {
    match err {
        PodError::GrpcError(status) => status,
        PodError::NotFound { .. } | PodError::SandboxNotFound(_) => {
            Status::not_found(err.to_string())
        }
        PodError::NetworkError { .. }
        | PodError::AgentUnreachable { .. }
        | PodError::BackendError { .. } => Status::unavailable(err.to_string()),
        PodError::AmbiguousImage { .. } => Status::failed_precondition(err.to_string()),
        PodError::InvalidReference(_) | PodError::ConfigError(_) => {
            Status::invalid_argument(err.to_string())
        }
        PodError::Unimplemented(_) => Status::unimplemented(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_not_found_variants() {
        let status = pod_error_to_status(PodError::sandbox_not_found("i-0abc"));
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("i-0abc"));

        let status = pod_error_to_status(PodError::SandboxNotFound("sbx-missing".to_string()));
        assert_eq!(status.code(), Code::NotFound);
    }

    #[test]
    fn test_provision_and_destroy_map_to_internal() {
        let status = pod_error_to_status(PodError::ProvisionError {
            backend: "aws".to_string(),
            message: "quota".to_string(),
        });
        assert_eq!(status.code(), Code::Internal);

        let status = pod_error_to_status(PodError::DestroyError {
            id: "vm-1".to_string(),
            message: "locked".to_string(),
        });
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_reachability_maps_to_unavailable() {
        let status = pod_error_to_status(PodError::AgentUnreachable {
            address: "http://10.0.0.4:2375".to_string(),
            message: "refused".to_string(),
        });
        assert_eq!(status.code(), Code::Unavailable);

        let status = pod_error_to_status(PodError::NetworkError {
            id: "vm-1".to_string(),
            message: "no address".to_string(),
        });
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn test_image_errors() {
        let status = pod_error_to_status(PodError::AmbiguousImage {
            reference: "ubuntu".to_string(),
            matches: 2,
        });
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status = pod_error_to_status(PodError::InvalidReference("a/b/c".to_string()));
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_unimplemented() {
        let status = pod_error_to_status(PodError::Unimplemented("Exec".to_string()));
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn test_agent_status_passes_through() {
        let status = pod_error_to_status(PodError::GrpcError(Status::already_exists(
            "container name in use",
        )));
        assert_eq!(status.code(), Code::AlreadyExists);
        assert_eq!(status.message(), "container name in use");
    }
}
