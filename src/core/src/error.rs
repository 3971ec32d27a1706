use thiserror::Error;

/// vmpod error types
#[derive(Error, Debug)]
pub enum PodError {
    /// Unknown sandbox or image
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// A container request named a sandbox this shim does not know
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    /// The backend failed to create a VM
    #[error("Provision failed on {backend}: {message}")]
    ProvisionError { backend: String, message: String },

    /// The backend failed to destroy a VM; the sandbox is retained
    #[error("Destroy failed for {id}: {message}")]
    DestroyError { id: String, message: String },

    /// No network address could be obtained for a new VM
    #[error("Network error for {id}: {message}")]
    NetworkError { id: String, message: String },

    /// The in-VM agent could not be reached
    #[error("Agent unreachable at {address}: {message}")]
    AgentUnreachable { address: String, message: String },

    /// Any other backend call failure (state query, image catalog)
    #[error("Backend error: {backend} - {message}")]
    BackendError { backend: String, message: String },

    /// The image catalog returned more than one match
    #[error("Ambiguous image {reference}: {matches} matches")]
    AmbiguousImage { reference: String, matches: usize },

    /// Unparseable image reference
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Operation not supported
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A provider name was registered twice
    #[error("Provider already registered: {0}")]
    AlreadyRegistered(String),

    /// No provider registered under the requested name
    #[error("Unknown provider: {name} (available: {available})")]
    UnknownProvider { name: String, available: String },

    /// gRPC error returned by the in-VM agent
    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl PodError {
    /// Shorthand for an unknown sandbox.
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        PodError::NotFound {
            resource: "Sandbox",
            id: id.into(),
        }
    }

    /// Shorthand for an unknown image.
    pub fn image_not_found(reference: impl Into<String>) -> Self {
        PodError::NotFound {
            resource: "Image",
            id: reference.into(),
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PodError::NotFound { .. })
    }
}

impl From<serde_json::Error> for PodError {
    fn from(err: serde_json::Error) -> Self {
        PodError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PodError {
    fn from(err: serde_yaml::Error) -> Self {
        PodError::SerializationError(err.to_string())
    }
}

/// Result type alias for vmpod operations
pub type Result<T> = std::result::Result<T, PodError>;
