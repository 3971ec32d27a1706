//! Images - metadata about bootable VM images in a backend catalog.
//!
//! "Pulling" an image does not move bytes. It looks the reference up in the
//! backend's image catalog and remembers the match so that later status
//! queries succeed and, with image integration, sandboxes can boot from it.

mod catalog;

use async_trait::async_trait;
use vmpod_core::error::{PodError, Result};

use crate::provider::PodProvider;

pub use catalog::CatalogImageProvider;

/// Metadata of one catalog image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Identifier the backend boots from (AMI id, GCE image name)
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    /// Size in bytes
    pub size: u64,
}

/// A backend's image catalog.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Catalog name; matches `VmBackend::image_catalog` of backends that can boot from it.
    fn name(&self) -> &'static str;

    /// Images named `name`, optionally within a project or owner.
    async fn find(&self, qualifier: Option<&str>, name: &str) -> Result<Vec<ImageRecord>>;
}

/// Image operations exposed through the CRI image service.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every known image, or only the one matching `filter`.
    fn list(&self, filter: Option<&str>) -> Vec<ImageRecord>;

    /// Known image for `reference`, if any. Absence is not an error.
    fn status(&self, reference: &str) -> Option<ImageRecord>;

    /// Resolve `reference` in the catalog and remember it. Returns the image id.
    async fn pull(&self, reference: &str) -> Result<String>;

    /// Forget an image. Forgetting an unknown image succeeds.
    fn remove(&self, reference: &str) -> Result<()>;

    /// Boot image name for a CRI image reference.
    fn translate(&self, reference: &str) -> String;

    /// Enable image boot on `pods` if it boots from this provider's catalog.
    fn integrate(&self, pods: &dyn PodProvider) -> bool;
}

/// Append `:latest` to references without a tag.
///
/// Only the last path segment can carry a tag; a colon before it is a port.
pub fn normalize_reference(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

/// Split `[qualifier/]name[:tag]` into the qualifier and the untagged name.
pub fn parse_reference(reference: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = reference.split('/').collect();
    let (qualifier, name) = match parts.as_slice() {
        [name] => (None, *name),
        [qualifier, name] => (Some(*qualifier), *name),
        _ => return Err(PodError::InvalidReference(reference.to_string())),
    };

    let name = name.split(':').next().unwrap_or(name);
    if name.is_empty() || qualifier.is_some_and(str::is_empty) {
        return Err(PodError::InvalidReference(reference.to_string()));
    }

    Ok((qualifier, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reference() {
        assert_eq!(normalize_reference("vmpod-agent"), "vmpod-agent:latest");
        assert_eq!(normalize_reference("vmpod-agent:v2"), "vmpod-agent:v2");
        assert_eq!(normalize_reference("demo/vmpod-agent"), "demo/vmpod-agent:latest");
    }

    #[test]
    fn test_normalize_reference_ignores_port() {
        assert_eq!(
            normalize_reference("registry:5000/vmpod-agent"),
            "registry:5000/vmpod-agent:latest"
        );
        assert_eq!(
            normalize_reference("registry:5000/vmpod-agent:v2"),
            "registry:5000/vmpod-agent:v2"
        );
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            parse_reference("vmpod-agent").unwrap(),
            (None, "vmpod-agent")
        );
        assert_eq!(
            parse_reference("vmpod-agent:latest").unwrap(),
            (None, "vmpod-agent")
        );
        assert_eq!(
            parse_reference("demo/vmpod-agent:v2").unwrap(),
            (Some("demo"), "vmpod-agent")
        );
    }

    #[test]
    fn test_parse_reference_rejects_deep_paths() {
        let err = parse_reference("gcr.io/demo/vmpod-agent").unwrap_err();
        assert!(matches!(err, PodError::InvalidReference(_)));
        assert!(parse_reference("demo/").is_err());
        assert!(parse_reference("/vmpod-agent").is_err());
        assert!(parse_reference("").is_err());
    }
}
