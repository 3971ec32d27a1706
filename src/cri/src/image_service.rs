//! CRI ImageService implementation.
//!
//! Maps CRI image operations to the configured image provider. Images are
//! catalog entries the backend can boot; pulling resolves a reference in the
//! catalog and moves no bytes.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use vmpod_runtime::image::ImageProvider;

use crate::config_mapper::image_record_to_cri;
use crate::cri_api::image_service_server::ImageService;
use crate::cri_api::*;
use crate::error::pod_error_to_status;

/// vmpod implementation of the CRI ImageService.
pub struct VmPodImageService {
    images: Arc<dyn ImageProvider>,
}

impl VmPodImageService {
    pub fn new(images: Arc<dyn ImageProvider>) -> Self {
        Self { images }
    }
}

fn required_image(image: Option<ImageSpec>) -> Result<String, Status> {
    image
        .map(|spec| spec.image)
        .ok_or_else(|| Status::invalid_argument("image spec required"))
}

#[tonic::async_trait]
impl ImageService for VmPodImageService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();
        let filter = req
            .filter
            .and_then(|f| f.image)
            .map(|spec| spec.image)
            .filter(|image| !image.is_empty());

        let images: Vec<Image> = self
            .images
            .list(filter.as_deref())
            .into_iter()
            .map(|record| image_record_to_cri(None, record))
            .collect();

        tracing::debug!(count = images.len(), "CRI ListImages");

        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let req = request.into_inner();
        let reference = required_image(req.image)?;

        let image = self
            .images
            .status(&reference)
            .map(|record| image_record_to_cri(Some(&reference), record));

        Ok(Response::new(ImageStatusResponse {
            image,
            info: Default::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let req = request.into_inner();
        let reference = required_image(req.image)?;

        tracing::info!(image = %reference, provider = self.images.name(), "CRI PullImage");

        let image_ref = self
            .images
            .pull(&reference)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let req = request.into_inner();
        let reference = required_image(req.image)?;

        tracing::info!(image = %reference, "CRI RemoveImage");

        self.images
            .remove(&reference)
            .map_err(pod_error_to_status)?;

        Ok(Response::new(RemoveImageResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;
    use vmpod_runtime::image::{CatalogImageProvider, ImageRecord};
    use vmpod_runtime::testing::FakeCatalog;

    fn record(id: &str, name: &str) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            repo_tags: vec![name.to_string()],
            repo_digests: vec![id.to_string()],
            size: 8 << 30,
        }
    }

    fn service() -> VmPodImageService {
        let catalog = FakeCatalog::new("aws");
        catalog.add(None, record("ami-agent", "vmpod-agent"));
        catalog.add(Some("team"), record("ami-team", "base"));
        catalog.add(None, record("ami-a", "ubuntu"));
        catalog.add(None, record("ami-b", "ubuntu"));
        VmPodImageService::new(Arc::new(CatalogImageProvider::new(catalog)))
    }

    fn spec(image: &str) -> Option<ImageSpec> {
        Some(ImageSpec {
            image: image.to_string(),
            annotations: Default::default(),
        })
    }

    async fn pull(service: &VmPodImageService, image: &str) -> Result<String, Status> {
        service
            .pull_image(Request::new(PullImageRequest {
                image: spec(image),
                sandbox_config: None,
            }))
            .await
            .map(|resp| resp.into_inner().image_ref)
    }

    async fn status(service: &VmPodImageService, image: &str) -> Option<Image> {
        service
            .image_status(Request::new(ImageStatusRequest {
                image: spec(image),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner()
            .image
    }

    #[tokio::test]
    async fn test_pull_then_status() {
        let service = service();
        assert_eq!(pull(&service, "vmpod-agent:latest").await.unwrap(), "ami-agent");

        let image = status(&service, "vmpod-agent").await.unwrap();
        assert_eq!(image.id, "ami-agent");
        assert_eq!(image.spec.unwrap().image, "vmpod-agent");
    }

    #[tokio::test]
    async fn test_qualified_pull() {
        let service = service();
        assert_eq!(pull(&service, "team/base:latest").await.unwrap(), "ami-team");
    }

    #[tokio::test]
    async fn test_status_of_unknown_image_is_empty() {
        let service = service();
        assert!(status(&service, "nothing:latest").await.is_none());
    }

    #[tokio::test]
    async fn test_pull_errors() {
        let service = service();

        let err = pull(&service, "missing:latest").await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = pull(&service, "ubuntu:latest").await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let err = pull(&service, "a/b/c").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = service
            .pull_image(Request::new(PullImageRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let service = service();
        pull(&service, "vmpod-agent:latest").await.unwrap();
        pull(&service, "team/base:latest").await.unwrap();

        let all = service
            .list_images(Request::new(ListImagesRequest { filter: None }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(all.images.len(), 2);

        let filtered = service
            .list_images(Request::new(ListImagesRequest {
                filter: Some(ImageFilter {
                    image: spec("team/base"),
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(filtered.images.len(), 1);
        assert_eq!(filtered.images[0].id, "ami-team");

        service
            .remove_image(Request::new(RemoveImageRequest {
                image: spec("team/base:latest"),
            }))
            .await
            .unwrap();
        assert!(status(&service, "team/base:latest").await.is_none());

        // Forgetting an unknown image succeeds
        service
            .remove_image(Request::new(RemoveImageRequest {
                image: spec("never-pulled:latest"),
            }))
            .await
            .unwrap();
    }
}
