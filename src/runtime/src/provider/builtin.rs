//! Registration of the backends compiled into this crate.

use std::sync::Arc;

use futures::FutureExt;
use vmpod_core::config::{load_backend_config, Ec2Config, GceConfig, VirtualBoxConfig};
use vmpod_core::error::{PodError, Result};

use super::registry::{ProviderContext, ProviderRegistry};
use super::{PodProvider, VmPodProvider};
use crate::image::{CatalogImageProvider, ImageProvider};
use crate::vmm::{
    Ec2Backend, Ec2ImageCatalog, GceBackend, GceImageCatalog, VirtualBoxBackend, EC2_BACKEND,
    GCE_BACKEND, VIRTUALBOX_BACKEND,
};

/// Register the `aws` pod and image providers.
pub fn register_ec2(registry: &mut ProviderRegistry) -> Result<()> {
    registry.pods.register(
        EC2_BACKEND,
        Arc::new(|ctx: ProviderContext| {
            async move {
                let config: Ec2Config = load_backend_config(&ctx.config_dir)?;
                let backend = Ec2Backend::new(config);
                backend.validate_credentials().await?;
                let provider: Arc<dyn PodProvider> =
                    Arc::new(VmPodProvider::new(backend, ctx.connector));
                Ok::<_, PodError>(provider)
            }
            .boxed()
        }),
    )?;

    registry.images.register(
        EC2_BACKEND,
        Arc::new(|ctx: ProviderContext| {
            async move {
                let config: Ec2Config = load_backend_config(&ctx.config_dir)?;
                let provider: Arc<dyn ImageProvider> =
                    Arc::new(CatalogImageProvider::new(Ec2ImageCatalog::new(config)));
                Ok::<_, PodError>(provider)
            }
            .boxed()
        }),
    )
}

/// Register the `gcp` pod and image providers.
pub fn register_gce(registry: &mut ProviderRegistry) -> Result<()> {
    registry.pods.register(
        GCE_BACKEND,
        Arc::new(|ctx: ProviderContext| {
            async move {
                let config: GceConfig = load_backend_config(&ctx.config_dir)?;
                let backend = GceBackend::new(config);
                backend.activate().await?;
                let provider: Arc<dyn PodProvider> =
                    Arc::new(VmPodProvider::new(backend, ctx.connector));
                Ok::<_, PodError>(provider)
            }
            .boxed()
        }),
    )?;

    registry.images.register(
        GCE_BACKEND,
        Arc::new(|ctx: ProviderContext| {
            async move {
                let config: GceConfig = load_backend_config(&ctx.config_dir)?;
                let catalog = GceImageCatalog::new(config);
                catalog.activate().await?;
                let provider: Arc<dyn ImageProvider> =
                    Arc::new(CatalogImageProvider::new(catalog));
                Ok::<_, PodError>(provider)
            }
            .boxed()
        }),
    )
}

/// Register the `virtualbox` pod provider. VirtualBox has no image catalog.
pub fn register_virtualbox(registry: &mut ProviderRegistry) -> Result<()> {
    registry.pods.register(
        VIRTUALBOX_BACKEND,
        Arc::new(|ctx: ProviderContext| {
            async move {
                let config: VirtualBoxConfig = load_backend_config(&ctx.config_dir)?;
                let provider: Arc<dyn PodProvider> = Arc::new(VmPodProvider::new(
                    VirtualBoxBackend::new(config),
                    ctx.connector,
                ));
                Ok::<_, PodError>(provider)
            }
            .boxed()
        }),
    )
}
