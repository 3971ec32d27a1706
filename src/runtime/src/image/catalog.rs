//! CatalogImageProvider - image directory backed by a backend catalog.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use vmpod_core::error::{PodError, Result};

use super::{normalize_reference, parse_reference, ImageCatalog, ImageProvider, ImageRecord};
use crate::provider::PodProvider;

/// Image provider remembering catalog lookups by reference.
pub struct CatalogImageProvider<C: ImageCatalog> {
    catalog: C,
    images: RwLock<HashMap<String, ImageRecord>>,
}

impl<C: ImageCatalog> CatalogImageProvider<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            images: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }
}

#[async_trait]
impl<C: ImageCatalog> ImageProvider for CatalogImageProvider<C> {
    fn name(&self) -> &'static str {
        self.catalog.name()
    }

    fn list(&self, filter: Option<&str>) -> Vec<ImageRecord> {
        let images = self.images.read();
        match filter {
            Some(reference) => images
                .get(&normalize_reference(reference))
                .cloned()
                .into_iter()
                .collect(),
            None => images.values().cloned().collect(),
        }
    }

    fn status(&self, reference: &str) -> Option<ImageRecord> {
        self.images
            .read()
            .get(&normalize_reference(reference))
            .cloned()
    }

    async fn pull(&self, reference: &str) -> Result<String> {
        let (qualifier, name) = parse_reference(reference)?;

        let mut matches = self.catalog.find(qualifier, name).await?;
        let image = match matches.len() {
            0 => return Err(PodError::image_not_found(reference)),
            1 => matches.remove(0),
            n => {
                return Err(PodError::AmbiguousImage {
                    reference: reference.to_string(),
                    matches: n,
                })
            }
        };

        let id = image.id.clone();
        self.images.write().insert(reference.to_string(), image);

        tracing::info!(catalog = self.catalog.name(), reference, image_id = %id, "Image pulled");
        Ok(id)
    }

    fn remove(&self, reference: &str) -> Result<()> {
        if self.images.write().remove(reference).is_some() {
            tracing::info!(reference, "Image removed");
        }
        Ok(())
    }

    fn translate(&self, reference: &str) -> String {
        reference.to_string()
    }

    fn integrate(&self, pods: &dyn PodProvider) -> bool {
        let Some(integration) = pods.image_integration() else {
            return false;
        };
        if integration.image_catalog() != self.catalog.name() {
            return false;
        }
        integration.enable_image_boot();
        true
    }
}
