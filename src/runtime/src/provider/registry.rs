//! Provider registries.
//!
//! A name → constructor table built once at startup. The command line picks
//! the active pod provider (and optionally an image provider) by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use vmpod_core::error::{PodError, Result};

use super::PodProvider;
use crate::agent::AgentConnector;
use crate::image::ImageProvider;

/// What a provider constructor gets to work with.
#[derive(Clone)]
pub struct ProviderContext {
    /// Directory holding `<backend>.json` / `<backend>.yaml`
    pub config_dir: PathBuf,
    pub connector: Arc<dyn AgentConnector>,
}

/// Builds a pod provider; may validate credentials, hence async.
pub type PodProviderFactory =
    Arc<dyn Fn(ProviderContext) -> BoxFuture<'static, Result<Arc<dyn PodProvider>>> + Send + Sync>;

/// Builds an image provider.
pub type ImageProviderFactory =
    Arc<dyn Fn(ProviderContext) -> BoxFuture<'static, Result<Arc<dyn ImageProvider>>> + Send + Sync>;

/// Name → factory table.
pub struct Registry<F> {
    kind: &'static str,
    entries: HashMap<String, F>,
}

impl<F: Clone> Registry<F> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Register `factory` under `name`. Names are registered once.
    pub fn register(&mut self, name: &str, factory: F) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(PodError::AlreadyRegistered(format!("{} provider '{}'", self.kind, name)));
        }
        tracing::debug!(kind = self.kind, name, "Registered provider");
        self.entries.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<F> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| PodError::UnknownProvider {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Pod and image provider registries.
pub struct ProviderRegistry {
    pub pods: Registry<PodProviderFactory>,
    pub images: Registry<ImageProviderFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            pods: Registry::new("pod"),
            images: Registry::new("image"),
        }
    }

    /// A registry holding every backend compiled into this crate.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        super::register_ec2(&mut registry)?;
        super::register_gce(&mut registry)?;
        super::register_virtualbox(&mut registry)?;
        Ok(registry)
    }

    /// Construct the pod provider registered under `name`.
    pub async fn pod_provider(
        &self,
        name: &str,
        ctx: ProviderContext,
    ) -> Result<Arc<dyn PodProvider>> {
        let factory = self.pods.get(name)?;
        factory(ctx).await
    }

    /// Construct the image provider registered under `name`.
    pub async fn image_provider(
        &self,
        name: &str,
        ctx: ProviderContext,
    ) -> Result<Arc<dyn ImageProvider>> {
        let factory = self.images.get(name)?;
        factory(ctx).await
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
