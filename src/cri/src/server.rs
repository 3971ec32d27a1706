//! gRPC server setup for CRI services.
//!
//! Listens on a Unix domain socket for CRI RuntimeService and ImageService RPCs.
//! The image service is only served when an image provider is configured.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use vmpod_runtime::image::ImageProvider;
use vmpod_runtime::provider::PodProvider;

use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::image_service::VmPodImageService;
use crate::runtime_service::VmPodRuntimeService;

/// CRI gRPC server configuration.
pub struct CriServer {
    /// Path to the Unix domain socket.
    socket_path: PathBuf,
    pods: Arc<dyn PodProvider>,
    images: Option<Arc<dyn ImageProvider>>,
}

impl CriServer {
    /// Create a new CRI server.
    pub fn new(
        socket_path: PathBuf,
        pods: Arc<dyn PodProvider>,
        images: Option<Arc<dyn ImageProvider>>,
    ) -> Self {
        Self {
            socket_path,
            pods,
            images,
        }
    }

    /// Start serving CRI RPCs on the Unix socket.
    pub async fn serve(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` completes, then remove the socket.
    pub async fn serve_with_shutdown<F>(
        &self,
        signal: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        // Ensure parent directory exists
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runtime_service = VmPodRuntimeService::new(self.pods.clone(), self.images.clone());
        let image_service = self.images.clone().map(VmPodImageService::new);

        let uds = UnixListener::bind(&self.socket_path)?;
        let uds_stream = UnixListenerStream::new(uds);

        tracing::info!(
            socket = %self.socket_path.display(),
            pod_provider = self.pods.name(),
            image_provider = self.images.as_ref().map(|i| i.name()).unwrap_or("none"),
            "CRI server listening"
        );

        Server::builder()
            .add_service(RuntimeServiceServer::new(runtime_service))
            .add_optional_service(image_service.map(ImageServiceServer::new))
            .serve_with_incoming_shutdown(uds_stream, signal)
            .await?;

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(socket = %self.socket_path.display(), error = %e, "Failed to remove socket");
        }
        tracing::info!("CRI server stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use vmpod_runtime::provider::VmPodProvider;
    use vmpod_runtime::testing::{FakeBackend, FakeConnector};

    fn pods() -> Arc<dyn PodProvider> {
        Arc::new(VmPodProvider::new(
            FakeBackend::new(),
            Arc::new(FakeConnector::new()),
        ))
    }

    #[tokio::test]
    async fn test_serve_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("vmpod.sock");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, b"stale").unwrap();

        let server = CriServer::new(socket.clone(), pods(), None);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .map_err(|e| e.to_string())
        });

        // Wait for the listener to replace the stale file
        let mut bound = false;
        for _ in 0..100 {
            if std::fs::metadata(&socket)
                .map(|m| m.len() == 0)
                .unwrap_or(false)
            {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(bound);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
