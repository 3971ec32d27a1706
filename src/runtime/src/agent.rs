//! Connections to the agent running inside each sandbox VM.
//!
//! The agent speaks the CRI `RuntimeService` itself, so container requests
//! are forwarded to it unchanged and its answers (or its error statuses) are
//! handed back the same way.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint};
use vmpod_core::cri_api::runtime_service_client::RuntimeServiceClient;
use vmpod_core::cri_api::{
    ContainerStatusRequest, ContainerStatusResponse, CreateContainerRequest,
    CreateContainerResponse, ListContainersRequest, ListContainersResponse,
    RemoveContainerRequest, RemoveContainerResponse, StartContainerRequest,
    StartContainerResponse, StopContainerRequest, StopContainerResponse,
};
use vmpod_core::error::{PodError, Result};

/// Default TCP port the in-VM agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 2375;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// An established channel to one sandbox's agent.
///
/// Agent-side failures surface as `PodError::GrpcError` carrying the agent's
/// status untouched.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse>;

    async fn start_container(&self, request: StartContainerRequest)
        -> Result<StartContainerResponse>;

    async fn stop_container(&self, request: StopContainerRequest) -> Result<StopContainerResponse>;

    async fn remove_container(
        &self,
        request: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse>;

    async fn list_containers(&self, request: ListContainersRequest)
        -> Result<ListContainersResponse>;

    async fn container_status(
        &self,
        request: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse>;

    /// Release the channel. Calls made afterwards fail.
    async fn close(&self);
}

/// Opens agent connections for freshly provisioned VMs.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, address: IpAddr) -> Result<Arc<dyn AgentConnection>>;
}

/// Connects to agents over plaintext gRPC on a fixed port.
#[derive(Debug, Clone)]
pub struct GrpcAgentConnector {
    port: u16,
    connect_timeout: Duration,
}

impl GrpcAgentConnector {
    /// `connect_timeout` bounds the whole connect, including retries while
    /// the agent is still starting.
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    fn uri(&self, address: IpAddr) -> String {
        match address {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.port),
        }
    }
}

impl Default for GrpcAgentConnector {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PORT, Duration::from_secs(30))
    }
}

#[async_trait]
impl AgentConnector for GrpcAgentConnector {
    async fn connect(&self, address: IpAddr) -> Result<Arc<dyn AgentConnection>> {
        let uri = self.uri(address);
        let unreachable = |message: String| PodError::AgentUnreachable {
            address: uri.clone(),
            message,
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| unreachable(e.to_string()))?
            .connect_timeout(self.connect_timeout);

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let channel = loop {
            match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    tracing::debug!(address = %uri, error = %e, "Agent not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(unreachable(e.to_string())),
            }
        };

        tracing::info!(address = %uri, "Connected to sandbox agent");

        Ok(Arc::new(GrpcAgentConnection {
            address: uri,
            client: Mutex::new(Some(RuntimeServiceClient::new(channel))),
        }))
    }
}

/// tonic client to one agent.
pub struct GrpcAgentConnection {
    address: String,
    client: Mutex<Option<RuntimeServiceClient<Channel>>>,
}

impl GrpcAgentConnection {
    // Clients are cheap clones over one channel; the lock is only held to copy.
    fn client(&self) -> Result<RuntimeServiceClient<Channel>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| PodError::GrpcError(tonic::Status::unavailable("agent connection closed")))
    }
}

#[async_trait]
impl AgentConnection for GrpcAgentConnection {
    async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        Ok(self.client()?.create_container(request).await?.into_inner())
    }

    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        Ok(self.client()?.start_container(request).await?.into_inner())
    }

    async fn stop_container(&self, request: StopContainerRequest) -> Result<StopContainerResponse> {
        Ok(self.client()?.stop_container(request).await?.into_inner())
    }

    async fn remove_container(
        &self,
        request: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse> {
        Ok(self.client()?.remove_container(request).await?.into_inner())
    }

    async fn list_containers(
        &self,
        request: ListContainersRequest,
    ) -> Result<ListContainersResponse> {
        Ok(self.client()?.list_containers(request).await?.into_inner())
    }

    async fn container_status(
        &self,
        request: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse> {
        Ok(self.client()?.container_status(request).await?.into_inner())
    }

    async fn close(&self) {
        if self.client.lock().take().is_some() {
            tracing::debug!(address = %self.address, "Closed agent connection");
        }
    }
}
