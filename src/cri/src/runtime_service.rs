//! CRI RuntimeService implementation.
//!
//! Sandbox calls go to the configured pod provider. Container calls are
//! routed by container id, `<sandboxId>:<token>`, to the agent inside the
//! owning sandbox VM and forwarded unchanged; the agent's answer (or error)
//! comes back unchanged too.

use std::sync::Arc;

use futures::future::join_all;
use tonic::{Request, Response, Status};
use vmpod_core::error::PodError;
use vmpod_runtime::agent::AgentConnection;
use vmpod_runtime::image::ImageProvider;
use vmpod_runtime::provider::PodProvider;

use crate::config_mapper::{
    pod_sandbox_config_to_spec, pod_sandbox_filter, sandbox_status_to_cri,
    sandbox_status_to_pod_sandbox,
};
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::cri_api::*;
use crate::error::pod_error_to_status;

/// Runtime name reported by `Version`.
pub const RUNTIME_NAME: &str = "vmpod";

/// Sandbox id part of a container id. An id without a colon is all sandbox id.
pub fn sandbox_id_from_container_id(container_id: &str) -> &str {
    container_id.split(':').next().unwrap_or(container_id)
}

/// vmpod implementation of the CRI RuntimeService.
pub struct VmPodRuntimeService {
    pods: Arc<dyn PodProvider>,
    /// Translates a sandbox's requested boot image into a backend image name
    images: Option<Arc<dyn ImageProvider>>,
}

impl VmPodRuntimeService {
    pub fn new(pods: Arc<dyn PodProvider>, images: Option<Arc<dyn ImageProvider>>) -> Self {
        Self { pods, images }
    }

    /// Agent of the sandbox owning `sandbox_id`.
    async fn agent(&self, sandbox_id: &str) -> Result<Arc<dyn AgentConnection>, Status> {
        self.pods
            .agent_connection(sandbox_id)
            .await
            .map_err(|e| match e {
                PodError::NotFound { .. } => {
                    pod_error_to_status(PodError::SandboxNotFound(sandbox_id.to_string()))
                }
                other => pod_error_to_status(other),
            })
    }

    async fn agent_for_container(
        &self,
        container_id: &str,
    ) -> Result<Arc<dyn AgentConnection>, Status> {
        self.agent(sandbox_id_from_container_id(container_id)).await
    }

    /// Ask every sandbox agent, skipping the ones that fail.
    async fn list_all_containers(&self, request: ListContainersRequest) -> Vec<Container> {
        let ids = self.pods.sandbox_ids();
        let lists = join_all(ids.iter().map(|id| {
            let request = request.clone();
            async move {
                let agent = self.agent(id).await.map_err(PodError::GrpcError)?;
                agent.list_containers(request).await
            }
        }))
        .await;

        ids.iter()
            .zip(lists)
            .filter_map(|(id, result)| match result {
                Ok(resp) => Some(resp.containers),
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Skipping sandbox in ListContainers");
                    None
                }
            })
            .flatten()
            .collect()
    }
}

#[tonic::async_trait]
impl RuntimeService for VmPodRuntimeService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let _req = request.into_inner();
        Ok(Response::new(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: vmpod_runtime::VERSION.to_string(),
            runtime_api_version: "v1".to_string(),
        }))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config required"))?;

        let mut spec = pod_sandbox_config_to_spec(&config, &req.runtime_handler);
        if let Some(images) = &self.images {
            spec.boot_image = spec.boot_image.as_deref().map(|image| images.translate(image));
        }

        tracing::info!(
            name = %spec.name,
            namespace = %spec.namespace,
            provider = self.pods.name(),
            boot_image = ?spec.boot_image,
            "CRI RunPodSandbox"
        );

        let sandbox_id = self.pods.create(spec).await.map_err(pod_error_to_status)?;

        Ok(Response::new(RunPodSandboxResponse {
            pod_sandbox_id: sandbox_id,
        }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(sandbox_id = %req.pod_sandbox_id, "CRI StopPodSandbox");

        self.pods
            .stop(&req.pod_sandbox_id)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(sandbox_id = %req.pod_sandbox_id, "CRI RemovePodSandbox");

        self.pods
            .remove(&req.pod_sandbox_id)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();

        tracing::debug!(sandbox_id = %req.pod_sandbox_id, "CRI PodSandboxStatus");

        let status = self
            .pods
            .status(&req.pod_sandbox_id)
            .await
            .map_err(pod_error_to_status)?;

        let mut info = std::collections::HashMap::new();
        if req.verbose {
            info.insert("backend".to_string(), self.pods.name().to_string());
            info.insert("vmState".to_string(), status.backend_state.to_string());
        }

        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(sandbox_status_to_cri(&status)),
            info,
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let filter = pod_sandbox_filter(req.filter.as_ref())?;

        let statuses = self.pods.list(&filter).await.map_err(pod_error_to_status)?;

        tracing::debug!(count = statuses.len(), "CRI ListPodSandbox");

        Ok(Response::new(ListPodSandboxResponse {
            items: statuses.iter().map(sandbox_status_to_pod_sandbox).collect(),
        }))
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(sandbox_id = %req.pod_sandbox_id, "CRI CreateContainer");

        let agent = self.agent(&req.pod_sandbox_id).await?;
        let resp = agent
            .create_container(req)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(resp))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(container_id = %req.container_id, "CRI StartContainer");

        let agent = self.agent_for_container(&req.container_id).await?;
        let resp = agent
            .start_container(req)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(resp))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(
            container_id = %req.container_id,
            timeout = req.timeout,
            "CRI StopContainer"
        );

        let agent = self.agent_for_container(&req.container_id).await?;
        let resp = agent
            .stop_container(req)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(resp))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(container_id = %req.container_id, "CRI RemoveContainer");

        let agent = self.agent_for_container(&req.container_id).await?;
        let resp = agent
            .remove_container(req)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(resp))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let (sandbox_id, container_id) = req
            .filter
            .as_ref()
            .map(|f| (f.pod_sandbox_id.clone(), f.id.clone()))
            .unwrap_or_default();

        tracing::debug!(
            sandbox_id = %sandbox_id,
            container_id = %container_id,
            "CRI ListContainers"
        );

        let route = if !sandbox_id.is_empty() {
            Some(sandbox_id.as_str())
        } else if !container_id.is_empty() {
            Some(sandbox_id_from_container_id(&container_id))
        } else {
            None
        };

        let containers = match route {
            Some(id) => {
                let agent = self.agent(id).await?;
                agent
                    .list_containers(req)
                    .await
                    .map_err(pod_error_to_status)?
                    .containers
            }
            None => self.list_all_containers(req).await,
        };

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();

        tracing::debug!(container_id = %req.container_id, "CRI ContainerStatus");

        let agent = self.agent_for_container(&req.container_id).await?;
        let resp = agent
            .container_status(req)
            .await
            .map_err(pod_error_to_status)?;

        Ok(Response::new(resp))
    }

    // ── Exec ─────────────────────────────────────────────────────────

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(container_id = %req.container_id, "CRI Exec");
        Err(pod_error_to_status(PodError::Unimplemented("Exec".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;

    use tonic::Code;
    use vmpod_runtime::provider::VmPodProvider;
    use vmpod_runtime::testing::{FakeAgent, FakeBackend, FakeConnector};

    struct Harness {
        connector: Arc<FakeConnector>,
        backend: Arc<FakeBackend>,
        service: VmPodRuntimeService,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let connector = Arc::new(FakeConnector::new());
        let pods: Arc<dyn PodProvider> =
            Arc::new(VmPodProvider::with_backend(backend.clone(), connector.clone()));
        Harness {
            connector,
            backend,
            service: VmPodRuntimeService::new(pods, None),
        }
    }

    fn run_request(name: &str, labels: &[(&str, &str)]) -> RunPodSandboxRequest {
        RunPodSandboxRequest {
            config: Some(PodSandboxConfig {
                metadata: Some(PodSandboxMetadata {
                    name: name.to_string(),
                    uid: format!("uid-{}", name),
                    namespace: "default".to_string(),
                    attempt: 0,
                }),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            }),
            runtime_handler: String::new(),
        }
    }

    async fn run_pod(h: &Harness, name: &str) -> String {
        h.service
            .run_pod_sandbox(Request::new(run_request(name, &[])))
            .await
            .unwrap()
            .into_inner()
            .pod_sandbox_id
    }

    async fn agent_of(h: &Harness, sandbox_id: &str) -> Arc<FakeAgent> {
        let status = h
            .service
            .pod_sandbox_status(Request::new(PodSandboxStatusRequest {
                pod_sandbox_id: sandbox_id.to_string(),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner()
            .status
            .unwrap();
        let ip: IpAddr = status.network.unwrap().ip.parse().unwrap();
        h.connector.agent_at(ip).unwrap()
    }

    #[test]
    fn test_sandbox_id_from_container_id() {
        assert_eq!(sandbox_id_from_container_id("sbx1:abc"), "sbx1");
        assert_eq!(sandbox_id_from_container_id("sbx1:abc:def"), "sbx1");
        assert_eq!(sandbox_id_from_container_id("sbx1"), "sbx1");
        assert_eq!(sandbox_id_from_container_id(""), "");
    }

    #[tokio::test]
    async fn test_version() {
        let h = harness();
        let resp = h
            .service
            .version(Request::new(VersionRequest {
                version: "v1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.version, "0.1.0");
        assert_eq!(resp.runtime_name, "vmpod");
        assert_eq!(resp.runtime_api_version, "v1");
    }

    #[tokio::test]
    async fn test_run_requires_config() {
        let h = harness();
        let err = h
            .service
            .run_pod_sandbox(Request::new(RunPodSandboxRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_sandbox_lifecycle() {
        let h = harness();
        let id = run_pod(&h, "web").await;

        let listed = h
            .service
            .list_pod_sandbox(Request::new(ListPodSandboxRequest { filter: None }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, id);
        assert_eq!(listed.items[0].state, PodSandboxState::SandboxReady as i32);

        h.service
            .stop_pod_sandbox(Request::new(StopPodSandboxRequest {
                pod_sandbox_id: id.clone(),
            }))
            .await
            .unwrap();

        let status = h
            .service
            .pod_sandbox_status(Request::new(PodSandboxStatusRequest {
                pod_sandbox_id: id.clone(),
                verbose: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            status.status.unwrap().state,
            PodSandboxState::SandboxNotready as i32
        );
        assert_eq!(status.info.get("vmState").map(String::as_str), Some("running"));

        h.service
            .remove_pod_sandbox(Request::new(RemovePodSandboxRequest {
                pod_sandbox_id: id.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(h.backend.live_vms(), 0);

        let err = h
            .service
            .remove_pod_sandbox(Request::new(RemovePodSandboxRequest { pod_sandbox_id: id }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_sandbox_is_not_found() {
        let h = harness();
        let err = h
            .service
            .stop_pod_sandbox(Request::new(StopPodSandboxRequest {
                pod_sandbox_id: "vm-404".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = h
            .service
            .pod_sandbox_status(Request::new(PodSandboxStatusRequest {
                pod_sandbox_id: "vm-404".to_string(),
                verbose: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_provision_failure_maps_to_internal() {
        let h = harness();
        h.backend.fail_provision(true);
        let err = h
            .service
            .run_pod_sandbox(Request::new(run_request("web", &[])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let h = harness();
        h.service
            .run_pod_sandbox(Request::new(run_request("web", &[("app", "web")])))
            .await
            .unwrap();
        h.service
            .run_pod_sandbox(Request::new(run_request("db", &[("app", "db")])))
            .await
            .unwrap();

        let listed = h
            .service
            .list_pod_sandbox(Request::new(ListPodSandboxRequest {
                filter: Some(PodSandboxFilter {
                    id: String::new(),
                    state: None,
                    label_selector: HashMap::from([("app".to_string(), "db".to_string())]),
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].metadata.as_ref().unwrap().name, "db");
    }

    #[tokio::test]
    async fn test_container_calls_route_to_owning_agent() {
        let h = harness();
        let first = run_pod(&h, "web").await;
        let second = run_pod(&h, "db").await;

        let created = h
            .service
            .create_container(Request::new(CreateContainerRequest {
                pod_sandbox_id: second.clone(),
                config: None,
                sandbox_config: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(created.container_id.starts_with(&format!("{}:", second)));

        let container_id = format!("{}:abc", second);
        h.service
            .start_container(Request::new(StartContainerRequest {
                container_id: container_id.clone(),
            }))
            .await
            .unwrap();
        h.service
            .stop_container(Request::new(StopContainerRequest {
                container_id: container_id.clone(),
                timeout: 10,
            }))
            .await
            .unwrap();
        let status = h
            .service
            .container_status(Request::new(ContainerStatusRequest {
                container_id: container_id.clone(),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.status.unwrap().id, container_id);
        h.service
            .remove_container(Request::new(RemoveContainerRequest {
                container_id: container_id.clone(),
            }))
            .await
            .unwrap();

        let calls = agent_of(&h, &second).await.calls();
        assert_eq!(
            calls,
            vec![
                ("create_container", second.clone()),
                ("start_container", container_id.clone()),
                ("stop_container", container_id.clone()),
                ("container_status", container_id.clone()),
                ("remove_container", container_id.clone()),
            ]
        );
        assert!(agent_of(&h, &first).await.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sandbox_in_container_id() {
        let h = harness();
        run_pod(&h, "web").await;

        let err = h
            .service
            .start_container(Request::new(StartContainerRequest {
                container_id: "sbx-missing:abc".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert!(err.message().contains("sbx-missing"));
    }

    #[tokio::test]
    async fn test_agent_error_passes_through() {
        let h = harness();
        let id = run_pod(&h, "web").await;
        agent_of(&h, &id)
            .await
            .fail_with(Status::failed_precondition("container is running"));

        let err = h
            .service
            .remove_container(Request::new(RemoveContainerRequest {
                container_id: format!("{}:abc", id),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(err.message(), "container is running");
    }

    #[tokio::test]
    async fn test_list_containers_routing() {
        let h = harness();
        let first = run_pod(&h, "web").await;
        let second = run_pod(&h, "db").await;

        let container = |sandbox: &str, token: &str| Container {
            id: format!("{}:{}", sandbox, token),
            pod_sandbox_id: sandbox.to_string(),
            ..Default::default()
        };
        agent_of(&h, &first)
            .await
            .set_containers(vec![container(&first, "a")]);
        let second_agent = agent_of(&h, &second).await;
        second_agent.set_containers(vec![container(&second, "b"), container(&second, "c")]);

        // By sandbox id
        let resp = h
            .service
            .list_containers(Request::new(ListContainersRequest {
                filter: Some(ContainerFilter {
                    pod_sandbox_id: second.clone(),
                    ..Default::default()
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.containers.len(), 2);

        // By composite container id
        let resp = h
            .service
            .list_containers(Request::new(ListContainersRequest {
                filter: Some(ContainerFilter {
                    id: format!("{}:a", first),
                    ..Default::default()
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.containers.len(), 1);

        // Fan out, skipping a failing agent
        second_agent.fail_with(Status::unavailable("agent restarting"));
        let resp = h
            .service
            .list_containers(Request::new(ListContainersRequest { filter: None }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.containers.len(), 1);
        assert_eq!(resp.containers[0].id, format!("{}:a", first));
    }

    /// Image provider mapping references to prefixed backend names.
    struct PrefixingImages;

    #[tonic::async_trait]
    impl ImageProvider for PrefixingImages {
        fn name(&self) -> &'static str {
            "aws"
        }

        fn list(&self, _filter: Option<&str>) -> Vec<vmpod_runtime::image::ImageRecord> {
            Vec::new()
        }

        fn status(&self, _reference: &str) -> Option<vmpod_runtime::image::ImageRecord> {
            None
        }

        async fn pull(&self, reference: &str) -> vmpod_core::error::Result<String> {
            Ok(reference.to_string())
        }

        fn remove(&self, _reference: &str) -> vmpod_core::error::Result<()> {
            Ok(())
        }

        fn translate(&self, reference: &str) -> String {
            format!("img-{}", reference)
        }

        fn integrate(&self, _pods: &dyn PodProvider) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_boot_image_goes_through_translation() {
        let backend = Arc::new(FakeBackend::with_catalog("aws"));
        let provider = Arc::new(VmPodProvider::with_backend(
            backend.clone(),
            Arc::new(FakeConnector::new()),
        ));
        provider
            .image_integration()
            .unwrap()
            .enable_image_boot();
        let service = VmPodRuntimeService::new(
            provider,
            Some(Arc::new(PrefixingImages) as Arc<dyn ImageProvider>),
        );

        let mut request = run_request("web", &[]);
        if let Some(config) = request.config.as_mut() {
            config.annotations.insert(
                crate::config_mapper::ANN_BOOT_IMAGE.to_string(),
                "vmpod-agent:latest".to_string(),
            );
        }
        service
            .run_pod_sandbox(Request::new(request))
            .await
            .unwrap();
        service
            .run_pod_sandbox(Request::new(run_request("db", &[])))
            .await
            .unwrap();

        let images: Vec<Option<String>> =
            backend.provisioned().into_iter().map(|spec| spec.image).collect();
        assert_eq!(
            images,
            vec![Some("img-vmpod-agent:latest".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_exec_is_unimplemented() {
        let h = harness();
        let err = h
            .service
            .exec(Request::new(ExecRequest {
                container_id: "vm-1:abc".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
