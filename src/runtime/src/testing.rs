//! In-memory fakes of the backend, agent and image catalog.
//!
//! Available to this crate's tests and, with the `testing` feature, to
//! downstream crates.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use vmpod_core::cri_api::{
    Container, ContainerStatus, ContainerStatusRequest, ContainerStatusResponse,
    CreateContainerRequest, CreateContainerResponse, ListContainersRequest,
    ListContainersResponse, RemoveContainerRequest, RemoveContainerResponse,
    StartContainerRequest, StartContainerResponse, StopContainerRequest, StopContainerResponse,
};
use vmpod_core::error::{PodError, Result};

use crate::agent::{AgentConnection, AgentConnector};
use crate::image::{ImageCatalog, ImageRecord};
use crate::vmm::{VmBackend, VmHandle, VmSpec, VmState};

/// Scriptable VM backend.
pub struct FakeBackend {
    name: &'static str,
    catalog: Option<&'static str>,
    next_id: AtomicUsize,
    vms: Mutex<HashMap<String, VmState>>,
    specs: Mutex<Vec<VmSpec>>,
    provision_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    state_calls: AtomicUsize,
    fail_provision: AtomicBool,
    fail_destroy: AtomicBool,
    fail_state: AtomicBool,
    no_address: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            name: "fake",
            catalog: None,
            next_id: AtomicUsize::new(0),
            vms: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            provision_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            state_calls: AtomicUsize::new(0),
            fail_provision: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            fail_state: AtomicBool::new(false),
            no_address: AtomicBool::new(false),
        }
    }

    /// A backend that can boot images from the named catalog.
    pub fn with_catalog(catalog: &'static str) -> Self {
        Self {
            catalog: Some(catalog),
            ..Self::new()
        }
    }

    pub fn set_state(&self, id: &str, state: VmState) {
        self.vms.lock().insert(id.to_string(), state);
    }

    pub fn fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_state(&self, fail: bool) {
        self.fail_state.store(fail, Ordering::SeqCst);
    }

    /// Report no addresses for VMs provisioned from now on.
    pub fn withhold_addresses(&self, withhold: bool) {
        self.no_address.store(withhold, Ordering::SeqCst);
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn state_calls(&self) -> usize {
        self.state_calls.load(Ordering::SeqCst)
    }

    /// Specs of every provision call, in order.
    pub fn provisioned(&self) -> Vec<VmSpec> {
        self.specs.lock().clone()
    }

    /// VMs provisioned and not yet destroyed.
    pub fn live_vms(&self) -> usize {
        self.vms.lock().len()
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn fake_address(id: &str) -> IpAddr {
    let n = id
        .rsplit('-')
        .next()
        .and_then(|n| n.parse::<u8>().ok())
        .unwrap_or(0);
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
}

#[async_trait]
impl VmBackend for FakeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn image_catalog(&self) -> Option<&'static str> {
        self.catalog
    }

    async fn provision(&self, spec: &VmSpec) -> Result<VmHandle> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(PodError::ProvisionError {
                backend: self.name.to_string(),
                message: "quota exceeded".to_string(),
            });
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("vm-{}", n);
        self.vms.lock().insert(id.clone(), VmState::Running);
        Ok(VmHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn destroy(&self, handle: &VmHandle) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(PodError::DestroyError {
                id: handle.id.clone(),
                message: "VM is locked".to_string(),
            });
        }
        self.vms.lock().remove(&handle.id);
        Ok(())
    }

    async fn addresses(&self, handle: &VmHandle) -> Result<Vec<IpAddr>> {
        if self.no_address.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![fake_address(&handle.id)])
    }

    async fn state(&self, handle: &VmHandle) -> Result<VmState> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_state.load(Ordering::SeqCst) {
            return Err(PodError::BackendError {
                backend: self.name.to_string(),
                message: "throttled".to_string(),
            });
        }
        Ok(self
            .vms
            .lock()
            .get(&handle.id)
            .cloned()
            .unwrap_or(VmState::Terminated))
    }
}

/// One forwarded call seen by a [`FakeAgent`]: method name and the id it named.
pub type AgentCall = (&'static str, String);

/// Agent that answers from memory and records what it was asked.
pub struct FakeAgent {
    address: IpAddr,
    calls: Mutex<Vec<AgentCall>>,
    containers: Mutex<Vec<Container>>,
    error: Mutex<Option<tonic::Status>>,
    next_container: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeAgent {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            next_container: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Answer every later call with `status`.
    pub fn fail_with(&self, status: tonic::Status) {
        *self.error.lock() = Some(status);
    }

    /// Containers returned by `list_containers`.
    pub fn set_containers(&self, containers: Vec<Container>) {
        *self.containers.lock() = containers;
    }

    fn record(&self, method: &'static str, id: &str) -> Result<()> {
        self.calls.lock().push((method, id.to_string()));
        match self.error.lock().clone() {
            Some(status) => Err(PodError::GrpcError(status)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentConnection for FakeAgent {
    async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        self.record("create_container", &request.pod_sandbox_id)?;
        let n = self.next_container.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreateContainerResponse {
            container_id: format!("{}:c{}", request.pod_sandbox_id, n),
        })
    }

    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        self.record("start_container", &request.container_id)?;
        Ok(StartContainerResponse {})
    }

    async fn stop_container(&self, request: StopContainerRequest) -> Result<StopContainerResponse> {
        self.record("stop_container", &request.container_id)?;
        Ok(StopContainerResponse {})
    }

    async fn remove_container(
        &self,
        request: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse> {
        self.record("remove_container", &request.container_id)?;
        Ok(RemoveContainerResponse {})
    }

    async fn list_containers(
        &self,
        request: ListContainersRequest,
    ) -> Result<ListContainersResponse> {
        let id = request
            .filter
            .map(|f| f.pod_sandbox_id)
            .unwrap_or_default();
        self.record("list_containers", &id)?;
        Ok(ListContainersResponse {
            containers: self.containers.lock().clone(),
        })
    }

    async fn container_status(
        &self,
        request: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse> {
        self.record("container_status", &request.container_id)?;
        Ok(ContainerStatusResponse {
            status: Some(ContainerStatus {
                id: request.container_id,
                ..Default::default()
            }),
            info: HashMap::new(),
        })
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeAgent`]s.
#[derive(Default)]
pub struct FakeConnector {
    agents: Mutex<Vec<Arc<FakeAgent>>>,
    fail: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every agent connected so far.
    pub fn agents(&self) -> Vec<Arc<FakeAgent>> {
        self.agents.lock().clone()
    }

    pub fn agent_at(&self, address: IpAddr) -> Option<Arc<FakeAgent>> {
        self.agents
            .lock()
            .iter()
            .find(|a| a.address == address)
            .cloned()
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self, address: IpAddr) -> Result<Arc<dyn AgentConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PodError::AgentUnreachable {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let agent = Arc::new(FakeAgent::new(address));
        self.agents.lock().push(agent.clone());
        Ok(agent as Arc<dyn AgentConnection>)
    }
}

/// Image catalog answering from a fixed table.
pub struct FakeCatalog {
    name: &'static str,
    images: Mutex<Vec<(Option<String>, ImageRecord)>>,
    queries: Mutex<Vec<(Option<String>, String)>>,
}

impl FakeCatalog {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            images: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Add an image, optionally scoped to a qualifier (project or owner).
    pub fn add(&self, qualifier: Option<&str>, record: ImageRecord) {
        self.images
            .lock()
            .push((qualifier.map(str::to_string), record));
    }

    /// `(qualifier, name)` of every query, in order.
    pub fn queries(&self) -> Vec<(Option<String>, String)> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl ImageCatalog for FakeCatalog {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn find(&self, qualifier: Option<&str>, name: &str) -> Result<Vec<ImageRecord>> {
        self.queries
            .lock()
            .push((qualifier.map(str::to_string), name.to_string()));
        Ok(self
            .images
            .lock()
            .iter()
            .filter(|(q, r)| {
                q.as_deref() == qualifier && r.repo_tags.iter().any(|t| t == name)
            })
            .map(|(_, r)| r.clone())
            .collect())
    }
}
