//! HTTP client for the platform's JSON API.
//!
//! Mutating endpoints answer with a task record; the client polls
//! `/api/tasks/{id}` until the task reaches a terminal status so callers see
//! synchronous semantics.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use vcd_reconcile::{poll_until, PollError, PollPolicy};

use super::{ClientError, NetworkStore, ScopeResolver, VAppStore};
use crate::model::{
    AllocationMode, IpMode, NetworkObserved, NetworkSettings, ObservedVm, PowerStatus, Scope, ScopeHandle,
    VAppObserved, VAppSpec, VmUpdate,
};

/// Connection settings for [`RestClient`].
#[derive(Clone)]
pub struct RestConfig {
    /// Base URL of the API (e.g. `https://vcd.example.com`).
    pub base_url: String,

    /// Pre-issued bearer token.
    pub token: Option<String>,

    /// Per-request timeout.
    pub request_timeout: Duration,

    /// How to wait for asynchronous tasks.
    pub task_poll: PollPolicy,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: Duration::from_secs(30),
            task_poll: PollPolicy::default(),
        }
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("task_poll", &self.task_poll)
            .finish()
    }
}

/// Platform API client.
pub struct RestClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    task_poll: PollPolicy,
}

impl RestClient {
    /// Create a new client.
    pub fn new(config: RestConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::Transport(format!("invalid base url {}: {e}", config.base_url)))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            task_poll: config.task_poll,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Transport(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Platform request failed");
            let message = serde_json::from_str::<ErrorRecord>(&body)
                .map(|record| record.message)
                .unwrap_or(body);
            return Err(if status.is_client_error() {
                ClientError::Rejected(message)
            } else {
                ClientError::Transport(format!("{status}: {message}"))
            });
        }

        Ok(response.json().await?)
    }

    async fn get_task(&self, id: &str) -> Result<TaskRecord, ClientError> {
        let url = self.url(&["tasks", id])?;
        self.send(self.request(Method::GET, url)).await
    }

    /// Block until the task reaches a terminal status.
    async fn wait_for_task(&self, task: TaskRecord) -> Result<(), ClientError> {
        debug!(task_id = %task.id, status = %task.status, "Waiting for task");
        let resource = format!("task {}", task.id);
        let this = self;

        let result = poll_until(&self.task_poll, &resource, move || {
            let id = task.id.clone();
            async move {
                let current = this.get_task(&id).await?;
                let status = current.status.clone();
                match status.as_str() {
                    "success" => Ok(Some(())),
                    "error" | "aborted" | "canceled" => Err(ClientError::TaskFailed {
                        task: current.id,
                        status: current.status,
                        message: current.error.map(|e| e.message).unwrap_or_default(),
                    }),
                    _ => Ok(None),
                }
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Timeout { resource, elapsed }) => Err(ClientError::TaskTimeout {
                task: resource,
                message: format!("still running after {elapsed:?}"),
            }),
        }
    }

    async fn run_task(&self, builder: reqwest::RequestBuilder) -> Result<(), ClientError> {
        let task: TaskRecord = self.send(builder).await?;
        self.wait_for_task(task).await
    }
}

// ============================================================================
// Wire records
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorRecord {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ScopeRecord {
    org_id: String,
    vdc_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskRecord {
    id: String,
    status: String,
    #[serde(default)]
    error: Option<ErrorRecord>,
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    status: i32,
}

#[derive(Debug, Deserialize)]
struct VmRecord {
    name: String,
    #[serde(default)]
    network_name: Option<String>,
    #[serde(default)]
    ip_allocation_mode: Option<AllocationMode>,
    #[serde(default)]
    ip_address: Option<Ipv4Addr>,
    cpus: u32,
    memory_mb: u32,
}

#[derive(Debug, Deserialize)]
struct VAppRecord {
    id: String,
    name: String,
    status: i32,
    template_name: String,
    catalog_name: String,
    #[serde(default)]
    vms: Vec<VmRecord>,
}

impl From<VAppRecord> for VAppObserved {
    fn from(record: VAppRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: PowerStatus::from_code(record.status),
            template_name: record.template_name,
            catalog_name: record.catalog_name,
            vms: record
                .vms
                .into_iter()
                .map(|vm| ObservedVm {
                    name: vm.name,
                    network_name: vm.network_name,
                    allocation_mode: vm.ip_allocation_mode,
                    ip: vm.ip_address,
                    cpus: vm.cpus,
                    memory_mb: vm.memory_mb,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NetworkRecord {
    id: String,
    name: String,
    #[serde(flatten)]
    settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
struct AddressList {
    values: Vec<Ipv4Addr>,
}

#[derive(Debug, Serialize)]
struct CreateVAppRequest<'a> {
    name: &'a str,
    catalog_name: &'a str,
    template_name: &'a str,
    vm_name: &'a str,
    network_name: &'a str,
    ip_allocation_mode: AllocationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<Ipv4Addr>,
    cpus: u32,
    memory_mb: u32,
    power_on: bool,
}

#[derive(Debug, Serialize)]
struct ReconfigureRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_allocation_mode: Option<AllocationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<Ipv4Addr>,
}

#[derive(Debug, Serialize)]
struct NetworkRequest<'a> {
    name: &'a str,
    #[serde(flatten)]
    settings: &'a NetworkSettings,
}

fn static_address(ip: &IpMode) -> Option<Ipv4Addr> {
    match ip {
        IpMode::Static(addr) => Some(*addr),
        _ => None,
    }
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl ScopeResolver for RestClient {
    async fn resolve_scope(&self, org: &str, vdc: &str) -> Result<ScopeHandle, ClientError> {
        let url = self.url(&["orgs", org, "vdcs", vdc])?;
        let record: ScopeRecord = self.send(self.request(Method::GET, url)).await?;
        debug!(org, vdc, vdc_id = %record.vdc_id, "Resolved scope");

        Ok(ScopeHandle {
            scope: Scope::new(org, vdc),
            org_id: record.org_id,
            vdc_id: record.vdc_id,
        })
    }
}

#[async_trait]
impl VAppStore for RestClient {
    async fn find_vapp_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<VAppObserved, ClientError> {
        let url = self.url(&["vdcs", &scope.vdc_id, "vapps", name])?;
        let record: VAppRecord = self.send(self.request(Method::GET, url)).await?;
        Ok(record.into())
    }

    async fn read_status(
        &self,
        _scope: &ScopeHandle,
        vapp: &VAppObserved,
    ) -> Result<PowerStatus, ClientError> {
        let url = self.url(&["vapps", &vapp.id, "status"])?;
        let record: StatusRecord = self.send(self.request(Method::GET, url)).await?;
        Ok(PowerStatus::from_code(record.status))
    }

    async fn create_vapp(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
    ) -> Result<VAppObserved, ClientError> {
        let body = CreateVAppRequest {
            name: &spec.name,
            catalog_name: &spec.catalog_name,
            template_name: &spec.template_name,
            vm_name: &spec.name,
            network_name: &spec.network_name,
            ip_allocation_mode: spec.ip.allocation_mode(),
            ip_address: static_address(&spec.ip),
            cpus: spec.cpus,
            memory_mb: spec.memory_mb,
            power_on: false,
        };
        let url = self.url(&["vdcs", &scope.vdc_id, "vapps"])?;
        self.run_task(self.request(Method::POST, url).json(&body))
            .await?;

        self.find_vapp_by_name(scope, &spec.name).await
    }

    async fn update_vm(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
        update: &VmUpdate,
    ) -> Result<VAppObserved, ClientError> {
        let connection = update.connection.as_ref();
        let body = ReconfigureRequest {
            cpus: update.cpus,
            memory_mb: update.memory_mb,
            network_name: connection.map(|c| c.network_name.as_str()),
            ip_allocation_mode: connection.map(|c| c.ip.allocation_mode()),
            ip_address: connection.and_then(|c| static_address(&c.ip)),
        };
        let url = self.url(&["vapps", &vapp.id, "vm", "reconfigure"])?;
        self.run_task(self.request(Method::POST, url).json(&body))
            .await?;

        self.find_vapp_by_name(scope, &vapp.name).await
    }

    async fn power_on(&self, _scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError> {
        let url = self.url(&["vapps", &vapp.id, "power", "action", "powerOn"])?;
        self.run_task(self.request(Method::POST, url)).await
    }

    async fn power_off(
        &self,
        _scope: &ScopeHandle,
        vapp: &VAppObserved,
    ) -> Result<(), ClientError> {
        let url = self.url(&["vapps", &vapp.id, "power", "action", "powerOff"])?;
        self.run_task(self.request(Method::POST, url)).await
    }

    async fn delete(&self, _scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError> {
        let url = self.url(&["vapps", &vapp.id])?;
        self.run_task(self.request(Method::DELETE, url)).await
    }
}

#[async_trait]
impl NetworkStore for RestClient {
    async fn find_network_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<NetworkObserved, ClientError> {
        let url = self.url(&["vdcs", &scope.vdc_id, "networks", name])?;
        let record: NetworkRecord = self.send(self.request(Method::GET, url)).await?;
        Ok(NetworkObserved {
            id: record.id,
            name: record.name,
            settings: record.settings,
        })
    }

    async fn create_network(
        &self,
        scope: &ScopeHandle,
        name: &str,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError> {
        let url = self.url(&["vdcs", &scope.vdc_id, "networks"])?;
        let body = NetworkRequest { name, settings };
        self.run_task(self.request(Method::POST, url).json(&body))
            .await?;

        self.find_network_by_name(scope, name).await
    }

    async fn update_network(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError> {
        let url = self.url(&["networks", &network.id])?;
        let body = NetworkRequest {
            name: &network.name,
            settings,
        };
        self.run_task(self.request(Method::PUT, url).json(&body))
            .await?;

        self.find_network_by_name(scope, &network.name).await
    }

    async fn delete_network(
        &self,
        _scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<(), ClientError> {
        let url = self.url(&["networks", &network.id])?;
        self.run_task(self.request(Method::DELETE, url)).await
    }

    async fn allocated_addresses(
        &self,
        _scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<Vec<Ipv4Addr>, ClientError> {
        let url = self.url(&["networks", &network.id, "allocatedAddresses"])?;
        let list: AddressList = self.send(self.request(Method::GET, url)).await?;
        Ok(list.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RestClient {
        let mut config = RestConfig::new(server.uri());
        config.token = Some("secret".to_string());
        config.task_poll = PollPolicy::new(Duration::from_millis(5));
        RestClient::new(config).unwrap()
    }

    fn scope_handle() -> ScopeHandle {
        ScopeHandle {
            scope: Scope::new("org1", "vdc1"),
            org_id: "o-1".to_string(),
            vdc_id: "v-1".to_string(),
        }
    }

    fn vapp() -> VAppObserved {
        VAppObserved {
            id: "vapp-1".to_string(),
            name: "app1".to_string(),
            status: PowerStatus::PoweredOff,
            template_name: "photon".to_string(),
            catalog_name: "cat".to_string(),
            vms: vec![],
        }
    }

    #[tokio::test]
    async fn test_resolve_scope_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/orgs/org1/vdcs/vdc1"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"org_id": "o-1", "vdc_id": "v-1"})),
            )
            .mount(&server)
            .await;

        let handle = client(&server).resolve_scope("org1", "vdc1").await.unwrap();
        assert_eq!(handle, scope_handle());
    }

    #[tokio::test]
    async fn test_missing_vapp_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/vdcs/v-1/vapps/app1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .find_vapp_by_name(&scope_handle(), "app1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound));
    }

    #[tokio::test]
    async fn test_find_vapp_maps_status_and_vms() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/vdcs/v-1/vapps/app1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "vapp-1",
                "name": "app1",
                "status": 4,
                "template_name": "photon",
                "catalog_name": "cat",
                "vms": [{
                    "name": "app1",
                    "network_name": "net1",
                    "ip_allocation_mode": "MANUAL",
                    "ip_address": "10.10.102.160",
                    "cpus": 1,
                    "memory_mb": 1024
                }]
            })))
            .mount(&server)
            .await;

        let found = client(&server)
            .find_vapp_by_name(&scope_handle(), "app1")
            .await
            .unwrap();
        assert_eq!(found.status, PowerStatus::PoweredOn);
        assert_eq!(found.child_vm_name(), Some("app1"));
        assert_eq!(found.assigned_ip(), Some(Ipv4Addr::new(10, 10, 102, 160)));
    }

    #[tokio::test]
    async fn test_power_on_waits_for_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/vapps/vapp-1/power/action/powerOn"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"id": "t-1", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/t-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "t-1", "status": "running"})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/t-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "t-1", "status": "success"})),
            )
            .mount(&server)
            .await;

        client(&server)
            .power_on(&scope_handle(), &vapp())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_task_carries_message() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/vapps/vapp-1"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"id": "t-2", "status": "running"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "t-2",
                "status": "error",
                "error": {"message": "vApp is busy"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete(&scope_handle(), &vapp())
            .await
            .unwrap_err();
        match err {
            ClientError::TaskFailed { task, status, message } => {
                assert_eq!(task, "t-2");
                assert_eq!(status, "error");
                assert_eq!(message, "vApp is busy");
            }
            other => panic!("expected task failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_request_uses_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/vdcs/v-1/networks"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "pools overlap"})),
            )
            .mount(&server)
            .await;

        let settings = NetworkSettings {
            edge_gateway: "edge1".to_string(),
            gateway: Ipv4Addr::new(10, 10, 103, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns1: None,
            dns2: None,
            static_ip_pool: crate::model::IpPool {
                start_address: Ipv4Addr::new(10, 10, 103, 2),
                end_address: Ipv4Addr::new(10, 10, 103, 200),
            },
            dhcp_pool: Some(crate::model::IpPool {
                start_address: Ipv4Addr::new(10, 10, 103, 150),
                end_address: Ipv4Addr::new(10, 10, 103, 254),
            }),
        };
        let err = client(&server)
            .create_network(&scope_handle(), "net2", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m == "pools overlap"));
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let mut config = RestConfig::new("https://vcd.example.com");
        config.token = Some("secret".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
