//! Call layer to the virtualization platform.
//!
//! Capabilities are split into three traits so reconcilers and checks only
//! ask for what they use:
//!
//! - [`ScopeResolver`]: org/VDC resolution
//! - [`VAppStore`]: vApp lookup, status, power and delete
//! - [`NetworkStore`]: routed network lookup and lifecycle
//!
//! Every mutating call blocks until the platform reports its task finished.

pub mod rest;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    NetworkObserved, NetworkSettings, PowerStatus, ScopeHandle, VAppObserved, VAppSpec, VmUpdate,
};

pub use rest::{RestClient, RestConfig};

/// Errors returned by a platform client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The object does not exist.
    #[error("object not found")]
    NotFound,

    /// The platform refused the request (validation, quota, busy object).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// An asynchronous task finished unsuccessfully.
    #[error("task {task} ended with status {status}: {message}")]
    TaskFailed {
        task: String,
        status: String,
        message: String,
    },

    /// Gave up waiting for a task.
    #[error("task {task} did not finish: {message}")]
    TaskTimeout { task: String, message: String },

    /// Network or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Org/VDC resolution.
#[async_trait]
pub trait ScopeResolver: Send + Sync {
    /// Resolve an org/VDC pair. Must succeed before any other call.
    async fn resolve_scope(&self, org: &str, vdc: &str) -> Result<ScopeHandle, ClientError>;
}

/// vApp operations.
#[async_trait]
pub trait VAppStore: Send + Sync {
    async fn find_vapp_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<VAppObserved, ClientError>;

    /// Read the current power status. Side-effect free; may be transitional.
    async fn read_status(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
    ) -> Result<PowerStatus, ClientError>;

    /// Instantiate the template with one VM named after the vApp, powered off.
    async fn create_vapp(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
    ) -> Result<VAppObserved, ClientError>;

    /// Reconfigure the child VM.
    async fn update_vm(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
        update: &VmUpdate,
    ) -> Result<VAppObserved, ClientError>;

    async fn power_on(&self, scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError>;

    async fn power_off(&self, scope: &ScopeHandle, vapp: &VAppObserved)
        -> Result<(), ClientError>;

    async fn delete(&self, scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError>;
}

/// Routed network operations.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn find_network_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<NetworkObserved, ClientError>;

    async fn create_network(
        &self,
        scope: &ScopeHandle,
        name: &str,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError>;

    async fn update_network(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError>;

    async fn delete_network(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<(), ClientError>;

    /// Addresses currently handed out to VMs on the network.
    async fn allocated_addresses(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<Vec<Ipv4Addr>, ClientError>;
}

/// Everything a reconciliation run needs from the platform.
pub trait Platform: ScopeResolver + VAppStore + NetworkStore {}

impl<T: ScopeResolver + VAppStore + NetworkStore + ?Sized> Platform for T {}
