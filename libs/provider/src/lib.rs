//! vApp and routed network reconciliation against a vCloud-style platform.
//!
//! The crate is layered bottom-up:
//!
//! - [`client`]: the remote call layer (REST client and traits)
//! - [`network`]: routed network reconciler
//! - [`vapp`]: vApp lifecycle state machine
//! - [`verify`]: post-reconciliation checks
//!
//! [`sim::SimPlatform`] implements the client traits in memory.

pub mod client;
pub mod error;
pub mod model;
pub mod network;
pub mod sim;
pub mod vapp;
pub mod verify;

pub use client::{ClientError, Platform, RestClient, RestConfig};
pub use error::{Operation, ProviderError, ResourceKind};
pub use model::{
    IpMode, IpPool, NetworkObserved, NetworkSettings, NetworkSpec, PowerStatus, Scope,
    ScopeHandle, VAppObserved, VAppSpec,
};
pub use network::{NetworkAction, NetworkHandle, NetworkReconciler};
pub use sim::SimPlatform;
pub use vapp::{VAppAction, VAppOutcome, VAppReconciler, VAppState};
pub use verify::VerifyError;

use client::ScopeResolver;

/// Resolve an org/VDC pair, naming both on failure.
pub async fn resolve_scope<R: ScopeResolver + ?Sized>(
    resolver: &R,
    org: &str,
    vdc: &str,
) -> Result<ScopeHandle, ProviderError> {
    resolver
        .resolve_scope(org, vdc)
        .await
        .map_err(|e| ProviderError::ScopeNotFound {
            scope: Scope::new(org, vdc),
            reason: e.to_string(),
        })
}

/// Reject a declaration whose org/vdc differs from the resolved scope.
pub(crate) fn ensure_scope(
    handle: &ScopeHandle,
    declared: &Scope,
    kind: ResourceKind,
    name: &str,
) -> Result<(), ProviderError> {
    if &handle.scope == declared {
        return Ok(());
    }
    Err(ProviderError::InvalidSpec {
        kind,
        scope: declared.clone(),
        name: name.to_string(),
        reason: format!("declared in {declared} but reconciled in {}", handle.scope),
    })
}
