//! Routed network reconciliation.
//!
//! Networks are idempotent by name within a scope. The reconciler never
//! deletes a network that still hands out addresses, since vApps attached to
//! it must keep working for as long as they exist.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vcd_reconcile::SpecHash;

use crate::client::{ClientError, NetworkStore, Platform};
use crate::error::{Operation, ProviderError, ResourceKind};
use crate::model::{NetworkObserved, NetworkSettings, NetworkSpec, Scope, ScopeHandle};
use crate::ensure_scope;

/// A reconciled network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    pub settings: NetworkSettings,
    pub spec_hash: SpecHash,
}

impl NetworkHandle {
    fn from_observed(scope: &Scope, observed: NetworkObserved) -> Result<Self, ProviderError> {
        let spec_hash = SpecHash::of(&observed.settings).map_err(|e| ProviderError::InvalidSpec {
            kind: ResourceKind::Network,
            scope: scope.clone(),
            name: observed.name.clone(),
            reason: format!("settings cannot be hashed: {e}"),
        })?;

        Ok(Self {
            id: observed.id,
            name: observed.name,
            scope: scope.clone(),
            settings: observed.settings,
            spec_hash,
        })
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAction {
    Created,
    Updated,
    Unchanged,
}

/// Result of reconciling one network.
#[derive(Debug, Clone)]
pub struct NetworkOutcome {
    pub handle: NetworkHandle,
    pub action: NetworkAction,
}

/// Reconciler for routed networks.
#[derive(Clone)]
pub struct NetworkReconciler {
    platform: Arc<dyn Platform>,
}

impl NetworkReconciler {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    fn wrap<'a>(
        scope: &'a ScopeHandle,
        name: &str,
        operation: Operation,
    ) -> impl Fn(ClientError) -> ProviderError + 'a {
        let scope = &scope.scope;
        let name = name.to_string();
        move |err| ProviderError::from_client(err, ResourceKind::Network, scope, &name, operation)
    }

    async fn lookup(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<Option<NetworkObserved>, ProviderError> {
        match self.platform.find_network_by_name(scope, name).await {
            Ok(found) => Ok(Some(found)),
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(Self::wrap(scope, name, Operation::FindNetwork)(e)),
        }
    }

    /// Converge a network to `spec`.
    pub async fn reconcile(
        &self,
        scope: &ScopeHandle,
        spec: &NetworkSpec,
    ) -> Result<NetworkOutcome, ProviderError> {
        ensure_scope(scope, &spec.scope(), ResourceKind::Network, &spec.name)?;

        let Some(existing) = self.lookup(scope, &spec.name).await? else {
            info!(
                org = %scope.scope.org,
                vdc = %scope.scope.vdc,
                network = %spec.name,
                gateway = %spec.settings.gateway,
                "Creating routed network"
            );
            let created = self
                .platform
                .create_network(scope, &spec.name, &spec.settings)
                .await
                .map_err(Self::wrap(scope, &spec.name, Operation::CreateNetwork))?;
            return Ok(NetworkOutcome {
                handle: NetworkHandle::from_observed(&scope.scope, created)?,
                action: NetworkAction::Created,
            });
        };

        if existing.settings == spec.settings {
            debug!(network = %spec.name, "Network already matches desired settings");
            return Ok(NetworkOutcome {
                handle: NetworkHandle::from_observed(&scope.scope, existing)?,
                action: NetworkAction::Unchanged,
            });
        }

        let conflict = |reason: String| ProviderError::Conflict {
            kind: ResourceKind::Network,
            scope: scope.scope.clone(),
            name: spec.name.clone(),
            reason,
        };

        if let Some(reason) = existing.settings.incompatible_with(&spec.settings) {
            warn!(network = %spec.name, reason = %reason, "Refusing in-place network change");
            return Err(conflict(reason));
        }

        let in_use = self
            .platform
            .allocated_addresses(scope, &existing)
            .await
            .map_err(Self::wrap(scope, &spec.name, Operation::ListAllocations))?;
        if let Some(stranded) = in_use.iter().find(|addr| !spec.settings.pools_cover(**addr)) {
            return Err(conflict(format!(
                "address {stranded} is used by an attached VM and falls outside the new pools"
            )));
        }

        info!(
            network = %spec.name,
            attached = in_use.len(),
            "Updating network pools in place"
        );
        let updated = self
            .platform
            .update_network(scope, &existing, &spec.settings)
            .await
            .map_err(Self::wrap(scope, &spec.name, Operation::UpdateNetwork))?;

        Ok(NetworkOutcome {
            handle: NetworkHandle::from_observed(&scope.scope, updated)?,
            action: NetworkAction::Updated,
        })
    }

    /// Return the network `dependent` refers to, or fail if it has not been reconciled.
    pub async fn require(
        &self,
        scope: &ScopeHandle,
        name: &str,
        dependent: &str,
    ) -> Result<NetworkHandle, ProviderError> {
        match self.lookup(scope, name).await? {
            Some(found) => NetworkHandle::from_observed(&scope.scope, found),
            None => Err(ProviderError::DependencyNotReady {
                scope: scope.scope.clone(),
                name: dependent.to_string(),
                dependency_kind: ResourceKind::Network,
                dependency: name.to_string(),
            }),
        }
    }

    /// Delete a network. Returns false if it was already absent.
    pub async fn destroy(&self, scope: &ScopeHandle, name: &str) -> Result<bool, ProviderError> {
        let Some(existing) = self.lookup(scope, name).await? else {
            debug!(network = %name, "Network already absent");
            return Ok(false);
        };

        let in_use = self
            .platform
            .allocated_addresses(scope, &existing)
            .await
            .map_err(Self::wrap(scope, name, Operation::ListAllocations))?;
        if !in_use.is_empty() {
            return Err(ProviderError::Conflict {
                kind: ResourceKind::Network,
                scope: scope.scope.clone(),
                name: name.to_string(),
                reason: format!("{} addresses are still assigned to VMs", in_use.len()),
            });
        }

        info!(org = %scope.scope.org, vdc = %scope.scope.vdc, network = %name, "Deleting network");
        self.platform
            .delete_network(scope, &existing)
            .await
            .map_err(Self::wrap(scope, name, Operation::DeleteNetwork))?;
        Ok(true)
    }
}
