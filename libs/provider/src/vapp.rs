//! vApp lifecycle.
//!
//! ```text
//! Absent ──create──> Creating ──> Active(POWERED_OFF) <──power──> Active(POWERED_ON)
//!                                       │
//!   Absent <──────── Deleting <─────────┘ (powered off first)
//! ```
//!
//! Every operation starts with a lookup by name, so a failed create or
//! delete is recovered by simply calling the reconciler again.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vcd_reconcile::{PollError, PollPolicy, SpecHash};

use crate::client::{ClientError, Platform, VAppStore};
use crate::ensure_scope;
use crate::error::{Operation, ProviderError, ResourceKind};
use crate::model::{
    IpMode, NetworkConnection, PowerStatus, ScopeHandle, VAppObserved, VAppSpec, VmUpdate,
};
use crate::network::{NetworkHandle, NetworkReconciler};
use crate::verify::{self, Destroyed, VerifyError};

/// Lifecycle state of a vApp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VAppState {
    Absent,
    Creating,
    /// Exists; the status may still be transitional.
    Active(PowerStatus),
    Deleting,
}

impl VAppState {
    fn of(observed: Option<&VAppObserved>) -> Self {
        match observed {
            Some(vapp) => Self::Active(vapp.status.clone()),
            None => Self::Absent,
        }
    }
}

impl fmt::Display for VAppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Creating => f.write_str("creating"),
            Self::Active(status) => write!(f, "active({status})"),
            Self::Deleting => f.write_str("deleting"),
        }
    }
}

/// What a reconciliation did to the remote vApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAppAction {
    Created,
    Updated {
        reconfigured: bool,
        power_changed: bool,
    },
    Unchanged,
}

/// Result of reconciling one vApp.
#[derive(Debug, Clone)]
pub struct VAppOutcome {
    pub observed: VAppObserved,
    pub network: NetworkHandle,
    pub action: VAppAction,
    pub spec_hash: SpecHash,
}

/// Drives vApps to their declared state.
pub struct VAppReconciler {
    platform: Arc<dyn Platform>,
    networks: NetworkReconciler,
    poll: PollPolicy,
}

impl VAppReconciler {
    pub fn new(platform: Arc<dyn Platform>, poll: PollPolicy) -> Self {
        Self {
            networks: NetworkReconciler::new(platform.clone()),
            platform,
            poll,
        }
    }

    fn remote(
        scope: &ScopeHandle,
        name: &str,
        operation: Operation,
    ) -> impl Fn(ClientError) -> ProviderError {
        let scope = scope.scope.clone();
        let name = name.to_string();
        move |err| ProviderError::from_client(err, ResourceKind::VApp, &scope, &name, operation)
    }

    fn transition(name: &str, from: &VAppState, to: &VAppState) {
        debug!(vapp = %name, from = %from, to = %to, "vApp state transition");
    }

    async fn lookup(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<Option<VAppObserved>, ProviderError> {
        match self.platform.find_vapp_by_name(scope, name).await {
            Ok(found) => Ok(Some(found)),
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(Self::remote(scope, name, Operation::FindVApp)(e)),
        }
    }

    /// Look the vApp up and report its lifecycle state.
    ///
    /// This is the recovery step after an indeterminate failure.
    pub async fn observe(&self, scope: &ScopeHandle, name: &str) -> Result<VAppState, ProviderError> {
        let found = self.lookup(scope, name).await?;
        Ok(VAppState::of(found.as_ref()))
    }

    /// Poll until the status is terminal, or equals `want` when given.
    async fn wait_for_status(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
        want: Option<&PowerStatus>,
    ) -> Result<PowerStatus, ProviderError> {
        let platform: &dyn Platform = &*self.platform;
        let read = move || async move {
            let status = platform.read_status(scope, vapp).await?;
            let settled = match want {
                Some(want) => &status == want,
                None => status.is_terminal(),
            };
            Ok::<_, ClientError>(settled.then_some(status))
        };

        poll_status(&self.poll, scope, &vapp.name, want, read).await
    }

    async fn power(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
        on: bool,
    ) -> Result<PowerStatus, ProviderError> {
        let (operation, call) = if on {
            (Operation::PowerOn, self.platform.power_on(scope, vapp))
        } else {
            (Operation::PowerOff, self.platform.power_off(scope, vapp))
        };
        info!(
            org = %scope.scope.org,
            vdc = %scope.scope.vdc,
            vapp = %vapp.name,
            power_on = on,
            "Changing vApp power state"
        );
        call.await.map_err(Self::remote(scope, &vapp.name, operation))?;

        let desired = PowerStatus::desired(on);
        self.wait_for_status(scope, vapp, Some(&desired)).await
    }

    fn integrity(spec: &VAppSpec, err: VerifyError) -> ProviderError {
        ProviderError::Integrity {
            scope: spec.scope(),
            name: spec.name.clone(),
            reason: err.to_string(),
        }
    }

    fn check_static_address(spec: &VAppSpec, network: &NetworkHandle) -> Result<(), ProviderError> {
        let IpMode::Static(addr) = spec.ip else {
            return Ok(());
        };
        let pool = network.settings.static_ip_pool;
        if pool.contains(addr) {
            return Ok(());
        }
        Err(ProviderError::InvalidSpec {
            kind: ResourceKind::VApp,
            scope: spec.scope(),
            name: spec.name.clone(),
            reason: format!(
                "ip {addr} is outside static pool {pool} of network {}",
                network.name
            ),
        })
    }

    fn outcome(
        spec: &VAppSpec,
        observed: VAppObserved,
        network: NetworkHandle,
        action: VAppAction,
    ) -> Result<VAppOutcome, ProviderError> {
        let spec_hash = SpecHash::of(spec).map_err(|e| ProviderError::InvalidSpec {
            kind: ResourceKind::VApp,
            scope: spec.scope(),
            name: spec.name.clone(),
            reason: format!("spec cannot be hashed: {e}"),
        })?;
        Ok(VAppOutcome {
            observed,
            network,
            action,
            spec_hash,
        })
    }

    /// Read back the vApp after mutations and check what must hold for it.
    async fn settle(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
        network: &NetworkHandle,
    ) -> Result<VAppObserved, ProviderError> {
        let Some(mut observed) = self.lookup(scope, &spec.name).await? else {
            return Err(ProviderError::NotFound {
                kind: ResourceKind::VApp,
                scope: scope.scope.clone(),
                name: spec.name.clone(),
            });
        };
        if !observed.status.is_terminal() {
            observed.status = self.wait_for_status(scope, &observed, None).await?;
        }
        Self::checked(spec, network, observed)
    }

    /// Converge the vApp named in `spec`.
    ///
    /// Repeating the call with an unchanged spec performs no mutations.
    pub async fn reconcile(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
    ) -> Result<VAppOutcome, ProviderError> {
        ensure_scope(scope, &spec.scope(), ResourceKind::VApp, &spec.name)?;

        match self.lookup(scope, &spec.name).await? {
            None => self.create(scope, spec).await,
            Some(existing) => self.update(scope, spec, existing).await,
        }
    }

    async fn create(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
    ) -> Result<VAppOutcome, ProviderError> {
        let network = self
            .networks
            .require(scope, &spec.network_name, &spec.name)
            .await?;
        Self::check_static_address(spec, &network)?;

        Self::transition(&spec.name, &VAppState::Absent, &VAppState::Creating);
        info!(
            org = %scope.scope.org,
            vdc = %scope.scope.vdc,
            vapp = %spec.name,
            template = %spec.template_name,
            network = %spec.network_name,
            ip = %spec.ip,
            "Creating vApp"
        );
        let created = self
            .platform
            .create_vapp(scope, spec)
            .await
            .map_err(Self::remote(scope, &spec.name, Operation::CreateVApp))?;
        verify::check_topology(&scope.scope, &created).map_err(|e| Self::integrity(spec, e))?;

        if spec.power_on {
            self.power(scope, &created, true).await?;
        }

        let observed = self.settle(scope, spec, &network).await?;
        Self::transition(
            &spec.name,
            &VAppState::Creating,
            &VAppState::Active(observed.status.clone()),
        );
        Self::outcome(spec, observed, network, VAppAction::Created)
    }

    async fn update(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
        mut existing: VAppObserved,
    ) -> Result<VAppOutcome, ProviderError> {
        verify::check_topology(&scope.scope, &existing).map_err(|e| Self::integrity(spec, e))?;

        if existing.template_name != spec.template_name || existing.catalog_name != spec.catalog_name {
            return Err(ProviderError::Conflict {
                kind: ResourceKind::VApp,
                scope: scope.scope.clone(),
                name: spec.name.clone(),
                reason: format!(
                    "template {}/{} cannot change to {}/{} in place",
                    existing.catalog_name,
                    existing.template_name,
                    spec.catalog_name,
                    spec.template_name
                ),
            });
        }

        let network = self
            .networks
            .require(scope, &spec.network_name, &spec.name)
            .await?;

        let mut update = VmUpdate::default();
        if let Some(vm) = existing.child_vm() {
            if vm.cpus != spec.cpus {
                update.cpus = Some(spec.cpus);
            }
            if vm.memory_mb != spec.memory_mb {
                update.memory_mb = Some(spec.memory_mb);
            }

            let address_changed = match spec.ip {
                IpMode::Static(addr) => vm.ip != Some(addr),
                IpMode::Allocated | IpMode::Dhcp => false,
            };
            if vm.network_name.as_deref() != Some(spec.network_name.as_str())
                || vm.allocation_mode != Some(spec.ip.allocation_mode())
                || address_changed
            {
                Self::check_static_address(spec, &network)?;
                update.connection = Some(NetworkConnection {
                    network_name: spec.network_name.clone(),
                    ip: spec.ip,
                });
            }
        }

        if !existing.status.is_terminal() {
            existing.status = self.wait_for_status(scope, &existing, None).await?;
        }
        let mut status = existing.status.clone();

        let mut power_changed = false;
        if !spec.power_on && status == PowerStatus::PoweredOn {
            status = self.power(scope, &existing, false).await?;
            power_changed = true;
        }

        let reconfigured = !update.is_empty();
        if reconfigured {
            info!(
                vapp = %spec.name,
                cpus = ?update.cpus,
                memory_mb = ?update.memory_mb,
                reconnect = update.connection.is_some(),
                "Reconfiguring VM"
            );
            self.platform
                .update_vm(scope, &existing, &update)
                .await
                .map_err(Self::remote(scope, &spec.name, Operation::UpdateVm))?;
        }

        if spec.power_on && status != PowerStatus::PoweredOn {
            self.power(scope, &existing, true).await?;
            power_changed = true;
        }

        if !reconfigured && !power_changed {
            debug!(vapp = %spec.name, "vApp already matches desired state");
            let observed = Self::checked(spec, &network, existing)?;
            return Self::outcome(spec, observed, network, VAppAction::Unchanged);
        }

        let observed = self.settle(scope, spec, &network).await?;
        Self::outcome(
            spec,
            observed,
            network,
            VAppAction::Updated {
                reconfigured,
                power_changed,
            },
        )
    }

    fn checked(
        spec: &VAppSpec,
        network: &NetworkHandle,
        observed: VAppObserved,
    ) -> Result<VAppObserved, ProviderError> {
        verify::check_identity(spec, &observed).map_err(|e| Self::integrity(spec, e))?;
        verify::check_assigned_ip(spec, &observed, &network.settings)
            .map_err(|e| Self::integrity(spec, e))?;
        Ok(observed)
    }

    /// Drive the vApp to powered on or off. A no-op when already there.
    pub async fn set_power(
        &self,
        scope: &ScopeHandle,
        name: &str,
        on: bool,
    ) -> Result<VAppObserved, ProviderError> {
        let Some(mut vapp) = self.lookup(scope, name).await? else {
            return Err(ProviderError::NotFound {
                kind: ResourceKind::VApp,
                scope: scope.scope.clone(),
                name: name.to_string(),
            });
        };

        if !vapp.status.is_terminal() {
            vapp.status = self.wait_for_status(scope, &vapp, None).await?;
        }
        if vapp.status == PowerStatus::desired(on) {
            debug!(vapp = %name, status = %vapp.status, "Power state already as desired");
            return Ok(vapp);
        }

        vapp.status = self.power(scope, &vapp, on).await?;
        Ok(vapp)
    }

    /// Power off if needed and delete. Absent vApps are left alone.
    ///
    /// Returns what was destroyed, for later verification.
    pub async fn destroy(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<Option<Destroyed>, ProviderError> {
        let Some(mut vapp) = self.lookup(scope, name).await? else {
            debug!(vapp = %name, "vApp already absent");
            return Ok(None);
        };

        let from = VAppState::of(Some(&vapp));
        if !vapp.status.is_terminal() {
            vapp.status = self.wait_for_status(scope, &vapp, None).await?;
        }
        if vapp.status == PowerStatus::PoweredOn {
            vapp.status = self.power(scope, &vapp, false).await?;
        }

        Self::transition(name, &from, &VAppState::Deleting);
        info!(org = %scope.scope.org, vdc = %scope.scope.vdc, vapp = %name, id = %vapp.id, "Deleting vApp");
        if let Err(e) = self.platform.delete(scope, &vapp).await {
            warn!(vapp = %name, error = %e, "Delete failed; vApp state is unknown until observed again");
            return Err(Self::remote(scope, name, Operation::DeleteVApp)(e));
        }
        Self::transition(name, &VAppState::Deleting, &VAppState::Absent);

        Ok(Some(Destroyed {
            name: vapp.name,
            id: Some(vapp.id),
        }))
    }
}

async fn poll_status<F, Fut>(
    policy: &PollPolicy,
    scope: &ScopeHandle,
    name: &str,
    want: Option<&PowerStatus>,
    read: F,
) -> Result<PowerStatus, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<PowerStatus>, ClientError>>,
{
    match vcd_reconcile::poll_until(policy, name, read).await {
        Ok(status) => Ok(status),
        Err(PollError::Failed(e)) => Err(VAppReconciler::remote(scope, name, Operation::ReadStatus)(e)),
        Err(PollError::Timeout { elapsed, .. }) => Err(ProviderError::Timeout {
            scope: scope.scope.clone(),
            name: name.to_string(),
            expected: want.map_or_else(|| "a settled status".to_string(), ToString::to_string),
            elapsed,
        }),
    }
}
