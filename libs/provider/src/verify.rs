//! Post-reconciliation checks.
//!
//! Checks compare a declared [`VAppSpec`] with what the platform reports and
//! name the violated property on failure. They never mutate anything.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::debug;
use vcd_reconcile::ConvergenceStatus;

use crate::client::{ClientError, VAppStore};
use crate::model::{IpMode, IpPool, NetworkSettings, PowerStatus, Scope, ScopeHandle, VAppObserved, VAppSpec};

/// A failed check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("bad name: expected {expected}, found {found} ({scope})")]
    NameMismatch {
        scope: Scope,
        expected: String,
        found: String,
    },

    #[error("vApp {name} has {count} VMs, expected exactly one ({scope})")]
    VmCount {
        scope: Scope,
        name: String,
        count: usize,
    },

    #[error("vApp and VM names do not match: {vapp} != {vm} ({scope})")]
    ChildNameMismatch {
        scope: Scope,
        vapp: String,
        vm: String,
    },

    #[error("vApp {name} is {observed}, expected {expected} ({scope})")]
    Power {
        scope: Scope,
        name: String,
        expected: PowerStatus,
        observed: PowerStatus,
    },

    #[error("vApp {name} has no assigned address ({scope})")]
    MissingAddress { scope: Scope, name: String },

    #[error("vApp {name} has address {observed}, expected {expected} ({scope})")]
    AddressMismatch {
        scope: Scope,
        name: String,
        expected: String,
        observed: Ipv4Addr,
    },

    #[error("vApp {name} still exists after destroy: {id} ({scope})")]
    StillPresent {
        scope: Scope,
        name: String,
        id: String,
    },

    #[error("vApp {name} was recreated after destroy: {previous_id} replaced by {id} ({scope})")]
    Recreated {
        scope: Scope,
        name: String,
        previous_id: String,
        id: String,
    },

    #[error("could not check vApp {name} ({scope}): {reason}")]
    LookupFailed {
        scope: Scope,
        name: String,
        reason: String,
    },
}

impl VerifyError {
    /// True for a power mismatch caused by a status that is still settling.
    pub fn is_converging(&self) -> bool {
        matches!(
            self,
            Self::Power {
                observed: PowerStatus::Transitional(_),
                ..
            }
        )
    }
}

/// Structural checks that hold for any vApp this crate manages.
pub fn check_topology(scope: &Scope, observed: &VAppObserved) -> Result<(), VerifyError> {
    let Some(vm) = observed.child_vm() else {
        return Err(VerifyError::VmCount {
            scope: scope.clone(),
            name: observed.name.clone(),
            count: observed.vms.len(),
        });
    };
    if vm.name != observed.name {
        return Err(VerifyError::ChildNameMismatch {
            scope: scope.clone(),
            vapp: observed.name.clone(),
            vm: vm.name.clone(),
        });
    }
    Ok(())
}

/// The vApp carries the declared name and its single VM carries it too.
pub fn check_identity(spec: &VAppSpec, observed: &VAppObserved) -> Result<(), VerifyError> {
    let scope = spec.scope();
    if observed.name != spec.name {
        return Err(VerifyError::NameMismatch {
            scope,
            expected: spec.name.clone(),
            found: observed.name.clone(),
        });
    }
    check_topology(&scope, observed)
}

/// The observed power status equals `expected`.
pub fn check_power(
    spec: &VAppSpec,
    observed: &VAppObserved,
    expected: &PowerStatus,
) -> Result<(), VerifyError> {
    if &observed.status == expected {
        return Ok(());
    }
    Err(VerifyError::Power {
        scope: spec.scope(),
        name: spec.name.clone(),
        expected: expected.clone(),
        observed: observed.status.clone(),
    })
}

fn pool_text(pool: Option<&IpPool>) -> String {
    match pool {
        Some(pool) => format!("an address in {pool}"),
        None => "an address from a pool the network does not have".to_string(),
    }
}

/// The assigned address honors the declared IP mode.
///
/// A static address must match exactly; pool modes must land in the matching
/// pool of `network`.
pub fn check_assigned_ip(
    spec: &VAppSpec,
    observed: &VAppObserved,
    network: &NetworkSettings,
) -> Result<(), VerifyError> {
    let Some(addr) = observed.assigned_ip() else {
        return Err(VerifyError::MissingAddress {
            scope: spec.scope(),
            name: spec.name.clone(),
        });
    };

    let (ok, expected) = match spec.ip {
        IpMode::Static(declared) => (addr == declared, declared.to_string()),
        IpMode::Allocated => {
            let pool = &network.static_ip_pool;
            (pool.contains(addr), pool_text(Some(pool)))
        }
        IpMode::Dhcp => {
            let pool = network.dhcp_pool.as_ref();
            (pool.is_some_and(|p| p.contains(addr)), pool_text(pool))
        }
    };

    if ok {
        return Ok(());
    }
    Err(VerifyError::AddressMismatch {
        scope: spec.scope(),
        name: spec.name.clone(),
        expected,
        observed: addr,
    })
}

/// Run every check that applies and collect all failures.
pub fn check_consistency(
    spec: &VAppSpec,
    observed: &VAppObserved,
    network: Option<&NetworkSettings>,
) -> Vec<VerifyError> {
    let mut failures = Vec::new();
    if let Err(e) = check_identity(spec, observed) {
        failures.push(e);
    }
    if let Err(e) = check_power(spec, observed, &PowerStatus::desired(spec.power_on)) {
        failures.push(e);
    }
    if let Some(network) = network {
        if let Err(e) = check_assigned_ip(spec, observed, network) {
            failures.push(e);
        }
    }
    failures
}

/// Summarize a set of check failures.
pub fn convergence(failures: &[VerifyError]) -> ConvergenceStatus {
    if failures.is_empty() {
        ConvergenceStatus::Converged
    } else if failures.iter().all(VerifyError::is_converging) {
        ConvergenceStatus::Converging
    } else {
        ConvergenceStatus::Diverged
    }
}

/// A vApp that was destroyed, as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destroyed {
    pub name: String,
    /// Remote id before destruction, if it was known.
    pub id: Option<String>,
}

/// Confirm every destroyed vApp is gone.
///
/// All entries are checked; failures are returned together.
pub async fn check_destroyed<S: VAppStore + ?Sized>(
    store: &S,
    scope: &ScopeHandle,
    destroyed: &[Destroyed],
) -> Result<(), Vec<VerifyError>> {
    let mut failures = Vec::new();

    for entry in destroyed {
        let scope_name = || (scope.scope.clone(), entry.name.clone());
        match store.find_vapp_by_name(scope, &entry.name).await {
            Err(ClientError::NotFound) => {
                debug!(vapp = %entry.name, "Confirmed destroyed");
            }
            Err(e) => {
                let (scope, name) = scope_name();
                failures.push(VerifyError::LookupFailed {
                    scope,
                    name,
                    reason: e.to_string(),
                });
            }
            Ok(found) => {
                let (scope, name) = scope_name();
                let failure = match &entry.id {
                    Some(previous_id) if previous_id != &found.id => VerifyError::Recreated {
                        scope,
                        name,
                        previous_id: previous_id.clone(),
                        id: found.id,
                    },
                    _ => VerifyError::StillPresent {
                        scope,
                        name,
                        id: found.id,
                    },
                };
                failures.push(failure);
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}
