//! Error taxonomy for reconciliation.
//!
//! Every variant carries the org/vdc scope and the resource name so a failure
//! can be located on the platform without re-deriving context.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;
use crate::model::Scope;

/// Kind of remote object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VApp,
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VApp => f.write_str("vApp"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Remote operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ResolveScope,
    FindVApp,
    ReadStatus,
    CreateVApp,
    UpdateVm,
    PowerOn,
    PowerOff,
    DeleteVApp,
    FindNetwork,
    CreateNetwork,
    UpdateNetwork,
    DeleteNetwork,
    ListAllocations,
}

impl Operation {
    /// A failure of this operation leaves the object in an unknown state.
    pub fn leaves_indeterminate(&self) -> bool {
        matches!(self, Self::CreateVApp | Self::DeleteVApp)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolveScope => "resolve scope",
            Self::FindVApp => "find vApp",
            Self::ReadStatus => "read status",
            Self::CreateVApp => "create vApp",
            Self::UpdateVm => "update VM",
            Self::PowerOn => "power on",
            Self::PowerOff => "power off",
            Self::DeleteVApp => "delete vApp",
            Self::FindNetwork => "find network",
            Self::CreateNetwork => "create network",
            Self::UpdateNetwork => "update network",
            Self::DeleteNetwork => "delete network",
            Self::ListAllocations => "list allocated addresses",
        };
        f.write_str(name)
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Org/VDC pair could not be resolved.
    #[error("error retrieving vdc {} from org {}: {reason}", .scope.vdc, .scope.org)]
    ScopeNotFound { scope: Scope, reason: String },

    /// Resource absent when presence was expected.
    #[error("{kind} {name} not found ({scope})")]
    NotFound {
        kind: ResourceKind,
        scope: Scope,
        name: String,
    },

    /// A referenced resource has not been reconciled yet.
    #[error("vApp {name} depends on {dependency_kind} {dependency}, which is not ready ({scope})")]
    DependencyNotReady {
        scope: Scope,
        name: String,
        dependency_kind: ResourceKind,
        dependency: String,
    },

    /// The change cannot be applied in place.
    #[error("conflict on {kind} {name} ({scope}): {reason}")]
    Conflict {
        kind: ResourceKind,
        scope: Scope,
        name: String,
        reason: String,
    },

    /// Observed data violates a structural invariant.
    #[error("integrity violation on vApp {name} ({scope}): {reason}")]
    Integrity {
        scope: Scope,
        name: String,
        reason: String,
    },

    /// Desired state is unusable before any remote call is made.
    #[error("invalid {kind} {name} ({scope}): {reason}")]
    InvalidSpec {
        kind: ResourceKind,
        scope: Scope,
        name: String,
        reason: String,
    },

    /// A transitional status did not settle within the polling policy.
    #[error("timed out after {elapsed:?} waiting for vApp {name} to reach {expected} ({scope})")]
    Timeout {
        scope: Scope,
        name: String,
        expected: String,
        elapsed: Duration,
    },

    /// Opaque failure from the platform.
    #[error("failed to {operation} {name} ({scope}): {source}")]
    Remote {
        scope: Scope,
        name: String,
        operation: Operation,
        #[source]
        source: ClientError,
    },
}

impl ProviderError {
    /// Wrap a client error with identifying context.
    ///
    /// `NotFound` from a lookup stays `NotFound`; anything else is a remote failure.
    pub fn from_client(
        err: ClientError,
        kind: ResourceKind,
        scope: &Scope,
        name: &str,
        operation: Operation,
    ) -> Self {
        match err {
            ClientError::NotFound if matches!(operation, Operation::FindVApp | Operation::FindNetwork) => {
                Self::NotFound {
                    kind,
                    scope: scope.clone(),
                    name: name.to_string(),
                }
            }
            source => Self::Remote {
                scope: scope.clone(),
                name: name.to_string(),
                operation,
                source,
            },
        }
    }

    /// True if the remote object may be in any state after this error.
    ///
    /// Callers must look the object up again before retrying.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Remote { operation, .. } if operation.leaves_indeterminate())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
