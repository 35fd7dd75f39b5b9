//! Reconciliation primitives.
//!
//! Helpers shared by the network and vApp reconcilers:
//!
//! - **Spec hashing**: detect whether desired state changed between two
//!   reconciliations without comparing field by field.
//! - **Convergence status**: classify observed state against desired state.
//! - **Polling**: wait for a remote object to reach a terminal state.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Polling never retries a failed read; errors are handed back to the caller

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// Reading the current state failed.
    #[error("{0}")]
    Failed(E),
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a declared resource has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        // 128 bits is plenty to tell two specs apart.
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Compute a spec hash for any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| {
                    let key = serde_json::Value::String(k.clone());
                    format!("{key}:{}", canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// How often and how long to wait for a remote object to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between reads.
    pub interval: Duration,

    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl PollPolicy {
    /// Create a policy with no timeout.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Repeatedly run `read` until it yields a value.
///
/// `Ok(None)` means "not there yet". A read error ends polling immediately.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    resource: &str,
    mut read: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(value) = read().await.map_err(PollError::Failed)? {
            if attempts > 1 {
                debug!(resource, attempts, "Converged after polling");
            }
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if let Some(timeout) = policy.timeout {
            if elapsed >= timeout {
                return Err(PollError::Timeout {
                    resource: resource.to_string(),
                    elapsed,
                });
            }
        }

        debug!(resource, attempts, "Not converged yet, polling again");
        tokio::time::sleep(policy.interval).await;
    }
}

/// Default delay between status reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
