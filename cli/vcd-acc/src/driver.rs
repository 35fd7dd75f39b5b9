//! Applies documents step by step and evaluates checks.
//!
//! Apply order within a step:
//!
//! 1. destroy vApps no longer declared
//! 2. reconcile declared networks
//! 3. reconcile declared vApps
//! 4. destroy networks no longer declared
//!
//! Teardown always runs at the end of a scenario, even after a failed step,
//! and is followed by a destroy check over every vApp that was removed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use vcd_provider::client::ClientError;
use vcd_provider::verify::{self, Destroyed, VerifyError};
use vcd_provider::{
    resolve_scope, NetworkReconciler, Operation, Platform, ProviderError, ResourceKind,
    RestClient, Scope, ScopeHandle, SimPlatform, VAppObserved, VAppReconciler, VAppSpec,
};

use crate::config::{AcceptanceConfig, ConfigError};
use crate::document::{DocumentError, Resolved};
use crate::scenario::{Check, Scenario};
use crate::state::{Declared, ResourceKey, State};

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn scope_suffix(scope: Option<&Scope>) -> String {
    scope.map(|scope| format!(" ({scope})")).unwrap_or_default()
}

fn found_text(found: Option<&str>) -> String {
    match found {
        Some(value) => format!("{value:?}"),
        None => "<unset>".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up platform client: {0}")]
    Connect(#[source] ClientError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// `scope` is `None` only when nothing has been applied in any scope yet.
    #[error("not found: {resource}{}", scope_suffix(.scope.as_ref()))]
    NotInState {
        resource: ResourceKey,
        scope: Option<Scope>,
    },

    #[error("{resource} is not a {expected} ({scope})")]
    WrongKind {
        resource: ResourceKey,
        scope: Scope,
        expected: &'static str,
    },

    #[error(
        "{resource}: attribute {attribute} expected {expected:?}, got {} ({scope})",
        found_text(.found.as_deref())
    )]
    Attribute {
        resource: ResourceKey,
        scope: Scope,
        attribute: String,
        expected: String,
        found: Option<String>,
    },

    #[error("step {step}: {source}")]
    Step {
        step: usize,
        #[source]
        source: Box<DriverError>,
    },

    #[error("destroy check failed: {}", join(.0))]
    Destroy(Vec<VerifyError>),

    #[error("teardown failed: {}", join(.0))]
    Teardown(Vec<DriverError>),
}

/// Build the platform a run talks to.
pub fn connect(config: &AcceptanceConfig, simulate: bool) -> Result<Arc<dyn Platform>, DriverError> {
    if simulate {
        let sim = SimPlatform::new()
            .with_vdc(&config.org, &config.vdc)
            .with_edge_gateway(&config.org, &config.vdc, &config.edge_gateway)
            .with_catalog_item(&config.catalog, &config.catalog_item)
            .with_status_lag(1);
        return Ok(Arc::new(sim));
    }

    let client = RestClient::new(config.rest_config()?).map_err(DriverError::Connect)?;
    Ok(Arc::new(client))
}

/// Platform for a scenario run, or `None` when short-test mode skips it.
///
/// The skip comes before the pre-check so a run without credentials can
/// still be skipped.
pub fn connect_scenario(
    config: &AcceptanceConfig,
    simulate: bool,
) -> Result<Option<Arc<dyn Platform>>, DriverError> {
    if config.short_test {
        return Ok(None);
    }
    config.precheck(!simulate)?;
    connect(config, simulate).map(Some)
}

/// Stateful executor for a sequence of documents.
pub struct Driver {
    platform: Arc<dyn Platform>,
    networks: NetworkReconciler,
    vapps: VAppReconciler,
    scopes: BTreeMap<Scope, ScopeHandle>,
    state: State,
    /// Everything a reconcile was attempted for and not yet destroyed.
    known: BTreeMap<ResourceKey, Scope>,
    destroyed: Vec<(ScopeHandle, Destroyed)>,
}

impl Driver {
    pub fn new(platform: Arc<dyn Platform>, poll: vcd_reconcile::PollPolicy) -> Self {
        Self {
            networks: NetworkReconciler::new(platform.clone()),
            vapps: VAppReconciler::new(platform.clone(), poll),
            platform,
            scopes: BTreeMap::new(),
            state: State::default(),
            known: BTreeMap::new(),
            destroyed: Vec::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Resolve a scope once and reuse the handle.
    pub async fn scope(&mut self, scope: &Scope) -> Result<ScopeHandle, DriverError> {
        if let Some(handle) = self.scopes.get(scope) {
            return Ok(handle.clone());
        }
        let handle = resolve_scope(self.platform.as_ref(), &scope.org, &scope.vdc).await?;
        self.scopes.insert(scope.clone(), handle.clone());
        Ok(handle)
    }

    /// Converge the platform to `document`.
    pub async fn apply(&mut self, document: &Resolved) -> Result<(), DriverError> {
        info!(
            hash = %document.hash()?,
            networks = document.networks.len(),
            vapps = document.vapps.len(),
            "Applying document"
        );

        let declared: BTreeSet<ResourceKey> = document
            .networks
            .iter()
            .map(|spec| ResourceKey::Network(spec.name.clone()))
            .chain(
                document
                    .vapps
                    .iter()
                    .map(|spec| ResourceKey::VApp(spec.name.clone())),
            )
            .collect();
        let removed: Vec<(ResourceKey, Scope)> = self
            .known
            .iter()
            .filter(|(key, _)| !declared.contains(*key))
            .map(|(key, scope)| (key.clone(), scope.clone()))
            .collect();

        for (key, scope) in &removed {
            if let ResourceKey::VApp(name) = key {
                self.destroy_vapp(scope, name).await?;
            }
        }

        for spec in &document.networks {
            let handle = self.scope(&spec.scope()).await?;
            self.known
                .insert(ResourceKey::Network(spec.name.clone()), spec.scope());
            let outcome = self.networks.reconcile(&handle, spec).await?;
            info!(network = %spec.name, action = ?outcome.action, "Network reconciled");
            self.state.record_network(spec, &outcome.handle);
        }

        for spec in &document.vapps {
            let handle = self.scope(&spec.scope()).await?;
            self.known
                .insert(ResourceKey::VApp(spec.name.clone()), spec.scope());
            let outcome = self.vapps.reconcile(&handle, spec).await?;
            info!(
                vapp = %spec.name,
                action = ?outcome.action,
                status = %outcome.observed.status,
                "vApp reconciled"
            );
            self.state.record_vapp(spec, &outcome.observed);
        }

        for (key, scope) in &removed {
            if let ResourceKey::Network(name) = key {
                self.destroy_network(scope, name).await?;
            }
        }

        Ok(())
    }

    async fn destroy_vapp(&mut self, scope: &Scope, name: &str) -> Result<(), DriverError> {
        let handle = self.scope(scope).await?;
        let key = ResourceKey::VApp(name.to_string());
        let recorded_id = self.state.get(&key).map(|state| state.id.clone());

        let destroyed = self
            .vapps
            .destroy(&handle, name)
            .await?
            .unwrap_or(Destroyed {
                name: name.to_string(),
                id: recorded_id,
            });
        self.destroyed.push((handle, destroyed));
        self.state.remove(&key);
        self.known.remove(&key);
        Ok(())
    }

    async fn destroy_network(&mut self, scope: &Scope, name: &str) -> Result<(), DriverError> {
        let handle = self.scope(scope).await?;
        self.networks.destroy(&handle, name).await?;
        let key = ResourceKey::Network(name.to_string());
        self.state.remove(&key);
        self.known.remove(&key);
        Ok(())
    }

    /// Missing from state, named with the scope it was declared in or,
    /// failing that, the only scope this run has touched.
    fn not_in_state(&self, resource: &ResourceKey) -> DriverError {
        let scope = self.known.get(resource).cloned().or_else(|| {
            let mut scopes = self.scopes.keys();
            match (scopes.next(), scopes.next()) {
                (Some(only), None) => Some(only.clone()),
                _ => None,
            }
        });
        DriverError::NotInState {
            resource: resource.clone(),
            scope,
        }
    }

    fn declared_vapp(&self, resource: &ResourceKey) -> Result<(&VAppSpec, Scope), DriverError> {
        let state = self
            .state
            .get(resource)
            .ok_or_else(|| self.not_in_state(resource))?;
        match &state.declared {
            Declared::VApp(spec) => Ok((spec, state.scope.clone())),
            Declared::Network(_) => Err(DriverError::WrongKind {
                resource: resource.clone(),
                scope: state.scope.clone(),
                expected: "vApp",
            }),
        }
    }

    async fn observe_vapp(
        &mut self,
        resource: &ResourceKey,
    ) -> Result<(VAppSpec, VAppObserved), DriverError> {
        let (spec, scope) = self.declared_vapp(resource)?;
        let spec = spec.clone();
        let handle = self.scope(&scope).await?;
        let observed = self
            .platform
            .find_vapp_by_name(&handle, &spec.name)
            .await
            .map_err(|e| {
                ProviderError::from_client(e, ResourceKind::VApp, &scope, &spec.name, Operation::FindVApp)
            })?;
        Ok((spec, observed))
    }

    /// Evaluate one check against state and the platform.
    pub async fn check(&mut self, check: &Check) -> Result<(), DriverError> {
        match check {
            Check::Exists { resource } => {
                let state = self
                    .state
                    .get(resource)
                    .ok_or_else(|| self.not_in_state(resource))?;
                let (id, scope) = (state.id.clone(), state.scope.clone());
                let handle = self.scope(&scope).await?;
                let name = resource.name();

                let found_id = match resource {
                    ResourceKey::VApp(_) => self
                        .platform
                        .find_vapp_by_name(&handle, name)
                        .await
                        .map(|found| found.id)
                        .map_err(|e| {
                            ProviderError::from_client(e, ResourceKind::VApp, &scope, name, Operation::FindVApp)
                        })?,
                    ResourceKey::Network(_) => self
                        .platform
                        .find_network_by_name(&handle, name)
                        .await
                        .map(|found| found.id)
                        .map_err(|e| {
                            ProviderError::from_client(
                                e,
                                ResourceKind::Network,
                                &scope,
                                name,
                                Operation::FindNetwork,
                            )
                        })?,
                };
                if found_id != id {
                    return Err(DriverError::Attribute {
                        resource: resource.clone(),
                        scope,
                        attribute: "id".to_string(),
                        expected: id,
                        found: Some(found_id),
                    });
                }
                Ok(())
            }
            Check::Identity { resource } => {
                let (spec, observed) = self.observe_vapp(resource).await?;
                verify::check_identity(&spec, &observed)?;
                Ok(())
            }
            Check::Power { resource, status } => {
                let (spec, observed) = self.observe_vapp(resource).await?;
                verify::check_power(&spec, &observed, status)?;
                Ok(())
            }
            Check::AssignedIp { resource } => {
                let (spec, observed) = self.observe_vapp(resource).await?;
                let network_key = ResourceKey::Network(spec.network_name.clone());
                let network = match self.state.get(&network_key).map(|s| &s.declared) {
                    Some(Declared::Network(network)) => network.settings.clone(),
                    _ => {
                        return Err(DriverError::NotInState {
                            resource: network_key,
                            scope: Some(spec.scope()),
                        })
                    }
                };
                verify::check_assigned_ip(&spec, &observed, &network)?;
                Ok(())
            }
            Check::Attr {
                resource,
                attribute,
                value,
            } => {
                let Some(state) = self.state.get(resource) else {
                    return Err(self.not_in_state(resource));
                };
                let found = self.state.attribute(resource, attribute);
                if found == Some(value.as_str()) {
                    return Ok(());
                }
                Err(DriverError::Attribute {
                    resource: resource.clone(),
                    scope: state.scope.clone(),
                    attribute: attribute.clone(),
                    expected: value.clone(),
                    found: found.map(str::to_string),
                })
            }
        }
    }

    /// Destroy everything still known, then confirm every destroyed vApp is gone.
    ///
    /// Keeps going past individual failures and reports all of them.
    pub async fn teardown(&mut self) -> Result<(), DriverError> {
        let mut failures = Vec::new();

        let known: Vec<(ResourceKey, Scope)> = self
            .known
            .iter()
            .map(|(key, scope)| (key.clone(), scope.clone()))
            .collect();
        for (key, scope) in known.iter().filter(|(key, _)| matches!(key, ResourceKey::VApp(_))) {
            if let Err(e) = self.destroy_vapp(scope, key.name()).await {
                warn!(resource = %key, error = %e, "Teardown failed");
                failures.push(e);
            }
        }
        for (key, scope) in known.iter().filter(|(key, _)| matches!(key, ResourceKey::Network(_))) {
            if let Err(e) = self.destroy_network(scope, key.name()).await {
                warn!(resource = %key, error = %e, "Teardown failed");
                failures.push(e);
            }
        }

        let mut by_scope: BTreeMap<Scope, (ScopeHandle, Vec<Destroyed>)> = BTreeMap::new();
        for (handle, destroyed) in &self.destroyed {
            by_scope
                .entry(handle.scope.clone())
                .or_insert_with(|| (handle.clone(), Vec::new()))
                .1
                .push(destroyed.clone());
        }
        let mut leftovers = Vec::new();
        for (handle, destroyed) in by_scope.values() {
            if let Err(mut found) =
                verify::check_destroyed(self.platform.as_ref(), handle, destroyed).await
            {
                leftovers.append(&mut found);
            }
        }
        if !leftovers.is_empty() {
            failures.push(DriverError::Destroy(leftovers));
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(DriverError::Teardown(failures)),
        }
    }
}

/// Result of running a scenario.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub skipped: bool,
    pub steps_total: usize,
    pub steps_passed: usize,
    pub failure: Option<DriverError>,
    pub teardown: Option<DriverError>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none() && self.teardown.is_none()
    }

    /// The first failure, if any; teardown problems come second.
    pub fn into_result(self) -> Result<(), DriverError> {
        match (self.failure, self.teardown) {
            (None, None) => Ok(()),
            (Some(e), None) | (None, Some(e)) => Err(e),
            (Some(failure), Some(teardown)) => Err(DriverError::Teardown(vec![failure, teardown])),
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(f, "{}: skipped", self.name);
        }
        write!(
            f,
            "{}: {}/{} steps passed",
            self.name, self.steps_passed, self.steps_total
        )?;
        if let Some(e) = &self.failure {
            write!(f, "; {e}")?;
        }
        if let Some(e) = &self.teardown {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

/// Run every step, stopping at the first failure, then tear down.
pub async fn run_scenario(
    config: &AcceptanceConfig,
    platform: Arc<dyn Platform>,
    scenario: &Scenario,
) -> Result<ScenarioReport, DriverError> {
    let mut report = ScenarioReport {
        name: scenario.name.clone(),
        skipped: false,
        steps_total: scenario.steps.len(),
        steps_passed: 0,
        failure: None,
        teardown: None,
    };

    if config.short_test {
        info!(scenario = %scenario.name, "Short test mode, skipping acceptance scenario");
        report.skipped = true;
        return Ok(report);
    }
    config.precheck(false)?;

    let defaults = config.defaults();
    let mut driver = Driver::new(platform, config.poll_policy());

    for (idx, step) in scenario.steps.iter().enumerate() {
        let step_no = idx + 1;
        info!(scenario = %scenario.name, step = step_no, "Running step");

        let result = async {
            let resolved = step.document.resolve(&defaults)?;
            driver.apply(&resolved).await?;
            for check in &step.checks {
                driver.check(check).await.inspect_err(|e| {
                    error!(step = step_no, check = %check, error = %e, "Check failed");
                })?;
            }
            Ok::<_, DriverError>(())
        }
        .await;

        match result {
            Ok(()) => report.steps_passed += 1,
            Err(e) => {
                report.failure = Some(DriverError::Step {
                    step: step_no,
                    source: Box::new(e),
                });
                break;
            }
        }
    }

    if let Err(e) = driver.teardown().await {
        error!(scenario = %scenario.name, error = %e, "Teardown reported failures");
        report.teardown = Some(e);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use vcd_provider::{IpMode, IpPool, NetworkSettings, NetworkSpec, PowerStatus};
    use vcd_reconcile::PollPolicy;

    use super::*;

    fn sim() -> Arc<SimPlatform> {
        Arc::new(
            SimPlatform::new()
                .with_vdc("acme", "vdc")
                .with_edge_gateway("acme", "vdc", "edge")
                .with_catalog_item("cat", "photon"),
        )
    }

    fn network(name: &str, third: u8) -> NetworkSpec {
        NetworkSpec {
            name: name.to_string(),
            org: "acme".to_string(),
            vdc: "vdc".to_string(),
            settings: NetworkSettings {
                edge_gateway: "edge".to_string(),
                gateway: Ipv4Addr::new(10, 0, third, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                dns1: None,
                dns2: None,
                static_ip_pool: IpPool {
                    start_address: Ipv4Addr::new(10, 0, third, 2),
                    end_address: Ipv4Addr::new(10, 0, third, 100),
                },
                dhcp_pool: None,
            },
        }
    }

    fn vapp(name: &str, network: &str, power_on: bool) -> VAppSpec {
        VAppSpec {
            org: "acme".to_string(),
            vdc: "vdc".to_string(),
            name: name.to_string(),
            template_name: "photon".to_string(),
            catalog_name: "cat".to_string(),
            network_name: network.to_string(),
            cpus: 1,
            memory_mb: 512,
            ip: IpMode::Allocated,
            power_on,
        }
    }

    fn driver(sim: &Arc<SimPlatform>) -> Driver {
        Driver::new(sim.clone(), PollPolicy::new(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_apply_moves_vapp_then_drops_old_network() {
        let sim = sim();
        let mut driver = driver(&sim);

        driver
            .apply(&Resolved {
                networks: vec![network("a", 1)],
                vapps: vec![vapp("web", "a", true), vapp("db", "a", true)],
            })
            .await
            .unwrap();

        driver
            .apply(&Resolved {
                networks: vec![network("b", 2)],
                vapps: vec![vapp("web", "b", false)],
            })
            .await
            .unwrap();

        let web = ResourceKey::VApp("web".into());
        assert_eq!(driver.state().attribute(&web, "network_name"), Some("b"));
        assert_eq!(driver.state().attribute(&web, "status"), Some("POWERED_OFF"));
        assert!(driver.state().get(&ResourceKey::VApp("db".into())).is_none());
        assert!(driver.state().get(&ResourceKey::Network("a".into())).is_none());

        driver
            .check(&Check::Power {
                resource: web.clone(),
                status: PowerStatus::PoweredOff,
            })
            .await
            .unwrap();
        driver.check(&Check::AssignedIp { resource: web }).await.unwrap();

        driver.teardown().await.unwrap();
        assert!(sim.vapp_names(&Scope::new("acme", "vdc")).await.is_empty());
    }

    #[tokio::test]
    async fn test_checks_report_mismatches() {
        let sim = sim();
        let mut driver = driver(&sim);
        driver
            .apply(&Resolved {
                networks: vec![network("a", 1)],
                vapps: vec![vapp("web", "a", true)],
            })
            .await
            .unwrap();

        let web = ResourceKey::VApp("web".into());
        let err = driver
            .check(&Check::Attr {
                resource: web.clone(),
                attribute: "power_on".into(),
                value: "false".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Attribute { ref found, .. } if found.as_deref() == Some("true")));
        assert_eq!(
            err.to_string(),
            "vcd_vapp.web: attribute power_on expected \"false\", got \"true\" (org acme, vdc vdc)"
        );

        let err = driver
            .check(&Check::Attr {
                resource: web.clone(),
                attribute: "hostname".into(),
                value: "web".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("got <unset> (org acme, vdc vdc)"), "{err}");

        let err = driver
            .check(&Check::Exists {
                resource: ResourceKey::VApp("ghost".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not found: vcd_vapp.ghost (org acme, vdc vdc)");

        let err = driver
            .check(&Check::Identity {
                resource: ResourceKey::Network("a".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "vcd_network_routed.a is not a vApp (org acme, vdc vdc)");

        sim.rename_child_vm(&Scope::new("acme", "vdc"), "web", "other").await;
        let err = driver.check(&Check::Identity { resource: web }).await.unwrap_err();
        assert!(matches!(err, DriverError::Verify(VerifyError::ChildNameMismatch { .. })));

        driver.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_detects_replaced_vapp() {
        let sim = sim();
        let mut driver = driver(&sim);
        driver
            .apply(&Resolved {
                networks: vec![network("a", 1)],
                vapps: vec![vapp("web", "a", false)],
            })
            .await
            .unwrap();
        let web = ResourceKey::VApp("web".into());
        driver.check(&Check::Exists { resource: web.clone() }).await.unwrap();
        let recorded = driver.state().attribute(&web, "id").unwrap().to_string();

        // Replace the vApp behind the driver's back.
        let outside = VAppReconciler::new(sim.clone(), PollPolicy::new(Duration::from_millis(1)));
        let handle = resolve_scope(sim.as_ref(), "acme", "vdc").await.unwrap();
        outside.destroy(&handle, "web").await.unwrap();
        let replaced = outside.reconcile(&handle, &vapp("web", "a", false)).await.unwrap();
        assert_ne!(replaced.observed.id, recorded);

        let err = driver.check(&Check::Exists { resource: web }).await.unwrap_err();
        match err {
            DriverError::Attribute {
                ref scope,
                ref attribute,
                ref expected,
                ref found,
                ..
            } => {
                assert_eq!(scope, &Scope::new("acme", "vdc"));
                assert_eq!(attribute, "id");
                assert_eq!(expected, &recorded);
                assert_eq!(found.as_deref(), Some(replaced.observed.id.as_str()));
            }
            other => panic!("expected id mismatch, got {other}"),
        }

        driver.teardown().await.unwrap();
    }

    #[test]
    fn test_short_test_skips_before_precheck() {
        let skip = AcceptanceConfig::load_with_env(
            None,
            Some([("VCD_SHORT_TEST".to_string(), "true".to_string())].into_iter().collect()),
        )
        .unwrap();
        assert!(matches!(connect_scenario(&skip, false), Ok(None)));

        let run = AcceptanceConfig::load_with_env(None, Some(Default::default())).unwrap();
        match connect_scenario(&run, false) {
            Err(DriverError::Config(ConfigError::Missing(missing))) => {
                assert!(missing.contains(&"VCD_ORG"));
                assert!(missing.contains(&"VCD_URL"));
            }
            Err(other) => panic!("expected missing configuration, got {other}"),
            Ok(_) => panic!("expected missing configuration"),
        }
    }

    #[tokio::test]
    async fn test_teardown_reports_every_failure() {
        let sim = sim();
        let mut driver = driver(&sim);
        driver
            .apply(&Resolved {
                networks: vec![network("a", 1)],
                vapps: vec![vapp("web", "a", false)],
            })
            .await
            .unwrap();

        sim.fail_next(Operation::DeleteVApp, "backend busy").await;
        let err = driver.teardown().await.unwrap_err();
        match err {
            DriverError::Teardown(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].to_string().contains("delete vApp web"));
                assert!(failures[1].to_string().contains("conflict on network a"));
            }
            other => panic!("expected teardown error, got {other}"),
        }

        // A second pass finds the vApp again and finishes the job.
        driver.teardown().await.unwrap();
    }
}
