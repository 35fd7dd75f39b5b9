//! End-to-end vApp power-off scenario.
//!
//! Runs the three-step scenario in `fixtures/`:
//!
//! 1. Two routed networks, a vApp on a static address and one on a
//!    pool-allocated address, both powered on
//! 2. The same document again, checking the allocated vApp
//! 3. The static vApp moved to a network with a DHCP pool and powered off
//!
//! followed by teardown and a destroy check over every vApp.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vcd-e2e --test vapp_power_off
//! ```
//!
//! Set `VCD_SHORT_TEST=1` to skip. With `VCD_URL` (and the other `VCD_*`
//! settings) present, the live variant runs against a real endpoint too.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use vcd_acc::{
    connect, run_scenario, AcceptanceConfig, Check, Document, Driver, DriverError, ResourceKey,
    Scenario, Step,
};
use vcd_provider::verify::VerifyError;
use vcd_provider::{PowerStatus, Scope, SimPlatform};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

fn short_test() -> bool {
    std::env::var("VCD_SHORT_TEST").is_ok_and(|v| !v.is_empty() && v != "0" && v != "false")
}

fn sim_config(extra: &[(&str, &str)]) -> AcceptanceConfig {
    let mut env: HashMap<String, String> = [
        ("VCD_ORG", "acme"),
        ("VCD_VDC", "acme-vdc"),
        ("VCD_CATALOG", "templates"),
        ("VCD_CATALOG_ITEM", "photon-os"),
        ("VCD_EDGE_GATEWAY", "edge-gw"),
        ("VCD_POLL_INTERVAL_MS", "1"),
    ]
    .iter()
    .chain(extra)
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    if short_test() {
        env.insert("VCD_SHORT_TEST".to_string(), "true".to_string());
    }
    AcceptanceConfig::load_with_env(None, Some(env.into_iter().collect()))
        .expect("simulated config should load")
}

fn sim(config: &AcceptanceConfig) -> Arc<SimPlatform> {
    Arc::new(
        SimPlatform::new()
            .with_vdc(&config.org, &config.vdc)
            .with_edge_gateway(&config.org, &config.vdc, &config.edge_gateway)
            .with_catalog_item(&config.catalog, &config.catalog_item)
            .with_status_lag(2),
    )
}

#[tokio::test]
async fn test_vapp_power_off_simulated() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = sim_config(&[]);
    let platform = sim(&config);
    let scenario = Scenario::load(&fixture("vapp_power_off.toml")).expect("fixture should load");

    let report = run_scenario(&config, platform.clone(), &scenario)
        .await
        .expect("scenario should run");
    if report.skipped {
        eprintln!("skipping: VCD_SHORT_TEST is set");
        return;
    }

    assert!(report.passed(), "scenario failed: {report}");
    assert_eq!(report.steps_passed, 3);
    assert!(platform
        .vapp_names(&Scope::new("acme", "acme-vdc"))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_short_test_skips_without_platform_calls() {
    let config = sim_config(&[("VCD_SHORT_TEST", "1")]);
    let platform = sim(&config);
    let scenario = Scenario::load(&fixture("vapp_power_off.toml")).unwrap();

    let report = run_scenario(&config, platform.clone(), &scenario)
        .await
        .unwrap();

    assert!(report.skipped);
    assert_eq!(report.steps_passed, 0);
    assert_eq!(platform.mutation_count().await, 0);
}

#[tokio::test]
async fn test_reapplying_a_step_changes_nothing() {
    let config = sim_config(&[]);
    if config.short_test {
        return;
    }
    let platform = sim(&config);
    let mut driver = Driver::new(platform.clone(), config.poll_policy());
    let basic = Document::from_path(&fixture("basic.toml"))
        .unwrap()
        .resolve(&config.defaults())
        .unwrap();

    driver.apply(&basic).await.unwrap();
    let mutations = platform.mutation_count().await;
    driver.apply(&basic).await.unwrap();
    assert_eq!(platform.mutation_count().await, mutations);

    let allocated = ResourceKey::VApp("TestAccVcdVAppVappAllocated".into());
    let assigned = driver.state().attribute(&allocated, "assigned_ip").unwrap();
    assert!(assigned.starts_with("10.10.202."), "got {assigned}");

    driver.teardown().await.unwrap();
}

#[tokio::test]
async fn test_failed_check_still_tears_down() {
    let config = sim_config(&[]);
    if config.short_test {
        return;
    }
    let platform = sim(&config);
    let scenario = Scenario {
        name: "wrong_power".to_string(),
        steps: vec![Step {
            document: Document::from_path(&fixture("basic.toml")).unwrap(),
            checks: vec![Check::Power {
                resource: ResourceKey::VApp("TestAccVcdVAppVapp".into()),
                status: PowerStatus::PoweredOff,
            }],
        }],
    };

    let report = run_scenario(&config, platform.clone(), &scenario)
        .await
        .unwrap();

    assert_eq!(report.steps_passed, 0);
    assert!(report.teardown.is_none(), "teardown failed: {report}");
    match report.failure {
        Some(DriverError::Step { step: 1, ref source }) => assert!(matches!(
            source.as_ref(),
            DriverError::Verify(VerifyError::Power { .. })
        )),
        ref other => panic!("unexpected failure: {other:?}"),
    }
    assert!(platform
        .vapp_names(&Scope::new("acme", "acme-vdc"))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_vapp_power_off_live() {
    if short_test() {
        return;
    }
    let config = match AcceptanceConfig::load(None) {
        Ok(config) if config.url.is_some() => config,
        _ => {
            eprintln!("skipping: VCD_URL is not set");
            return;
        }
    };
    config.precheck(true).expect("live configuration incomplete");

    let platform = connect(&config, false).expect("client should build");
    let scenario = Scenario::load(&fixture("vapp_power_off.toml")).unwrap();
    let report = run_scenario(&config, platform, &scenario).await.unwrap();

    report.into_result().expect("live scenario failed");
}
