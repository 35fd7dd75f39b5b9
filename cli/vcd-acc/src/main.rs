//! vcd-acc - acceptance scenario runner for vApps and routed networks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vcd_acc::{connect, connect_scenario, run_scenario, AcceptanceConfig, Scenario};
use vcd_provider::verify;
use vcd_provider::{resolve_scope, IpMode, Platform, Scope, VAppReconciler, VAppSpec};

mod error;

/// Apply desired-state scenarios and verify the platform converges.
#[derive(Debug, Parser)]
#[command(name = "vcd-acc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML). `VCD_*` variables override it.
    #[arg(long, global = true, env = "VCD_CONFIG")]
    config: Option<PathBuf>,

    /// Run against the in-memory platform instead of a live endpoint.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a scenario file.
    Run {
        /// Path to the scenario TOML.
        scenario: PathBuf,
    },

    /// Check a live vApp against a declaration without changing it.
    Check {
        /// vApp name.
        #[arg(long)]
        name: String,

        /// Network the vApp should be attached to.
        #[arg(long)]
        network: String,

        /// Declared address: an IPv4 address, `allocated` or `dhcp`.
        #[arg(long, default_value = "allocated")]
        ip: IpMode,

        /// Expect the vApp to be powered off.
        #[arg(long)]
        powered_off: bool,
    },

    /// Power a vApp on or off.
    Power {
        /// vApp name.
        name: String,

        /// Power off instead of on.
        #[arg(long)]
        off: bool,
    },
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = AcceptanceConfig::load(self.config.as_deref())?;

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();

        match self.command {
            Commands::Run { scenario } => run_file(&config, self.simulate, &scenario).await,
            Commands::Check {
                name,
                network,
                ip,
                powered_off,
            } => {
                let platform = live_platform(&config, self.simulate)?;
                let scope = resolve_scope(platform.as_ref(), &config.org, &config.vdc).await?;
                let spec = VAppSpec {
                    org: config.org.clone(),
                    vdc: config.vdc.clone(),
                    name: name.clone(),
                    template_name: config.catalog_item.clone(),
                    catalog_name: config.catalog.clone(),
                    network_name: network.clone(),
                    cpus: 1,
                    memory_mb: 1024,
                    ip,
                    power_on: !powered_off,
                };

                let observed = platform
                    .find_vapp_by_name(&scope, &name)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to look up vApp {name} ({})",
                            Scope::new(&config.org, &config.vdc)
                        )
                    })?;
                let settings = platform
                    .find_network_by_name(&scope, &network)
                    .await
                    .with_context(|| format!("failed to look up network {network}"))?
                    .settings;

                let failures = verify::check_consistency(&spec, &observed, Some(&settings));
                let status = verify::convergence(&failures);
                for failure in &failures {
                    eprintln!("{} {}", "Failed:".red().bold(), failure);
                }
                if !failures.is_empty() {
                    anyhow::bail!("vApp {name} is {status:?}");
                }
                println!("{} vApp {} is {:?}", "Passed:".green().bold(), name, status);
                Ok(())
            }
            Commands::Power { name, off } => {
                let platform = live_platform(&config, self.simulate)?;
                let scope = resolve_scope(platform.as_ref(), &config.org, &config.vdc).await?;
                let vapps = VAppReconciler::new(platform, config.poll_policy());
                let vapp = vapps.set_power(&scope, &name, !off).await?;
                println!("{} vApp {} is {}", "Success:".green().bold(), name, vapp.status);
                Ok(())
            }
        }
    }
}

/// Platform for commands that inspect or change live objects.
fn live_platform(config: &AcceptanceConfig, simulate: bool) -> Result<Arc<dyn Platform>> {
    if !simulate {
        config.precheck(true)?;
    }
    Ok(connect(config, simulate)?)
}

async fn run_file(config: &AcceptanceConfig, simulate: bool, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)
        .with_context(|| format!("failed to load scenario {}", path.display()))?;
    let Some(platform) = connect_scenario(config, simulate)? else {
        info!(scenario = %scenario.name, "Short test mode, skipping acceptance scenario");
        println!("{} {}: VCD_SHORT_TEST is set", "Skipped:".yellow().bold(), scenario.name);
        return Ok(());
    };
    info!(scenario = %scenario.name, steps = scenario.steps.len(), "Starting scenario");

    let report = run_scenario(config, platform, &scenario).await?;
    if report.passed() {
        println!("{} {}", "Passed:".green().bold(), report);
    }
    report.into_result()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
