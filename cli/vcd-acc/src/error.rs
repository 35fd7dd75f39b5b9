//! Error display for the CLI.

use colored::Colorize;
use vcd_acc::{ConfigError, DriverError};
use vcd_provider::ProviderError;

fn provider_hint(err: &ProviderError) -> Option<&'static str> {
    match err {
        ProviderError::ScopeNotFound { .. } => {
            Some("Hint: Check VCD_ORG and VCD_VDC against the platform.")
        }
        ProviderError::DependencyNotReady { .. } => {
            Some("Hint: Declare the network in the same document as the vApp.")
        }
        ProviderError::Timeout { .. } => {
            Some("Hint: Raise VCD_SETTLE_TIMEOUT_SECS or leave it unset to wait indefinitely.")
        }
        err if err.is_indeterminate() => {
            Some("Hint: The remote object may be half-created or half-deleted. Re-run to let the next lookup settle it.")
        }
        _ => None,
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let hint = if let Some(config_err) = err.downcast_ref::<ConfigError>() {
        match config_err {
            ConfigError::Missing(_) => {
                Some("Hint: Set the variables above or pass --config <file>.")
            }
            ConfigError::Load(_) => None,
        }
    } else if let Some(driver_err) = err.downcast_ref::<DriverError>() {
        match driver_err {
            DriverError::Provider(e) => provider_hint(e),
            DriverError::Step { source, .. } => match source.as_ref() {
                DriverError::Provider(e) => provider_hint(e),
                _ => None,
            },
            DriverError::Config(ConfigError::Missing(_)) => {
                Some("Hint: Set the variables above or pass --config <file>.")
            }
            DriverError::Connect(_) => Some("Hint: Check VCD_URL and VCD_TOKEN."),
            _ => None,
        }
    } else {
        err.downcast_ref::<ProviderError>().and_then(provider_hint)
    };

    if let Some(hint) = hint {
        eprintln!("\n{}", hint.yellow());
    }
}
