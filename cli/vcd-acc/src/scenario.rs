//! Multi-step acceptance scenarios.
//!
//! ```toml
//! name = "vapp_power_off"
//!
//! [[step]]
//! document = "basic.toml"
//!
//! [[step.check]]
//! kind = "power"
//! resource = "vcd_vapp.TestAccVcdVAppVapp"
//! status = "POWERED_ON"
//! ```
//!
//! Document paths are relative to the scenario file.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use vcd_provider::PowerStatus;

use crate::document::{Document, DocumentError};
use crate::state::ResourceKey;

/// An assertion evaluated after a step is applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Present in state and on the platform under the recorded id.
    Exists { resource: ResourceKey },
    /// Declared name matches, and the single child VM carries it.
    Identity { resource: ResourceKey },
    /// Remote power status.
    Power {
        resource: ResourceKey,
        status: PowerStatus,
    },
    /// Assigned address honors the declared IP mode.
    AssignedIp { resource: ResourceKey },
    /// Recorded attribute equals a literal.
    Attr {
        resource: ResourceKey,
        attribute: String,
        value: String,
    },
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists { resource } => write!(f, "{resource} exists"),
            Self::Identity { resource } => write!(f, "{resource} identity"),
            Self::Power { resource, status } => write!(f, "{resource} is {status}"),
            Self::AssignedIp { resource } => write!(f, "{resource} assigned ip"),
            Self::Attr {
                resource,
                attribute,
                value,
            } => write!(f, "{resource}.{attribute} = {value:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub document: Document,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioFile {
    name: String,
    #[serde(rename = "step")]
    steps: Vec<StepFile>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    document: PathBuf,
    #[serde(default, rename = "check")]
    checks: Vec<Check>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DocumentError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&contents, base)
    }

    /// Parse a scenario, reading documents relative to `base`.
    pub fn from_toml_str(contents: &str, base: &Path) -> Result<Self, DocumentError> {
        let file: ScenarioFile = toml::from_str(contents)?;
        let steps = file
            .steps
            .into_iter()
            .map(|step| {
                Ok(Step {
                    document: Document::from_path(&base.join(&step.document))?,
                    checks: step.checks,
                })
            })
            .collect::<Result<Vec<_>, DocumentError>>()?;

        Ok(Self {
            name: file.name,
            steps,
        })
    }
}
