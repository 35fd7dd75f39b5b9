//! Desired-state documents.
//!
//! A document declares routed networks and vApps in TOML:
//!
//! ```toml
//! [[network]]
//! name = "TestAccVcdVAppNet"
//! gateway = "10.10.102.1"
//! static_ip_pool = { start_address = "10.10.102.2", end_address = "10.10.102.254" }
//!
//! [[vapp]]
//! name = "TestAccVcdVAppVapp"
//! network_name = "TestAccVcdVAppNet"
//! ip = "10.10.102.160"
//! ```
//!
//! Org, vdc, edge gateway, catalog and template default to the run
//! configuration when a declaration leaves them out.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vcd_provider::model::{self, Scope};
use vcd_provider::{IpMode, IpPool, NetworkSettings, NetworkSpec, VAppSpec};
use vcd_reconcile::SpecHash;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{kind} {name} is declared more than once in {scope}")]
    Duplicate {
        kind: &'static str,
        name: String,
        scope: Scope,
    },

    #[error("{kind} {name} has no {field} and no default is configured")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("document cannot be hashed: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Values filled into declarations that omit them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defaults {
    pub org: String,
    pub vdc: String,
    pub catalog: String,
    pub catalog_item: String,
    pub edge_gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDecl {
    pub name: String,
    pub org: Option<String>,
    pub vdc: Option<String>,
    pub edge_gateway: Option<String>,
    pub gateway: Ipv4Addr,
    #[serde(default = "model::default_netmask")]
    pub netmask: Ipv4Addr,
    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
    pub static_ip_pool: IpPool,
    pub dhcp_pool: Option<IpPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VAppDecl {
    pub name: String,
    pub org: Option<String>,
    pub vdc: Option<String>,
    pub template_name: Option<String>,
    pub catalog_name: Option<String>,
    pub network_name: String,
    #[serde(default = "model::default_cpus")]
    pub cpus: u32,
    #[serde(default = "model::default_memory_mb")]
    pub memory: u32,
    pub ip: IpMode,
    #[serde(default = "model::default_power_on")]
    pub power_on: bool,
}

/// A parsed, unresolved document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkDecl>,

    #[serde(default, rename = "vapp")]
    pub vapps: Vec<VAppDecl>,
}

/// A document with every field filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub networks: Vec<NetworkSpec>,
    pub vapps: Vec<VAppSpec>,
}

impl Resolved {
    /// Content hash, stable across key order and formatting.
    pub fn hash(&self) -> Result<SpecHash, DocumentError> {
        Ok(SpecHash::of(self)?)
    }
}

fn pick(
    value: &Option<String>,
    default: &str,
    kind: &'static str,
    name: &str,
    field: &'static str,
) -> Result<String, DocumentError> {
    let chosen = value.as_deref().unwrap_or(default);
    if chosen.is_empty() {
        return Err(DocumentError::MissingField {
            kind,
            name: name.to_string(),
            field,
        });
    }
    Ok(chosen.to_string())
}

impl Document {
    pub fn from_toml_str(contents: &str) -> Result<Self, DocumentError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DocumentError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Fill in defaults and reject duplicate names within a scope.
    pub fn resolve(&self, defaults: &Defaults) -> Result<Resolved, DocumentError> {
        let mut resolved = Resolved::default();
        let mut seen = BTreeSet::new();

        for decl in &self.networks {
            const KIND: &str = "network";
            let spec = NetworkSpec {
                name: decl.name.clone(),
                org: pick(&decl.org, &defaults.org, KIND, &decl.name, "org")?,
                vdc: pick(&decl.vdc, &defaults.vdc, KIND, &decl.name, "vdc")?,
                settings: NetworkSettings {
                    edge_gateway: pick(
                        &decl.edge_gateway,
                        &defaults.edge_gateway,
                        KIND,
                        &decl.name,
                        "edge_gateway",
                    )?,
                    gateway: decl.gateway,
                    netmask: decl.netmask,
                    dns1: decl.dns1,
                    dns2: decl.dns2,
                    static_ip_pool: decl.static_ip_pool,
                    dhcp_pool: decl.dhcp_pool,
                },
            };
            if !seen.insert((KIND, spec.scope(), spec.name.clone())) {
                return Err(DocumentError::Duplicate {
                    kind: KIND,
                    scope: spec.scope(),
                    name: spec.name,
                });
            }
            resolved.networks.push(spec);
        }

        for decl in &self.vapps {
            const KIND: &str = "vApp";
            let spec = VAppSpec {
                org: pick(&decl.org, &defaults.org, KIND, &decl.name, "org")?,
                vdc: pick(&decl.vdc, &defaults.vdc, KIND, &decl.name, "vdc")?,
                name: decl.name.clone(),
                template_name: pick(
                    &decl.template_name,
                    &defaults.catalog_item,
                    KIND,
                    &decl.name,
                    "template_name",
                )?,
                catalog_name: pick(
                    &decl.catalog_name,
                    &defaults.catalog,
                    KIND,
                    &decl.name,
                    "catalog_name",
                )?,
                network_name: decl.network_name.clone(),
                cpus: decl.cpus,
                memory_mb: decl.memory,
                ip: decl.ip,
                power_on: decl.power_on,
            };
            if !seen.insert((KIND, spec.scope(), spec.name.clone())) {
                return Err(DocumentError::Duplicate {
                    kind: KIND,
                    scope: spec.scope(),
                    name: spec.name,
                });
            }
            resolved.vapps.push(spec);
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Defaults {
        Defaults {
            org: "acme".to_string(),
            vdc: "acme-vdc".to_string(),
            catalog: "templates".to_string(),
            catalog_item: "photon-os".to_string(),
            edge_gateway: "edge-gw".to_string(),
        }
    }

    const POWER_OFF: &str = r#"
[[network]]
name = "TestAccVcdVAppNet2"
gateway = "10.10.103.1"
static_ip_pool = { start_address = "10.10.103.2", end_address = "10.10.103.170" }
dhcp_pool = { start_address = "10.10.103.171", end_address = "10.10.103.254" }

[[vapp]]
name = "TestAccVcdVAppVapp"
network_name = "TestAccVcdVAppNet2"
memory = 1024
cpus = 1
ip = "10.10.103.160"
power_on = false
"#;

    #[test]
    fn test_resolve_fills_defaults() {
        let resolved = Document::from_toml_str(POWER_OFF)
            .unwrap()
            .resolve(&defaults())
            .unwrap();

        let network = &resolved.networks[0];
        assert_eq!(network.org, "acme");
        assert_eq!(network.settings.edge_gateway, "edge-gw");
        assert_eq!(network.settings.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert!(network.settings.dhcp_pool.is_some());

        let vapp = &resolved.vapps[0];
        assert_eq!(vapp.template_name, "photon-os");
        assert_eq!(vapp.catalog_name, "templates");
        assert_eq!(vapp.ip, IpMode::Static(Ipv4Addr::new(10, 10, 103, 160)));
        assert!(!vapp.power_on);
    }

    #[test]
    fn test_allocated_and_default_power() {
        let doc = Document::from_toml_str(
            r#"
[[vapp]]
name = "TestAccVcdVAppVappAllocated"
network_name = "TestAccVcdVAppNet3"
ip = "allocated"
"#,
        )
        .unwrap();
        let resolved = doc.resolve(&defaults()).unwrap();
        assert_eq!(resolved.vapps[0].ip, IpMode::Allocated);
        assert!(resolved.vapps[0].power_on);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let doc = Document::from_toml_str(&format!("{POWER_OFF}\n{}", &POWER_OFF[POWER_OFF.find("[[vapp]]").unwrap()..])).unwrap();
        let err = doc.resolve(&defaults()).unwrap_err();
        assert!(matches!(err, DocumentError::Duplicate { kind: "vApp", .. }));
    }

    #[test]
    fn test_duplicate_network_names_its_scope() {
        let network = &POWER_OFF[..POWER_OFF.find("[[vapp]]").unwrap()];
        let doc = Document::from_toml_str(&format!("{network}\n{network}")).unwrap();

        let err = doc.resolve(&defaults()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "network TestAccVcdVAppNet2 is declared more than once in org acme, vdc acme-vdc"
        );
    }

    #[test]
    fn test_missing_default_is_reported() {
        let err = Document::from_toml_str(POWER_OFF)
            .unwrap()
            .resolve(&Defaults::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "network TestAccVcdVAppNet2 has no org and no default is configured"
        );
    }

    #[test]
    fn test_unknown_field_and_bad_ip_rejected() {
        assert!(Document::from_toml_str("[[vapp]]\nname = \"a\"\nnetwork_name = \"n\"\nip = \"x\"\n").is_err());
        assert!(Document::from_toml_str("[[network]]\nname = \"n\"\nbogus = 1\n").is_err());
    }

    #[test]
    fn test_hash_ignores_formatting() {
        let compact = POWER_OFF.replace(" = ", "=");
        let a = Document::from_toml_str(POWER_OFF).unwrap().resolve(&defaults()).unwrap();
        let b = Document::from_toml_str(&compact).unwrap().resolve(&defaults()).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }
}
