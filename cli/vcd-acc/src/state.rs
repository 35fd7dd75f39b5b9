//! Recorded state of applied resources.
//!
//! After each apply the driver records, per resource, the remote id, the
//! scope it lives in, the declaration it was reconciled from and a flat
//! attribute map that checks compare against.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vcd_provider::{NetworkHandle, NetworkSpec, Scope, VAppObserved, VAppSpec};

/// Address of a resource in state, e.g. `vcd_vapp.web`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceKey {
    VApp(String),
    Network(String),
}

impl ResourceKey {
    pub const VAPP_TYPE: &'static str = "vcd_vapp";
    pub const NETWORK_TYPE: &'static str = "vcd_network_routed";

    pub fn name(&self) -> &str {
        match self {
            Self::VApp(name) | Self::Network(name) => name,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VApp(name) => write!(f, "{}.{name}", Self::VAPP_TYPE),
            Self::Network(name) => write!(f, "{}.{name}", Self::NETWORK_TYPE),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid resource address: {s}"))?;
        if name.is_empty() {
            return Err(format!("invalid resource address: {s}"));
        }
        match kind {
            Self::VAPP_TYPE => Ok(Self::VApp(name.to_string())),
            Self::NETWORK_TYPE => Ok(Self::Network(name.to_string())),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// The declaration a resource was last reconciled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared {
    VApp(VAppSpec),
    Network(NetworkSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub id: String,
    pub scope: Scope,
    pub declared: Declared,
    pub attributes: BTreeMap<String, String>,
}

/// All resources applied so far.
#[derive(Debug, Clone, Default)]
pub struct State {
    resources: BTreeMap<ResourceKey, ResourceState>,
}

impl State {
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceState> {
        self.resources.get(key)
    }

    pub fn attribute(&self, key: &ResourceKey, attribute: &str) -> Option<&str> {
        self.get(key)?.attributes.get(attribute).map(String::as_str)
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<ResourceState> {
        self.resources.remove(key)
    }

    pub fn record_vapp(&mut self, spec: &VAppSpec, observed: &VAppObserved) {
        let mut attributes = BTreeMap::new();
        attributes.insert("id".to_string(), observed.id.clone());
        attributes.insert("name".to_string(), observed.name.clone());
        attributes.insert("org".to_string(), spec.org.clone());
        attributes.insert("vdc".to_string(), spec.vdc.clone());
        attributes.insert("template_name".to_string(), spec.template_name.clone());
        attributes.insert("catalog_name".to_string(), spec.catalog_name.clone());
        attributes.insert("network_name".to_string(), spec.network_name.clone());
        attributes.insert("cpus".to_string(), spec.cpus.to_string());
        attributes.insert("memory".to_string(), spec.memory_mb.to_string());
        // Declared form: an address, "allocated" or "dhcp".
        attributes.insert("ip".to_string(), spec.ip.to_string());
        if let Some(addr) = observed.assigned_ip() {
            attributes.insert("assigned_ip".to_string(), addr.to_string());
        }
        attributes.insert("power_on".to_string(), spec.power_on.to_string());
        attributes.insert("status".to_string(), observed.status.to_string());

        self.resources.insert(
            ResourceKey::VApp(spec.name.clone()),
            ResourceState {
                id: observed.id.clone(),
                scope: spec.scope(),
                declared: Declared::VApp(spec.clone()),
                attributes,
            },
        );
    }

    pub fn record_network(&mut self, spec: &NetworkSpec, handle: &NetworkHandle) {
        let settings = &handle.settings;

        let mut attributes = BTreeMap::new();
        attributes.insert("id".to_string(), handle.id.clone());
        attributes.insert("name".to_string(), handle.name.clone());
        attributes.insert("org".to_string(), spec.org.clone());
        attributes.insert("vdc".to_string(), spec.vdc.clone());
        attributes.insert("edge_gateway".to_string(), settings.edge_gateway.clone());
        attributes.insert("gateway".to_string(), settings.gateway.to_string());
        attributes.insert("netmask".to_string(), settings.netmask.to_string());
        attributes.insert("static_ip_pool".to_string(), settings.static_ip_pool.to_string());
        if let Some(dhcp) = &settings.dhcp_pool {
            attributes.insert("dhcp_pool".to_string(), dhcp.to_string());
        }
        for (key, value) in [("dns1", settings.dns1), ("dns2", settings.dns2)] {
            if let Some(addr) = value {
                attributes.insert(key.to_string(), addr.to_string());
            }
        }
        attributes.insert("spec_hash".to_string(), handle.spec_hash.to_string());

        self.resources.insert(
            ResourceKey::Network(spec.name.clone()),
            ResourceState {
                id: handle.id.clone(),
                scope: spec.scope(),
                declared: Declared::Network(spec.clone()),
                attributes,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("vcd_vapp.TestAccVcdVAppVapp", ResourceKey::VApp("TestAccVcdVAppVapp".into()))]
    #[case("vcd_network_routed.net1", ResourceKey::Network("net1".into()))]
    fn test_key_round_trips(#[case] text: &str, #[case] key: ResourceKey) {
        assert_eq!(text.parse::<ResourceKey>().unwrap(), key);
        assert_eq!(key.to_string(), text);
    }

    #[rstest]
    #[case("vcd_vapp")]
    #[case("vcd_vapp.")]
    #[case("vcd_vm.web")]
    fn test_bad_keys(#[case] text: &str) {
        assert!(text.parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_key_ordering_groups_by_type() {
        let mut keys = vec![
            ResourceKey::Network("a".into()),
            ResourceKey::VApp("b".into()),
        ];
        keys.sort();
        assert!(matches!(keys[0], ResourceKey::VApp(_)));
    }
}
