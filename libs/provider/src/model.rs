//! Desired and observed state for vApps and routed networks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vcd_networking::{Ipv4Range, NetworkError};

/// Org/VDC namespace within which resource names are unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub org: String,
    pub vdc: String,
}

impl Scope {
    pub fn new(org: impl Into<String>, vdc: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            vdc: vdc.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "org {}, vdc {}", self.org, self.vdc)
    }
}

/// Resolved org/VDC context.
///
/// Read-only once resolved; safe to reuse for every reconciliation in a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeHandle {
    pub scope: Scope,
    pub org_id: String,
    pub vdc_id: String,
}

// ============================================================================
// Power status
// ============================================================================

/// vApp power status as reported by the platform.
///
/// Only the two terminal states are modeled; everything else the platform
/// reports (e.g. `RESOLVED`, `MIXED`) is kept verbatim as transitional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PowerStatus {
    PoweredOn,
    PoweredOff,
    Transitional(String),
}

impl PowerStatus {
    pub const POWERED_ON: &'static str = "POWERED_ON";
    pub const POWERED_OFF: &'static str = "POWERED_OFF";

    /// Map a numeric platform status code.
    pub fn from_code(code: i32) -> Self {
        let name = match code {
            4 => return Self::PoweredOn,
            8 => return Self::PoweredOff,
            -1 => "FAILED_CREATION",
            0 => "UNRESOLVED",
            1 => "RESOLVED",
            2 => "DEPLOYED",
            3 => "SUSPENDED",
            5 => "WAITING_FOR_INPUT",
            6 => "UNKNOWN",
            7 => "UNRECOGNIZED",
            9 => "INCONSISTENT_STATE",
            10 => "MIXED",
            other => return Self::Transitional(format!("UNKNOWN({other})")),
        };
        Self::Transitional(name.to_string())
    }

    /// Terminal status matching a desired `power_on` flag.
    pub fn desired(power_on: bool) -> Self {
        if power_on {
            Self::PoweredOn
        } else {
            Self::PoweredOff
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PoweredOn => Self::POWERED_ON,
            Self::PoweredOff => Self::POWERED_OFF,
            Self::Transitional(name) => name,
        }
    }

    /// Returns true for `POWERED_ON` / `POWERED_OFF`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transitional(_))
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PowerStatus {
    fn from(name: String) -> Self {
        match name.as_str() {
            Self::POWERED_ON => Self::PoweredOn,
            Self::POWERED_OFF => Self::PoweredOff,
            _ => Self::Transitional(name),
        }
    }
}

impl From<PowerStatus> for String {
    fn from(status: PowerStatus) -> Self {
        status.as_str().to_string()
    }
}

impl Serialize for PowerStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PowerStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

// ============================================================================
// IP addressing
// ============================================================================

/// How the child VM obtains its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpMode {
    /// Literal address from the network's static pool.
    Static(Ipv4Addr),

    /// Next free address from the static pool, picked by the platform.
    Allocated,

    /// Leased from the network's DHCP pool.
    Dhcp,
}

impl IpMode {
    pub const ALLOCATED: &'static str = "allocated";
    pub const DHCP: &'static str = "dhcp";

    pub fn allocation_mode(&self) -> AllocationMode {
        match self {
            Self::Static(_) => AllocationMode::Manual,
            Self::Allocated => AllocationMode::Pool,
            Self::Dhcp => AllocationMode::Dhcp,
        }
    }
}

impl fmt::Display for IpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(addr) => write!(f, "{addr}"),
            Self::Allocated => f.write_str(Self::ALLOCATED),
            Self::Dhcp => f.write_str(Self::DHCP),
        }
    }
}

impl FromStr for IpMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::ALLOCATED => Ok(Self::Allocated),
            Self::DHCP => Ok(Self::Dhcp),
            other => other
                .parse()
                .map(Self::Static)
                .map_err(|_| NetworkError::InvalidAddress(other.to_string())),
        }
    }
}

impl Serialize for IpMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Address allocation mode of a VM network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMode {
    Manual,
    Pool,
    Dhcp,
}

// ============================================================================
// vApp
// ============================================================================

pub fn default_power_on() -> bool {
    true
}

pub fn default_cpus() -> u32 {
    1
}

pub fn default_memory_mb() -> u32 {
    1024
}

/// Desired state of a vApp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VAppSpec {
    pub org: String,
    pub vdc: String,

    /// Lookup key within the vdc; also the name given to the child VM.
    pub name: String,

    pub template_name: String,
    pub catalog_name: String,

    /// Routed network that must already exist.
    pub network_name: String,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_mb", rename = "memory")]
    pub memory_mb: u32,

    pub ip: IpMode,

    #[serde(default = "default_power_on")]
    pub power_on: bool,
}

impl VAppSpec {
    pub fn scope(&self) -> Scope {
        Scope::new(&self.org, &self.vdc)
    }
}

/// A VM inside a vApp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedVm {
    pub name: String,
    pub network_name: Option<String>,
    pub allocation_mode: Option<AllocationMode>,
    pub ip: Option<Ipv4Addr>,
    pub cpus: u32,
    pub memory_mb: u32,
}

/// Observed state of a vApp, read back from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VAppObserved {
    /// Opaque remote identifier.
    pub id: String,
    pub name: String,
    pub status: PowerStatus,
    pub template_name: String,
    pub catalog_name: String,
    pub vms: Vec<ObservedVm>,
}

impl VAppObserved {
    /// The child VM, if the vApp has exactly one.
    pub fn child_vm(&self) -> Option<&ObservedVm> {
        match self.vms.as_slice() {
            [vm] => Some(vm),
            _ => None,
        }
    }

    pub fn child_vm_name(&self) -> Option<&str> {
        self.child_vm().map(|vm| vm.name.as_str())
    }

    /// Address of the child VM, resolved by the platform.
    pub fn assigned_ip(&self) -> Option<Ipv4Addr> {
        self.child_vm().and_then(|vm| vm.ip)
    }
}

/// Change to the child VM of an existing vApp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmUpdate {
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub connection: Option<NetworkConnection>,
}

impl VmUpdate {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory_mb.is_none() && self.connection.is_none()
    }
}

/// Network attachment of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConnection {
    pub network_name: String,
    pub ip: IpMode,
}

// ============================================================================
// Routed network
// ============================================================================

/// Inclusive address pool as declared in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPool {
    pub start_address: Ipv4Addr,
    pub end_address: Ipv4Addr,
}

impl IpPool {
    pub fn range(&self) -> Result<Ipv4Range, NetworkError> {
        Ipv4Range::new(self.start_address, self.end_address)
    }

    /// Whether `addr` lies in the pool. A reversed pool contains nothing.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.range().is_ok_and(|range| range.contains(addr))
    }
}

impl fmt::Display for IpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_address, self.end_address)
    }
}

pub fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

/// Configurable part of a routed network, shared by desired and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub edge_gateway: String,
    pub gateway: Ipv4Addr,

    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns1: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns2: Option<Ipv4Addr>,

    pub static_ip_pool: IpPool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_pool: Option<IpPool>,
}

impl NetworkSettings {
    /// Changes that cannot be applied to an existing network in place.
    pub fn incompatible_with(&self, other: &NetworkSettings) -> Option<String> {
        if self.edge_gateway != other.edge_gateway {
            return Some(format!(
                "edge gateway would change from {} to {}",
                self.edge_gateway, other.edge_gateway
            ));
        }
        if self.gateway != other.gateway || self.netmask != other.netmask {
            return Some(format!(
                "subnet would change from {}/{} to {}/{}",
                self.gateway, self.netmask, other.gateway, other.netmask
            ));
        }
        None
    }

    /// Whether `addr` falls in either pool.
    pub fn pools_cover(&self, addr: Ipv4Addr) -> bool {
        self.static_ip_pool.contains(addr) || self.dhcp_pool.is_some_and(|pool| pool.contains(addr))
    }
}

/// Desired state of a routed network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub org: String,
    pub vdc: String,

    #[serde(flatten)]
    pub settings: NetworkSettings,
}

impl NetworkSpec {
    pub fn scope(&self) -> Scope {
        Scope::new(&self.org, &self.vdc)
    }
}

/// Observed state of a routed network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkObserved {
    pub id: String,
    pub name: String,
    pub settings: NetworkSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_status_codes() {
        assert_eq!(PowerStatus::from_code(4), PowerStatus::PoweredOn);
        assert_eq!(PowerStatus::from_code(8), PowerStatus::PoweredOff);
        assert_eq!(
            PowerStatus::from_code(10),
            PowerStatus::Transitional("MIXED".to_string())
        );
        assert_eq!(PowerStatus::from_code(42).as_str(), "UNKNOWN(42)");
        assert!(!PowerStatus::from_code(1).is_terminal());
    }

    #[test]
    fn test_power_status_text() {
        let status: PowerStatus = serde_json::from_str("\"POWERED_OFF\"").unwrap();
        assert_eq!(status, PowerStatus::PoweredOff);
        assert_eq!(
            PowerStatus::from("SUSPENDED".to_string()),
            PowerStatus::Transitional("SUSPENDED".to_string())
        );
        assert_eq!(PowerStatus::desired(true).to_string(), "POWERED_ON");
    }

    #[test]
    fn test_ip_mode_parse() {
        assert_eq!("allocated".parse::<IpMode>().unwrap(), IpMode::Allocated);
        assert_eq!("dhcp".parse::<IpMode>().unwrap(), IpMode::Dhcp);
        assert_eq!(
            "10.10.102.160".parse::<IpMode>().unwrap(),
            IpMode::Static(Ipv4Addr::new(10, 10, 102, 160))
        );
        assert!("10.10.102".parse::<IpMode>().is_err());
        assert_eq!(IpMode::Allocated.to_string(), "allocated");
    }

    #[test]
    fn test_vapp_spec_defaults() {
        let spec: VAppSpec = serde_json::from_value(serde_json::json!({
            "org": "org1",
            "vdc": "vdc1",
            "name": "app1",
            "template_name": "photon",
            "catalog_name": "cat",
            "network_name": "net1",
            "ip": "allocated",
        }))
        .unwrap();

        assert!(spec.power_on);
        assert_eq!(spec.cpus, 1);
        assert_eq!(spec.memory_mb, 1024);
        assert_eq!(spec.scope(), Scope::new("org1", "vdc1"));
    }

    #[test]
    fn test_child_vm_requires_exactly_one() {
        let vm = ObservedVm {
            name: "app1".to_string(),
            network_name: Some("net1".to_string()),
            allocation_mode: Some(AllocationMode::Manual),
            ip: Some(Ipv4Addr::new(10, 10, 102, 160)),
            cpus: 1,
            memory_mb: 1024,
        };
        let mut vapp = VAppObserved {
            id: "urn:vcloud:vapp:1".to_string(),
            name: "app1".to_string(),
            status: PowerStatus::PoweredOn,
            template_name: "photon".to_string(),
            catalog_name: "cat".to_string(),
            vms: vec![vm.clone()],
        };
        assert_eq!(vapp.child_vm_name(), Some("app1"));
        assert_eq!(vapp.assigned_ip(), Some(Ipv4Addr::new(10, 10, 102, 160)));

        vapp.vms.push(vm);
        assert_eq!(vapp.child_vm_name(), None);
    }

    #[test]
    fn test_network_settings_compatibility() {
        let base = NetworkSettings {
            edge_gateway: "edge1".to_string(),
            gateway: Ipv4Addr::new(10, 10, 103, 1),
            netmask: default_netmask(),
            dns1: None,
            dns2: None,
            static_ip_pool: IpPool {
                start_address: Ipv4Addr::new(10, 10, 103, 2),
                end_address: Ipv4Addr::new(10, 10, 103, 170),
            },
            dhcp_pool: Some(IpPool {
                start_address: Ipv4Addr::new(10, 10, 103, 171),
                end_address: Ipv4Addr::new(10, 10, 103, 254),
            }),
        };

        let mut pools_changed = base.clone();
        pools_changed.static_ip_pool.end_address = Ipv4Addr::new(10, 10, 103, 100);
        assert!(base.incompatible_with(&pools_changed).is_none());

        let mut moved = base.clone();
        moved.gateway = Ipv4Addr::new(10, 10, 104, 1);
        assert!(base.incompatible_with(&moved).is_some());

        assert!(base.pools_cover(Ipv4Addr::new(10, 10, 103, 200)));
        assert!(!base.pools_cover(Ipv4Addr::new(10, 10, 103, 1)));
    }

    #[test]
    fn test_ip_pool_contains_bounds() {
        let pool = IpPool {
            start_address: Ipv4Addr::new(10, 10, 102, 2),
            end_address: Ipv4Addr::new(10, 10, 102, 254),
        };
        assert!(pool.contains(Ipv4Addr::new(10, 10, 102, 2)));
        assert!(pool.contains(Ipv4Addr::new(10, 10, 102, 254)));
        assert!(!pool.contains(Ipv4Addr::new(10, 10, 102, 1)));
        assert_eq!(pool.to_string(), "10.10.102.2-10.10.102.254");

        let reversed = IpPool {
            start_address: pool.end_address,
            end_address: pool.start_address,
        };
        assert!(!reversed.contains(Ipv4Addr::new(10, 10, 102, 100)));
    }
}
