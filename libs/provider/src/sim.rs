//! In-memory platform for tests and offline runs.
//!
//! Behaves like a small virtual datacenter: scopes, edge gateways and catalog
//! items are seeded up front; networks and vApps are created through the
//! client traits. Addresses come from real pool allocators, so static
//! conflicts, pool exhaustion and overlapping pools surface as rejections the
//! way the real platform reports them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;
use vcd_networking::{ensure_disjoint, Ipv4PoolAllocator, Ipv4Subnet, NetworkError};

use crate::client::{ClientError, NetworkStore, ScopeResolver, VAppStore};
use crate::error::Operation;
use crate::model::{
    IpMode, NetworkConnection, NetworkObserved, NetworkSettings, ObservedVm, PowerStatus, Scope,
    ScopeHandle, VAppObserved, VAppSpec, VmUpdate,
};

/// Status reported while a power transition is still settling.
pub const SETTLING_STATUS: &str = "UNRESOLVED";

type Key = (Scope, String);

fn key(scope: &ScopeHandle, name: &str) -> Key {
    (scope.scope.clone(), name.to_string())
}

struct SimNetwork {
    observed: NetworkObserved,
    static_pool: Ipv4PoolAllocator,
    dhcp_pool: Option<Ipv4PoolAllocator>,
}

impl SimNetwork {
    fn build(id: String, name: &str, settings: &NetworkSettings) -> Result<Self, NetworkError> {
        let subnet = Ipv4Subnet::from_netmask(settings.gateway, settings.netmask)?;

        let static_range = settings.static_ip_pool.range()?;
        subnet.ensure_contains(&static_range)?;
        let mut ranges = vec![static_range];

        let dhcp_range = settings.dhcp_pool.map(|pool| pool.range()).transpose()?;
        if let Some(range) = dhcp_range {
            subnet.ensure_contains(&range)?;
            ranges.push(range);
        }
        ensure_disjoint(&ranges)?;

        Ok(Self {
            observed: NetworkObserved {
                id,
                name: name.to_string(),
                settings: settings.clone(),
            },
            static_pool: Ipv4PoolAllocator::new(vec![static_range]),
            dhcp_pool: dhcp_range.map(|range| Ipv4PoolAllocator::new(vec![range])),
        })
    }

    fn assign(&mut self, mode: IpMode) -> Result<Ipv4Addr, NetworkError> {
        match mode {
            IpMode::Static(addr) => self.static_pool.claim(addr),
            IpMode::Allocated => self.static_pool.allocate(),
            IpMode::Dhcp => match self.dhcp_pool.as_mut() {
                Some(pool) => pool.allocate(),
                None => Err(NetworkError::PoolExhausted(format!(
                    "network {} has no DHCP pool",
                    self.observed.name
                ))),
            },
        }
    }

    fn release(&mut self, addr: Ipv4Addr) {
        if !self.static_pool.release(addr) {
            if let Some(pool) = self.dhcp_pool.as_mut() {
                pool.release(addr);
            }
        }
    }

    fn in_use(&self) -> Vec<Ipv4Addr> {
        let mut addrs: Vec<_> = self.static_pool.in_use().collect();
        if let Some(pool) = &self.dhcp_pool {
            addrs.extend(pool.in_use());
        }
        addrs.sort();
        addrs
    }
}

struct SimVApp {
    observed: VAppObserved,
    settling_reads: u32,
}

impl SimVApp {
    fn status(&mut self) -> PowerStatus {
        if self.settling_reads > 0 {
            self.settling_reads -= 1;
            PowerStatus::Transitional(SETTLING_STATUS.to_string())
        } else {
            self.observed.status.clone()
        }
    }

    fn snapshot(&mut self) -> VAppObserved {
        let mut observed = self.observed.clone();
        observed.status = self.status();
        observed
    }
}

#[derive(Default)]
struct SimState {
    scopes: BTreeMap<Scope, ScopeHandle>,
    edge_gateways: BTreeSet<(Scope, String)>,
    catalog_items: BTreeSet<(String, String)>,
    networks: BTreeMap<Key, SimNetwork>,
    vapps: BTreeMap<Key, SimVApp>,
    pending_failures: Vec<(Operation, String)>,
    /// vApp name to the VM name its next create produces.
    misnamed_vms: BTreeMap<String, String>,
    status_lag: u32,
    mutations: u64,
}

impl SimState {
    fn take_failure(&mut self, operation: Operation) -> Result<(), ClientError> {
        match self
            .pending_failures
            .iter()
            .position(|(op, _)| *op == operation)
        {
            Some(idx) => {
                let (_, message) = self.pending_failures.remove(idx);
                Err(ClientError::Rejected(message))
            }
            None => Ok(()),
        }
    }

    fn vapp_mut(&mut self, scope: &ScopeHandle, vapp: &VAppObserved) -> Result<&mut SimVApp, ClientError> {
        match self.vapps.get_mut(&key(scope, &vapp.name)) {
            Some(found) if found.observed.id == vapp.id => Ok(found),
            _ => Err(ClientError::NotFound),
        }
    }

    fn network_mut(&mut self, scope: &ScopeHandle, name: &str) -> Result<&mut SimNetwork, ClientError> {
        self.networks
            .get_mut(&key(scope, name))
            .ok_or_else(|| ClientError::Rejected(format!("network {name} not found")))
    }

    fn connect(
        &mut self,
        scope: &ScopeHandle,
        connection: &NetworkConnection,
    ) -> Result<Ipv4Addr, ClientError> {
        let network = self.network_mut(scope, &connection.network_name)?;
        network
            .assign(connection.ip)
            .map_err(|e| ClientError::Rejected(e.to_string()))
    }

    fn disconnect(&mut self, scope: &ScopeHandle, vm: &ObservedVm) {
        if let (Some(name), Some(addr)) = (&vm.network_name, vm.ip) {
            if let Some(network) = self.networks.get_mut(&key(scope, name)) {
                network.release(addr);
            }
        }
    }
}

/// Simulated virtual datacenter.
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// Create an empty platform.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    /// Seed an org/VDC pair.
    pub fn with_vdc(mut self, org: &str, vdc: &str) -> Self {
        let scope = Scope::new(org, vdc);
        let handle = ScopeHandle {
            scope: scope.clone(),
            org_id: format!("urn:vcloud:org:{}", Uuid::new_v4()),
            vdc_id: format!("urn:vcloud:vdc:{}", Uuid::new_v4()),
        };
        self.state.get_mut().scopes.insert(scope, handle);
        self
    }

    /// Seed an edge gateway in an org/VDC.
    pub fn with_edge_gateway(mut self, org: &str, vdc: &str, name: &str) -> Self {
        self.state
            .get_mut()
            .edge_gateways
            .insert((Scope::new(org, vdc), name.to_string()));
        self
    }

    /// Seed a catalog item that vApps can be instantiated from.
    pub fn with_catalog_item(mut self, catalog: &str, item: &str) -> Self {
        self.state
            .get_mut()
            .catalog_items
            .insert((catalog.to_string(), item.to_string()));
        self
    }

    /// Number of status reads that stay transitional after each power operation.
    pub fn with_status_lag(mut self, reads: u32) -> Self {
        self.state.get_mut().status_lag = reads;
        self
    }

    /// Make the next call of `operation` fail with `message`.
    pub async fn fail_next(&self, operation: Operation, message: &str) {
        self.state
            .lock()
            .await
            .pending_failures
            .push((operation, message.to_string()));
    }

    /// Count of successful mutating calls so far.
    pub async fn mutation_count(&self) -> u64 {
        self.state.lock().await.mutations
    }

    /// Names of vApps currently present in a scope.
    pub async fn vapp_names(&self, scope: &Scope) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .vapps
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Give the VM of the next created `vapp` a different name.
    pub async fn misname_next_vm(&self, vapp: &str, vm_name: &str) {
        self.state
            .lock()
            .await
            .misnamed_vms
            .insert(vapp.to_string(), vm_name.to_string());
    }

    /// Rename the first VM of a vApp, producing an unexpected topology.
    pub async fn rename_child_vm(&self, scope: &Scope, vapp: &str, vm_name: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(found) = state.vapps.get_mut(&(scope.clone(), vapp.to_string())) else {
            return false;
        };
        match found.observed.vms.first_mut() {
            Some(vm) => {
                vm.name = vm_name.to_string();
                true
            }
            None => false,
        }
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScopeResolver for SimPlatform {
    async fn resolve_scope(&self, org: &str, vdc: &str) -> Result<ScopeHandle, ClientError> {
        let state = self.state.lock().await;
        state
            .scopes
            .get(&Scope::new(org, vdc))
            .cloned()
            .ok_or(ClientError::NotFound)
    }
}

#[async_trait]
impl VAppStore for SimPlatform {
    async fn find_vapp_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<VAppObserved, ClientError> {
        let mut state = self.state.lock().await;
        state
            .vapps
            .get_mut(&key(scope, name))
            .map(SimVApp::snapshot)
            .ok_or(ClientError::NotFound)
    }

    async fn read_status(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
    ) -> Result<PowerStatus, ClientError> {
        let mut state = self.state.lock().await;
        Ok(state.vapp_mut(scope, vapp)?.status())
    }

    async fn create_vapp(
        &self,
        scope: &ScopeHandle,
        spec: &VAppSpec,
    ) -> Result<VAppObserved, ClientError> {
        self.state.lock().await.take_failure(Operation::CreateVApp)?;

        let mut state = self.state.lock().await;
        if state.vapps.contains_key(&key(scope, &spec.name)) {
            return Err(ClientError::Rejected(format!(
                "vApp {} already exists",
                spec.name
            )));
        }
        if !state
            .catalog_items
            .contains(&(spec.catalog_name.clone(), spec.template_name.clone()))
        {
            return Err(ClientError::Rejected(format!(
                "catalog item {} not found in catalog {}",
                spec.template_name, spec.catalog_name
            )));
        }

        let connection = NetworkConnection {
            network_name: spec.network_name.clone(),
            ip: spec.ip,
        };
        let ip = state.connect(scope, &connection)?;
        let vm_name = state
            .misnamed_vms
            .remove(&spec.name)
            .unwrap_or_else(|| spec.name.clone());

        let observed = VAppObserved {
            id: format!("urn:vcloud:vapp:{}", Uuid::new_v4()),
            name: spec.name.clone(),
            status: PowerStatus::PoweredOff,
            template_name: spec.template_name.clone(),
            catalog_name: spec.catalog_name.clone(),
            vms: vec![ObservedVm {
                name: vm_name,
                network_name: Some(spec.network_name.clone()),
                allocation_mode: Some(spec.ip.allocation_mode()),
                ip: Some(ip),
                cpus: spec.cpus,
                memory_mb: spec.memory_mb,
            }],
        };

        info!(vapp = %spec.name, id = %observed.id, ip = %ip, "[SIM] vApp created");
        state.vapps.insert(
            key(scope, &spec.name),
            SimVApp {
                observed: observed.clone(),
                settling_reads: 0,
            },
        );
        state.mutations += 1;
        Ok(observed)
    }

    async fn update_vm(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
        update: &VmUpdate,
    ) -> Result<VAppObserved, ClientError> {
        self.state.lock().await.take_failure(Operation::UpdateVm)?;

        let mut state = self.state.lock().await;
        let mut vm = state
            .vapp_mut(scope, vapp)?
            .observed
            .vms
            .first()
            .cloned()
            .ok_or_else(|| ClientError::Rejected(format!("vApp {} has no VM", vapp.name)))?;

        if let Some(connection) = &update.connection {
            state.disconnect(scope, &vm);
            match state.connect(scope, connection) {
                Ok(ip) => {
                    vm.network_name = Some(connection.network_name.clone());
                    vm.allocation_mode = Some(connection.ip.allocation_mode());
                    vm.ip = Some(ip);
                }
                Err(e) => {
                    // Put the previous address back before reporting.
                    if let (Some(name), Some(addr)) = (&vm.network_name, vm.ip) {
                        if let Some(network) = state.networks.get_mut(&key(scope, name)) {
                            let _ = network.static_pool.claim(addr).or_else(|_| {
                                network
                                    .dhcp_pool
                                    .as_mut()
                                    .map_or(Err(NetworkError::InUse(addr)), |pool| pool.claim(addr))
                            });
                        }
                    }
                    return Err(e);
                }
            }
        }
        if let Some(cpus) = update.cpus {
            vm.cpus = cpus;
        }
        if let Some(memory_mb) = update.memory_mb {
            vm.memory_mb = memory_mb;
        }

        let found = state.vapp_mut(scope, vapp)?;
        found.observed.vms[0] = vm;
        let observed = found.snapshot();
        state.mutations += 1;
        info!(vapp = %vapp.name, "[SIM] VM reconfigured");
        Ok(observed)
    }

    async fn power_on(&self, scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError> {
        self.state.lock().await.take_failure(Operation::PowerOn)?;

        let mut state = self.state.lock().await;
        let lag = state.status_lag;
        let found = state.vapp_mut(scope, vapp)?;
        found.observed.status = PowerStatus::PoweredOn;
        found.settling_reads = lag;
        state.mutations += 1;
        info!(vapp = %vapp.name, "[SIM] vApp powered on");
        Ok(())
    }

    async fn power_off(
        &self,
        scope: &ScopeHandle,
        vapp: &VAppObserved,
    ) -> Result<(), ClientError> {
        self.state.lock().await.take_failure(Operation::PowerOff)?;

        let mut state = self.state.lock().await;
        let lag = state.status_lag;
        let found = state.vapp_mut(scope, vapp)?;
        found.observed.status = PowerStatus::PoweredOff;
        found.settling_reads = lag;
        state.mutations += 1;
        info!(vapp = %vapp.name, "[SIM] vApp powered off");
        Ok(())
    }

    async fn delete(&self, scope: &ScopeHandle, vapp: &VAppObserved) -> Result<(), ClientError> {
        self.state.lock().await.take_failure(Operation::DeleteVApp)?;

        let mut state = self.state.lock().await;
        let found = state.vapp_mut(scope, vapp)?;
        if found.observed.status == PowerStatus::PoweredOn {
            return Err(ClientError::Rejected(format!(
                "vApp {} must be powered off before it can be deleted",
                vapp.name
            )));
        }

        if let Some(removed) = state.vapps.remove(&key(scope, &vapp.name)) {
            for vm in &removed.observed.vms {
                state.disconnect(scope, vm);
            }
        }
        state.mutations += 1;
        info!(vapp = %vapp.name, "[SIM] vApp deleted");
        Ok(())
    }
}

#[async_trait]
impl NetworkStore for SimPlatform {
    async fn find_network_by_name(
        &self,
        scope: &ScopeHandle,
        name: &str,
    ) -> Result<NetworkObserved, ClientError> {
        let state = self.state.lock().await;
        state
            .networks
            .get(&key(scope, name))
            .map(|network| network.observed.clone())
            .ok_or(ClientError::NotFound)
    }

    async fn create_network(
        &self,
        scope: &ScopeHandle,
        name: &str,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError> {
        self.state.lock().await.take_failure(Operation::CreateNetwork)?;

        let mut state = self.state.lock().await;
        if state.networks.contains_key(&key(scope, name)) {
            return Err(ClientError::Rejected(format!("network {name} already exists")));
        }
        if !state
            .edge_gateways
            .contains(&(scope.scope.clone(), settings.edge_gateway.clone()))
        {
            return Err(ClientError::Rejected(format!(
                "edge gateway {} not found",
                settings.edge_gateway
            )));
        }

        let id = format!("urn:vcloud:network:{}", Uuid::new_v4());
        let network = SimNetwork::build(id, name, settings)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        let observed = network.observed.clone();

        state.networks.insert(key(scope, name), network);
        state.mutations += 1;
        info!(network = %name, gateway = %settings.gateway, "[SIM] Network created");
        Ok(observed)
    }

    async fn update_network(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
        settings: &NetworkSettings,
    ) -> Result<NetworkObserved, ClientError> {
        self.state.lock().await.take_failure(Operation::UpdateNetwork)?;

        let mut state = self.state.lock().await;
        let current = state
            .networks
            .get(&key(scope, &network.name))
            .filter(|found| found.observed.id == network.id)
            .ok_or(ClientError::NotFound)?;

        let mut rebuilt = SimNetwork::build(network.id.clone(), &network.name, settings)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        for addr in current.in_use() {
            let claimed = rebuilt.static_pool.claim(addr).or_else(|_| {
                rebuilt
                    .dhcp_pool
                    .as_mut()
                    .map_or(Err(NetworkError::InUse(addr)), |pool| pool.claim(addr))
            });
            if claimed.is_err() {
                return Err(ClientError::Rejected(format!(
                    "address {addr} is in use and not covered by the new pools"
                )));
            }
        }

        let observed = rebuilt.observed.clone();
        state.networks.insert(key(scope, &network.name), rebuilt);
        state.mutations += 1;
        info!(network = %network.name, "[SIM] Network updated");
        Ok(observed)
    }

    async fn delete_network(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<(), ClientError> {
        self.state.lock().await.take_failure(Operation::DeleteNetwork)?;

        let mut state = self.state.lock().await;
        let k = key(scope, &network.name);
        match state.networks.get(&k) {
            Some(found) if found.observed.id == network.id => {
                if !found.in_use().is_empty() {
                    return Err(ClientError::Rejected(format!(
                        "network {} is still used by VMs",
                        network.name
                    )));
                }
            }
            _ => return Err(ClientError::NotFound),
        }

        state.networks.remove(&k);
        state.mutations += 1;
        info!(network = %network.name, "[SIM] Network deleted");
        Ok(())
    }

    async fn allocated_addresses(
        &self,
        scope: &ScopeHandle,
        network: &NetworkObserved,
    ) -> Result<Vec<Ipv4Addr>, ClientError> {
        let state = self.state.lock().await;
        state
            .networks
            .get(&key(scope, &network.name))
            .map(SimNetwork::in_use)
            .ok_or(ClientError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IpPool;

    fn platform() -> SimPlatform {
        SimPlatform::new()
            .with_vdc("org1", "vdc1")
            .with_edge_gateway("org1", "vdc1", "edge1")
            .with_catalog_item("cat", "photon")
    }

    fn settings(third: u8) -> NetworkSettings {
        NetworkSettings {
            edge_gateway: "edge1".to_string(),
            gateway: Ipv4Addr::new(10, 10, third, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns1: None,
            dns2: None,
            static_ip_pool: IpPool {
                start_address: Ipv4Addr::new(10, 10, third, 2),
                end_address: Ipv4Addr::new(10, 10, third, 254),
            },
            dhcp_pool: None,
        }
    }

    fn spec(name: &str, ip: IpMode) -> VAppSpec {
        VAppSpec {
            org: "org1".to_string(),
            vdc: "vdc1".to_string(),
            name: name.to_string(),
            template_name: "photon".to_string(),
            catalog_name: "cat".to_string(),
            network_name: "net1".to_string(),
            cpus: 1,
            memory_mb: 1024,
            ip,
            power_on: true,
        }
    }

    #[tokio::test]
    async fn test_unknown_scope_is_not_found() {
        let sim = platform();
        assert!(sim.resolve_scope("org1", "vdc1").await.is_ok());
        assert!(matches!(
            sim.resolve_scope("org1", "other").await,
            Err(ClientError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_overlapping_pools() {
        let sim = platform();
        let scope = sim.resolve_scope("org1", "vdc1").await.unwrap();

        let mut bad = settings(103);
        bad.dhcp_pool = Some(IpPool {
            start_address: Ipv4Addr::new(10, 10, 103, 100),
            end_address: Ipv4Addr::new(10, 10, 103, 254),
        });
        let err = sim.create_network(&scope, "net2", &bad).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m.contains("overlap")));
    }

    #[tokio::test]
    async fn test_static_address_conflict_is_rejected() {
        let sim = platform();
        let scope = sim.resolve_scope("org1", "vdc1").await.unwrap();
        sim.create_network(&scope, "net1", &settings(102)).await.unwrap();

        let ip = IpMode::Static(Ipv4Addr::new(10, 10, 102, 160));
        sim.create_vapp(&scope, &spec("app1", ip)).await.unwrap();
        let err = sim.create_vapp(&scope, &spec("app2", ip)).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m.contains("in use")));
    }

    #[tokio::test]
    async fn test_status_lag_reports_transitional() {
        let sim = platform().with_status_lag(2);
        let scope = sim.resolve_scope("org1", "vdc1").await.unwrap();
        sim.create_network(&scope, "net1", &settings(102)).await.unwrap();
        let vapp = sim
            .create_vapp(&scope, &spec("app1", IpMode::Allocated))
            .await
            .unwrap();

        sim.power_on(&scope, &vapp).await.unwrap();
        assert!(!sim.read_status(&scope, &vapp).await.unwrap().is_terminal());
        assert!(!sim.read_status(&scope, &vapp).await.unwrap().is_terminal());
        assert_eq!(
            sim.read_status(&scope, &vapp).await.unwrap(),
            PowerStatus::PoweredOn
        );
    }

    #[tokio::test]
    async fn test_delete_requires_power_off_and_frees_address() {
        let sim = platform();
        let scope = sim.resolve_scope("org1", "vdc1").await.unwrap();
        let net = sim.create_network(&scope, "net1", &settings(102)).await.unwrap();
        let vapp = sim
            .create_vapp(&scope, &spec("app1", IpMode::Allocated))
            .await
            .unwrap();
        assert_eq!(vapp.assigned_ip(), Some(Ipv4Addr::new(10, 10, 102, 2)));

        sim.power_on(&scope, &vapp).await.unwrap();
        assert!(sim.delete(&scope, &vapp).await.is_err());

        sim.power_off(&scope, &vapp).await.unwrap();
        sim.delete(&scope, &vapp).await.unwrap();
        assert!(sim.allocated_addresses(&scope, &net).await.unwrap().is_empty());
        assert!(sim.vapp_names(&scope.scope).await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let sim = platform();
        let scope = sim.resolve_scope("org1", "vdc1").await.unwrap();
        sim.fail_next(Operation::CreateNetwork, "quota exceeded").await;

        let err = sim
            .create_network(&scope, "net1", &settings(102))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request rejected: quota exceeded");
        assert!(sim.create_network(&scope, "net1", &settings(102)).await.is_ok());
    }
}
