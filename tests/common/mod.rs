#![allow(dead_code)]

// Shared fixtures for the integration tests: an in-memory fake of the
// hypervisor API and compact cluster constructors.

use async_trait::async_trait;
use proxbalance::api::{
    ClusterTask, GuestConfig, GuestSummary, HaStatusEntry, MigrationRequest, NodeStatus,
    NodeSummary, PressureWire, ProxmoxApi, TaskStatus, VersionInfo,
};
use proxbalance::config::Config;
use proxbalance::inventory::{Cluster, Guest, GuestKind, Node};
use proxbalance::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// One guest as the fake API will report it.
#[derive(Debug, Clone)]
pub struct FakeGuest {
    pub vmid: u32,
    pub node: String,
    pub kind: GuestKind,
    pub running: bool,
    pub mem_used_gib: u64,
    pub mem_assigned_gib: u64,
    pub tags: Option<String>,
}

impl FakeGuest {
    pub fn new(vmid: u32, node: &str, mem_used_gib: u64) -> Self {
        Self {
            vmid,
            node: node.to_string(),
            kind: GuestKind::Vm,
            running: true,
            mem_used_gib,
            mem_assigned_gib: mem_used_gib + 2,
            tags: None,
        }
    }

    pub fn tagged(mut self, tags: &str) -> Self {
        self.tags = Some(tags.to_string());
        self
    }
}

/// In-memory stand-in for a Proxmox cluster: read operations serve the
/// configured topology, migrations are recorded and succeed immediately.
pub struct FakeApi {
    pub node_names: Vec<String>,
    pub node_mem_total_gib: u64,
    pub guests: Vec<FakeGuest>,
    pub migrations: Mutex<Vec<MigrationRequest>>,
}

impl FakeApi {
    pub fn new(node_names: &[&str], guests: Vec<FakeGuest>) -> Self {
        Self {
            node_names: node_names.iter().map(|s| s.to_string()).collect(),
            node_mem_total_gib: 64,
            guests,
            migrations: Mutex::new(Vec::new()),
        }
    }

    pub fn migrated_ids(&self) -> Vec<u32> {
        self.migrations.lock().unwrap().iter().map(|m| m.vmid).collect()
    }
}

#[async_trait]
impl ProxmoxApi for FakeApi {
    async fn version(&self) -> Result<VersionInfo> {
        Ok(VersionInfo { version: "8.2.4".into(), release: None })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        Ok(self
            .node_names
            .iter()
            .map(|name| {
                let used: u64 = self
                    .guests
                    .iter()
                    .filter(|g| &g.node == name && g.running)
                    .map(|g| g.mem_used_gib * GIB)
                    .sum();
                NodeSummary {
                    node: name.clone(),
                    status: Some("online".into()),
                    cpu: 0.1,
                    maxcpu: 16,
                    mem: used,
                    maxmem: self.node_mem_total_gib * GIB,
                    disk: 0,
                    maxdisk: 1024 * GIB,
                }
            })
            .collect())
    }

    async fn node_status(&self, _node: &str) -> Result<NodeStatus> {
        Ok(NodeStatus {
            pveversion: Some("pve-manager/8.2.4/abc".into()),
            pressure: None,
        })
    }

    async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<GuestSummary>> {
        Ok(self
            .guests
            .iter()
            .filter(|g| g.node == node && g.kind == kind)
            .map(|g| GuestSummary {
                vmid: g.vmid,
                name: Some(format!("guest{}", g.vmid)),
                status: Some(if g.running { "running" } else { "stopped" }.into()),
                cpus: 2.0,
                mem: if g.running { g.mem_used_gib * GIB } else { 0 },
                maxmem: g.mem_assigned_gib * GIB,
                disk: 0,
                maxdisk: 32 * GIB,
                tags: g.tags.clone(),
                lock: None,
            })
            .collect())
    }

    async fn guest_config(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u32,
    ) -> Result<GuestConfig> {
        Ok(GuestConfig::default())
    }

    async fn guest_rrd_cpu(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u32,
    ) -> Result<Option<f64>> {
        Ok(Some(0.1))
    }

    async fn guest_pressure(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u32,
    ) -> Result<Option<PressureWire>> {
        Ok(None)
    }

    async fn ha_state(&self) -> Result<Vec<HaStatusEntry>> {
        Ok(vec![])
    }

    async fn pool_members(&self, _pool: &str) -> Result<Vec<u32>> {
        Ok(vec![])
    }

    async fn migrate(&self, request: &MigrationRequest) -> Result<String> {
        self.migrations.lock().unwrap().push(request.clone());
        Ok(format!(
            "UPID:{}:00001234:00000000:00000064:qmigrate:{}:root@pam:",
            request.node, request.vmid
        ))
    }

    async fn task_status(&self, _node: &str, _upid: &str) -> Result<TaskStatus> {
        Ok(TaskStatus {
            status: Some("stopped".into()),
            exitstatus: Some("OK".into()),
            kind: Some("qmigrate".into()),
            node: None,
        })
    }

    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>> {
        Ok(vec![])
    }
}

pub fn config(extra: &str) -> Config {
    let raw = format!(
        r#"
proxmox_api:
  hosts: [pve1]
  user: root@pam
  token_id: balancer
  token_secret: secret
{}"#,
        extra
    );
    serde_yaml::from_str(&raw).expect("valid test config")
}

// Direct cluster constructors for exercising the placement engine without
// the API layer.

pub fn make_node(name: &str, mem_total_gib: u64) -> Node {
    Node {
        name: name.to_string(),
        online: true,
        pve_major: 8,
        cpu_total: 16,
        cpu_used: 0.0,
        cpu_assigned: 0,
        mem_total: mem_total_gib * GIB,
        mem_used: 0,
        mem_assigned: 0,
        disk_total: 1024 * GIB,
        disk_used: 0,
        disk_assigned: 0,
        pressure: None,
        reserved_memory: 0,
        maintenance: false,
    }
}

pub fn make_guest(id: u32, node: &str, mem_used_gib: u64, mem_assigned_gib: u64) -> Guest {
    Guest {
        id,
        name: format!("g{}", id),
        kind: GuestKind::Vm,
        node: node.to_string(),
        running: true,
        cpu_cores: 2,
        cpu_used: 0.2,
        mem_assigned: mem_assigned_gib * GIB,
        mem_used: mem_used_gib * GIB,
        disk_assigned: 10 * GIB,
        disk_used: 5 * GIB,
        pressure: None,
        tags: BTreeSet::new(),
        pool: None,
        disks: vec![],
        locked: false,
        ignored: false,
        pinned_nodes: BTreeSet::new(),
        pin_strict: false,
    }
}

pub fn make_cluster(nodes: Vec<Node>, guests: Vec<Guest>) -> Cluster {
    let mut node_map: BTreeMap<String, Node> = BTreeMap::new();
    for n in nodes {
        node_map.insert(n.name.clone(), n);
    }
    let mut guest_map: BTreeMap<u32, Guest> = BTreeMap::new();
    for g in guests {
        let n = node_map.get_mut(&g.node).expect("guest references a known node");
        n.cpu_used += g.used_cpu();
        n.cpu_assigned += g.cpu_cores;
        n.mem_used += g.mem_used;
        n.mem_assigned += g.mem_assigned;
        n.disk_used += g.disk_used;
        n.disk_assigned += g.disk_assigned;
        guest_map.insert(g.id, g);
    }
    Cluster { nodes: node_map, guests: guest_map, pve_major: 8 }
}

/// Node loads on the used-memory dimension, for independent recomputation.
pub fn memory_loads(cluster: &Cluster) -> HashMap<String, f64> {
    cluster
        .nodes
        .values()
        .filter(|n| n.online && !n.maintenance)
        .map(|n| (n.name.clone(), n.mem_used as f64 / n.mem_total as f64 * 100.0))
        .collect()
}
