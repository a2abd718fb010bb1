//! Shared helpers for unit tests: compact constructors for nodes, guests
//! and clusters with per-node aggregates derived from the guest sums.

use crate::inventory::{Cluster, Guest, GuestKind, Node, PressureSet};
use std::collections::{BTreeMap, BTreeSet};

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn node(name: &str, mem_total_gib: u64) -> Node {
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

pub fn guest(id: u32, node: &str, mem_used_gib: u64, mem_assigned_gib: u64) -> Guest {
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

pub fn guest_with_pressure(id: u32, node: &str, pressure: PressureSet) -> Guest {
    let mut g = guest(id, node, 2, 4);
    g.pressure = Some(pressure);
    g
}

/// Assemble a cluster; node usage and assigned totals are backfilled from
/// the guest sums so the aggregate invariants hold by construction.
pub fn cluster(nodes: Vec<Node>, guests: Vec<Guest>) -> Cluster {
    let mut node_map: BTreeMap<String, Node> = BTreeMap::new();
    for mut n in nodes {
        n.cpu_used = 0.0;
        n.cpu_assigned = 0;
        n.mem_used = 0;
        n.mem_assigned = 0;
        n.disk_used = 0;
        n.disk_assigned = 0;
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

pub fn config_from_yaml(extra: &str) -> crate::config::Config {
    let raw = format!(
        r#"
proxmox_api:
  hosts: [pve1]
  user: root@pam
  token_id: t
  token_secret: s
{}"#,
        extra
    );
    serde_yaml::from_str(&raw).expect("valid test config")
}
