/// Cluster Inventory
///
/// This module builds the canonical in-memory cluster snapshot from the
/// hypervisor API:
/// - nodes with capacity, live usage, assigned totals and pressure metrics
/// - guests with normalized units, tags, disks and lock state
/// - ignore and maintenance filtering, including HA-reported maintenance
///
/// The snapshot is built once per cycle. After constraint compilation has
/// marked ignore/pin state it is treated as immutable; the placement engine
/// works on its own clone.
pub mod normalize;

use crate::api::{PressureWire, ProxmoxApi, TripletWire};
use crate::config::Config;
use crate::error::{BalancerError, Result};
use crate::placement::Mode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Guest kind as the API distinguishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Vm,
    Ct,
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestKind::Vm => write!(f, "vm"),
            GuestKind::Ct => write!(f, "ct"),
        }
    }
}

/// One pressure-stall triplet, fractions in [0,1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureTriplet {
    pub some: f64,
    pub full: f64,
    pub spikes: f64,
}

impl From<TripletWire> for PressureTriplet {
    fn from(wire: TripletWire) -> Self {
        Self { some: wire.some, full: wire.full, spikes: wire.spikes }
    }
}

/// Pressure triplets per balancing dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureSet {
    pub cpu: PressureTriplet,
    pub memory: PressureTriplet,
    pub disk: PressureTriplet,
}

impl From<PressureWire> for PressureSet {
    fn from(wire: PressureWire) -> Self {
        Self {
            cpu: wire.cpu.map(Into::into).unwrap_or_default(),
            memory: wire.memory.map(Into::into).unwrap_or_default(),
            disk: wire.io.map(Into::into).unwrap_or_default(),
        }
    }
}

/// One cluster member.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub online: bool,
    pub pve_major: u32,
    /// Physical cores.
    pub cpu_total: u64,
    /// Fraction-of-a-core units, additive with guest usage.
    pub cpu_used: f64,
    /// Sum of resident guests' assigned cores.
    pub cpu_assigned: u64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_assigned: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_assigned: u64,
    pub pressure: Option<PressureSet>,
    /// Reserved memory headroom in bytes.
    pub reserved_memory: u64,
    /// Sources moves but never receives them.
    pub maintenance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    IdeDisk,
    Scsi,
    Virtio,
    Sata,
    Nvme,
    RootFs,
}

#[derive(Debug, Clone)]
pub struct GuestDisk {
    pub slot: String,
    pub kind: DiskKind,
    pub shared: bool,
}

/// One VM or container.
#[derive(Debug, Clone)]
pub struct Guest {
    pub id: u32,
    pub name: String,
    pub kind: GuestKind,
    pub node: String,
    pub running: bool,
    pub cpu_cores: u64,
    /// Recent-window mean, fraction-of-a-core units.
    pub cpu_used: f64,
    pub mem_assigned: u64,
    pub mem_used: u64,
    pub disk_assigned: u64,
    pub disk_used: u64,
    pub pressure: Option<PressureSet>,
    pub tags: BTreeSet<String>,
    pub pool: Option<String>,
    pub disks: Vec<GuestDisk>,
    pub locked: bool,
    /// Never moved, even under enforcement.
    pub ignored: bool,
    /// Allowed destinations; empty means any node.
    pub pinned_nodes: BTreeSet<String>,
    pub pin_strict: bool,
}

impl Guest {
    /// CPU weight; a stopped guest contributes nothing.
    pub fn used_cpu(&self) -> f64 {
        if self.running {
            self.cpu_used
        } else {
            0.0
        }
    }

    pub fn has_local_disk(&self) -> bool {
        self.disks.iter().any(|d| !d.shared)
    }
}

/// The per-cycle snapshot the balancer operates on.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub nodes: BTreeMap<String, Node>,
    pub guests: BTreeMap<u32, Guest>,
    /// Minimum major version across online nodes; gates version-dependent
    /// features.
    pub pve_major: u32,
}

impl Cluster {
    pub fn guests_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Guest> {
        self.guests.values().filter(move |g| g.node == node)
    }

    /// Move a guest between nodes, keeping every per-node aggregate in sync
    /// with the guest sums.
    pub fn apply_move(&mut self, vmid: u32, to: &str) -> Result<()> {
        let guest = self
            .guests
            .get(&vmid)
            .ok_or_else(|| BalancerError::Inventory(format!("unknown guest {}", vmid)))?
            .clone();
        if guest.node == to {
            return Ok(());
        }
        if !self.nodes.contains_key(to) {
            return Err(BalancerError::Inventory(format!("unknown node {}", to)));
        }

        {
            let source = self
                .nodes
                .get_mut(&guest.node)
                .ok_or_else(|| BalancerError::Inventory(format!("unknown node {}", guest.node)))?;
            source.cpu_assigned = source.cpu_assigned.saturating_sub(guest.cpu_cores);
            source.mem_assigned = source.mem_assigned.saturating_sub(guest.mem_assigned);
            source.disk_assigned = source.disk_assigned.saturating_sub(guest.disk_assigned);
            source.cpu_used = (source.cpu_used - guest.used_cpu()).max(0.0);
            source.mem_used = source.mem_used.saturating_sub(guest.mem_used);
            source.disk_used = source.disk_used.saturating_sub(guest.disk_used);
        }
        {
            let target = self.nodes.get_mut(to).unwrap();
            target.cpu_assigned += guest.cpu_cores;
            target.mem_assigned += guest.mem_assigned;
            target.disk_assigned += guest.disk_assigned;
            target.cpu_used += guest.used_cpu();
            target.mem_used += guest.mem_used;
            target.disk_used += guest.disk_used;
        }
        self.guests.get_mut(&vmid).unwrap().node = to.to_string();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for guest in self.guests.values() {
            if !self.nodes.contains_key(&guest.node) {
                return Err(BalancerError::Inventory(format!(
                    "guest {} references unknown node {}",
                    guest.id, guest.node
                )));
            }
        }
        for node in self.nodes.values() {
            if node.online && (node.mem_total == 0 || node.cpu_total == 0) {
                return Err(BalancerError::Inventory(format!(
                    "node {} reports zero capacity",
                    node.name
                )));
            }
        }
        Ok(())
    }
}

/// Build the cluster snapshot for one balancing cycle.
pub async fn build(api: &dyn ProxmoxApi, config: &Config) -> Result<Cluster> {
    let version = api.version().await?;
    let cluster_major = version.major();

    let ignored_nodes: BTreeSet<&str> = config
        .proxmox_cluster
        .ignore_nodes
        .iter()
        .map(String::as_str)
        .collect();
    let configured_maintenance: BTreeSet<&str> = config
        .proxmox_cluster
        .maintenance_nodes
        .iter()
        .map(String::as_str)
        .collect();
    let ha_maintenance = ha_maintenance_nodes(api).await?;

    let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
    for row in api.list_nodes().await? {
        if ignored_nodes.contains(row.node.as_str()) {
            debug!("ignoring node {}", row.node);
            continue;
        }
        let online = row.is_online();
        let mut node = Node {
            name: row.node.clone(),
            online,
            pve_major: cluster_major,
            cpu_total: row.maxcpu,
            cpu_used: row.cpu * row.maxcpu as f64,
            cpu_assigned: 0,
            mem_total: row.maxmem,
            mem_used: row.mem,
            mem_assigned: 0,
            disk_total: row.maxdisk,
            disk_used: row.disk,
            disk_assigned: 0,
            pressure: None,
            reserved_memory: config.balancing.reserved_memory(&row.node),
            maintenance: configured_maintenance.contains(row.node.as_str())
                || ha_maintenance.contains(&row.node),
        };
        if online {
            let status = api.node_status(&node.name).await?;
            if let Some(major) = status.pveversion.as_deref().and_then(normalize::parse_pve_major)
            {
                node.pve_major = major;
            }
            node.pressure = status.pressure.map(Into::into);
        }
        nodes.insert(node.name.clone(), node);
    }

    let pve_major = nodes
        .values()
        .filter(|n| n.online)
        .map(|n| n.pve_major)
        .min()
        .unwrap_or(cluster_major);

    if config.balancing.mode == Mode::Psi && pve_major < 9 {
        return Err(BalancerError::Config(format!(
            "psi mode requires hypervisor major version >= 9, cluster reports {}",
            pve_major
        )));
    }

    let mut guests: BTreeMap<u32, Guest> = BTreeMap::new();
    let node_names: Vec<String> =
        nodes.values().filter(|n| n.online).map(|n| n.name.clone()).collect();
    for node_name in &node_names {
        let (vms, cts) = futures::future::try_join(
            api.list_guests(node_name, GuestKind::Vm),
            api.list_guests(node_name, GuestKind::Ct),
        )
        .await?;
        let rows = vms
            .into_iter()
            .map(|row| (GuestKind::Vm, row))
            .chain(cts.into_iter().map(|row| (GuestKind::Ct, row)));
        for (kind, row) in rows {
            let guest = build_guest(api, config, node_name, kind, row).await?;
            if let Some(previous) = guests.insert(guest.id, guest) {
                return Err(BalancerError::Inventory(format!(
                    "guest id {} appears on multiple nodes ({} and {})",
                    previous.id, previous.node, node_name
                )));
            }
        }
    }

    // Pool membership only matters for pools with a configured rule.
    for pool in config.balancing.pools.keys() {
        match api.pool_members(pool).await {
            Ok(members) => {
                for vmid in members {
                    if let Some(guest) = guests.get_mut(&vmid) {
                        guest.pool = Some(pool.clone());
                    }
                }
            }
            Err(e) => warn!("cannot resolve pool {}: {}", pool, e),
        }
    }

    for guest in guests.values() {
        if let Some(node) = nodes.get_mut(&guest.node) {
            node.cpu_assigned += guest.cpu_cores;
            node.mem_assigned += guest.mem_assigned;
            node.disk_assigned += guest.disk_assigned;
        }
    }

    let cluster = Cluster { nodes, guests, pve_major };
    cluster.validate()?;
    debug!(
        "inventory: {} nodes, {} guests, pve major {}",
        cluster.nodes.len(),
        cluster.guests.len(),
        cluster.pve_major
    );
    Ok(cluster)
}

async fn build_guest(
    api: &dyn ProxmoxApi,
    config: &Config,
    node: &str,
    kind: GuestKind,
    row: crate::api::GuestSummary,
) -> Result<Guest> {
    let guest_config = api.guest_config(node, kind, row.vmid).await?;

    let mut tags = row.tags.as_deref().map(normalize::split_tags).unwrap_or_default();
    if let Some(raw) = guest_config.tags.as_deref() {
        tags.extend(normalize::split_tags(raw));
    }

    let disks: Vec<GuestDisk> = guest_config
        .entries
        .iter()
        .filter_map(|(key, value)| normalize::classify_disk(key, value))
        .collect();

    let running = row.is_running();
    let cpu_cores = (row.cpus.round() as u64).max(1);
    let mut cpu_used = 0.0;
    if running {
        let mut mean = api.guest_rrd_cpu(node, kind, row.vmid).await?.unwrap_or(0.0);
        if mean <= 0.0 {
            // A running guest reporting zero is suspicious; trust the value
            // only after a second read.
            mean = api.guest_rrd_cpu(node, kind, row.vmid).await?.unwrap_or(0.0);
        }
        cpu_used = mean * cpu_cores as f64;
    }

    let pressure = if config.balancing.mode == Mode::Psi && running {
        api.guest_pressure(node, kind, row.vmid).await?.map(Into::into)
    } else {
        None
    };

    Ok(Guest {
        id: row.vmid,
        name: row.name.clone().unwrap_or_else(|| format!("{}{}", kind, row.vmid)),
        kind,
        node: node.to_string(),
        running,
        cpu_cores,
        cpu_used,
        mem_assigned: row.maxmem,
        mem_used: row.mem,
        disk_assigned: row.maxdisk,
        disk_used: row.disk,
        pressure,
        tags,
        pool: None,
        disks,
        locked: row.lock.is_some() || guest_config.lock.is_some(),
        ignored: false,
        pinned_nodes: BTreeSet::new(),
        pin_strict: false,
    })
}

/// Nodes the HA manager currently reports in maintenance mode.
async fn ha_maintenance_nodes(api: &dyn ProxmoxApi) -> Result<BTreeSet<String>> {
    let mut result = BTreeSet::new();
    for entry in api.ha_state().await? {
        let in_maintenance = entry
            .status
            .as_deref()
            .map(|s| s.contains("maintenance"))
            .unwrap_or(false);
        if !in_maintenance {
            continue;
        }
        if let Some(node) = entry.node.clone() {
            result.insert(node);
        } else if let Some(id) = entry.id.as_deref() {
            // LRM entries carry the node name after the colon, e.g.
            // "lrm:pve2".
            if let Some((_, node)) = id.split_once(':') {
                result.insert(node.to_string());
            }
        }
    }
    Ok(result)
}
