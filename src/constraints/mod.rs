/// Constraint Compilation
///
/// Guest tags and declarative pool rules are parsed exactly once per cycle
/// into an immutable `Constraints` artifact with three indexes:
/// - guest -> affinity / anti-affinity groups
/// - guest -> pin set (allowed destinations) with strict flag
/// - node -> guests forbidden by strict pins (the inverted index)
///
/// Tag grammar, case-sensitive: `plb_ignore_*`, `plb_affinity_<key>`,
/// `plb_anti_affinity_<key>`, `plb_pin_<nodename>`.
use crate::config::{Config, PoolRuleKind};
use crate::inventory::Cluster;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const TAG_IGNORE: &str = "plb_ignore";
pub const TAG_IGNORE_PREFIX: &str = "plb_ignore_";
pub const TAG_AFFINITY_PREFIX: &str = "plb_affinity_";
pub const TAG_ANTI_AFFINITY_PREFIX: &str = "plb_anti_affinity_";
pub const TAG_PIN_PREFIX: &str = "plb_pin_";

/// Allowed destinations of one guest; an empty node set means any node.
#[derive(Debug, Clone, Default)]
pub struct PinSet {
    pub nodes: BTreeSet<String>,
    /// Strict pins fail the move when no pinned node is feasible;
    /// preferred pins fall back to any node.
    pub strict: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub affinity: BTreeMap<String, BTreeSet<u32>>,
    pub anti_affinity: BTreeMap<String, BTreeSet<u32>>,
    pub pins: BTreeMap<u32, PinSet>,
    /// Guests a node may never receive, derived by inverting strict pins.
    pub forbidden: BTreeMap<String, BTreeSet<u32>>,
    pub warnings: Vec<String>,
}

impl Constraints {
    pub fn pin(&self, vmid: u32) -> Option<&PinSet> {
        self.pins.get(&vmid)
    }

    /// Affinity groups the guest belongs to.
    pub fn affinity_groups_of(
        &self,
        vmid: u32,
    ) -> impl Iterator<Item = (&String, &BTreeSet<u32>)> {
        self.affinity.iter().filter(move |(_, members)| members.contains(&vmid))
    }

    /// Anti-affinity groups the guest belongs to.
    pub fn anti_affinity_groups_of(
        &self,
        vmid: u32,
    ) -> impl Iterator<Item = (&String, &BTreeSet<u32>)> {
        self.anti_affinity.iter().filter(move |(_, members)| members.contains(&vmid))
    }

    /// Largest affinity group the guest belongs to, for candidate ordering.
    pub fn affinity_group_size(&self, vmid: u32) -> usize {
        self.affinity_groups_of(vmid).map(|(_, members)| members.len()).max().unwrap_or(0)
    }
}

/// Compile tag- and pool-derived rules against the cluster topology.
///
/// Ignore and pin state is written back onto the affected guests; the
/// snapshot is frozen afterwards.
pub fn compile(cluster: &mut Cluster, config: &Config) -> Constraints {
    let mut constraints = Constraints::default();
    let node_names: BTreeSet<String> = cluster.nodes.keys().cloned().collect();
    let mut pool_strict: BTreeSet<u32> = BTreeSet::new();

    // Tag pass.
    for guest in cluster.guests.values_mut() {
        for tag in &guest.tags {
            if tag == TAG_IGNORE || tag.starts_with(TAG_IGNORE_PREFIX) {
                guest.ignored = true;
            } else if let Some(key) = tag.strip_prefix(TAG_ANTI_AFFINITY_PREFIX) {
                constraints
                    .anti_affinity
                    .entry(key.to_string())
                    .or_default()
                    .insert(guest.id);
            } else if let Some(key) = tag.strip_prefix(TAG_AFFINITY_PREFIX) {
                constraints.affinity.entry(key.to_string()).or_default().insert(guest.id);
            } else if let Some(node) = tag.strip_prefix(TAG_PIN_PREFIX) {
                constraints
                    .pins
                    .entry(guest.id)
                    .or_default()
                    .nodes
                    .insert(node.to_string());
            } else if tag.starts_with("plb_") {
                debug!("guest {}: unrecognized balancer tag '{}'", guest.id, tag);
            }
        }
    }

    // Pool pass; pool rules merge with tag rules.
    for (pool, rule) in &config.balancing.pools {
        let members: Vec<u32> = cluster
            .guests
            .values()
            .filter(|g| g.pool.as_deref() == Some(pool.as_str()))
            .map(|g| g.id)
            .collect();
        if members.is_empty() {
            continue;
        }
        let group = match rule.kind {
            PoolRuleKind::Affinity => constraints.affinity.entry(pool.clone()).or_default(),
            PoolRuleKind::AntiAffinity => {
                constraints.anti_affinity.entry(pool.clone()).or_default()
            }
        };
        group.extend(members.iter().copied());
        if let Some(pin_nodes) = &rule.pin {
            for vmid in &members {
                let pin = constraints.pins.entry(*vmid).or_default();
                pin.nodes.extend(pin_nodes.iter().cloned());
                if rule.strict {
                    pool_strict.insert(*vmid);
                }
            }
        }
    }

    // Validate pin targets against the topology.
    let mut dropped: Vec<u32> = Vec::new();
    for (vmid, pin) in constraints.pins.iter_mut() {
        pin.strict = config.balancing.enforce_pinning || pool_strict.contains(vmid);
        let unknown: Vec<String> =
            pin.nodes.iter().filter(|n| !node_names.contains(*n)).cloned().collect();
        if unknown.is_empty() {
            continue;
        }
        if config.balancing.enforce_pinning {
            let message = format!(
                "guest {} is pinned to unknown node(s) {}; marking it ignored",
                vmid,
                unknown.join(", ")
            );
            warn!("{}", message);
            constraints.warnings.push(message);
            if let Some(guest) = cluster.guests.get_mut(vmid) {
                guest.ignored = true;
            }
        } else {
            warn!(
                "guest {}: dropping unknown pin node(s) {}",
                vmid,
                unknown.join(", ")
            );
            for name in &unknown {
                pin.nodes.remove(name);
            }
            if pin.nodes.is_empty() {
                dropped.push(*vmid);
            }
        }
    }
    for vmid in dropped {
        constraints.pins.remove(&vmid);
    }

    // Write pin state back onto the guests.
    for (vmid, pin) in &constraints.pins {
        if let Some(guest) = cluster.guests.get_mut(vmid) {
            guest.pinned_nodes = pin.nodes.clone();
            guest.pin_strict = pin.strict;
        }
    }

    // Invert strict pins into the per-node forbidden index.
    for node in &node_names {
        let forbidden: BTreeSet<u32> = constraints
            .pins
            .iter()
            .filter(|(_, pin)| pin.strict && !pin.nodes.is_empty() && !pin.nodes.contains(node))
            .map(|(vmid, _)| *vmid)
            .collect();
        if !forbidden.is_empty() {
            constraints.forbidden.insert(node.clone(), forbidden);
        }
    }

    constraints
}
