/// Hypervisor API Access
///
/// `ProxmoxApi` is the read/dispatch surface the rest of the core is built
/// against; `ProxmoxClient` is the production implementation over HTTPS.
/// Tests substitute mock implementations of the trait.
///
/// Wire types in this module deserialize leniently: the API is known to
/// return some numeric fields as strings, so every numeric field at this
/// boundary goes through a coercing deserializer. Downstream types are
/// strict.
pub mod client;
pub mod endpoint;

pub use client::ProxmoxClient;
pub use endpoint::Endpoint;

use crate::error::Result;
use crate::inventory::GuestKind;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// One row of `GET /nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    /// CPU load as a fraction of the whole node, [0,1].
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxcpu: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub mem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub disk: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxdisk: u64,
}

impl NodeSummary {
    pub fn is_online(&self) -> bool {
        self.status.as_deref() == Some("online")
    }
}

/// Subset of `GET /nodes/{node}/status` the balancer consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub pveversion: Option<String>,
    #[serde(default)]
    pub pressure: Option<PressureWire>,
}

/// Kernel pressure-stall triplets, present on PVE 9 and later.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PressureWire {
    #[serde(default)]
    pub cpu: Option<TripletWire>,
    #[serde(default)]
    pub memory: Option<TripletWire>,
    #[serde(default)]
    pub io: Option<TripletWire>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TripletWire {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub some: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub full: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub spikes: f64,
}

/// One row of `GET /nodes/{node}/qemu` or `GET /nodes/{node}/lxc`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestSummary {
    #[serde(deserialize_with = "lenient_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cpus: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub mem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub disk: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxdisk: u64,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub lock: Option<String>,
}

impl GuestSummary {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

/// Guest configuration; disk and mountpoint entries stay untyped and are
/// classified by the inventory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestConfig {
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(flatten)]
    pub entries: BTreeMap<String, serde_json::Value>,
}

/// One row of `GET /cluster/ha/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct HaStatusEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// `GET /version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
}

impl VersionInfo {
    /// Major version, e.g. 8 for "8.2.4".
    pub fn major(&self) -> u32 {
        self.version
            .split('.')
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub exitstatus: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status.as_deref() == Some("stopped")
    }

    pub fn is_ok(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

/// One row of `GET /cluster/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterTask {
    pub upid: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub starttime: u64,
}

/// Parameters of a migration dispatch.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub kind: GuestKind,
    pub node: String,
    pub vmid: u32,
    pub target: String,
    /// Live migration; only meaningful for running VMs.
    pub online: bool,
    pub with_local_disks: bool,
    pub with_conntrack_state: bool,
}

/// Typed read and dispatch operations against the hypervisor API.
///
/// Implementations must be safe for concurrent use; the migration executor
/// shares one instance across its workers.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    async fn version(&self) -> Result<VersionInfo>;

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>>;

    async fn node_status(&self, node: &str) -> Result<NodeStatus>;

    async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<GuestSummary>>;

    async fn guest_config(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<GuestConfig>;

    /// Mean CPU usage over the recent one-hour window, as a fraction [0,1]
    /// of the guest's assigned cores. `None` when no samples exist.
    async fn guest_rrd_cpu(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<Option<f64>>;

    /// Pressure-stall triplets of a running guest, when the hypervisor
    /// exposes them.
    async fn guest_pressure(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Option<PressureWire>>;

    async fn ha_state(&self) -> Result<Vec<HaStatusEntry>>;

    async fn pool_members(&self, pool: &str) -> Result<Vec<u32>>;

    /// Dispatch a migration and return the worker UPID.
    async fn migrate(&self, request: &MigrationRequest) -> Result<String>;

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus>;

    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>>;
}

// Lenient numeric deserializers. The API intermittently returns numbers as
// strings; coercion happens here and nowhere else.

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    U(u64),
    I(i64),
    F(f64),
    S(String),
}

pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U(v) => Ok(v),
        NumOrStr::I(v) => Ok(v.max(0) as u64),
        NumOrStr::F(v) => Ok(if v.is_finite() && v > 0.0 { v as u64 } else { 0 }),
        NumOrStr::S(s) => Ok(s.trim().parse::<u64>().unwrap_or(0)),
    }
}

pub(crate) fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_u64(deserializer).map(|v| v.min(u32::MAX as u64) as u32)
}

pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U(v) => Ok(v as f64),
        NumOrStr::I(v) => Ok(v as f64),
        NumOrStr::F(v) => Ok(v),
        NumOrStr::S(s) => Ok(s.trim().parse::<f64>().unwrap_or(0.0)),
    }
}

pub(crate) fn lenient_opt_f64<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        NumOrStr::U(v) => v as f64,
        NumOrStr::I(v) => v as f64,
        NumOrStr::F(v) => v,
        NumOrStr::S(s) => s.trim().parse::<f64>().unwrap_or(0.0),
    }))
}

pub(crate) fn lenient_opt_u32<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?.map(|v| {
        if v.is_finite() && v > 0.0 {
            v.min(u32::MAX as f64) as u32
        } else {
            0
        }
    }))
}
