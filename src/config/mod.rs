/// Configuration Model
///
/// This module defines the YAML configuration surface of the balancer:
/// - `proxmox_api`: endpoints, credentials, TLS and retry policy
/// - `proxmox_cluster`: maintenance/ignore node lists, overprovisioning
/// - `balancing`: method, mode, balanciness, enforcement and executor knobs
/// - `service`: daemon scheduling, startup delay, log level
///
/// Unknown keys fail validation. The loaded `Config` is immutable; the
/// daemon replaces the whole value on reload rather than mutating in place.
use crate::error::{BalancerError, Result};
use crate::inventory::GuestKind;
use crate::placement::{Method, Mode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/proxlb/proxlb.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub proxmox_api: ApiSection,
    #[serde(default)]
    pub proxmox_cluster: ClusterSection,
    #[serde(default)]
    pub balancing: BalancingSection,
    #[serde(default)]
    pub service: ServiceSection,
}

/// API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiSection {
    /// Ordered endpoint list, each `host[:port]` (port defaults to 8006).
    pub hosts: Vec<String>,
    pub user: String,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_true")]
    pub ssl_verification: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
}

impl ApiSection {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.wait_time)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    #[serde(default)]
    pub maintenance_nodes: Vec<String>,
    #[serde(default)]
    pub ignore_nodes: Vec<String>,
    #[serde(default)]
    pub overprovisioning: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalancingSection {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_balanciness")]
    pub balanciness: u32,
    /// Skip the cycle entirely while the peak node stays under this
    /// used-memory percentage.
    #[serde(default)]
    pub memory_threshold: Option<u32>,
    #[serde(default = "default_balance_types")]
    pub balance_types: Vec<GuestKind>,
    #[serde(default = "default_true")]
    pub balance_larger_guests_first: bool,
    #[serde(default)]
    pub enforce_affinity: bool,
    #[serde(default)]
    pub enforce_pinning: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_parallel_jobs")]
    pub parallel_jobs: u32,
    #[serde(default = "default_true")]
    pub live: bool,
    #[serde(default = "default_true")]
    pub with_local_disks: bool,
    #[serde(default = "default_true")]
    pub with_conntrack_state: bool,
    #[serde(default = "default_max_job_validation")]
    pub max_job_validation: u64,
    /// Per-node reserved headroom; the `defaults` key applies to nodes
    /// without their own entry.
    #[serde(default)]
    pub node_resource_reserve: BTreeMap<String, ReserveEntry>,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolRule>,
    #[serde(default)]
    pub psi: Option<PsiThresholds>,
}

impl Default for BalancingSection {
    fn default() -> Self {
        Self {
            enable: true,
            method: Method::default(),
            mode: Mode::default(),
            balanciness: default_balanciness(),
            memory_threshold: None,
            balance_types: default_balance_types(),
            balance_larger_guests_first: true,
            enforce_affinity: false,
            enforce_pinning: false,
            parallel: false,
            parallel_jobs: default_parallel_jobs(),
            live: true,
            with_local_disks: true,
            with_conntrack_state: true,
            max_job_validation: default_max_job_validation(),
            node_resource_reserve: BTreeMap::new(),
            pools: BTreeMap::new(),
            psi: None,
        }
    }
}

impl BalancingSection {
    /// Reserved memory in bytes for `node`, falling back to the `defaults`
    /// entry when the node has no reservation of its own.
    pub fn reserved_memory(&self, node: &str) -> u64 {
        self.node_resource_reserve
            .get(node)
            .or_else(|| self.node_resource_reserve.get("defaults"))
            .map(|r| r.memory * GIB)
            .unwrap_or(0)
    }

    pub fn max_job_validation_duration(&self) -> Duration {
        Duration::from_secs(self.max_job_validation)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReserveEntry {
    /// Reserved memory in GiB.
    #[serde(default)]
    pub memory: u64,
}

/// Declarative affinity rule attached to a resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolRule {
    #[serde(rename = "type")]
    pub kind: PoolRuleKind,
    #[serde(default)]
    pub pin: Option<Vec<String>>,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolRuleKind {
    #[serde(rename = "affinity")]
    Affinity,
    #[serde(rename = "anti-affinity")]
    AntiAffinity,
}

/// Pressure-stall thresholds; a node is hot when any component of its
/// triplet exceeds the matching threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PsiThresholds {
    #[serde(default = "default_psi_some")]
    pub some: f64,
    #[serde(default = "default_psi_full")]
    pub full: f64,
    #[serde(default = "default_psi_spikes")]
    pub spikes: f64,
}

impl Default for PsiThresholds {
    fn default() -> Self {
        Self {
            some: default_psi_some(),
            full: default_psi_full(),
            spikes: default_psi_spikes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    #[serde(default = "default_true")]
    pub daemon: bool,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub delay: Delay,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            daemon: true,
            schedule: Schedule::default(),
            delay: Delay::default(),
            log_level: LogLevel::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub format: TimeFormat,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            format: TimeFormat::Hours,
        }
    }
}

impl Schedule {
    pub fn as_duration(&self) -> Duration {
        self.format.to_duration(self.interval)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delay {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub format: TimeFormat,
}

impl Delay {
    pub fn as_duration(&self) -> Option<Duration> {
        if self.enable {
            Some(self.format.to_duration(self.time))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    #[default]
    #[serde(rename = "hours")]
    Hours,
    #[serde(rename = "minutes")]
    Minutes,
}

impl TimeFormat {
    fn to_duration(self, amount: u64) -> Duration {
        match self {
            TimeFormat::Hours => Duration::from_secs(amount * 3600),
            TimeFormat::Minutes => Duration::from_secs(amount * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[default]
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl LogLevel {
    pub fn as_filter(&self) -> tracing::level_filters::LevelFilter {
        match self {
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Warning => tracing::level_filters::LevelFilter::WARN,
            LogLevel::Critical => tracing::level_filters::LevelFilter::ERROR,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BalancerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.proxmox_api.hosts.is_empty() {
            return Err(BalancerError::Config("proxmox_api.hosts must not be empty".into()));
        }
        if self.proxmox_api.user.is_empty() {
            return Err(BalancerError::Config("proxmox_api.user must not be empty".into()));
        }
        let has_token =
            self.proxmox_api.token_id.is_some() && self.proxmox_api.token_secret.is_some();
        if self.proxmox_api.token_id.is_some() != self.proxmox_api.token_secret.is_some() {
            return Err(BalancerError::Config(
                "token_id and token_secret must be configured together".into(),
            ));
        }
        if !has_token && self.proxmox_api.pass.is_none() {
            return Err(BalancerError::Config(
                "either a password or an API token must be configured".into(),
            ));
        }
        if self.balancing.parallel_jobs < 1 {
            return Err(BalancerError::Config("balancing.parallel_jobs must be >= 1".into()));
        }
        if self.balancing.balance_types.is_empty() {
            return Err(BalancerError::Config("balancing.balance_types must not be empty".into()));
        }
        if self.balancing.mode == Mode::Psi && self.balancing.psi.is_none() {
            return Err(BalancerError::Config(
                "balancing.psi thresholds are required when mode is psi".into(),
            ));
        }
        if self.service.schedule.interval == 0 {
            return Err(BalancerError::Config("service.schedule.interval must be >= 1".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    1
}

fn default_wait_time() -> u64 {
    1
}

fn default_balanciness() -> u32 {
    10
}

fn default_balance_types() -> Vec<GuestKind> {
    vec![GuestKind::Vm, GuestKind::Ct]
}

fn default_parallel_jobs() -> u32 {
    5
}

fn default_max_job_validation() -> u64 {
    1800
}

fn default_interval() -> u64 {
    24
}

fn default_psi_some() -> f64 {
    0.1
}

fn default_psi_full() -> f64 {
    0.2
}

fn default_psi_spikes() -> f64 {
    0.5
}
