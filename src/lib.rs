// ProxBalance - workload rebalancer for Proxmox VE clusters
// Core library module

pub mod api;
pub mod config;
pub mod constraints;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod placement;
pub mod scheduler;

#[cfg(test)]
pub mod testutil;

pub use config::Config;
pub use error::{BalancerError, Result};

/// Crate version, surfaced by `--version` and logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
