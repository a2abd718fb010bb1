// Full-cycle integration tests: inventory, constraint compilation,
// placement and execution driven end-to-end against the fake API.

mod common;

use common::{config, FakeApi, FakeGuest};
use proxbalance::executor::MoveOutcome;
use proxbalance::scheduler::run_cycle_with;
use std::sync::Arc;
use tokio::sync::watch;

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn test_memory_rebalance_cycle_executes_plan() {
    // One overloaded node, two empty ones; the heavier guest moves to the
    // lexicographically lower destination.
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![FakeGuest::new(10, "pve-a", 30), FakeGuest::new(11, "pve-a", 30)],
    ));
    let cfg = config("");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert_eq!(outcome.plan.moves.len(), 1);
    let mv = &outcome.plan.moves[0];
    assert_eq!(mv.id, 10);
    assert_eq!(mv.from, "pve-a");
    assert_eq!(mv.to, "pve-b");
    assert!(outcome.plan.spread_after < outcome.plan.spread_before);

    assert_eq!(outcome.reports.len(), 1);
    assert_eq!(outcome.reports[0].outcome, MoveOutcome::Ok);

    let migrations = api.migrations.lock().unwrap();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].vmid, 10);
    assert_eq!(migrations[0].target, "pve-b");
    // A running VM migrates live by default.
    assert!(migrations[0].online);
}

#[tokio::test]
async fn test_dry_run_never_dispatches() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![FakeGuest::new(10, "pve-a", 30), FakeGuest::new(11, "pve-a", 30)],
    ));
    let cfg = config("");

    let outcome = run_cycle_with(api.clone(), &cfg, true, shutdown_channel())
        .await
        .unwrap();

    assert!(!outcome.plan.is_empty());
    assert!(outcome.reports.is_empty());
    assert!(api.migrated_ids().is_empty());

    let json = outcome.plan.to_json();
    assert_eq!(json["plan"][0]["id"], 10);
    assert_eq!(json["method"], "memory");
    assert_eq!(json["mode"], "used");
}

#[tokio::test]
async fn test_ignore_tag_survives_whole_cycle() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![
            FakeGuest::new(10, "pve-a", 30).tagged("plb_ignore_backup"),
            FakeGuest::new(11, "pve-a", 30),
        ],
    ));
    let cfg = config("");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert!(outcome.plan.moves.iter().all(|m| m.id != 10));
    assert!(api.migrated_ids().iter().all(|id| *id != 10));
}

#[tokio::test]
async fn test_anti_affinity_cycle_separates_guests() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![
            FakeGuest::new(1, "pve-a", 2).tagged("plb_anti_affinity_web"),
            FakeGuest::new(2, "pve-a", 2).tagged("plb_anti_affinity_web"),
            FakeGuest::new(3, "pve-a", 2).tagged("plb_anti_affinity_web"),
        ],
    ));
    let cfg = config("balancing:\n  balanciness: 100\n  enforce_affinity: true\n");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert_eq!(outcome.plan.moves.len(), 2);
    let mut targets: Vec<&str> =
        outcome.plan.moves.iter().map(|m| m.to.as_str()).collect();
    targets.sort();
    assert_eq!(targets, vec!["pve-b", "pve-c"]);
    assert_eq!(api.migrated_ids().len(), 2);
}

#[tokio::test]
async fn test_maintenance_node_is_evacuated() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![FakeGuest::new(7, "pve-b", 4)],
    ));
    let cfg = config("proxmox_cluster:\n  maintenance_nodes: [pve-b]\n");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert_eq!(outcome.plan.moves.len(), 1);
    assert_eq!(outcome.plan.moves[0].id, 7);
    assert_eq!(outcome.plan.moves[0].reason, "maintenance");
    assert_ne!(outcome.plan.moves[0].to, "pve-b");
}

#[tokio::test]
async fn test_disabled_balancing_skips_cycle() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b"],
        vec![FakeGuest::new(10, "pve-a", 30)],
    ));
    let cfg = config("balancing:\n  enable: false\n");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert!(outcome.plan.is_empty());
    assert!(api.migrated_ids().is_empty());
}

#[tokio::test]
async fn test_ignored_node_drops_out_of_inventory() {
    let api = Arc::new(FakeApi::new(
        &["pve-a", "pve-b", "pve-c"],
        vec![FakeGuest::new(10, "pve-a", 30), FakeGuest::new(11, "pve-a", 30)],
    ));
    // With pve-b ignored the only destination left is pve-c.
    let cfg = config("proxmox_cluster:\n  ignore_nodes: [pve-b]\n");

    let outcome = run_cycle_with(api.clone(), &cfg, false, shutdown_channel())
        .await
        .unwrap();

    assert_eq!(outcome.plan.moves.len(), 1);
    assert_eq!(outcome.plan.moves[0].to, "pve-c");
}
