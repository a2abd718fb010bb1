/// Migration Executor
///
/// Executes a `Plan` against the hypervisor API, sequentially or with a
/// bounded pool of parallel workers. A dispatcher feeds moves in plan
/// order through a bounded work queue; workers dispatch the migration,
/// then poll the task at a fixed cadence until it reaches a terminal
/// state or the per-job watchdog expires. HA-wrapped parent tasks are
/// resolved to their worker child before polling continues.
///
/// Per-move lifecycle: queued -> dispatched -> polling -> succeeded /
/// failed / timed-out / cancelled. Cancellation stops new dispatch;
/// in-flight jobs are still awaited up to the watchdog deadline since the
/// migrations themselves continue on the hypervisor.
use crate::api::{MigrationRequest, ProxmoxApi};
use crate::config::Config;
use crate::error::Result;
use crate::inventory::{Cluster, GuestKind};
use crate::placement::{Move, Plan};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub parallel: bool,
    pub parallel_jobs: usize,
    pub live: bool,
    pub with_local_disks: bool,
    pub with_conntrack_state: bool,
    pub max_job_validation: Duration,
    pub poll_interval: Duration,
}

impl ExecutorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallel: config.balancing.parallel,
            parallel_jobs: config.balancing.parallel_jobs as usize,
            live: config.balancing.live,
            with_local_disks: config.balancing.with_local_disks,
            with_conntrack_state: config.balancing.with_conntrack_state,
            max_job_validation: config.balancing.max_job_validation_duration(),
            poll_interval: Duration::from_secs(1),
        }
    }

    fn worker_count(&self) -> usize {
        if self.parallel {
            self.parallel_jobs.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Ok,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct MoveReport {
    pub id: u32,
    pub from: String,
    pub to: String,
    pub outcome: MoveOutcome,
}

/// Migration task identifier. The HA manager wraps the real worker in a
/// parent task; the child is resolved on first poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobHandle {
    Direct(String),
    HaWrapped { parent: String, child: Option<String> },
}

impl JobHandle {
    pub fn from_upid(upid: String) -> Self {
        if upid_field(&upid, 5) == Some("hamigrate") {
            JobHandle::HaWrapped { parent: upid, child: None }
        } else {
            JobHandle::Direct(upid)
        }
    }

    /// The UPID to poll right now.
    pub fn upid(&self) -> &str {
        match self {
            JobHandle::Direct(upid) => upid,
            JobHandle::HaWrapped { child: Some(child), .. } => child,
            JobHandle::HaWrapped { parent, .. } => parent,
        }
    }
}

// UPID layout: UPID:node:pid:pstart:starttime:type:id:user:
fn upid_field(upid: &str, index: usize) -> Option<&str> {
    upid.split(':').nth(index)
}

fn upid_node(upid: &str) -> Option<&str> {
    upid_field(upid, 1)
}

fn upid_starttime(upid: &str) -> u64 {
    upid_field(upid, 4)
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .unwrap_or(0)
}

struct WorkItem {
    mv: Move,
    running: bool,
    has_local_disk: bool,
    conntrack: bool,
}

/// Execute the plan; the returned reports are in plan order.
pub async fn execute(
    api: Arc<dyn ProxmoxApi>,
    cluster: &Cluster,
    plan: &Plan,
    options: &ExecutorOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<MoveReport>> {
    if plan.is_empty() {
        return Ok(Vec::new());
    }

    let conntrack = options.with_conntrack_state && cluster.pve_major >= 9;
    if options.with_conntrack_state && !conntrack {
        warn!(
            "with_conntrack_state requires hypervisor major version >= 9 (cluster reports {}); \
             dropping the flag for this cycle",
            cluster.pve_major
        );
    }

    let workers = options.worker_count();
    let (work_tx, work_rx) = mpsc::channel::<(usize, WorkItem)>(workers);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (report_tx, mut report_rx) = mpsc::channel::<(usize, MoveReport)>(plan.moves.len());

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let work_rx = Arc::clone(&work_rx);
        let report_tx = report_tx.clone();
        let api = Arc::clone(&api);
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = { work_rx.lock().await.recv().await };
                let Some((index, item)) = item else { break };
                let report = run_move(api.as_ref(), &item, &options).await;
                if report_tx.send((index, report)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(report_tx);

    // Dispatch in plan order; a cancellation drains the remainder of the
    // queue without aborting in-flight jobs.
    let mut skipped: Vec<(usize, MoveReport)> = Vec::new();
    for (index, mv) in plan.moves.iter().enumerate() {
        if *shutdown.borrow() {
            debug!("shutdown requested; not dispatching guest {}", mv.id);
            skipped.push((
                index,
                MoveReport {
                    id: mv.id,
                    from: mv.from.clone(),
                    to: mv.to.clone(),
                    outcome: MoveOutcome::Skipped("shutdown requested".into()),
                },
            ));
            continue;
        }
        let guest = cluster.guests.get(&mv.id);
        let item = WorkItem {
            mv: mv.clone(),
            running: guest.map(|g| g.running).unwrap_or(false),
            has_local_disk: guest.map(|g| g.has_local_disk()).unwrap_or(false),
            conntrack,
        };
        if work_tx.send((index, item)).await.is_err() {
            break;
        }
    }
    drop(work_tx);

    let mut reports: Vec<Option<MoveReport>> = vec![None; plan.moves.len()];
    while let Some((index, report)) = report_rx.recv().await {
        reports[index] = Some(report);
    }
    for (index, report) in skipped {
        reports[index] = Some(report);
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(reports.into_iter().flatten().collect())
}

async fn run_move(
    api: &dyn ProxmoxApi,
    item: &WorkItem,
    options: &ExecutorOptions,
) -> MoveReport {
    let mv = &item.mv;
    let report = |outcome: MoveOutcome| MoveReport {
        id: mv.id,
        from: mv.from.clone(),
        to: mv.to.clone(),
        outcome,
    };

    // A stopped VM migrates offline; containers always use the restart
    // path, which the API handles transparently.
    let online = options.live && item.running && mv.kind == GuestKind::Vm;
    let request = MigrationRequest {
        kind: mv.kind,
        node: mv.from.clone(),
        vmid: mv.id,
        target: mv.to.clone(),
        online,
        with_local_disks: options.with_local_disks && item.has_local_disk,
        with_conntrack_state: item.conntrack && online,
    };

    info!("migrating {} {} from {} to {}", mv.kind, mv.id, mv.from, mv.to);
    let upid = match api.migrate(&request).await {
        Ok(upid) => upid,
        Err(e) => {
            debug!("guest {}: migration dispatch failed: {}", mv.id, e);
            return report(MoveOutcome::Failed(format!("dispatch failed: {}", e)));
        }
    };

    let mut handle = JobHandle::from_upid(upid);
    let deadline = tokio::time::Instant::now() + options.max_job_validation;

    loop {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "guest {}: migration not finished after {}s; the job keeps running on the hypervisor",
                mv.id,
                options.max_job_validation.as_secs()
            );
            return report(MoveOutcome::Failed(format!(
                "timeout after {}s",
                options.max_job_validation.as_secs()
            )));
        }

        let unresolved_parent = match &handle {
            JobHandle::HaWrapped { parent, child: None } => Some(parent.clone()),
            _ => None,
        };
        if let Some(parent) = unresolved_parent {
            if let Some(worker) = resolve_ha_child(api, &parent, mv.id).await {
                debug!("guest {}: HA parent task resolved to worker {}", mv.id, worker);
                handle = JobHandle::HaWrapped { parent, child: Some(worker) };
            }
        }

        let upid = handle.upid().to_string();
        let node = upid_node(&upid).unwrap_or(mv.from.as_str()).to_string();
        match api.task_status(&node, &upid).await {
            Ok(status) if status.is_finished() => {
                return if status.is_ok() {
                    info!("guest {}: migration to {} succeeded", mv.id, mv.to);
                    report(MoveOutcome::Ok)
                } else {
                    let reason = status.exitstatus.unwrap_or_else(|| "unknown error".into());
                    debug!("guest {}: migration failed: {}", mv.id, reason);
                    report(MoveOutcome::Failed(reason))
                };
            }
            Ok(_) => {}
            // Transient poll failures are tolerated until the watchdog fires.
            Err(e) => debug!("guest {}: task poll failed: {}", mv.id, e),
        }

        tokio::time::sleep(options.poll_interval).await;
    }
}

/// Find the worker task spawned on behalf of an HA migration parent.
async fn resolve_ha_child(api: &dyn ProxmoxApi, parent: &str, vmid: u32) -> Option<String> {
    let tasks = api.cluster_tasks().await.ok()?;
    let vmid_string = vmid.to_string();
    let parent_start = upid_starttime(parent);
    tasks
        .into_iter()
        .find(|t| {
            t.upid != parent
                && matches!(
                    t.kind.as_deref(),
                    Some("qmigrate") | Some("vzmigrate") | Some("migrate")
                )
                && t.id.as_deref() == Some(vmid_string.as_str())
                && t.starttime >= parent_start
        })
        .map(|t| t.upid)
}
