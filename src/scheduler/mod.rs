/// Scheduler
///
/// Top-level control loop. One-shot mode runs a single balancing cycle;
/// daemon mode loops on the configured interval with an optional startup
/// delay. SIGHUP reloads the configuration between cycles (an invalid new
/// file keeps the old one), SIGINT/SIGTERM trigger a graceful shutdown:
/// no new migrations are dispatched and in-flight jobs are awaited up to
/// their watchdog deadline.
use crate::api::{ProxmoxApi, ProxmoxClient};
use crate::config::Config;
use crate::constraints;
use crate::error::Result;
use crate::executor::{self, ExecutorOptions, MoveOutcome, MoveReport};
use crate::inventory;
use crate::placement::{self, Plan};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of one balancing cycle.
pub struct CycleOutcome {
    pub plan: Plan,
    pub reports: Vec<MoveReport>,
}

/// Run one full cycle against a fresh API client.
pub async fn run_cycle(
    config: &Config,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<CycleOutcome> {
    let client = ProxmoxClient::new(&config.proxmox_api)?;
    client.connect().await?;
    debug!("authenticated against the API using {} credentials", client.auth_scheme());
    run_cycle_with(Arc::new(client), config, dry_run, shutdown).await
}

/// Cycle body over an already-connected API; also the entry point the
/// integration tests drive with a mock client.
pub async fn run_cycle_with(
    api: Arc<dyn ProxmoxApi>,
    config: &Config,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<CycleOutcome> {
    let started = std::time::Instant::now();
    info!("cycle started at {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%z"));

    if !config.balancing.enable {
        info!("balancing is disabled; skipping cycle");
        return Ok(CycleOutcome {
            plan: Plan::new(config.balancing.method, config.balancing.mode),
            reports: Vec::new(),
        });
    }

    let mut cluster = inventory::build(api.as_ref(), config).await?;
    let constraints = constraints::compile(&mut cluster, config);
    let plan = placement::plan(&cluster, &constraints, config)?;

    info!(
        "cycle: {} node(s), {} guest(s), {} planned move(s), spread {:.1}% -> {:.1}%",
        cluster.nodes.len(),
        cluster.guests.len(),
        plan.moves.len(),
        plan.spread_before,
        plan.spread_after
    );

    let reports = if dry_run || plan.is_empty() {
        Vec::new()
    } else {
        let options = ExecutorOptions::from_config(config);
        executor::execute(api, &cluster, &plan, &options, shutdown).await?
    };

    let mut failed = 0usize;
    for report in &reports {
        match &report.outcome {
            MoveOutcome::Ok => {
                info!("guest {}: {} -> {} done", report.id, report.from, report.to)
            }
            MoveOutcome::Failed(reason) => {
                failed += 1;
                warn!("guest {}: {} -> {} failed: {}", report.id, report.from, report.to, reason)
            }
            MoveOutcome::Skipped(reason) => {
                info!("guest {}: {} -> {} skipped: {}", report.id, report.from, report.to, reason)
            }
        }
    }
    info!(
        "cycle finished in {:.1}s ({} move(s), {} failed)",
        started.elapsed().as_secs_f64(),
        reports.len(),
        failed
    );

    Ok(CycleOutcome { plan, reports })
}

/// Resolve the best destination node for a new guest.
pub async fn query_best_node(config: &Config) -> Result<Option<String>> {
    let client = ProxmoxClient::new(&config.proxmox_api)?;
    client.connect().await?;
    let mut cluster = inventory::build(&client, config).await?;
    let constraints = constraints::compile(&mut cluster, config);
    Ok(placement::best_node(&cluster, &constraints, config))
}

pub struct Scheduler {
    config: Arc<Config>,
    config_path: PathBuf,
}

impl Scheduler {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Self { config: Arc::new(config), config_path }
    }

    pub async fn run(mut self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        if !self.config.service.daemon {
            run_cycle(&self.config, false, shutdown_rx.clone()).await?;
            return Ok(());
        }

        let mut sighup = signal(SignalKind::hangup())?;

        if let Some(delay) = self.config.service.delay.as_duration() {
            info!("delaying the first cycle by {}s", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => return Ok(()),
            }
        }

        'ticker: loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match run_cycle(&self.config, false, shutdown_rx.clone()).await {
                Ok(_) => {}
                // The daemon always recovers to the next tick; only the
                // process-level entry points abort.
                Err(e) => error!("cycle aborted: {}", e),
            }

            let interval = self.config.service.schedule.as_duration();
            info!("next cycle in {}s", interval.as_secs());
            let deadline = tokio::time::Instant::now() + interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = sighup.recv() => self.reload(),
                    _ = wait_for_shutdown(&mut shutdown_rx) => break 'ticker,
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Swap in a freshly validated configuration; a broken file keeps the
    /// previous one.
    fn reload(&mut self) {
        info!("reloading configuration from {}", self.config_path.display());
        match Config::load(&self.config_path) {
            Ok(config) => {
                self.config = Arc::new(config);
                info!("configuration reloaded");
            }
            Err(e) => error!("configuration reload failed, keeping the previous one: {}", e),
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
