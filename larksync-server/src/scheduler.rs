//! Scheduler: drives per-table cycles on their configured intervals.
//!
//! A single supervisor loop owns a `next_due` time per enabled binding and
//! dispatches due bindings to spawned workers, bounded by a semaphore so a
//! burst of due tables cannot stampede the two APIs. Cycles are parallel
//! across bindings and serial within one: a binding whose previous cycle is
//! still running is not re-dispatched, and a cycle that overruns its
//! interval simply skips the missed fire (drop-tardy, not queued).
//!
//! The configuration file is re-read when its mtime changes; the new
//! snapshot takes effect at the next tick without disturbing in-flight
//! cycles.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::workflow::{run_cycle, CycleMode, CycleOutcome};
use crate::SyncContext;

/// Parallel cycles across all bindings.
const MAX_CONCURRENT_CYCLES: usize = 3;

/// Supervisor tick granularity.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How often the daemon drains pending user mappings between cycles.
const USER_RESOLVE_INTERVAL: Duration = Duration::from_secs(600);

/// Pending users resolved per maintenance pass.
const USER_RESOLVE_BATCH: usize = 50;

type BindingKey = (String, String);

/// Run the daemon until ctrl-c. Running cycles finish during drain; nothing
/// new starts.
pub async fn run_daemon(ctx: Arc<SyncContext>, config_path: PathBuf) -> Result<()> {
    let mut next_due: HashMap<BindingKey, Instant> = HashMap::new();
    let mut running: HashSet<BindingKey> = HashSet::new();
    let mut invalid_filters: HashSet<BindingKey> = HashSet::new();
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CYCLES));
    let (done_tx, mut done_rx) =
        mpsc::unbounded_channel::<(BindingKey, Result<CycleOutcome>)>();

    let mut config_mtime = file_mtime(&config_path);
    let mut next_user_resolve = Instant::now() + USER_RESOLVE_INTERVAL;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut draining = false;

    validate_filters(&ctx, &mut invalid_filters).await;
    info!(
        "daemon started: {} bindings enabled",
        ctx.config().enabled_bindings().len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !draining => {
                info!("shutdown requested; draining {} running cycles", running.len());
                draining = true;
            }
            Some((key, result)) = done_rx.recv() => {
                running.remove(&key);
                let interval = ctx
                    .config()
                    .sync_interval(&key.0, &key.1);
                next_due.insert(key.clone(), Instant::now() + Duration::from_secs(interval));
                match result {
                    Ok(outcome) if outcome.had_failures() => warn!(
                        "cycle for {}/{} finished with {} failed rows",
                        key.0, key.1, outcome.failed
                    ),
                    Ok(_) => {}
                    Err(err) => error!("cycle for {}/{} failed: {:#}", key.0, key.1, err),
                }
            }
            _ = ticker.tick() => {
                if draining {
                    if running.is_empty() {
                        info!("drain complete, daemon exiting");
                        return Ok(());
                    }
                    continue;
                }

                if let Some(new_mtime) = reload_if_changed(&ctx, &config_path, config_mtime) {
                    config_mtime = Some(new_mtime);
                    invalid_filters.clear();
                    validate_filters(&ctx, &mut invalid_filters).await;
                }

                let now = Instant::now();
                for binding in ctx.config().enabled_bindings() {
                    let key = binding.key();
                    if running.contains(&key) || invalid_filters.contains(&key) {
                        continue;
                    }
                    let due = next_due.get(&key).copied().unwrap_or(now);
                    if now < due {
                        continue;
                    }

                    running.insert(key.clone());
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("semaphore closed");
                        let result = run_cycle(&ctx, &binding, CycleMode::Incremental).await;
                        let _ = done_tx.send((binding.key(), result));
                    });
                }

                if now >= next_user_resolve {
                    next_user_resolve = now + USER_RESOLVE_INTERVAL;
                    resolve_pending_users(&ctx).await;
                }
            }
        }
    }
}

/// One-shot mode: run every enabled binding (optionally narrowed to a team
/// or one table) once, sequentially, and report how many cycles failed.
pub async fn run_once(
    ctx: &SyncContext,
    team: Option<&str>,
    table: Option<&str>,
    full_refresh: bool,
) -> Result<Vec<CycleOutcome>> {
    let bindings: Vec<_> = ctx
        .config()
        .enabled_bindings()
        .into_iter()
        .filter(|b| team.map_or(true, |t| b.team == t))
        .filter(|b| table.map_or(true, |t| b.table == t))
        .collect();
    if bindings.is_empty() {
        anyhow::bail!("no enabled bindings match the requested team/table");
    }

    let mode = if full_refresh {
        CycleMode::FullRefresh
    } else {
        CycleMode::Incremental
    };

    let mut outcomes = Vec::new();
    let mut failures = 0usize;
    for binding in bindings {
        match run_cycle(ctx, &binding, mode.clone()).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                failures += 1;
                error!(
                    "cycle for {}/{} failed: {:#}",
                    binding.team, binding.table, err
                );
            }
        }
    }

    if failures > 0 {
        anyhow::bail!(
            "{} of {} cycles failed",
            failures,
            failures + outcomes.len()
        );
    }
    Ok(outcomes)
}

/// Single-issue mode.
pub async fn run_single_issue(
    ctx: &SyncContext,
    team: &str,
    table: &str,
    issue_key: &str,
) -> Result<CycleOutcome> {
    let binding = ctx
        .config()
        .find_binding(team, table)
        .ok_or_else(|| anyhow::anyhow!("no enabled binding {}/{}", team, table))?;
    run_cycle(ctx, &binding, CycleMode::SingleIssue(issue_key.to_string())).await
}

/// Drop bindings whose filter expression the source rejects. The binding is
/// skipped (configuration error); everything else proceeds.
async fn validate_filters(ctx: &SyncContext, invalid: &mut HashSet<BindingKey>) {
    for binding in ctx.config().enabled_bindings() {
        if !ctx.jira.validate_jql(&binding.jql).await {
            error!(
                "filter for {}/{} is invalid, binding disabled until config changes: {}",
                binding.team, binding.table, binding.jql
            );
            invalid.insert(binding.key());
        }
    }
}

async fn resolve_pending_users(ctx: &SyncContext) {
    let Some(mapper) = &ctx.user_mapper else {
        return;
    };
    match mapper.resolve_pending(&ctx.lark, USER_RESOLVE_BATCH).await {
        Ok(stats) if stats.attempted > 0 => info!(
            "resolved pending users: {} attempted, {} valid, {} empty",
            stats.attempted, stats.resolved, stats.empty
        ),
        Ok(_) => {}
        Err(err) => warn!("pending user resolution failed: {:#}", err),
    }
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Re-read the config when its mtime moved. Returns the new mtime on a
/// successful install; a file that fails to parse keeps the old snapshot.
fn reload_if_changed(
    ctx: &SyncContext,
    path: &PathBuf,
    last_mtime: Option<SystemTime>,
) -> Option<SystemTime> {
    let current = file_mtime(path)?;
    if Some(current) == last_mtime {
        return None;
    }
    match Config::load(path) {
        Ok(config) => {
            info!("configuration change detected, installing new snapshot");
            ctx.install_config(config);
            Some(current)
        }
        Err(err) => {
            error!("configuration reload failed, keeping old snapshot: {:#}", err);
            // Remember the mtime anyway so a broken file is not re-parsed
            // every tick.
            Some(current)
        }
    }
}
