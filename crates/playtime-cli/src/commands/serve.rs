//! Serve command: the long-running tracker process.
//!
//! Reads host events from stdin and writes host commands to stdout (see
//! [`crate::host`]). A periodic task flushes, saves, and reconciles on the
//! configured interval. On interrupt or end of input the periodic task is
//! signalled and awaited, then one final flush runs before exit.

use std::io::Stdout;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use playtime_core::{Enforcer, SessionCommands, SystemClock, Tracker};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::util::lock_ledger;
use crate::Config;
use crate::host::{HostEvent, JsonLineCommands, SnapshotDirectory};

type StdioEnforcer = Enforcer<SnapshotDirectory, JsonLineCommands<Stdout>>;

pub fn run(config: &Config) -> Result<()> {
    let _lock = lock_ledger(&config.ledger_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(serve(config));
    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_background();
    result
}

async fn serve(config: &Config) -> Result<()> {
    let tracker = Arc::new(Tracker::open(
        &config.ledger_path,
        config.tracker_settings(),
        Arc::new(SystemClock),
    ));
    let throttle = i64::try_from(config.enforcement_interval_seconds).unwrap_or(i64::MAX);
    let enforcer = Arc::new(
        Enforcer::new(
            Arc::clone(&tracker),
            SnapshotDirectory::new(config.exempt_users.iter().cloned()),
            JsonLineCommands::new(std::io::stdout()),
        )
        .with_interval(chrono::Duration::seconds(throttle))
        .with_access_control(config.manage_library_access),
    );
    tracing::info!(
        ledger = %config.ledger_path.display(),
        flush_interval_seconds = config.flush_interval_seconds,
        "serving"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let every = Duration::from_secs(config.flush_interval_seconds.max(1));
    let periodic = tokio::spawn(periodic_loop(Arc::clone(&enforcer), every, shutdown_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&enforcer, &line),
                Ok(None) => {
                    tracing::info!("host closed the event stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read host events");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
        }
    }

    // Let any in-flight periodic pass finish before the final flush.
    let _ = shutdown_tx.send(true);
    if let Err(e) = periodic.await {
        tracing::warn!(error = %e, "periodic task ended abnormally");
    }

    let folded = tracker.flush_all().context("final flush failed")?;
    tracing::info!(seconds = folded, "final flush complete");
    Ok(())
}

async fn periodic_loop(enforcer: Arc<StdioEnforcer>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let enforcer = Arc::clone(&enforcer);
                if let Err(e) = tokio::task::spawn_blocking(move || enforcer.run_periodic()).await {
                    tracing::warn!(error = %e, "periodic pass failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Parses and applies one line from the host. Bad lines are logged and skipped.
pub fn handle_line<C: SessionCommands>(enforcer: &Enforcer<SnapshotDirectory, C>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<HostEvent>(line) {
        Ok(event) => handle_event(enforcer, event),
        Err(e) => tracing::warn!(error = %e, line, "ignoring malformed host event"),
    }
}

pub fn handle_event<C: SessionCommands>(enforcer: &Enforcer<SnapshotDirectory, C>, event: HostEvent) {
    match event {
        HostEvent::SessionStart {
            session_id,
            user_id,
            paused,
        } => enforcer.on_start(&session_id, &user_id, paused),
        HostEvent::SessionProgress {
            session_id,
            user_id,
            paused,
        } => enforcer.on_progress(&session_id, &user_id, paused),
        HostEvent::SessionStop { session_id } => {
            enforcer.on_stop(&session_id);
        }
        HostEvent::LiveSessions { sessions } => {
            let received_at = enforcer.tracker().now();
            enforcer.directory().replace(sessions, received_at);
        }
        HostEvent::ResetUser { user_id } => {
            if let Err(e) = enforcer.reset_user(&user_id) {
                tracing::warn!(%user_id, error = %e, "failed to save ledger after reset");
            }
        }
    }
}
