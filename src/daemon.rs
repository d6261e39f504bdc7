// SPDX-License-Identifier: Apache-2.0
//! The long-running scheduler. Two workers run on independent
//! tick cadences inside the same tokio runtime, each isolated so one
//! backup's failure never stops the others from being scheduled.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigFile;
use crate::engine;

/// How often the backer worker wakes to check whether any backup's period
/// has elapsed. The indexer shares this cadence: since every `index()` call
/// is itself cheap and idempotent, it's simplest to run it on the same tick
/// rather than track a second period table.
const TICK: Duration = Duration::from_secs(60);

/// Runs until `SIGINT` or `SIGTERM`, backing up and indexing every
/// configured backup on its own period.
pub async fn run(config: Arc<ConfigFile>) -> crate::error::Result<()> {
    let token = CancellationToken::new();

    let sigint_token = token.clone();
    let sigterm_token = token.clone();
    tokio::spawn(async move {
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot install SIGINT handler: {}", e);
                return;
            }
        };
        int.recv().await;
        log::info!("received SIGINT, shutting down");
        sigint_token.cancel();
    });
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        term.recv().await;
        log::info!("received SIGTERM, shutting down");
        sigterm_token.cancel();
    });

    let backer = tokio::spawn(backer_loop(config.clone(), token.clone()));
    let indexer = tokio::spawn(indexer_loop(config, token));

    let _ = tokio::join!(backer, indexer);
    Ok(())
}

/// Per-backup due times, so each backup's configured `period` is honored
/// independently rather than every backup running on every tick.
struct DueTracker {
    next_due: std::collections::HashMap<String, std::time::Instant>,
}

impl DueTracker {
    fn new() -> DueTracker {
        DueTracker { next_due: std::collections::HashMap::new() }
    }

    fn has_seen(&self, name: &str) -> bool {
        self.next_due.contains_key(name)
    }

    fn schedule(&mut self, name: &str, at: std::time::Instant) {
        self.next_due.insert(name.to_string(), at);
    }

    fn is_due(&self, name: &str, now: std::time::Instant) -> bool {
        match self.next_due.get(name) {
            Some(due) => *due <= now,
            None => true,
        }
    }
}

/// The backer's starting point for `name`: `last_stored.creation +
/// backup.period`, or due immediately if nothing has been stored yet (or the
/// lookup fails — the run itself will surface and log the real error).
async fn initial_delay(config: &ConfigFile, name: &str, period: Duration) -> Duration {
    let handle = match config.backup_handle(name) {
        Ok(h) => h,
        Err(_) => return Duration::ZERO,
    };
    let fs = match handle.local.get_filesystem(&handle.fsname).await {
        Ok(fs) => fs,
        Err(_) => return Duration::ZERO,
    };
    let last_stored = match crate::backsnap::get_latest_stored(fs.as_ref(), &handle.bid).await {
        Ok(Some(b)) => b,
        _ => return Duration::ZERO,
    };
    let due_at = last_stored.meta().creation + period.as_secs() as i64;
    let remaining = due_at - chrono::Utc::now().timestamp();
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(remaining as u64)
    }
}

async fn backer_loop(config: Arc<ConfigFile>, token: CancellationToken) {
    let mut due = DueTracker::new();
    loop {
        if token.is_cancelled() {
            break;
        }

        for name in config.backup_names() {
            if token.is_cancelled() {
                break;
            }
            let period = config.backup_period(&name).unwrap_or(TICK);
            if !due.has_seen(&name) {
                let delay = initial_delay(&config, &name, period).await;
                due.schedule(&name, std::time::Instant::now() + delay);
            }
            if !due.is_due(&name, std::time::Instant::now()) {
                continue;
            }
            match run_one_backup(&config, &name, false).await {
                Ok(()) => due.schedule(&name, std::time::Instant::now() + period),
                Err(e) => log::error!("backup {} failed: {:#}", name, e),
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(TICK) => {}
        }
    }
    log::info!("backer worker stopped");
}

async fn indexer_loop(config: Arc<ConfigFile>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }

        for name in config.backup_names() {
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = run_one_index(&config, &name).await {
                log::error!("index {} failed: {:#}", name, e);
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(TICK) => {}
        }
    }
    log::info!("indexer worker stopped");
}

async fn run_one_backup(config: &ConfigFile, name: &str, force: bool) -> crate::error::Result<()> {
    let handle = config.backup_handle(name)?;
    let fs = handle.local.get_filesystem(&handle.fsname).await?;
    let outcome = engine::backup(fs.as_ref(), handle.remote.as_ref(), &handle.bid, force).await?;
    log::info!(
        "backup {}: series_created={} generation_created={} generations_stored={}",
        name,
        outcome.series_created,
        outcome.generation_created,
        outcome.generations_stored
    );
    Ok(())
}

async fn run_one_index(config: &ConfigFile, name: &str) -> crate::error::Result<()> {
    let handle = config.backup_handle(name)?;
    let fs = handle.local.as_ref();
    let fs = fs.get_filesystem(&handle.fsname).await?;
    if let Some(mut backsnap) = crate::backsnap::get_latest_stored(fs.as_ref(), &handle.bid).await? {
        handle.remote.index(&mut backsnap).await?;
    }
    Ok(())
}
