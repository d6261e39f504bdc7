// SPDX-License-Identifier: Apache-2.0
//! `zbacker`: ZFS snapshot replication to a remote object store.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use zbacker::config::ConfigFile;
use zbacker::error::Result;
use zbacker::{daemon, engine};

#[derive(Parser)]
#[command(name = "zbacker", about = "ZFS incremental snapshot replication")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", default_value = "zbacker.yaml")]
    config: String,

    /// Enable debug logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up one configured backup.
    Backup {
        #[arg(short = 'n', long = "name")]
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Update the remote head pointers for one configured backup.
    Index {
        #[arg(short = 'n', long = "name")]
        name: String,
    },
    /// Back up every configured backup.
    BackupAll {
        #[arg(long)]
        force: bool,
    },
    /// Index every configured backup.
    IndexAll,
    /// List Metas known to a remote, optionally filtered by filesystem name.
    List {
        #[arg(short = 'r', long = "remote")]
        remote: Option<String>,
        #[arg(short = 'f', long = "fsname")]
        fsname: Option<String>,
    },
    /// Restore a backup chain onto a fresh local filesystem.
    Restore {
        #[arg(short = 'l', long = "local")]
        local: String,
        #[arg(short = 'r', long = "remote")]
        remote: String,
        #[arg(short = 'g', long = "fsguid")]
        fsguid: String,
        #[arg(short = 'f', long = "target")]
        target: String,
        #[arg(short = 'i', long = "bid", default_value = "default")]
        bid: String,
    },
    /// Run the scheduler until `SIGINT`/`SIGTERM`.
    Daemon,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Backup { name, force } => {
            let config = ConfigFile::load(&cli.config)?;
            let handle = config.backup_handle(&name)?;
            let fs = handle.local.get_filesystem(&handle.fsname).await?;
            let outcome = engine::backup(fs.as_ref(), handle.remote.as_ref(), &handle.bid, force).await?;
            log::info!(
                "backup {}: series_created={} generation_created={} generations_stored={}",
                name,
                outcome.series_created,
                outcome.generation_created,
                outcome.generations_stored
            );
        }
        Command::Index { name } => {
            let config = ConfigFile::load(&cli.config)?;
            let handle = config.backup_handle(&name)?;
            let fs = handle.local.get_filesystem(&handle.fsname).await?;
            if let Some(mut backsnap) = zbacker::backsnap::get_latest_stored(fs.as_ref(), &handle.bid).await? {
                handle.remote.index(&mut backsnap).await?;
            }
        }
        Command::BackupAll { force } => {
            let config = ConfigFile::load(&cli.config)?;
            for name in config.backup_names() {
                let handle = config.backup_handle(&name)?;
                let result = match handle.local.get_filesystem(&handle.fsname).await {
                    Ok(fs) => engine::backup(fs.as_ref(), handle.remote.as_ref(), &handle.bid, force).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(outcome) => log::info!(
                        "backup {}: series_created={} generation_created={} generations_stored={}",
                        name,
                        outcome.series_created,
                        outcome.generation_created,
                        outcome.generations_stored
                    ),
                    Err(e) => log::error!("backup {} failed: {:#}", name, e),
                }
            }
        }
        Command::IndexAll => {
            let config = ConfigFile::load(&cli.config)?;
            for name in config.backup_names() {
                let handle = config.backup_handle(&name)?;
                let fs = handle.local.get_filesystem(&handle.fsname).await?;
                match zbacker::backsnap::get_latest_stored(fs.as_ref(), &handle.bid).await {
                    Ok(Some(mut backsnap)) => {
                        if let Err(e) = handle.remote.index(&mut backsnap).await {
                            log::error!("index {} failed: {:#}", name, e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::error!("index {} failed: {:#}", name, e),
                }
            }
        }
        Command::List { remote, fsname } => {
            let config = ConfigFile::load(&cli.config)?;
            let remote_name = remote
                .or_else(|| config.default_remote_name())
                .ok_or_else(|| zbacker::error::Error::Config("no remote given and no default_remote configured".to_string()))?;
            let remote = config.remote_handle(&remote_name)?;
            let mut metas = remote.list(None, None).await?;
            if let Some(fsname) = fsname {
                metas.retain(|m| m.fsname == fsname);
            }
            println!("{}", serde_json::to_string_pretty(&metas)?);
        }
        Command::Restore { local, remote, fsguid, target, bid } => {
            let config = ConfigFile::load(&cli.config)?;
            let local = config.local_handle(&local)?;
            let remote = config.remote_handle(&remote)?;
            engine::restore(local.as_ref(), remote.as_ref(), &fsguid, &bid, &target).await?;
        }
        Command::Daemon => {
            let config = Arc::new(ConfigFile::load(&cli.config)?);
            daemon::run(config).await?;
        }
    }
    Ok(())
}
