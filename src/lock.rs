// SPDX-License-Identifier: Apache-2.0
//! Advisory, non-blocking exclusive process lock serializing concurrent
//! `backup()` invocations for the same `(fsguid, bid)` pair.

use std::fs::OpenOptions;
use std::path::PathBuf;

use fs4::tokio::AsyncFileExt;
use tokio::fs::File;

use crate::common::VERSION;
use crate::error::{Error, Result};

/// Holds the open, locked file for the lifetime of a `backup()` call;
/// dropping it releases the lock.
pub struct Lock {
    _file: File,
}

/// Prefers the well-known `/var/run/zbacker`, falling back to a directory
/// under the system temp dir when that's not writable (unprivileged
/// development and test runs).
fn lock_dir() -> PathBuf {
    let well_known = PathBuf::from("/var/run/zbacker");
    if std::fs::create_dir_all(&well_known).is_ok() {
        well_known
    } else {
        std::env::temp_dir().join("zbacker")
    }
}

/// Acquires the lock for `(fsguid, bid)`, failing immediately (rather than
/// blocking) if another process already holds it.
pub async fn acquire(fsguid: &str, bid: &str) -> Result<Lock> {
    let dir = lock_dir();
    std::fs::create_dir_all(&dir).map_err(Error::from)?;
    let path = dir.join(format!("zbacker-{}-{}-{}.lock", VERSION, fsguid, bid));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(Error::from)?;
    let file = File::from_std(file);

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Lock { _file: file }),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::AlreadyRunning(format!(
            "backup already running for fsguid={} bid={}",
            fsguid, bid
        ))),
        Err(e) => Err(Error::from(e)),
    }
}
