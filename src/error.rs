// SPDX-License-Identifier: Apache-2.0
//! Error kinds for the backup engine.
//!
//! The daemon catches every one of these per-backup and logs it; only
//! `Config` is meant to be fatal at startup (see `config.rs`).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incompatible remote: {0}")]
    IncompatibleRemote(String),

    #[error("backup already running: {0}")]
    AlreadyRunning(String),

    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Stream(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Error {
        Error::Backend(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Backend(e.into())
    }
}
