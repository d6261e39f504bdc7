// SPDX-License-Identifier: Apache-2.0
//! Core data types: the stream identity (`Key`), the descriptive record
//! that rides alongside every stored stream (`Meta`), and the state blob
//! persisted into snapshot properties (`BacksnapState`).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version of the on-disk/on-wire format. Bumping this isolates old chains:
/// snapshots and remote objects written under a previous VERSION become
/// invisible to the engine, by design.
pub const VERSION: &str = "1";

/// The ZFS property holding `VERSION`, used to recognize our snapshots.
pub const VERSION_PROP: &str = "zbacker:version";

/// The ZFS property holding the serialized `BacksnapState`.
pub const STATE_PROP: &str = "zbacker:state";

/// Uniquely identifies one stream within a chain: which filesystem, which
/// named backup on that filesystem, which series (baseline + its
/// increments), and which generation within that series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub fsid: String,
    pub bid: String,
    pub sid: String,
    pub n: u64,
}

impl Key {
    /// Start a fresh series: a new random `sid`, generation 0.
    pub fn new_baseline(fsid: impl Into<String>, bid: impl Into<String>) -> Key {
        Key {
            fsid: fsid.into(),
            bid: bid.into(),
            sid: Uuid::new_v4().simple().to_string(),
            n: 0,
        }
    }

    /// The next generation in the same series.
    pub fn next(&self) -> Key {
        Key {
            fsid: self.fsid.clone(),
            bid: self.bid.clone(),
            sid: self.sid.clone(),
            n: self.n + 1,
        }
    }

    /// The short snapshot name this key maps to: `zbacker:<VERSION>-<bid>-<sid>-<n>`.
    pub fn snapshot_name(&self) -> String {
        format!("zbacker:{}-{}-{}-{}", VERSION, self.bid, self.sid, self.n)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[fsid={}, bid={}, sid={}, n={}]",
            self.fsid, self.bid, self.sid, self.n
        )
    }
}

/// Describes the snapshot that produced a stored stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub key: Key,
    pub fsname: String,
    /// Native creation timestamp of the source filesystem, Unix seconds UTC.
    pub fscreation: i64,
    pub hostname: String,
    /// When this Meta was produced, Unix seconds UTC.
    pub creation: i64,
    /// When the series (the baseline) started, Unix seconds UTC. Copied from
    /// the baseline's `creation` for every generation in the series.
    pub screation: i64,
}

impl Meta {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Meta> {
        serde_json::from_slice(data)
    }

    pub fn creation_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.creation, 0).single().unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }

    pub fn fscreation_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.fscreation, 0).single().unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }

    pub fn screation_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.screation, 0).single().unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }
}

impl std::fmt::Display for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[key={}, fsname={}, fscreation={}, hostname={}, creation={}]",
            self.key, self.fsname, self.fscreation, self.hostname, self.creation
        )
    }
}

/// Identity of a remote backend, as recorded on a Backsnap. Two remotes are
/// compatible iff both fields compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteId {
    #[serde(rename = "type")]
    pub type_: String,
    pub cfg: Value,
}

/// The state blob persisted in `STATE_PROP` alongside every Backsnap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacksnapState {
    pub meta: Meta,
    pub stored: bool,
    pub remote: RemoteId,
    /// Backend-private bookkeeping, opaque to the core. See `Remote::index`.
    pub remote_state: Option<Value>,
}

impl BacksnapState {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<BacksnapState> {
        serde_json::from_slice(data)
    }
}
