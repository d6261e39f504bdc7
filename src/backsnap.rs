// SPDX-License-Identifier: Apache-2.0
//! `Backsnap`: a local snapshot paired with the engine's persisted state
//! about it, plus the enumeration helpers the engine and CLI need to walk
//! a filesystem's backup chains.

use std::collections::BTreeMap;

use hostname::get as get_hostname;

use crate::common::{BacksnapState, Key, Meta, RemoteId, STATE_PROP, VERSION, VERSION_PROP};
use crate::error::{Error, Result};
use crate::remote::Remote;
use crate::zfs::{LocalFilesystem, LocalSnapshot};

/// A snapshot that carries zbacker's bookkeeping: the `Meta` record
/// describing it, whether its stream has been stored remotely yet, and the
/// identity of the remote it was created against.
pub struct Backsnap {
    snapshot: Box<dyn LocalSnapshot>,
    state: BacksnapState,
}

impl Backsnap {
    fn from_parts(snapshot: Box<dyn LocalSnapshot>, state: BacksnapState) -> Backsnap {
        Backsnap { snapshot, state }
    }

    pub fn snapshot(&self) -> &dyn LocalSnapshot {
        self.snapshot.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.state.meta
    }

    pub fn key(&self) -> &Key {
        &self.state.meta.key
    }

    pub fn is_stored(&self) -> bool {
        self.state.stored
    }

    pub fn get_remote_state(&self) -> Option<&serde_json::Value> {
        self.state.remote_state.as_ref()
    }

    pub async fn set_stored(&mut self, stored: bool) -> Result<()> {
        self.state.stored = stored;
        self.apply_state().await
    }

    pub async fn set_remote_state(&mut self, value: serde_json::Value) -> Result<()> {
        self.state.remote_state = Some(value);
        self.apply_state().await
    }

    /// Confirms `remote` is the same remote (by type and config) this
    /// Backsnap was created against; a generation may only ever be stored
    /// to the remote its series started with.
    pub fn validate_remote(&self, remote: &dyn Remote) -> Result<()> {
        if self.state.remote.type_ != remote.type_() || self.state.remote.cfg != remote.cfg() {
            return Err(Error::IncompatibleRemote(format!(
                "series started against {:?} but asked to store to {:?}",
                self.state.remote,
                RemoteId {
                    type_: remote.type_().to_string(),
                    cfg: remote.cfg(),
                }
            )));
        }
        Ok(())
    }

    async fn apply_state(&mut self) -> Result<()> {
        let data = self.state.to_json()?;
        let text = String::from_utf8(data).expect("serde_json output is valid UTF-8");
        self.snapshot.set(STATE_PROP, &text).await?;
        Ok(())
    }

    /// Creates a new snapshot for `key` on `fs`, tagged with a fresh
    /// `BacksnapState` bound to `remote`. If writing the version/state
    /// properties fails, the just-created snapshot is destroyed rather
    /// than left half-tagged, since `zfs snapshot -o` isn't guaranteed
    /// atomic with property writes on every backend.
    pub async fn create(fs: &dyn LocalFilesystem, remote: &dyn Remote, key: Key, screation: i64) -> Result<Backsnap> {
        let now = chrono::Utc::now().timestamp();
        let fscreation = fs.get_creation().await?;
        let hostname = get_hostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let meta = Meta {
            key: key.clone(),
            fsname: fs.name().to_string(),
            fscreation,
            hostname,
            creation: now,
            screation,
        };

        let state = BacksnapState {
            meta,
            stored: false,
            remote: RemoteId {
                type_: remote.type_().to_string(),
                cfg: remote.cfg(),
            },
            remote_state: None,
        };

        let state_text = String::from_utf8(state.to_json()?).expect("serde_json output is valid UTF-8");

        let mut props = BTreeMap::new();
        props.insert(VERSION_PROP.to_string(), VERSION.to_string());
        props.insert(STATE_PROP.to_string(), state_text);

        let name = key.snapshot_name();
        let snapshot = fs.snapshot(&name, &props).await;
        match snapshot {
            Ok(snapshot) => Ok(Backsnap::from_parts(snapshot, state)),
            Err(e) => {
                if let Ok(existing) = fs.get_snapshot(&name).await {
                    let _ = existing.destroy().await;
                }
                Err(e)
            }
        }
    }
}

/// Loads every Backsnap for `bid` on `fs`, grouped by series id, each
/// group sorted ascending by generation (equivalently, by creation time —
/// `n` is monotonic within a series by construction).
pub async fn get_all_backsnaps(fs: &dyn LocalFilesystem, bid: &str) -> Result<BTreeMap<String, Vec<Backsnap>>> {
    let snaps = fs.list_snapshots(&[VERSION_PROP]).await?;
    let mut groups: BTreeMap<String, Vec<Backsnap>> = BTreeMap::new();

    for (name, props) in snaps {
        if props.get(VERSION_PROP).map(|v| v.as_str()) != Some(VERSION) {
            continue;
        }
        let snapshot = fs.get_snapshot(&name).await?;
        let state_text = match snapshot.get(STATE_PROP).await? {
            Some(text) => text,
            None => continue,
        };
        let state = BacksnapState::from_json(state_text.as_bytes())?;
        if state.meta.key.bid != bid {
            continue;
        }
        let sid = state.meta.key.sid.clone();
        groups
            .entry(sid)
            .or_default()
            .push(Backsnap::from_parts(snapshot, state));
    }

    for group in groups.values_mut() {
        group.sort_by_key(|b| b.key().n);
    }

    Ok(groups)
}

/// Picks the single series whose head (most recent generation) is newest,
/// breaking ties between equally-recent heads by lexicographic `sid`
/// compare (any deterministic tie-break is acceptable here).
pub async fn get_latest_backsnaps(fs: &dyn LocalFilesystem, bid: &str) -> Result<Vec<Backsnap>> {
    let mut groups = get_all_backsnaps(fs, bid).await?;

    let mut best_sid: Option<(i64, String)> = None;
    for (sid, group) in groups.iter() {
        let head = match group.last() {
            Some(h) => h,
            None => continue,
        };
        let creation = head.snapshot().get_creation().await?;
        let better = match &best_sid {
            None => true,
            Some((bc, bsid)) => (creation, sid) > (*bc, bsid),
        };
        if better {
            best_sid = Some((creation, sid.clone()));
        }
    }

    match best_sid {
        Some((_, sid)) => Ok(groups.remove(&sid).unwrap_or_default()),
        None => Ok(Vec::new()),
    }
}

/// The most recent generation of the latest series that has actually been
/// stored remotely, if any.
pub async fn get_latest_stored(fs: &dyn LocalFilesystem, bid: &str) -> Result<Option<Backsnap>> {
    let mut chain = get_latest_backsnaps(fs, bid).await?;
    Ok(chain.drain(..).filter(|b| b.is_stored()).last())
}
