// SPDX-License-Identifier: Apache-2.0
//! The backup and restore state machines, realized as a true streaming
//! pipeline via `tokio::io::duplex` + `tokio::try_join!`.

use crate::backsnap::{get_latest_backsnaps, Backsnap};
use crate::common::Key;
use crate::error::{Error, Result};
use crate::lock;
use crate::remote::Remote;
use crate::zfs::{LocalDriver, LocalFilesystem};

/// What a `backup()` call actually did, for logging and for tests asserting
/// idempotence: a second `backup()` with nothing changed creates no new
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackupOutcome {
    pub series_created: bool,
    pub generation_created: bool,
    pub generations_stored: usize,
}

const DUPLEX_BUF: usize = 64 * 1024;

/// Backs up `bid` on `fs`: extends the current series with a new generation
/// if the head is stale (or `force` is set), then streams every unstored
/// generation in the chain to `remote`, pruning superseded local snapshots
/// as their successors land.
pub async fn backup(fs: &dyn LocalFilesystem, remote: &dyn Remote, bid: &str, force: bool) -> Result<BackupOutcome> {
    let fsguid = fs
        .get("guid")
        .await?
        .ok_or_else(|| Error::NotFound(format!("guid property on filesystem {}", fs.name())))?;
    let _lock = lock::acquire(&fsguid, bid).await?;

    let mut chain = get_latest_backsnaps(fs, bid).await?;
    let mut outcome = BackupOutcome::default();

    if chain.is_empty() {
        let key = Key::new_baseline(fsguid, bid);
        let now = chrono::Utc::now().timestamp();
        let snap = Backsnap::create(fs, remote, key, now).await?;
        chain.push(snap);
        outcome.series_created = true;
        outcome.generation_created = true;
    } else {
        let is_current = chain.last().unwrap().snapshot().check_is_current().await?;
        if force || !is_current {
            let head = chain.last().unwrap();
            head.validate_remote(remote)?;
            let key = head.key().next();
            let screation = head.meta().screation;
            let snap = Backsnap::create(fs, remote, key, screation).await?;
            chain.push(snap);
            outcome.generation_created = true;
        }
    }

    let n = chain.len();
    for i in 0..n {
        let (earlier, later) = chain.split_at_mut(i);
        let current = &mut later[0];

        if !current.is_stored() {
            let prev_snapshot = if i > 0 { Some(earlier[i - 1].snapshot()) } else { None };

            let (mut tx, mut rx) = tokio::io::duplex(DUPLEX_BUF);
            let key = current.key().clone();
            let send_fut = current.snapshot().send(&mut tx, prev_snapshot);
            let put_fut = remote.put_data(&key, &mut rx);
            tokio::try_join!(send_fut, put_fut)?;

            remote.put_meta(current.meta()).await?;
            if i == n - 1 {
                remote.index(current).await?;
            }
            current.set_stored(true).await?;
            outcome.generations_stored += 1;
        }

        if i > 0 {
            earlier[i - 1].snapshot().destroy().await?;
        }
    }

    Ok(outcome)
}

/// Restores `bid`'s latest series for `fsguid` onto `target_fsname`,
/// receiving every generation from 0 through the head in order, then
/// destroying the recv-created snapshot chain on the target so it's left
/// as a plain filesystem rather than a pile of zbacker bookkeeping
/// snapshots.
pub async fn restore(
    driver: &dyn LocalDriver,
    remote: &dyn Remote,
    fsguid: &str,
    bid: &str,
    target_fsname: &str,
) -> Result<()> {
    let latest = remote.get_current_meta(fsguid, Some(bid), None).await?;
    let sid = latest.key.sid.clone();

    for n in 0..=latest.key.n {
        let key = Key {
            fsid: fsguid.to_string(),
            bid: bid.to_string(),
            sid: sid.clone(),
            n,
        };
        let (mut tx, mut rx) = tokio::io::duplex(DUPLEX_BUF);
        let get_fut = remote.get_data(&key, &mut tx);
        let recv_fut = driver.recv(target_fsname, &mut rx);
        tokio::try_join!(get_fut, recv_fut)?;
    }

    let fs = driver.get_filesystem(target_fsname).await?;
    for name in fs.list_snapshots(&[]).await?.keys() {
        let snapshot = fs.get_snapshot(name).await?;
        snapshot.destroy().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use crate::common::Meta;
    use crate::zfs::LocalSnapshot;

    struct SnapRecord {
        props: BTreeMap<String, String>,
        creation: i64,
        current: bool,
    }

    struct FakeFsState {
        guid: String,
        creation: i64,
        next_creation: i64,
        snaps: BTreeMap<String, SnapRecord>,
    }

    struct FakeFs {
        state: Arc<Mutex<FakeFsState>>,
    }

    struct FakeSnapshot {
        state: Arc<Mutex<FakeFsState>>,
        name: String,
    }

    #[async_trait]
    impl LocalFilesystem for FakeFs {
        fn name(&self) -> &str {
            "fake/fs"
        }

        async fn get(&self, prop: &str) -> Result<Option<String>> {
            let state = self.state.lock().unwrap();
            if prop == "guid" {
                Ok(Some(state.guid.clone()))
            } else {
                Ok(None)
            }
        }

        async fn get_creation(&self) -> Result<i64> {
            Ok(self.state.lock().unwrap().creation)
        }

        async fn list_snapshots(&self, keys: &[&str]) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .snaps
                .iter()
                .map(|(name, record)| {
                    let props = keys
                        .iter()
                        .filter_map(|k| record.props.get(*k).map(|v| (k.to_string(), v.clone())))
                        .collect();
                    (name.clone(), props)
                })
                .collect())
        }

        async fn get_snapshot(&self, name: &str) -> Result<Box<dyn LocalSnapshot>> {
            let state = self.state.lock().unwrap();
            if !state.snaps.contains_key(name) {
                return Err(Error::NotFound(format!("snapshot {}", name)));
            }
            Ok(Box::new(FakeSnapshot {
                state: self.state.clone(),
                name: name.to_string(),
            }))
        }

        async fn snapshot(&self, name: &str, props: &BTreeMap<String, String>) -> Result<Box<dyn LocalSnapshot>> {
            let mut state = self.state.lock().unwrap();
            let creation = state.next_creation;
            state.next_creation += 1;
            state.snaps.insert(
                name.to_string(),
                SnapRecord {
                    props: props.clone(),
                    creation,
                    current: true,
                },
            );
            Ok(Box::new(FakeSnapshot {
                state: self.state.clone(),
                name: name.to_string(),
            }))
        }
    }

    #[async_trait]
    impl LocalSnapshot for FakeSnapshot {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get(&self, prop: &str) -> Result<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.snaps.get(&self.name).and_then(|r| r.props.get(prop).cloned()))
        }

        async fn set(&self, prop: &str, value: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let record = state
                .snaps
                .get_mut(&self.name)
                .ok_or_else(|| Error::NotFound(format!("snapshot {}", self.name)))?;
            record.props.insert(prop.to_string(), value.to_string());
            Ok(())
        }

        async fn get_creation(&self) -> Result<i64> {
            let state = self.state.lock().unwrap();
            Ok(state.snaps.get(&self.name).map(|r| r.creation).unwrap_or(0))
        }

        async fn check_is_current(&self) -> Result<bool> {
            let state = self.state.lock().unwrap();
            Ok(state.snaps.get(&self.name).map(|r| r.current).unwrap_or(false))
        }

        async fn send(
            &self,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
            other: Option<&dyn LocalSnapshot>,
        ) -> Result<()> {
            let marker = match other {
                Some(other) => format!("incr:{}->{}", other.name(), self.name),
                None => format!("full:{}", self.name),
            };
            sink.write_all(marker.as_bytes()).await?;
            sink.shutdown().await?;
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.snaps.remove(&self.name);
            Ok(())
        }
    }

    struct FakeDriver {
        filesystems: Mutex<HashMap<String, Arc<Mutex<FakeFsState>>>>,
    }

    impl FakeDriver {
        fn new() -> FakeDriver {
            FakeDriver {
                filesystems: Mutex::new(HashMap::new()),
            }
        }

        fn fs(&self, name: &str, guid: &str) -> FakeFs {
            let mut fss = self.filesystems.lock().unwrap();
            let state = fss.entry(name.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(FakeFsState {
                    guid: guid.to_string(),
                    creation: 1_700_000_000,
                    next_creation: 1_700_000_001,
                    snaps: BTreeMap::new(),
                }))
            });
            FakeFs { state: state.clone() }
        }
    }

    #[async_trait]
    impl LocalDriver for FakeDriver {
        async fn get_filesystem(&self, name: &str) -> Result<Box<dyn LocalFilesystem>> {
            Ok(Box::new(self.fs(name, "restore-target-guid")))
        }

        async fn recv(&self, target_name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
            let mut buf = Vec::new();
            source.read_to_end(&mut buf).await?;
            let fs = self.fs(target_name, "restore-target-guid");
            let name = format!("recv-{}", String::from_utf8_lossy(&buf));
            fs.snapshot(&name, &BTreeMap::new()).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRemoteState {
        data: HashMap<String, Vec<u8>>,
        meta: HashMap<String, Meta>,
        current: HashMap<(String, Option<String>, Option<String>), Meta>,
    }

    struct FakeRemote {
        type_: String,
        cfg: serde_json::Value,
        state: Mutex<FakeRemoteState>,
    }

    impl FakeRemote {
        fn new() -> FakeRemote {
            FakeRemote {
                type_: "fake".to_string(),
                cfg: serde_json::json!({ "id": "default" }),
                state: Mutex::new(FakeRemoteState::default()),
            }
        }
    }

    #[async_trait]
    impl Remote for FakeRemote {
        fn type_(&self) -> &str {
            &self.type_
        }

        fn cfg(&self) -> serde_json::Value {
            self.cfg.clone()
        }

        async fn put_data(&self, key: &Key, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            self.state.lock().unwrap().data.insert(key.to_string(), buf);
            Ok(())
        }

        async fn get_data(&self, key: &Key, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
            let buf = self
                .state
                .lock()
                .unwrap()
                .data
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("data {}", key)))?;
            sink.write_all(&buf).await?;
            sink.shutdown().await?;
            Ok(())
        }

        async fn put_meta(&self, meta: &Meta) -> Result<()> {
            self.state.lock().unwrap().meta.insert(meta.key.to_string(), meta.clone());
            Ok(())
        }

        async fn get_meta(&self, key: &Key) -> Result<Meta> {
            self.state
                .lock()
                .unwrap()
                .meta
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("meta {}", key)))
        }

        async fn index(&self, backsnap: &mut Backsnap) -> Result<()> {
            let meta = backsnap.meta().clone();
            let mut state = self.state.lock().unwrap();
            state
                .current
                .insert((meta.key.fsid.clone(), None, None), meta.clone());
            state
                .current
                .insert((meta.key.fsid.clone(), Some(meta.key.bid.clone()), None), meta.clone());
            state.current.insert(
                (meta.key.fsid.clone(), Some(meta.key.bid.clone()), Some(meta.key.sid.clone())),
                meta,
            );
            Ok(())
        }

        async fn get_current_meta(&self, fsid: &str, bid: Option<&str>, sid: Option<&str>) -> Result<Meta> {
            self.state
                .lock()
                .unwrap()
                .current
                .get(&(fsid.to_string(), bid.map(String::from), sid.map(String::from)))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("current meta for {}", fsid)))
        }

        async fn list(&self, _fsid: Option<&str>, _bid: Option<&str>) -> Result<Vec<Meta>> {
            Ok(self.state.lock().unwrap().current.values().cloned().collect())
        }
    }

    #[tokio::test]
    async fn first_backup_creates_and_stores_baseline() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-1");
        let remote = FakeRemote::new();

        let outcome = backup(&fs, &remote, "daily", false).await.unwrap();
        assert!(outcome.series_created);
        assert!(outcome.generation_created);
        assert_eq!(outcome.generations_stored, 1);

        let chain = get_latest_backsnaps(&fs, "daily").await.unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain[0].is_stored());
    }

    #[tokio::test]
    async fn second_backup_with_no_changes_is_idempotent() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-2");
        let remote = FakeRemote::new();

        backup(&fs, &remote, "daily", false).await.unwrap();
        let outcome = backup(&fs, &remote, "daily", false).await.unwrap();

        assert!(!outcome.series_created);
        assert!(!outcome.generation_created);
        assert_eq!(outcome.generations_stored, 0);
    }

    #[tokio::test]
    async fn stale_snapshot_grows_the_chain_and_prunes_the_previous_generation() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-3");
        let remote = FakeRemote::new();

        backup(&fs, &remote, "daily", false).await.unwrap();
        let first_chain = get_latest_backsnaps(&fs, "daily").await.unwrap();
        let first_name = first_chain[0].snapshot().name().to_string();

        {
            let mut state = fs.state.lock().unwrap();
            state.snaps.get_mut(&first_name).unwrap().current = false;
        }

        let outcome = backup(&fs, &remote, "daily", false).await.unwrap();
        assert!(outcome.generation_created);
        assert_eq!(outcome.generations_stored, 1);

        let chain = get_latest_backsnaps(&fs, "daily").await.unwrap();
        assert_eq!(chain.len(), 1, "previous generation must be pruned once its successor is stored");
        assert_eq!(chain[0].key().n, 1);
    }

    #[tokio::test]
    async fn force_creates_a_new_generation_even_when_current() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-4");
        let remote = FakeRemote::new();

        backup(&fs, &remote, "daily", false).await.unwrap();
        let outcome = backup(&fs, &remote, "daily", true).await.unwrap();
        assert!(outcome.generation_created);
        assert_eq!(outcome.generations_stored, 1);
    }

    #[tokio::test]
    async fn mismatched_remote_is_rejected() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-5");
        let remote_a = FakeRemote::new();
        let mut remote_b = FakeRemote::new();
        remote_b.cfg = serde_json::json!({ "id": "different" });

        backup(&fs, &remote_a, "daily", false).await.unwrap();
        {
            let mut state = fs.state.lock().unwrap();
            for record in state.snaps.values_mut() {
                record.current = false;
            }
        }

        let err = backup(&fs, &remote_b, "daily", false).await.unwrap_err();
        assert!(matches!(err, Error::IncompatibleRemote(_)));
    }

    #[tokio::test]
    async fn restore_replays_every_generation_and_cleans_up() {
        let driver = FakeDriver::new();
        let fs = driver.fs("tank/data", "fsguid-6");
        let remote = FakeRemote::new();

        backup(&fs, &remote, "daily", false).await.unwrap();
        {
            let mut state = fs.state.lock().unwrap();
            for record in state.snaps.values_mut() {
                record.current = false;
            }
        }
        backup(&fs, &remote, "daily", false).await.unwrap();

        restore(&driver, &remote, "fsguid-6", "daily", "tank/restored").await.unwrap();

        let target = driver.fs("tank/restored", "restore-target-guid");
        let remaining = target.list_snapshots(&[]).await.unwrap();
        assert!(remaining.is_empty(), "restore must destroy its own recv-created chain");
    }
}
