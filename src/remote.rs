// SPDX-License-Identifier: Apache-2.0
//! The `Remote` trait: a closed set of object-store backends (directory,
//! S3) behind one interface, plus the path layout shared by both.

pub mod fs;
pub mod s3;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::backsnap::Backsnap;
use crate::common::{Key, Meta, VERSION};
use crate::error::Result;

/// A remote object store capable of holding full/incremental snapshot
/// streams plus their metadata, addressed by the hierarchy in
/// `remote::path`.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Discriminant used to recognize remote identity (`RemoteId::type_`).
    fn type_(&self) -> &str;

    /// Config used to recognize remote identity (`RemoteId::cfg`); must be
    /// stable for a given remote across process restarts.
    fn cfg(&self) -> serde_json::Value;

    /// Store the (already framed) data stream for `key`. Implementations
    /// apply LZMA compression before writing.
    async fn put_data(&self, key: &Key, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;

    /// Retrieve and decompress the data stream for `key` into `sink`.
    async fn get_data(&self, key: &Key, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;

    async fn put_meta(&self, meta: &Meta) -> Result<()>;

    async fn get_meta(&self, key: &Key) -> Result<Meta>;

    /// Update the named pointer objects (`current`, per-backup, per-series,
    /// day-stamped) to reference `backsnap`, skipping any pointer whose
    /// recorded generation already matches.
    async fn index(&self, backsnap: &mut Backsnap) -> Result<()>;

    /// Resolve the most current `Meta` at the requested scope: whole
    /// filesystem (`bid`/`sid` both `None`), a single backup (`sid` `None`),
    /// or a single series.
    async fn get_current_meta(&self, fsid: &str, bid: Option<&str>, sid: Option<&str>) -> Result<Meta>;

    /// One level of enumeration: filesystems (both `None`), backups under a
    /// filesystem (`bid` `None`), or series under a backup.
    async fn list(&self, fsid: Option<&str>, bid: Option<&str>) -> Result<Vec<Meta>>;
}

/// Object-store key layout shared by every backend, matching the
/// `fs/<fsid>.fs/backup/<bid>.backup/series/<sid>.series/...` hierarchy.
pub(crate) mod path {
    use crate::common::Key;

    pub fn root(prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            super::VERSION.to_string()
        } else {
            format!("{}/{}", prefix, super::VERSION)
        }
    }

    pub fn fs_path(prefix: &str, fsid: &str) -> String {
        format!("{}/fs/{}.fs", root(prefix), fsid)
    }

    pub fn backup_path(prefix: &str, fsid: &str, bid: &str) -> String {
        format!("{}/backup/{}.backup", fs_path(prefix, fsid), bid)
    }

    pub fn series_path(prefix: &str, fsid: &str, bid: &str, sid: &str) -> String {
        format!("{}/series/{}.series", backup_path(prefix, fsid, bid), sid)
    }

    pub fn data_path(prefix: &str, fsid: &str, bid: &str, sid: &str) -> String {
        format!("{}/data", series_path(prefix, fsid, bid, sid))
    }

    pub fn index_path(prefix: &str, fsid: &str, bid: &str) -> String {
        format!("{}/index", backup_path(prefix, fsid, bid))
    }

    pub fn data_datapath(prefix: &str, key: &Key) -> String {
        format!("{}/{}.data.xz", data_path(prefix, &key.fsid, &key.bid, &key.sid), key.n)
    }

    pub fn data_metapath(prefix: &str, key: &Key) -> String {
        format!("{}/{}.meta", data_path(prefix, &key.fsid, &key.bid, &key.sid), key.n)
    }

    pub fn index_metapath(prefix: &str, fsid: &str, bid: &str, nodename: &str) -> String {
        format!("{}/{}.meta", index_path(prefix, fsid, bid), nodename)
    }

    pub fn current_path(prefix: &str, fsid: &str, bid: Option<&str>, sid: Option<&str>) -> String {
        match (bid, sid) {
            (None, _) => format!("{}/current.meta", fs_path(prefix, fsid)),
            (Some(bid), None) => format!("{}/current.meta", backup_path(prefix, fsid, bid)),
            (Some(bid), Some(sid)) => format!("{}/current.meta", series_path(prefix, fsid, bid, sid)),
        }
    }
}

/// Computes the named pointer paths `index()` maintains for `key`: the
/// fs-wide, per-backup, and per-series `current` pointers, plus a
/// day-stamped snapshot under the backup's `index/` directory.
pub(crate) fn named_index_paths(prefix: &str, key: &Key, day_stamp: &str) -> BTreeMap<&'static str, String> {
    let mut m = BTreeMap::new();
    m.insert("current", path::current_path(prefix, &key.fsid, None, None));
    m.insert("bid_current", path::current_path(prefix, &key.fsid, Some(&key.bid), None));
    m.insert(
        "bid_sid_current",
        path::current_path(prefix, &key.fsid, Some(&key.bid), Some(&key.sid)),
    );
    m.insert(
        "bid_day",
        path::index_metapath(prefix, &key.fsid, &key.bid, day_stamp),
    );
    m
}

/// Shared `Remote` implementation over any `object_store::ObjectStore`.
/// `DirRemote` and `S3Remote` are thin constructors around this — both
/// backends only ever differ in which store they hand over and what
/// identity (`type_`/`cfg`) they report, keeping the backends as a closed set of
/// variants behind one interface" design note.
pub struct ObjectStoreRemote {
    type_: String,
    cfg: serde_json::Value,
    prefix: String,
    store: std::sync::Arc<dyn object_store::ObjectStore>,
}

impl ObjectStoreRemote {
    pub(crate) fn new(
        type_: &str,
        cfg: serde_json::Value,
        prefix: &str,
        store: std::sync::Arc<dyn object_store::ObjectStore>,
    ) -> ObjectStoreRemote {
        ObjectStoreRemote {
            type_: type_.to_string(),
            cfg,
            prefix: prefix.to_string(),
            store,
        }
    }

    async fn put_meta_at(&self, path: &str, meta: &Meta) -> Result<()> {
        let data = meta.to_json()?;
        self.store
            .put(&object_store::path::Path::from(path), data.into())
            .await?;
        Ok(())
    }

    async fn get_meta_at(&self, path: &str) -> Result<Meta> {
        let result = self.store.get(&object_store::path::Path::from(path)).await?;
        let bytes = result.bytes().await?;
        Ok(Meta::from_json(&bytes)?)
    }

    fn last_segment(p: &object_store::path::Path) -> String {
        p.as_ref().trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string()
    }
}

#[async_trait]
impl Remote for ObjectStoreRemote {
    fn type_(&self) -> &str {
        &self.type_
    }

    fn cfg(&self) -> serde_json::Value {
        self.cfg.clone()
    }

    async fn put_data(&self, key: &Key, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let obj_path = object_store::path::Path::from(path::data_datapath(&self.prefix, key));
        let mut writer = object_store::buffered::BufWriter::new(self.store.clone(), obj_path);
        let mut encoder = async_compression::tokio::write::XzEncoder::new(&mut writer);
        tokio::io::copy(stream, &mut encoder).await?;
        encoder.shutdown().await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn get_data(&self, key: &Key, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        use futures::TryStreamExt;

        let obj_path = object_store::path::Path::from(path::data_datapath(&self.prefix, key));
        let result = self.store.get(&obj_path).await?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = tokio_util::io::StreamReader::new(stream);
        let buffered = tokio::io::BufReader::new(reader);
        let mut decoder = async_compression::tokio::bufread::XzDecoder::new(buffered);
        tokio::io::copy(&mut decoder, sink).await?;
        Ok(())
    }

    async fn put_meta(&self, meta: &Meta) -> Result<()> {
        self.put_meta_at(&path::data_metapath(&self.prefix, &meta.key), meta).await
    }

    async fn get_meta(&self, key: &Key) -> Result<Meta> {
        self.get_meta_at(&path::data_metapath(&self.prefix, key)).await
    }

    async fn index(&self, backsnap: &mut Backsnap) -> Result<()> {
        use chrono::Datelike;

        let key = backsnap.key().clone();
        let meta = backsnap.meta().clone();
        let now = chrono::Utc::now();
        let day_stamp = format!("{}-{}-{}", now.year(), now.month(), now.day());
        let named = named_index_paths(&self.prefix, &key, &day_stamp);

        let mut indexes: BTreeMap<String, Key> = backsnap
            .get_remote_state()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let mut changed = false;
        for (name, path_str) in &named {
            if indexes.get(*name).map(|k| k == &key).unwrap_or(false) {
                continue;
            }
            self.put_meta_at(path_str, &meta).await?;
            indexes.insert((*name).to_string(), key.clone());
            changed = true;
        }

        if changed {
            backsnap.set_remote_state(serde_json::to_value(&indexes)?).await?;
        }
        Ok(())
    }

    async fn get_current_meta(&self, fsid: &str, bid: Option<&str>, sid: Option<&str>) -> Result<Meta> {
        self.get_meta_at(&path::current_path(&self.prefix, fsid, bid, sid)).await
    }

    async fn list(&self, fsid: Option<&str>, bid: Option<&str>) -> Result<Vec<Meta>> {
        let (list_prefix, suffix) = match (fsid, bid) {
            (None, _) => (format!("{}/fs", path::root(&self.prefix)), ".fs"),
            (Some(fsid), None) => (format!("{}/backup", path::fs_path(&self.prefix, fsid)), ".backup"),
            (Some(fsid), Some(bid)) => (
                format!("{}/series", path::backup_path(&self.prefix, fsid, bid)),
                ".series",
            ),
        };

        let listing = self
            .store
            .list_with_delimiter(Some(&object_store::path::Path::from(list_prefix)))
            .await?;

        let mut metas = Vec::new();
        for p in listing.common_prefixes {
            let seg = Self::last_segment(&p);
            let id = match seg.strip_suffix(suffix) {
                Some(id) => id,
                None => continue,
            };
            let meta = match (fsid, bid) {
                (None, _) => self.get_current_meta(id, None, None).await,
                (Some(fsid), None) => self.get_current_meta(fsid, Some(id), None).await,
                (Some(fsid), Some(bid)) => self.get_current_meta(fsid, Some(bid), Some(id)).await,
            };
            if let Ok(meta) = meta {
                metas.push(meta);
            }
        }
        Ok(metas)
    }
}
