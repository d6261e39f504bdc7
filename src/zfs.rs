// SPDX-License-Identifier: Apache-2.0
//! ZFS operations, behind the `LocalDriver`/`LocalFilesystem`/`LocalSnapshot`
//! trait surface so the engine can run against a real `zfs` binary or an
//! in-memory fake.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

use crate::checked::CheckedExt;
use crate::error::{Error, Result};

/// Path to the `zfs` binary.
pub static ZFS: &str = "/sbin/zfs";

/// Operations against the local snapshot-capable filesystem.
#[async_trait]
pub trait LocalDriver: Send + Sync {
    /// Open a handle to a named filesystem. Fails if the filesystem doesn't
    /// exist.
    async fn get_filesystem(&self, name: &str) -> Result<Box<dyn LocalFilesystem>>;

    /// Receive a stream (full or incremental) produced by `LocalSnapshot::send`
    /// into a filesystem, creating it if necessary.
    async fn recv(&self, target_name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;
}

/// A single filesystem (dataset) on the local driver.
#[async_trait]
pub trait LocalFilesystem: Send + Sync {
    fn name(&self) -> &str;

    /// Read a named property; `None` if unset (the `-` sentinel).
    async fn get(&self, prop: &str) -> Result<Option<String>>;

    /// The filesystem's own creation time, Unix seconds UTC.
    async fn get_creation(&self) -> Result<i64>;

    /// All snapshots of this filesystem, keyed by short name (the part after
    /// `@`), each carrying the requested property values (only properties
    /// that are actually set are present in the map).
    async fn list_snapshots(&self, keys: &[&str]) -> Result<BTreeMap<String, BTreeMap<String, String>>>;

    /// Open a handle to an existing snapshot by short name.
    async fn get_snapshot(&self, name: &str) -> Result<Box<dyn LocalSnapshot>>;

    /// Create a new snapshot, setting the given properties atomically with
    /// creation (`zfs snapshot -o prop=value`).
    async fn snapshot(&self, name: &str, props: &BTreeMap<String, String>) -> Result<Box<dyn LocalSnapshot>>;
}

/// A single snapshot.
#[async_trait]
pub trait LocalSnapshot: Send + Sync {
    /// The snapshot's short name (the part after `@`).
    fn name(&self) -> &str;

    async fn get(&self, prop: &str) -> Result<Option<String>>;

    async fn set(&self, prop: &str, value: &str) -> Result<()>;

    async fn get_creation(&self) -> Result<i64>;

    /// Whether this snapshot still reflects the filesystem's live state
    /// (`zfs diff` reports no changes since it was taken).
    async fn check_is_current(&self) -> Result<bool>;

    /// Stream this snapshot's contents into `sink`. If `other` is given,
    /// sends the incremental stream from `other` to `self`; otherwise sends
    /// a full stream. `sink` is shut down (write side closed) once the
    /// stream is fully written, so a paired reader sees EOF.
    async fn send(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        other: Option<&dyn LocalSnapshot>,
    ) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}

/// The real driver, shelling out to the `zfs` command line tool.
#[derive(Debug, Default)]
pub struct Zfs;

impl Zfs {
    pub fn new() -> Zfs {
        Zfs
    }
}

#[async_trait]
impl LocalDriver for Zfs {
    async fn get_filesystem(&self, name: &str) -> Result<Box<dyn LocalFilesystem>> {
        let status = Command::new(ZFS)
            .arg("list")
            .arg("-H")
            .arg("-t")
            .arg("filesystem")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::NotFound(format!("filesystem {}", name)));
        }
        Ok(Box::new(ZfsFilesystem {
            name: name.to_string(),
        }))
    }

    async fn recv(&self, target_name: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        let mut cmd = Command::new(ZFS);
        cmd.arg("recv").arg("-u").arg(target_name);
        cmd.stdin(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().expect("zfs recv stdin was piped");
        tokio::io::copy(source, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);
        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Backend(anyhow::anyhow!(
                "zfs recv {} failed: {:?}",
                target_name,
                status
            )));
        }
        Ok(())
    }
}

struct ZfsFilesystem {
    name: String,
}

#[async_trait]
impl LocalFilesystem for ZfsFilesystem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, prop: &str) -> Result<Option<String>> {
        get_prop(&self.name, prop).await
    }

    async fn get_creation(&self) -> Result<i64> {
        parse_creation(self.get("creation").await?)
    }

    async fn list_snapshots(&self, keys: &[&str]) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let mut fields = vec!["name"];
        fields.extend_from_slice(keys);
        let field_arg = fields.join(",");

        let out = Command::new(ZFS)
            .arg("list")
            .arg("-t")
            .arg("snapshot")
            .arg("-H")
            .arg("-r")
            .arg("-o")
            .arg(&field_arg)
            .arg(&self.name)
            .checked_output()
            .await
            .map_err(Error::Backend)?;

        let mut result = BTreeMap::new();
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            let values: Vec<&str> = line.split('\t').collect();
            let short = match values[0].split_once('@') {
                Some((_, short)) => short,
                None => continue,
            };
            let mut props = BTreeMap::new();
            for (i, key) in keys.iter().enumerate() {
                if let Some(v) = values.get(i + 1) {
                    if *v != "-" {
                        props.insert((*key).to_string(), v.to_string());
                    }
                }
            }
            result.insert(short.to_string(), props);
        }
        Ok(result)
    }

    async fn get_snapshot(&self, name: &str) -> Result<Box<dyn LocalSnapshot>> {
        let full = format!("{}@{}", self.name, name);
        let status = Command::new(ZFS)
            .arg("list")
            .arg("-H")
            .arg("-t")
            .arg("snapshot")
            .arg(&full)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::NotFound(format!("snapshot {}", full)));
        }
        Ok(Box::new(ZfsSnapshot { full }))
    }

    async fn snapshot(&self, name: &str, props: &BTreeMap<String, String>) -> Result<Box<dyn LocalSnapshot>> {
        let full = format!("{}@{}", self.name, name);
        let mut cmd = Command::new(ZFS);
        cmd.arg("snapshot");
        for (k, v) in props {
            cmd.arg("-o").arg(format!("{}={}", k, v));
        }
        cmd.arg(&full);
        cmd.checked_noio().await.map_err(Error::Backend)?;
        Ok(Box::new(ZfsSnapshot { full }))
    }
}

struct ZfsSnapshot {
    /// `<filesystem>@<name>`, the form `zfs` itself wants everywhere.
    full: String,
}

impl ZfsSnapshot {
    fn short_name(&self) -> &str {
        self.full.split_once('@').map(|(_, s)| s).unwrap_or(&self.full)
    }

    fn filesystem(&self) -> &str {
        self.full.split_once('@').map(|(fs, _)| fs).unwrap_or(&self.full)
    }
}

#[async_trait]
impl LocalSnapshot for ZfsSnapshot {
    fn name(&self) -> &str {
        self.short_name()
    }

    async fn get(&self, prop: &str) -> Result<Option<String>> {
        get_prop(&self.full, prop).await
    }

    async fn set(&self, prop: &str, value: &str) -> Result<()> {
        Command::new(ZFS)
            .arg("set")
            .arg(format!("{}={}", prop, value))
            .arg(&self.full)
            .checked_noio()
            .await
            .map_err(Error::Backend)
    }

    async fn get_creation(&self) -> Result<i64> {
        parse_creation(self.get("creation").await?)
    }

    async fn check_is_current(&self) -> Result<bool> {
        // `zfs diff` exits 0 and prints nothing when there have been no
        // changes since the snapshot; any printed line means the live
        // filesystem has moved on.
        let out = Command::new(ZFS)
            .arg("diff")
            .arg("-H")
            .arg(&self.full)
            .checked_output()
            .await
            .map_err(Error::Backend)?;
        Ok(out.stdout.is_empty())
    }

    async fn send(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        other: Option<&dyn LocalSnapshot>,
    ) -> Result<()> {
        let mut cmd = Command::new(ZFS);
        cmd.arg("send");
        if let Some(other) = other {
            cmd.arg("-i").arg(format!("{}@{}", self.filesystem(), other.name()));
        }
        cmd.arg(&self.full);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn()?;
        let mut stdout = child.stdout.take().expect("zfs send stdout was piped");
        tokio::io::copy(&mut stdout, sink).await?;
        sink.shutdown().await?;
        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Backend(anyhow::anyhow!(
                "zfs send {} failed: {:?}",
                self.full,
                status
            )));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Command::new(ZFS)
            .arg("destroy")
            .arg(&self.full)
            .checked_noio()
            .await
            .map_err(Error::Backend)
    }
}

async fn get_prop(target: &str, prop: &str) -> Result<Option<String>> {
    let out = Command::new(ZFS)
        .arg("get")
        .arg("-Hp")
        .arg("-o")
        .arg("value")
        .arg(prop)
        .arg(target)
        .checked_output()
        .await
        .map_err(Error::Backend)?;
    let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if value == "-" {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// `zfs get -p creation` already yields a parsable Unix-epoch value (UTC);
/// no timezone correction is needed on any ZFS version this crate targets.
fn parse_creation(raw: Option<String>) -> Result<i64> {
    let raw = raw.ok_or_else(|| Error::NotFound("creation".to_string()))?;
    raw.parse()
        .map_err(|_| Error::Backend(anyhow::anyhow!("unparsable creation value: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_short_name_splits_on_at() {
        let snap = ZfsSnapshot {
            full: "tank/data@zbacker:1-daily-abc123-0".to_string(),
        };
        assert_eq!(snap.short_name(), "zbacker:1-daily-abc123-0");
        assert_eq!(snap.filesystem(), "tank/data");
    }

    #[test]
    fn parse_creation_rejects_missing_property() {
        assert!(parse_creation(None).is_err());
    }

    #[test]
    fn parse_creation_accepts_epoch_seconds() {
        assert_eq!(parse_creation(Some("1700000000".to_string())).unwrap(), 1700000000);
    }
}
