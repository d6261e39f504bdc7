// SPDX-License-Identifier: Apache-2.0
//! YAML configuration. Loading validates the format version
//! up front so a stale config fails fast at startup rather than partway
//! through a backup; local driver and remote backend handles are built
//! lazily and cached by name so repeated lookups (daemon ticks, `backup-all`)
//! don't reopen the same S3 client or re-probe the same ZFS binary.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::common::VERSION;
use crate::error::{Error, Result};
use crate::remote::{self, Remote};
use crate::zfs::{LocalDriver, Zfs};

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    version: String,
    default_local: Option<String>,
    default_remote: Option<String>,
    locals: BTreeMap<String, LocalConfig>,
    remotes: BTreeMap<String, RemoteConfig>,
    backups: BTreeMap<String, BackupConfig>,

    #[serde(skip)]
    local_cache: Mutex<BTreeMap<String, Arc<dyn LocalDriver>>>,
    #[serde(skip)]
    remote_cache: Mutex<BTreeMap<String, Arc<dyn Remote>>>,
}

#[derive(Debug, Deserialize)]
struct LocalConfig {
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RemoteConfig {
    Fs {
        root: String,
    },
    S3 {
        bucket: String,
        prefix: String,
        #[serde(default)]
        creds: Option<CredsConfig>,
        #[serde(default)]
        profile: Option<String>,
        #[serde(default)]
        region: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct CredsConfig {
    access_key_id: String,
    secret_access_key: String,
}

#[derive(Debug, Deserialize)]
struct BackupConfig {
    local: Option<String>,
    remote: Option<String>,
    fs: FsNameConfig,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    period: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FsNameConfig {
    name: String,
}

/// Resolved handles for one configured backup: the local driver and remote
/// backend it should run against, plus its filesystem name and `bid`.
pub struct BackupHandle {
    pub local: Arc<dyn LocalDriver>,
    pub remote: Arc<dyn Remote>,
    pub fsname: String,
    pub bid: String,
}

const DEFAULT_BID: &str = "default";
const DEFAULT_PERIOD_SECS: u64 = 60;

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
        let file = File::open(path).map_err(Error::from)?;
        let config: ConfigFile = serde_yaml::from_reader(file).map_err(|e| Error::Config(e.to_string()))?;
        if config.version != VERSION {
            return Err(Error::Config(format!(
                "config version {} does not match engine version {}",
                config.version, VERSION
            )));
        }
        Ok(config)
    }

    pub fn backup_names(&self) -> Vec<String> {
        self.backups.keys().cloned().collect()
    }

    pub fn backup_period(&self, name: &str) -> Option<std::time::Duration> {
        self.backups
            .get(name)
            .map(|b| std::time::Duration::from_secs(b.period.unwrap_or(DEFAULT_PERIOD_SECS)))
    }

    pub fn default_remote_name(&self) -> Option<String> {
        self.default_remote.clone()
    }

    /// Resolves (and caches) the local driver and remote backend for a
    /// named backup.
    pub fn backup_handle(&self, name: &str) -> Result<BackupHandle> {
        let backup = self
            .backups
            .get(name)
            .ok_or_else(|| Error::Config(format!("no such backup: {}", name)))?;

        let local_name = backup
            .local
            .as_deref()
            .or(self.default_local.as_deref())
            .ok_or_else(|| Error::Config(format!("backup {} has no local and no default_local is set", name)))?;
        let remote_name = backup
            .remote
            .as_deref()
            .or(self.default_remote.as_deref())
            .ok_or_else(|| Error::Config(format!("backup {} has no remote and no default_remote is set", name)))?;

        let local = self.local_handle(local_name)?;
        let remote = self.remote_handle(remote_name)?;

        Ok(BackupHandle {
            local,
            remote,
            fsname: backup.fs.name.clone(),
            bid: backup.id.clone().unwrap_or_else(|| DEFAULT_BID.to_string()),
        })
    }

    pub fn local_handle(&self, name: &str) -> Result<Arc<dyn LocalDriver>> {
        if let Some(existing) = self.local_cache.lock().expect("local cache mutex poisoned").get(name) {
            return Ok(existing.clone());
        }
        let cfg = self
            .locals
            .get(name)
            .ok_or_else(|| Error::Config(format!("no such local: {}", name)))?;
        let driver: Arc<dyn LocalDriver> = match cfg.type_.as_str() {
            "zfs" => Arc::new(Zfs::new()),
            other => return Err(Error::Config(format!("unknown local type: {}", other))),
        };
        self.local_cache
            .lock()
            .expect("local cache mutex poisoned")
            .insert(name.to_string(), driver.clone());
        Ok(driver)
    }

    pub fn remote_handle(&self, name: &str) -> Result<Arc<dyn Remote>> {
        if let Some(existing) = self.remote_cache.lock().expect("remote cache mutex poisoned").get(name) {
            return Ok(existing.clone());
        }
        let cfg = self
            .remotes
            .get(name)
            .ok_or_else(|| Error::Config(format!("no such remote: {}", name)))?;
        let built: Arc<dyn Remote> = match cfg {
            RemoteConfig::Fs { root } => Arc::new(remote::fs::new(root)?),
            RemoteConfig::S3 { bucket, prefix, creds, profile, region } => {
                let creds = creds.as_ref().map(|c| remote::s3::Creds {
                    access_key_id: c.access_key_id.clone(),
                    secret_access_key: c.secret_access_key.clone(),
                });
                let params = remote::s3::Params {
                    bucket,
                    prefix,
                    region: region.as_deref(),
                    creds: creds.as_ref(),
                    profile: profile.as_deref(),
                };
                Arc::new(remote::s3::new(params)?)
            }
        };
        self.remote_cache
            .lock()
            .expect("remote cache mutex poisoned")
            .insert(name.to_string(), built.clone());
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
version: "1"
default_local: here
default_remote: vault
locals:
  here:
    type: zfs
remotes:
  vault:
    type: fs
    root: /srv/backups
backups:
  tank:
    fs:
      name: tank/data
    id: nightly
    period: 3600
"#
    }

    #[test]
    fn rejects_mismatched_version() {
        let bad = sample().replacen("\"1\"", "\"999\"", 1);
        let config: ConfigFile = serde_yaml::from_str(&bad).expect("parses despite bad version");
        assert_ne!(config.version, VERSION);
    }

    #[test]
    fn parses_backup_with_explicit_bid_and_period() {
        let config: ConfigFile = serde_yaml::from_str(sample()).unwrap();
        assert_eq!(config.backup_names(), vec!["tank".to_string()]);
        assert_eq!(config.backup_period("tank"), Some(std::time::Duration::from_secs(3600)));
        let backup = &config.backups["tank"];
        assert_eq!(backup.fs.name, "tank/data");
        assert_eq!(backup.id.as_deref(), Some("nightly"));
    }

    #[test]
    fn defaults_bid_and_period_when_absent() {
        let yaml = r#"
version: "1"
default_local: here
default_remote: vault
locals:
  here:
    type: zfs
remotes:
  vault:
    type: fs
    root: /srv/backups
backups:
  tank:
    fs:
      name: tank/data
"#;
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backup_period("tank"), Some(std::time::Duration::from_secs(DEFAULT_PERIOD_SECS)));
        let handle = config.backup_handle("tank").unwrap();
        assert_eq!(handle.bid, DEFAULT_BID);
    }
}
