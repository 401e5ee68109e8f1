//! Backup store seam and the in-memory backend.
//!
//! Backups are addressed by URL: `<target>?backup=<backup>&volume=<volume>`.
//! The manager only ever reaches the store through [`BackupStore`], so S3 and
//! NFS backends plug in at the same seam as [`MemoryBackupStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::image::SparseImage;

#[derive(Debug, Error)]
pub enum BackupStoreError {
    #[error("invalid backup target '{0}'")]
    InvalidTarget(String),

    #[error("invalid backup URL '{0}'")]
    InvalidUrl(String),

    #[error("backup volume '{0}' not found")]
    VolumeNotFound(String),

    #[error("backup '{backup}' of volume '{volume}' not found")]
    BackupNotFound { volume: String, backup: String },

    #[error("backup '{0}' already exists")]
    AlreadyExists(String),
}

impl BackupStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackupStoreError::VolumeNotFound(_) | BackupStoreError::BackupNotFound { .. }
        )
    }
}

type Result<T> = std::result::Result<T, BackupStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupScheme {
    S3,
    Nfs,
    Memory,
}

/// A validated backup target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    scheme: BackupScheme,
    url: String,
}

impl BackupTarget {
    /// Accepts `s3://bucket@region/path`, `nfs://host:/path` and `mem://name`.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || BackupStoreError::InvalidTarget(url.to_string());
        let url = url.trim_end_matches('/');

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "s3" => {
                let (bucket, region) = rest.split_once('@').ok_or_else(invalid)?;
                if bucket.is_empty() || region.is_empty() {
                    return Err(invalid());
                }
                BackupScheme::S3
            }
            "nfs" => {
                let (host, path) = rest.split_once(":/").ok_or_else(invalid)?;
                if host.is_empty() || path.is_empty() {
                    return Err(invalid());
                }
                BackupScheme::Nfs
            }
            "mem" if !rest.is_empty() && !rest.contains('/') => BackupScheme::Memory,
            _ => return Err(invalid()),
        };

        Ok(Self {
            scheme,
            url: url.to_string(),
        })
    }

    pub fn scheme(&self) -> BackupScheme {
        self.scheme
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn backup_url(&self, volume: &str, backup: &str) -> String {
        format!("{}?backup={backup}&volume={volume}", self.url)
    }
}

impl std::fmt::Display for BackupTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Parts of a backup URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupUrl {
    pub target: BackupTarget,
    pub volume: String,
    pub backup: String,
}

pub fn parse_backup_url(url: &str) -> Result<BackupUrl> {
    let invalid = || BackupStoreError::InvalidUrl(url.to_string());
    let (target, query) = url.split_once('?').ok_or_else(invalid)?;

    let mut volume = None;
    let mut backup = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("volume", v)) if !v.is_empty() => volume = Some(v.to_string()),
            Some(("backup", b)) if !b.is_empty() => backup = Some(b.to_string()),
            _ => {}
        }
    }

    Ok(BackupUrl {
        target: BackupTarget::parse(target).map_err(|_| invalid())?,
        volume: volume.ok_or_else(invalid)?,
        backup: backup.ok_or_else(invalid)?,
    })
}

/// Immutable record of one uploaded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub name: String,
    pub url: String,
    pub snapshot_name: String,
    pub snapshot_created: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub volume_name: String,
    pub volume_size: u64,
    pub volume_created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    /// Allocated bytes uploaded.
    pub size: u64,
}

/// Input for [`BackupStore::create_backup`]; the store fills in url,
/// created time and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackup {
    pub name: String,
    pub snapshot_name: String,
    pub snapshot_created: DateTime<Utc>,
    pub volume_name: String,
    pub volume_size: u64,
    pub volume_created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

/// All backups of one volume name in a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupVolume {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub last_backup_name: String,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub data_stored: u64,
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn create_backup(
        &self,
        target: &BackupTarget,
        backup: NewBackup,
        image: SparseImage,
    ) -> Result<Backup>;

    async fn list_backup_volumes(&self, target: &BackupTarget) -> Result<Vec<BackupVolume>>;

    async fn get_backup_volume(&self, target: &BackupTarget, volume: &str) -> Result<BackupVolume>;

    async fn list_backups(&self, target: &BackupTarget, volume: &str) -> Result<Vec<Backup>>;

    async fn get_backup(&self, target: &BackupTarget, volume: &str, name: &str) -> Result<Backup>;

    /// Backup record and data for a backup URL.
    async fn read_backup_image(&self, url: &str) -> Result<(Backup, SparseImage)>;

    async fn delete_backup(&self, target: &BackupTarget, volume: &str, name: &str) -> Result<()>;

    async fn delete_backup_volume(&self, target: &BackupTarget, volume: &str) -> Result<()>;
}

#[derive(Debug)]
struct StoredVolume {
    volume: BackupVolume,
    backups: BTreeMap<String, (Backup, SparseImage)>,
}

impl StoredVolume {
    fn refresh(&mut self) {
        let latest = self
            .backups
            .values()
            .map(|(b, _)| b)
            .max_by(|a, b| a.created.cmp(&b.created).then(a.name.cmp(&b.name)));
        self.volume.last_backup_name = latest.map(|b| b.name.clone()).unwrap_or_default();
        self.volume.last_backup_at = latest.map(|b| b.created);
        if let Some(latest) = latest {
            self.volume.size = latest.volume_size;
        }
        self.volume.data_stored = self.backups.values().map(|(b, _)| b.size).sum();
    }
}

/// In-process backup store keyed by target URL.
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    targets: RwLock<BTreeMap<String, BTreeMap<String, StoredVolume>>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn create_backup(
        &self,
        target: &BackupTarget,
        backup: NewBackup,
        image: SparseImage,
    ) -> Result<Backup> {
        let mut targets = self.targets.write().await;
        let volumes = targets.entry(target.as_str().to_string()).or_default();
        let stored = volumes
            .entry(backup.volume_name.clone())
            .or_insert_with(|| StoredVolume {
                volume: BackupVolume {
                    name: backup.volume_name.clone(),
                    size: backup.volume_size,
                    created: Utc::now(),
                    last_backup_name: String::new(),
                    last_backup_at: None,
                    data_stored: 0,
                },
                backups: BTreeMap::new(),
            });
        if stored.backups.contains_key(&backup.name) {
            return Err(BackupStoreError::AlreadyExists(backup.name));
        }

        let record = Backup {
            url: target.backup_url(&backup.volume_name, &backup.name),
            name: backup.name,
            snapshot_name: backup.snapshot_name,
            snapshot_created: backup.snapshot_created,
            created: Utc::now(),
            volume_name: backup.volume_name,
            volume_size: backup.volume_size,
            volume_created: backup.volume_created,
            labels: backup.labels,
            size: image.allocated(),
        };
        stored
            .backups
            .insert(record.name.clone(), (record.clone(), image));
        stored.refresh();

        info!(
            backup = %record.name,
            volume = %record.volume_name,
            target = %target,
            "Backup stored"
        );
        Ok(record)
    }

    async fn list_backup_volumes(&self, target: &BackupTarget) -> Result<Vec<BackupVolume>> {
        let targets = self.targets.read().await;
        Ok(targets
            .get(target.as_str())
            .map(|volumes| volumes.values().map(|s| s.volume.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_backup_volume(&self, target: &BackupTarget, volume: &str) -> Result<BackupVolume> {
        let targets = self.targets.read().await;
        targets
            .get(target.as_str())
            .and_then(|volumes| volumes.get(volume))
            .map(|s| s.volume.clone())
            .ok_or_else(|| BackupStoreError::VolumeNotFound(volume.to_string()))
    }

    async fn list_backups(&self, target: &BackupTarget, volume: &str) -> Result<Vec<Backup>> {
        let targets = self.targets.read().await;
        let stored = targets
            .get(target.as_str())
            .and_then(|volumes| volumes.get(volume))
            .ok_or_else(|| BackupStoreError::VolumeNotFound(volume.to_string()))?;
        let mut backups: Vec<Backup> = stored.backups.values().map(|(b, _)| b.clone()).collect();
        backups.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(backups)
    }

    async fn get_backup(&self, target: &BackupTarget, volume: &str, name: &str) -> Result<Backup> {
        let targets = self.targets.read().await;
        targets
            .get(target.as_str())
            .and_then(|volumes| volumes.get(volume))
            .and_then(|stored| stored.backups.get(name))
            .map(|(b, _)| b.clone())
            .ok_or_else(|| BackupStoreError::BackupNotFound {
                volume: volume.to_string(),
                backup: name.to_string(),
            })
    }

    async fn read_backup_image(&self, url: &str) -> Result<(Backup, SparseImage)> {
        let parsed = parse_backup_url(url)?;
        let targets = self.targets.read().await;
        targets
            .get(parsed.target.as_str())
            .and_then(|volumes| volumes.get(&parsed.volume))
            .and_then(|stored| stored.backups.get(&parsed.backup))
            .cloned()
            .ok_or(BackupStoreError::BackupNotFound {
                volume: parsed.volume,
                backup: parsed.backup,
            })
    }

    async fn delete_backup(&self, target: &BackupTarget, volume: &str, name: &str) -> Result<()> {
        let mut targets = self.targets.write().await;
        let stored = targets
            .get_mut(target.as_str())
            .and_then(|volumes| volumes.get_mut(volume))
            .ok_or_else(|| BackupStoreError::VolumeNotFound(volume.to_string()))?;
        if stored.backups.remove(name).is_none() {
            return Err(BackupStoreError::BackupNotFound {
                volume: volume.to_string(),
                backup: name.to_string(),
            });
        }
        stored.refresh();
        debug!(backup = %name, volume = %volume, "Backup deleted");
        Ok(())
    }

    async fn delete_backup_volume(&self, target: &BackupTarget, volume: &str) -> Result<()> {
        let mut targets = self.targets.write().await;
        targets
            .get_mut(target.as_str())
            .and_then(|volumes| volumes.remove(volume))
            .map(|_| ())
            .ok_or_else(|| BackupStoreError::VolumeNotFound(volume.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> BackupTarget {
        BackupTarget::parse("mem://store").unwrap()
    }

    fn new_backup(name: &str) -> NewBackup {
        NewBackup {
            name: name.to_string(),
            snapshot_name: format!("snap-of-{name}"),
            snapshot_created: Utc::now(),
            volume_name: "vol-a".to_string(),
            volume_size: 16 << 20,
            volume_created: Utc::now(),
            labels: BTreeMap::from([("app".to_string(), "db".to_string())]),
        }
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            BackupTarget::parse("s3://backups@us-east-1/").unwrap().scheme(),
            BackupScheme::S3
        );
        assert_eq!(
            BackupTarget::parse("nfs://10.0.0.9:/exports/backups").unwrap().scheme(),
            BackupScheme::Nfs
        );
        assert!(BackupTarget::parse("s3://backups").is_err());
        assert!(BackupTarget::parse("nfs://host/exports").is_err());
        assert!(BackupTarget::parse("ftp://host").is_err());
        assert!(BackupTarget::parse("mem://").is_err());
    }

    #[test]
    fn test_backup_url_roundtrip() {
        let url = target().backup_url("vol-a", "backup-1");
        assert_eq!(url, "mem://store?backup=backup-1&volume=vol-a");
        let parsed = parse_backup_url(&url).unwrap();
        assert_eq!(parsed.volume, "vol-a");
        assert_eq!(parsed.backup, "backup-1");
        assert_eq!(parsed.target, target());

        assert!(parse_backup_url("mem://store?volume=vol-a").is_err());
        assert!(parse_backup_url("mem://store").is_err());
    }

    #[tokio::test]
    async fn test_create_and_read_backup() {
        let store = MemoryBackupStore::new();
        let mut image = SparseImage::new(16 << 20);
        image.write_at(8192, b"payload");

        let backup = store
            .create_backup(&target(), new_backup("backup-1"), image)
            .await
            .unwrap();
        assert_eq!(backup.snapshot_name, "snap-of-backup-1");
        assert_eq!(backup.size, 4096);

        let (read, data) = store.read_backup_image(&backup.url).await.unwrap();
        assert_eq!(read, backup);
        assert_eq!(data.read_at(8192, 7).unwrap(), b"payload".to_vec());

        let volume = store.get_backup_volume(&target(), "vol-a").await.unwrap();
        assert_eq!(volume.last_backup_name, "backup-1");
        assert!(volume.last_backup_at.is_some());

        assert!(store
            .create_backup(&target(), new_backup("backup-1"), SparseImage::new(4096))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_backup_updates_last_backup() {
        let store = MemoryBackupStore::new();
        store
            .create_backup(&target(), new_backup("backup-1"), SparseImage::new(4096))
            .await
            .unwrap();
        store
            .create_backup(&target(), new_backup("backup-2"), SparseImage::new(4096))
            .await
            .unwrap();

        store.delete_backup(&target(), "vol-a", "backup-2").await.unwrap();
        let volume = store.get_backup_volume(&target(), "vol-a").await.unwrap();
        assert_eq!(volume.last_backup_name, "backup-1");

        store.delete_backup(&target(), "vol-a", "backup-1").await.unwrap();
        let volume = store.get_backup_volume(&target(), "vol-a").await.unwrap();
        assert!(volume.last_backup_name.is_empty());

        store.delete_backup_volume(&target(), "vol-a").await.unwrap();
        let err = store.get_backup_volume(&target(), "vol-a").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
