//! Crash-safe replica expansion.
//!
//! Every replica directory gets a `volume-snap-expand-<size>.img.meta.tmp`
//! marker before any image is touched. Markers are removed only after the
//! capacity charge commits, so a marker found later means the expansion never
//! finished and the replica has to be rolled back to the recorded size.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{ManagerError, Result};
use crate::model::Replica;
use crate::runtime::InstanceRuntime;
use crate::scheduler::ReplicaScheduler;

const MARKER_PREFIX: &str = "volume-snap-expand-";
const MARKER_SUFFIX: &str = ".img.meta.tmp";

pub fn marker_name(size: u64) -> String {
    format!("{MARKER_PREFIX}{size}{MARKER_SUFFIX}")
}

/// Creates the marker; fails if one for the same size already exists.
pub async fn write_marker(data_path: &Path, size: u64) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(data_path).await?;
    let path = data_path.join(marker_name(size));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    file.write_all(size.to_string().as_bytes()).await?;
    file.sync_all().await?;
    Ok(path)
}

/// Markers present in a replica directory.
pub async fn find_markers(data_path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(data_path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut markers = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(MARKER_PREFIX) && name.ends_with(MARKER_SUFFIX) {
            markers.push(entry.path());
        }
    }
    markers.sort();
    Ok(markers)
}

/// Removes every marker, whether file or directory.
pub async fn clear_markers(data_path: &Path) -> io::Result<usize> {
    let markers = find_markers(data_path).await?;
    for marker in &markers {
        let meta = tokio::fs::symlink_metadata(marker).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(marker).await?;
        } else {
            tokio::fs::remove_file(marker).await?;
        }
    }
    Ok(markers.len())
}

/// Grows every replica image from `old_size` to `new_size`.
///
/// On any failure the expanded replicas are shrunk back, all markers are
/// cleared so the next attempt starts clean, and no capacity stays charged.
pub async fn expand_replicas(
    runtime: &dyn InstanceRuntime,
    scheduler: &ReplicaScheduler,
    replicas: &[Replica],
    old_size: u64,
    new_size: u64,
) -> Result<()> {
    let delta = new_size.saturating_sub(old_size);
    scheduler.can_charge(replicas, delta).await?;

    let mut expanded: Vec<&Replica> = Vec::new();
    let outcome = async {
        for replica in replicas {
            write_marker(Path::new(&replica.data_path), new_size).await?;
        }
        for replica in replicas {
            runtime
                .expand_replica(&replica.name.to_string(), new_size)
                .await?;
            expanded.push(replica);
        }
        scheduler.charge_expansion(replicas, delta).await?;
        Ok::<(), ManagerError>(())
    }
    .await;

    if let Err(error) = outcome {
        warn!(error = %error, new_size, "Expansion failed, rolling back");
        for replica in expanded {
            if let Err(e) = runtime
                .expand_replica(&replica.name.to_string(), old_size)
                .await
            {
                warn!(replica = %replica.name, error = %e, "Failed to shrink replica back");
            }
        }
        for replica in replicas {
            if let Err(e) = clear_markers(Path::new(&replica.data_path)).await {
                warn!(replica = %replica.name, error = %e, "Failed to clear expansion marker");
            }
        }
        return Err(error);
    }

    clear_committed(replicas).await;
    Ok(())
}

/// Drops markers once the charge has committed. The new size stands even if
/// a marker survives; a later recovery pass resizes to the committed size,
/// which is a no-op for that replica.
async fn clear_committed(replicas: &[Replica]) {
    for replica in replicas {
        if let Err(e) = clear_markers(Path::new(&replica.data_path)).await {
            warn!(
                replica = %replica.name,
                error = %e,
                "Expansion committed but marker cleanup failed"
            );
        }
    }
}

/// Rolls back expansions interrupted before commit. Returns the number of
/// replicas that needed it.
pub async fn recover_interrupted(
    runtime: &dyn InstanceRuntime,
    replicas: &[Replica],
    committed_size: u64,
) -> Result<usize> {
    let mut recovered = 0;
    for replica in replicas {
        let path = Path::new(&replica.data_path);
        if find_markers(path).await?.is_empty() {
            continue;
        }
        runtime
            .expand_replica(&replica.name.to_string(), committed_size)
            .await?;
        clear_markers(path).await?;
        recovered += 1;
        info!(
            replica = %replica.name,
            size = committed_size,
            "Rolled back interrupted expansion"
        );
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_replica;

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("replicas").join("vol-a-r");

        let path = write_marker(&data, 32 << 20).await.unwrap();
        assert!(path.ends_with("volume-snap-expand-33554432.img.meta.tmp"));
        assert!(write_marker(&data, 32 << 20).await.is_err());

        tokio::fs::write(data.join("volume-head-000.img"), b"x").await.unwrap();
        assert_eq!(find_markers(&data).await.unwrap(), vec![path]);

        assert_eq!(clear_markers(&data).await.unwrap(), 1);
        assert!(find_markers(&data).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_directory_markers() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(marker_name(4096)))
            .await
            .unwrap();
        assert_eq!(clear_markers(dir.path()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_after_commit_skips_unreadable_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("vol-a-r1");
        tokio::fs::write(&broken, b"not a directory").await.unwrap();
        let healthy = dir.path().join("vol-a-r2");
        write_marker(&healthy, 64 << 20).await.unwrap();

        let replica = |path: &Path| Replica {
            data_path: path.to_string_lossy().into_owned(),
            ..test_replica("node-1")
        };
        let replicas = vec![replica(&broken), replica(&healthy)];

        assert!(clear_markers(&broken).await.is_err());
        clear_committed(&replicas).await;
        assert!(find_markers(&healthy).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_markers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_markers(&dir.path().join("absent")).await.unwrap().is_empty());
    }
}
