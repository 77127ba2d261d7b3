//! BackupStore — filesystem-backed container configuration snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use fleetup_core::config::RETENTION_RANGE;
use fleetup_core::{BackupRecord, ContainerInfo, ContainerSpec, LABEL_RESTORED_FROM, LABEL_VERSION};
use fleetup_runtime::ContainerRuntime;

use crate::error::{BackupError, BackupResult};

const CONFIG_FILE: &str = "config.json";
const ENV_FILE: &str = "env.json";
const METADATA_FILE: &str = "metadata.json";
const DIR_PREFIX: &str = "backup-";

/// Build an `Io` error for `path`.
fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |e| BackupError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Owns the backup directory tree.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Open (or create) a backup store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> BackupResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        debug!(dir = %dir.display(), "backup store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the configuration of `container_id` before an update.
    ///
    /// `version` and `artifact_tag` describe what the container runs now
    /// and are what a restore brings back.
    pub async fn create_backup(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        version: &str,
        artifact_tag: &str,
    ) -> BackupResult<BackupRecord> {
        let spec = runtime.inspect(container_id).await?;

        let (timestamp, path) = self.allocate_slot()?;
        write_json(&path.join(CONFIG_FILE), &spec)?;
        write_json(&path.join(ENV_FILE), &spec.env)?;

        let record = BackupRecord {
            timestamp,
            source_version: version.to_string(),
            source_artifact_tag: artifact_tag.to_string(),
            container_id: container_id.to_string(),
            storage_path: path.display().to_string(),
        };
        // Metadata last: its presence marks the backup complete.
        write_json(&path.join(METADATA_FILE), &record)?;

        info!(
            timestamp,
            %version,
            container = %container_id,
            path = %path.display(),
            "backup created"
        );
        Ok(record)
    }

    /// Recreate the backed-up container.
    ///
    /// Pulls the backup's image if it is gone, stops and removes whatever
    /// managed container is running, and starts a new container from the
    /// saved configuration labelled as a restoration.
    pub async fn restore_backup(
        &self,
        runtime: &dyn ContainerRuntime,
        record: &BackupRecord,
        stop_timeout: Duration,
    ) -> BackupResult<ContainerInfo> {
        let spec = self.load_spec(record)?;
        let image = &record.source_artifact_tag;

        if !runtime.image_exists(image).await? {
            info!(%image, "backup image missing locally, pulling");
            runtime.pull(image).await?;
        }

        if let Some(current) = runtime.find_managed().await? {
            debug!(id = %current.id, "stopping current container for restore");
            if let Err(e) = runtime.stop(&current.id, stop_timeout).await {
                warn!(id = %current.id, error = %e, "stop failed, forcing removal");
            }
            runtime.remove(&current.id, true).await?;
        }

        let labels = BTreeMap::from([
            (LABEL_VERSION.to_string(), record.source_version.clone()),
            (LABEL_RESTORED_FROM.to_string(), record.timestamp.to_string()),
        ]);
        let restored = runtime.start_from(image, &spec, &labels).await?;

        // The original container may still exist in a stopped state.
        if let Err(e) = runtime.remove(&record.container_id, true).await {
            warn!(id = %record.container_id, error = %e, "failed to remove original container");
        }

        info!(
            id = %restored.id,
            version = %record.source_version,
            backup = record.timestamp,
            "backup restored"
        );
        Ok(restored)
    }

    /// All complete backups, newest first.
    pub fn list_backups(&self) -> BackupResult<Vec<BackupRecord>> {
        let entries = fs::read_dir(&self.dir).map_err(io_err(&self.dir))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            let is_backup = path.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(DIR_PREFIX));
            if !is_backup {
                continue;
            }
            let metadata = path.join(METADATA_FILE);
            if !metadata.exists() {
                debug!(path = %path.display(), "skipping incomplete backup");
                continue;
            }
            match read_json::<BackupRecord>(&metadata) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    pub fn latest(&self) -> BackupResult<Option<BackupRecord>> {
        Ok(self.list_backups()?.into_iter().next())
    }

    /// Delete every backup beyond the newest `retention`.
    ///
    /// Deletion is best-effort per backup. Returns the number removed.
    pub fn cleanup_old(&self, retention: usize) -> BackupResult<usize> {
        if !RETENTION_RANGE.contains(&retention) {
            return Err(BackupError::InvalidRetention(retention));
        }

        let mut removed = 0;
        for record in self.list_backups()?.into_iter().skip(retention) {
            let path = PathBuf::from(&record.storage_path);
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(timestamp = record.timestamp, "old backup removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(timestamp = record.timestamp, path = %path.display(), error = %e, "failed to remove old backup");
                }
            }
        }
        if removed > 0 {
            info!(removed, retention, "backup retention applied");
        }
        Ok(removed)
    }

    /// Delete one backup, typically after a rollback consumed it.
    pub fn remove_backup(&self, record: &BackupRecord) -> BackupResult<()> {
        let path = PathBuf::from(&record.storage_path);
        fs::remove_dir_all(&path).map_err(io_err(&path))?;
        debug!(timestamp = record.timestamp, "backup removed");
        Ok(())
    }

    /// Saved container configuration of a backup.
    pub fn load_spec(&self, record: &BackupRecord) -> BackupResult<ContainerSpec> {
        read_json(&Path::new(&record.storage_path).join(CONFIG_FILE))
    }

    /// Saved environment of a backup, without parsing the full configuration.
    pub fn load_env(&self, record: &BackupRecord) -> BackupResult<Vec<String>> {
        read_json(&Path::new(&record.storage_path).join(ENV_FILE))
    }

    /// Reserve a unique, timestamp-keyed directory.
    fn allocate_slot(&self) -> BackupResult<(u64, PathBuf)> {
        let mut timestamp = epoch_millis();
        loop {
            let path = self.dir.join(format!("{DIR_PREFIX}{timestamp}"));
            match fs::create_dir(&path) {
                Ok(()) => return Ok((timestamp, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => timestamp += 1,
                Err(e) => return Err(io_err(&path)(e)),
            }
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> BackupResult<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| BackupError::Serialize(e.to_string()))?;
    fs::write(path, bytes).map_err(io_err(path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> BackupResult<T> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|e| BackupError::Deserialize {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
