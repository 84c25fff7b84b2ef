//! Filesystem checkpoint store.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/trial_00003/checkpoints.json          manifest, oldest step first
//! <base>/trial_00003/00000005-<sha256>.ckpt    one blob per checkpoint
//! ```
//!
//! A checkpoint's location is its path relative to the base directory. The
//! file name carries the SHA-256 of the blob, which is verified on every read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use poptune_core::{CheckpointError, CheckpointRef, CheckpointStore, TrialId};

use crate::persistence::{atomic_write, atomic_write_json, load_json};

pub const MANIFEST_FILE: &str = "checkpoints.json";
const BLOB_EXTENSION: &str = "ckpt";

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub checkpoint: CheckpointRef,
    pub hash: String,
    pub size_bytes: u64,
}

/// Checkpoint store backed by a directory tree.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    /// Serializes manifest read-modify-write cycles.
    manifest_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| store_error(&base_dir, e))?;
        Ok(Self {
            base_dir,
            manifest_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn trial_dir(&self, trial: TrialId) -> PathBuf {
        self.base_dir.join(trial.to_string())
    }

    fn manifest_path(&self, trial: TrialId) -> PathBuf {
        self.trial_dir(trial).join(MANIFEST_FILE)
    }

    /// Map a location back to a path, rejecting anything outside the store.
    fn resolve(&self, location: &str) -> Result<PathBuf, CheckpointError> {
        let relative = Path::new(location);
        let inside = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !inside || relative.components().count() != 2 {
            return Err(CheckpointError::NotFound {
                location: location.to_string(),
            });
        }
        Ok(self.base_dir.join(relative))
    }

    /// Manifest entries for a trial, oldest step first.
    pub async fn manifest(&self, trial: TrialId) -> Result<Vec<ManifestEntry>, CheckpointError> {
        let path = self.manifest_path(trial);
        let mut entries: Vec<ManifestEntry> = load_json(&path)
            .await
            .map_err(|e| store_error(&path, e))?
            .unwrap_or_default();
        entries.sort_by_key(|e| e.checkpoint.step());
        Ok(entries)
    }

    async fn write_manifest(
        &self,
        trial: TrialId,
        entries: &[ManifestEntry],
    ) -> Result<(), CheckpointError> {
        let path = self.manifest_path(trial);
        atomic_write_json(&path, &entries)
            .await
            .map_err(|e| store_error(&path, e))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(
        &self,
        trial: TrialId,
        step: u64,
        metric: f64,
        blob: Vec<u8>,
    ) -> Result<CheckpointRef, CheckpointError> {
        let hash = content_hash(&blob);
        let file_name = format!("{step:08}-{hash}.{BLOB_EXTENSION}");
        let location = format!("{trial}/{file_name}");
        let path = self.trial_dir(trial).join(&file_name);

        atomic_write(&path, &blob)
            .await
            .map_err(|e| store_error(&path, e))?;

        let checkpoint = CheckpointRef::new(trial, step, metric, location);
        let _guard = self.manifest_lock.lock().await;
        let mut entries = self.manifest(trial).await?;
        entries.retain(|e| e.checkpoint.location() != checkpoint.location());
        entries.push(ManifestEntry {
            checkpoint: checkpoint.clone(),
            hash,
            size_bytes: blob.len() as u64,
        });
        self.write_manifest(trial, &entries).await?;

        debug!(
            trial = %trial,
            step,
            bytes = blob.len(),
            location = checkpoint.location(),
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    async fn get(&self, checkpoint: &CheckpointRef) -> Result<Vec<u8>, CheckpointError> {
        let location = checkpoint.location();
        let path = self.resolve(location)?;
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    location: location.to_string(),
                });
            }
            Err(e) => return Err(CheckpointError::load(location, e.to_string())),
        };

        let expected = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.split_once('-'))
            .map(|(_, hash)| hash);
        if expected != Some(content_hash(&blob).as_str()) {
            warn!(location, "Checkpoint failed integrity check");
            return Err(CheckpointError::Corrupt {
                location: location.to_string(),
            });
        }
        Ok(blob)
    }

    async fn list(&self, trial: TrialId) -> Result<Vec<CheckpointRef>, CheckpointError> {
        Ok(self
            .manifest(trial)
            .await?
            .into_iter()
            .map(|e| e.checkpoint)
            .collect())
    }

    async fn remove(&self, checkpoint: &CheckpointRef) -> Result<(), CheckpointError> {
        let path = self.resolve(checkpoint.location())?;
        let trial = checkpoint.trial();

        let _guard = self.manifest_lock.lock().await;
        let mut entries = self.manifest(trial).await?;
        let before = entries.len();
        entries.retain(|e| e.checkpoint.location() != checkpoint.location());
        let listed = entries.len() != before;
        if listed {
            self.write_manifest(trial, &entries).await?;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if listed {
                    Ok(())
                } else {
                    Err(CheckpointError::NotFound {
                        location: checkpoint.location().to_string(),
                    })
                }
            }
            Err(e) => Err(store_error(&path, e)),
        }
    }
}

fn content_hash(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}

fn store_error(path: &Path, e: io::Error) -> CheckpointError {
    CheckpointError::store(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileCheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = store().await;
        let trial = TrialId::new(3);
        let checkpoint = store.put(trial, 5, 0.9, b"weights".to_vec()).await.unwrap();

        assert!(checkpoint.location().starts_with("trial_00003/00000005-"));
        assert_eq!(store.get(&checkpoint).await.unwrap(), b"weights".to_vec());
        assert!(store.base_dir().join("trial_00003").join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_step() {
        let (_dir, store) = store().await;
        let trial = TrialId::new(0);
        for step in [10u64, 5, 15] {
            store.put(trial, step, 0.1, vec![step as u8]).await.unwrap();
        }
        let steps: Vec<u64> = store.list(trial).await.unwrap().iter().map(|c| c.step()).collect();
        assert_eq!(steps, vec![5, 10, 15]);
        assert!(store.list(TrialId::new(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_records_hash_and_size() {
        let (_dir, store) = store().await;
        let trial = TrialId::new(0);
        store.put(trial, 1, 0.5, vec![0u8; 32]).await.unwrap();
        let manifest = store.manifest(trial).await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].size_bytes, 32);
        assert_eq!(manifest[0].hash, content_hash(&[0u8; 32]));
    }

    #[tokio::test]
    async fn test_tampered_blob_is_corrupt() {
        let (_dir, store) = store().await;
        let checkpoint = store.put(TrialId::new(0), 1, 0.5, b"good".to_vec()).await.unwrap();
        let path = store.base_dir().join(checkpoint.location());
        std::fs::write(&path, b"evil").unwrap();

        let err = store.get(&checkpoint).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_remove_and_prune() {
        let (_dir, store) = store().await;
        let trial = TrialId::new(2);
        let mut refs = Vec::new();
        for step in 1..=5u64 {
            refs.push(store.put(trial, step, 0.0, vec![step as u8]).await.unwrap());
        }

        store.remove(&refs[0]).await.unwrap();
        assert!(matches!(
            store.get(&refs[0]).await,
            Err(CheckpointError::NotFound { .. })
        ));
        assert!(matches!(
            store.remove(&refs[0]).await,
            Err(CheckpointError::NotFound { .. })
        ));

        let removed = store.prune(trial, 2).await.unwrap();
        assert_eq!(removed.iter().map(|c| c.step()).collect::<Vec<_>>(), vec![2, 3]);
        let kept: Vec<u64> = store.list(trial).await.unwrap().iter().map(|c| c.step()).collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_locations_outside_store_are_rejected() {
        let (_dir, store) = store().await;
        let escape = CheckpointRef::new(TrialId::new(0), 1, 0.0, "../../etc/passwd");
        assert!(matches!(
            store.get(&escape).await,
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reopen_sees_existing_checkpoints() {
        let dir = TempDir::new().unwrap();
        let trial = TrialId::new(1);
        let checkpoint = {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.put(trial, 7, 0.5, b"state".to_vec()).await.unwrap()
        };
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list(trial).await.unwrap(), vec![checkpoint.clone()]);
        assert_eq!(store.get(&checkpoint).await.unwrap(), b"state".to_vec());
    }
}
