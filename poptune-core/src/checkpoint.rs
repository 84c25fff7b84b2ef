//! Checkpoint references, the store interface, and per-trial retention.
//!
//! The scheduler never touches storage directly: blobs go through a
//! [`CheckpointStore`] and every reference it hands out is tracked by a
//! [`CheckpointLedger`], which enforces the retention count and makes sure a
//! checkpoint that is being loaded is never pruned underneath the reader.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::config::{Mode, Retention, TuneConfig};
use crate::error::CheckpointError;
use crate::trial::TrialId;

/// Immutable handle to a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    trial: TrialId,
    step: u64,
    metric: f64,
    location: String,
    created_at: DateTime<Utc>,
}

impl CheckpointRef {
    pub fn new(trial: TrialId, step: u64, metric: f64, location: impl Into<String>) -> Self {
        Self {
            trial,
            step,
            metric,
            location: location.into(),
            created_at: Utc::now(),
        }
    }

    pub fn trial(&self) -> TrialId {
        self.trial
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Metric reported at the step the checkpoint was taken.
    pub fn metric(&self) -> f64 {
        self.metric
    }

    /// Opaque, store-specific location.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Persistence backend for checkpoint blobs.
///
/// Stores are append-only per trial; `remove` and `prune` are the only deletion paths.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a blob and return a reference to it.
    async fn put(
        &self,
        trial: TrialId,
        step: u64,
        metric: f64,
        blob: Vec<u8>,
    ) -> Result<CheckpointRef, CheckpointError>;

    async fn get(&self, checkpoint: &CheckpointRef) -> Result<Vec<u8>, CheckpointError>;

    /// All stored references for a trial, oldest step first.
    async fn list(&self, trial: TrialId) -> Result<Vec<CheckpointRef>, CheckpointError>;

    async fn remove(&self, checkpoint: &CheckpointRef) -> Result<(), CheckpointError>;

    /// Remove all but the `keep_n` newest checkpoints of a trial.
    async fn prune(
        &self,
        trial: TrialId,
        keep_n: usize,
    ) -> Result<Vec<CheckpointRef>, CheckpointError> {
        let refs = self.list(trial).await?;
        let excess = refs.len().saturating_sub(keep_n);
        let mut removed = Vec::with_capacity(excess);
        for checkpoint in refs.into_iter().take(excess) {
            self.remove(&checkpoint).await?;
            removed.push(checkpoint);
        }
        Ok(removed)
    }
}

struct StoredCheckpoint {
    checkpoint: CheckpointRef,
    blob: Vec<u8>,
}

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<BTreeMap<String, StoredCheckpoint>>,
    next_id: AtomicU64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, checkpoint: &CheckpointRef) -> bool {
        read(&self.entries).contains_key(checkpoint.location())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        trial: TrialId,
        step: u64,
        metric: f64,
        blob: Vec<u8>,
    ) -> Result<CheckpointRef, CheckpointError> {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let checkpoint = CheckpointRef::new(trial, step, metric, format!("mem://{trial}/{seq:08}"));
        write(&self.entries).insert(
            checkpoint.location().to_string(),
            StoredCheckpoint {
                checkpoint: checkpoint.clone(),
                blob,
            },
        );
        Ok(checkpoint)
    }

    async fn get(&self, checkpoint: &CheckpointRef) -> Result<Vec<u8>, CheckpointError> {
        read(&self.entries)
            .get(checkpoint.location())
            .map(|stored| stored.blob.clone())
            .ok_or_else(|| CheckpointError::NotFound {
                location: checkpoint.location().to_string(),
            })
    }

    async fn list(&self, trial: TrialId) -> Result<Vec<CheckpointRef>, CheckpointError> {
        let mut refs: Vec<CheckpointRef> = read(&self.entries)
            .values()
            .filter(|stored| stored.checkpoint.trial() == trial)
            .map(|stored| stored.checkpoint.clone())
            .collect();
        refs.sort_by_key(|c| (c.step(), c.created_at()));
        Ok(refs)
    }

    async fn remove(&self, checkpoint: &CheckpointRef) -> Result<(), CheckpointError> {
        write(&self.entries)
            .remove(checkpoint.location())
            .map(|_| ())
            .ok_or_else(|| CheckpointError::NotFound {
                location: checkpoint.location().to_string(),
            })
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct LedgerState {
    /// Retained checkpoints of each trial's current lineage, oldest first.
    lineages: HashMap<TrialId, Vec<CheckpointRef>>,
    /// Dropped from a lineage but not yet deleted (leased, or deletion failed).
    orphans: Vec<CheckpointRef>,
    leases: HashMap<String, usize>,
    /// Locations with a delete in progress; these can no longer be leased.
    deleting: HashSet<String>,
}

impl LedgerState {
    fn is_leased(&self, location: &str) -> bool {
        self.leases.get(location).is_some_and(|n| *n > 0)
    }
}

fn lock(state: &Mutex<LedgerState>) -> MutexGuard<'_, LedgerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard that keeps a checkpoint alive while it is being read.
#[must_use = "the checkpoint may be pruned as soon as the lease is dropped"]
pub struct CheckpointLease {
    checkpoint: CheckpointRef,
    state: Arc<Mutex<LedgerState>>,
}

impl CheckpointLease {
    pub fn checkpoint(&self) -> &CheckpointRef {
        &self.checkpoint
    }
}

impl Drop for CheckpointLease {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let location = self.checkpoint.location();
        if let Some(count) = state.leases.get_mut(location) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.leases.remove(location);
            }
        }
    }
}

/// Tracks every trial's checkpoint lineage on top of a [`CheckpointStore`].
pub struct CheckpointLedger {
    store: Arc<dyn CheckpointStore>,
    keep: usize,
    retention: Retention,
    mode: Mode,
    state: Arc<Mutex<LedgerState>>,
}

impl CheckpointLedger {
    pub fn new(store: Arc<dyn CheckpointStore>, keep: usize, retention: Retention, mode: Mode) -> Self {
        Self {
            store,
            keep: keep.max(1),
            retention,
            mode,
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    pub fn from_config(store: Arc<dyn CheckpointStore>, config: &TuneConfig) -> Self {
        Self::new(
            store,
            config.keep_checkpoints_num,
            config.checkpoint_retention,
            config.mode,
        )
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist a checkpoint at the end of a trial's lineage.
    ///
    /// Steps within a lineage are strictly increasing.
    pub async fn save(
        &self,
        trial: TrialId,
        step: u64,
        metric: f64,
        blob: Vec<u8>,
    ) -> Result<CheckpointRef, CheckpointError> {
        self.check_monotonic(trial, step)?;
        let checkpoint = self.store.put(trial, step, metric, blob).await?;

        let mut state = lock(&self.state);
        let last = state
            .lineages
            .get(&trial)
            .and_then(|l| l.last())
            .map(CheckpointRef::step);
        if let Some(last) = last.filter(|last| *last >= step) {
            state.orphans.push(checkpoint);
            return Err(CheckpointError::NonMonotonicStep { trial, step, last });
        }
        state
            .lineages
            .entry(trial)
            .or_default()
            .push(checkpoint.clone());
        debug!(trial = %trial, step, metric, location = checkpoint.location(), "Checkpoint saved");
        Ok(checkpoint)
    }

    fn check_monotonic(&self, trial: TrialId, step: u64) -> Result<(), CheckpointError> {
        let state = lock(&self.state);
        match state.lineages.get(&trial).and_then(|l| l.last()) {
            Some(last) if last.step() >= step => Err(CheckpointError::NonMonotonicStep {
                trial,
                step,
                last: last.step(),
            }),
            _ => Ok(()),
        }
    }

    /// Prune a trial's lineage down to the retention count.
    ///
    /// Leased checkpoints are kept until a later [`collect_garbage`](Self::collect_garbage).
    pub async fn enforce_retention(&self, trial: TrialId) -> Vec<CheckpointRef> {
        let doomed = {
            let mut state = lock(&self.state);
            let Some(lineage) = state.lineages.get(&trial) else {
                return Vec::new();
            };
            let (kept, victims) = select_retained(lineage, self.keep, self.retention, self.mode);
            state.lineages.insert(trial, kept);
            self.claim_for_deletion(&mut state, victims)
        };
        self.delete(doomed).await
    }

    /// Drop a trial's lineage; it restarts empty from the next save.
    pub fn reset_lineage(&self, trial: TrialId) {
        let mut state = lock(&self.state);
        if let Some(lineage) = state.lineages.remove(&trial) {
            state.orphans.extend(lineage);
        }
    }

    /// Delete orphaned checkpoints that are no longer leased.
    pub async fn collect_garbage(&self) -> usize {
        let doomed = {
            let mut state = lock(&self.state);
            let orphans = std::mem::take(&mut state.orphans);
            self.claim_for_deletion(&mut state, orphans)
        };
        self.delete(doomed).await.len()
    }

    /// Split victims into deletable now and deferred (leased) ones.
    fn claim_for_deletion(
        &self,
        state: &mut LedgerState,
        victims: Vec<CheckpointRef>,
    ) -> Vec<CheckpointRef> {
        let mut doomed = Vec::new();
        for checkpoint in victims {
            if state.is_leased(checkpoint.location()) {
                debug!(location = checkpoint.location(), "Deferring prune of leased checkpoint");
                state.orphans.push(checkpoint);
            } else {
                state.deleting.insert(checkpoint.location().to_string());
                doomed.push(checkpoint);
            }
        }
        doomed
    }

    async fn delete(&self, doomed: Vec<CheckpointRef>) -> Vec<CheckpointRef> {
        let mut removed = Vec::with_capacity(doomed.len());
        for checkpoint in doomed {
            let result = self.store.remove(&checkpoint).await;
            let mut state = lock(&self.state);
            state.deleting.remove(checkpoint.location());
            match result {
                Ok(()) | Err(CheckpointError::NotFound { .. }) => removed.push(checkpoint),
                Err(e) => {
                    warn!(location = checkpoint.location(), error = %e, "Failed to prune checkpoint");
                    state.orphans.push(checkpoint);
                }
            }
        }
        removed
    }

    /// Pin a checkpoint so pruning skips it until the lease is dropped.
    pub fn lease(&self, checkpoint: &CheckpointRef) -> Result<CheckpointLease, CheckpointError> {
        let mut state = lock(&self.state);
        if state.deleting.contains(checkpoint.location()) {
            return Err(CheckpointError::NotFound {
                location: checkpoint.location().to_string(),
            });
        }
        *state
            .leases
            .entry(checkpoint.location().to_string())
            .or_insert(0) += 1;
        Ok(CheckpointLease {
            checkpoint: checkpoint.clone(),
            state: Arc::clone(&self.state),
        })
    }

    /// Read a checkpoint back under a lease.
    pub async fn load(&self, checkpoint: &CheckpointRef) -> Result<Vec<u8>, CheckpointError> {
        let lease = self
            .lease(checkpoint)
            .map_err(|e| CheckpointError::load(checkpoint.location(), e.to_string()))?;
        let blob = match self.store.get(lease.checkpoint()).await {
            Ok(blob) => blob,
            Err(e @ CheckpointError::Load { .. }) => return Err(e),
            Err(e) => return Err(CheckpointError::load(checkpoint.location(), e.to_string())),
        };
        drop(lease);
        Ok(blob)
    }

    pub fn is_leased(&self, checkpoint: &CheckpointRef) -> bool {
        lock(&self.state).is_leased(checkpoint.location())
    }

    /// Retained checkpoints of a trial's current lineage, oldest first.
    pub fn lineage(&self, trial: TrialId) -> Vec<CheckpointRef> {
        lock(&self.state)
            .lineages
            .get(&trial)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, trial: TrialId) -> Option<CheckpointRef> {
        lock(&self.state)
            .lineages
            .get(&trial)
            .and_then(|l| l.last().cloned())
    }

    /// Best-scoring retained checkpoint of a trial.
    pub fn best(&self, trial: TrialId) -> Option<CheckpointRef> {
        let mode = self.mode;
        lock(&self.state).lineages.get(&trial).and_then(|l| {
            l.iter()
                .filter(|c| !c.metric().is_nan())
                .max_by(|a, b| mode.compare(a.metric(), b.metric()))
                .cloned()
        })
    }

    pub fn orphan_count(&self) -> usize {
        lock(&self.state).orphans.len()
    }
}

/// Choose which checkpoints of a lineage survive; returns `(kept, victims)`.
fn select_retained(
    lineage: &[CheckpointRef],
    keep: usize,
    retention: Retention,
    mode: Mode,
) -> (Vec<CheckpointRef>, Vec<CheckpointRef>) {
    if lineage.len() <= keep {
        return (lineage.to_vec(), Vec::new());
    }
    let newest = lineage.len() - 1;
    let keep_idx: HashSet<usize> = match retention {
        Retention::Recent => (lineage.len() - keep..lineage.len()).collect(),
        Retention::Score => {
            let mut ranked: Vec<usize> = (0..newest).collect();
            // Best first, NaN metrics last.
            ranked.sort_by(|a, b| {
                let (a, b) = (lineage[*a].metric(), lineage[*b].metric());
                a.is_nan()
                    .cmp(&b.is_nan())
                    .then_with(|| mode.compare(b, a))
            });
            ranked
                .into_iter()
                .take(keep - 1)
                .chain(std::iter::once(newest))
                .collect()
        }
    };

    let mut kept = Vec::with_capacity(keep);
    let mut victims = Vec::new();
    for (i, checkpoint) in lineage.iter().enumerate() {
        if keep_idx.contains(&i) {
            kept.push(checkpoint.clone());
        } else {
            victims.push(checkpoint.clone());
        }
    }
    (kept, victims)
}
