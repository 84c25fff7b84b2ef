//! The scheduler driving a filesystem store: retention and exploits on disk.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use poptune_core::{
    CheckpointStore, Scheduler, StepContext, StepResult, Trainable, TrainingStepError, TrialId,
    TuneConfig,
};
use poptune_store::FileCheckpointStore;

/// Checkpoints `(step, quality)` as two little-endian words.
struct Counter {
    step: u64,
    quality: f64,
}

#[async_trait]
impl Trainable for Counter {
    async fn run_step(&mut self, ctx: StepContext) -> Result<StepResult, TrainingStepError> {
        if let Some(resume) = &ctx.resume {
            let bytes: [u8; 16] = resume
                .blob
                .as_slice()
                .try_into()
                .map_err(|_| TrainingStepError::new(ctx.trial, "bad checkpoint size"))?;
            self.step = u64::from_le_bytes(bytes[..8].try_into().unwrap_or_default());
            self.quality = f64::from_le_bytes(bytes[8..].try_into().unwrap_or_default());
        }
        self.step += 1;
        let mut result = StepResult::new(self.step, self.quality);
        if ctx.checkpoint_requested {
            let mut blob = self.step.to_le_bytes().to_vec();
            blob.extend_from_slice(&self.quality.to_le_bytes());
            result = result.with_checkpoint(blob);
        }
        Ok(result)
    }
}

fn counters(qualities: &'static [f64]) -> impl Fn(TrialId) -> Box<dyn Trainable> + Send + Sync {
    move |id| -> Box<dyn Trainable> {
        Box::new(Counter {
            step: 0,
            quality: qualities[id.index() as usize],
        })
    }
}

fn blob_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|x| x == "ckpt"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn retention_is_reflected_on_disk() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
    let config = TuneConfig {
        population_size: 2,
        checkpoint_interval: 1,
        keep_checkpoints_num: 2,
        perturbation_interval: 100,
        seed: Some(3),
        stop: poptune_core::StopConfig {
            max_iterations: Some(6),
            ..Default::default()
        },
        ..TuneConfig::default()
    };
    let scheduler = Scheduler::new(config, store.clone(), counters(&[0.25, 0.5])).unwrap();
    let analysis = scheduler.run().await.unwrap();

    for trial in &analysis.trials {
        let listed = store.list(trial.id).await.unwrap();
        assert_eq!(listed, analysis.checkpoints[&trial.id]);
        assert_eq!(listed.iter().map(|c| c.step()).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(blob_count(&dir.path().join(trial.id.to_string())), 2);
    }
}

#[tokio::test]
async fn exploited_trial_resumes_from_donor_blob() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
    let config = TuneConfig {
        population_size: 4,
        perturbation_interval: 5,
        seed: Some(11),
        stop: poptune_core::StopConfig {
            max_iterations: Some(7),
            ..Default::default()
        },
        ..TuneConfig::default()
    };
    let scheduler =
        Scheduler::new(config, store.clone(), counters(&[0.5, 0.6, 0.55, 0.9])).unwrap();
    let analysis = scheduler.run().await.unwrap();

    let target = analysis.trial(TrialId::new(0)).unwrap();
    assert_eq!(target.perturbations, 1);
    assert_eq!(target.last_metric, Some(0.9));
    assert_eq!(target.step, 7);
    // The target's own pre-exploit checkpoints were garbage-collected.
    assert!(store.list(TrialId::new(0)).await.unwrap().is_empty());
    assert!(!store.list(TrialId::new(3)).await.unwrap().is_empty());
}
