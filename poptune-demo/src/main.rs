//! Population-based training over a synthetic, resumable convnet.
//!
//! Configuration comes from `poptune.toml` (or the file named by
//! `POPTUNE_CONFIG`) layered with `POPTUNE_*` environment variables.

mod synthetic;

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use poptune_core::{
    CheckpointRef, CheckpointStore, Scheduler, Scope, TrialId, init_logging, load_config,
};
use poptune_store::FileCheckpointStore;

use crate::synthetic::{ModelState, SyntheticConvNet};

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("POPTUNE_CONFIG") {
        return PathBuf::from(path);
    }
    let local = PathBuf::from("poptune.toml");
    if local.exists() {
        return local;
    }
    Path::new(env!("CARGO_MANIFEST_DIR")).join("poptune.toml")
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "poptune", "poptune")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".poptune"))
}

/// Read a model back from `checkpoint`; `None` when the blob is gone or unreadable.
async fn load_model(
    store: &dyn CheckpointStore,
    checkpoint: &CheckpointRef,
) -> anyhow::Result<Option<ModelState>> {
    let blob = match store.get(checkpoint).await {
        Ok(blob) => blob,
        Err(e) => {
            warn!(
                trial = %checkpoint.trial(),
                location = checkpoint.location(),
                error = %e,
                "Checkpoint is unreadable"
            );
            return Ok(None);
        }
    };
    Ok(Some(serde_json::from_slice(&blob)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let path = config_path();
    let mut config = load_config(Some(&path), None)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let data_dir = data_dir();
    if config.logging.json_dir.is_none() {
        config.logging.json_dir = Some(data_dir.join("logs"));
    }
    let _guard = init_logging(&config.logging)?;

    let checkpoint_dir = data_dir.join("checkpoints").join(&config.name);
    let store = Arc::new(FileCheckpointStore::open(&checkpoint_dir).await?);
    info!(config = %path.display(), checkpoints = %checkpoint_dir.display(), "Loaded configuration");

    let seed = config.seed;
    let scheduler = Scheduler::new(config, store.clone(), move |trial: TrialId| {
        SyntheticConvNet::boxed(trial, seed)
    })?;

    let shutdown = scheduler.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current tick");
            shutdown.cancel();
        }
    });

    let analysis = scheduler.run().await?;
    println!("{}", analysis.summary());

    let report_path = checkpoint_dir.join("analysis.json");
    std::fs::write(&report_path, analysis.to_json()?)
        .with_context(|| format!("writing {}", report_path.display()))?;

    let Some(best) = analysis.best_trial(Scope::Last) else {
        println!("no trial reported a metric");
        return Ok(());
    };
    let Some(checkpoint) = analysis.best_checkpoint(best.id) else {
        println!("best trial {} has no checkpoint", best.id);
        return Ok(());
    };

    let Some(model) = load_model(store.as_ref(), checkpoint).await? else {
        println!(
            "best trial {}: checkpoint at step {} is no longer available",
            best.id,
            checkpoint.step()
        );
        return Ok(());
    };
    println!(
        "best trial {} (config {}): checkpoint at step {}, model accuracy: {:.4}",
        best.id,
        best.config,
        checkpoint.step(),
        model.evaluate()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use poptune_core::InMemoryCheckpointStore;

    #[tokio::test]
    async fn test_load_model_reads_stored_state() {
        let store = InMemoryCheckpointStore::new();
        let state = ModelState {
            step: 7,
            quality: 0.5,
        };
        let checkpoint = store
            .put(TrialId::new(0), 7, 0.5, serde_json::to_vec(&state).unwrap())
            .await
            .unwrap();
        let model = load_model(&store, &checkpoint).await.unwrap().unwrap();
        assert_eq!(model.step, 7);
        assert_eq!(model.evaluate(), 0.5);
    }

    #[tokio::test]
    async fn test_load_model_skips_pruned_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = store
            .put(TrialId::new(3), 5, 0.9, b"{}".to_vec())
            .await
            .unwrap();
        store.remove(&checkpoint).await.unwrap();
        assert!(load_model(&store, &checkpoint).await.unwrap().is_none());
    }
}
