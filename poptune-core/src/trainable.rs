//! The training capability the scheduler drives.
//!
//! A [`Trainable`] owns one trial's in-process training state. The scheduler
//! moves it onto a worker task for each step and takes it back when the step
//! reports, so an implementation never needs interior locking.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointRef;
use crate::error::TrainingStepError;
use crate::space::Configuration;
use crate::trial::TrialId;

/// Checkpoint the trainable must restore before training further.
#[derive(Debug, Clone)]
pub struct Resume {
    pub checkpoint: CheckpointRef,
    pub blob: Vec<u8>,
}

/// Everything a trainable gets for one reporting unit.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub trial: TrialId,
    pub config: Configuration,
    /// Step of the last accepted report.
    pub step: u64,
    /// Set after an exploit or a restart; the state to continue from.
    pub resume: Option<Resume>,
    /// Whether the scheduler wants a checkpoint with this report.
    pub checkpoint_requested: bool,
    /// Cancelled when the trial is stopped; checked at safe points only.
    pub cancel: CancellationToken,
}

/// What one step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Step reached by this report; must be after the previous report.
    pub step: u64,
    pub metric: f64,
    pub checkpoint: Option<Vec<u8>>,
    /// The trainable has nothing left to do.
    pub done: bool,
}

impl StepResult {
    pub fn new(step: u64, metric: f64) -> Self {
        Self {
            step,
            metric,
            checkpoint: None,
            done: false,
        }
    }

    pub fn with_checkpoint(mut self, blob: Vec<u8>) -> Self {
        self.checkpoint = Some(blob);
        self
    }

    pub fn finished(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Resumable training loop for one trial.
///
/// `run_step` blocks until the next metric is available. It must be able to
/// resume from any checkpoint it produced, and restarting after a crash must
/// not double-count steps.
#[async_trait]
pub trait Trainable: Send {
    async fn run_step(&mut self, ctx: StepContext) -> Result<StepResult, TrainingStepError>;
}

/// Creates a fresh trainable for a trial, at start-up and after a failure.
pub trait TrainableFactory: Send + Sync {
    fn create(&self, trial: TrialId) -> Box<dyn Trainable>;
}

impl<F> TrainableFactory for F
where
    F: Fn(TrialId) -> Box<dyn Trainable> + Send + Sync,
{
    fn create(&self, trial: TrialId) -> Box<dyn Trainable> {
        self(trial)
    }
}
