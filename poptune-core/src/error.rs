//! Error types for the poptune scheduling core.
//!
//! Uses `thiserror` for public API error types with one enum per concern
//! (population bookkeeping, checkpoints, training steps, configuration),
//! aggregated under [`PoptuneError`].

use crate::trial::{TrialId, TrialStatus};

/// Top-level error type for the poptune core library.
#[derive(Debug, thiserror::Error)]
pub enum PoptuneError {
    #[error("Population error: {0}")]
    Population(#[from] PopulationError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Training step error: {0}")]
    TrainingStep(#[from] TrainingStepError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the population registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PopulationError {
    /// The trial id is not registered. This is a programming error on the caller's side.
    #[error("Unknown trial: {id}")]
    UnknownTrial { id: TrialId },

    /// A report arrived for a step at or before the trial's current step.
    #[error("Stale report for {id}: step {step} is not after current step {current}")]
    StaleReport { id: TrialId, step: u64, current: u64 },

    #[error("Trial already registered: {id}")]
    DuplicateTrial { id: TrialId },

    #[error("Population is full ({capacity} trials)")]
    PopulationFull { capacity: usize },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("A perturbation is already in flight for {id}")]
    PerturbationInFlight { id: TrialId },
}

/// Errors from checkpoint storage and retention.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    /// A checkpoint could not be read back for a resume.
    #[error("Failed to load checkpoint {location}: {message}")]
    Load { location: String, message: String },

    #[error("Checkpoint store failure: {message}")]
    Store { message: String },

    #[error("Checkpoint step {step} for {trial} is not after step {last}")]
    NonMonotonicStep { trial: TrialId, step: u64, last: u64 },

    #[error("Checkpoint not found: {location}")]
    NotFound { location: String },

    #[error("Checkpoint content does not match its address: {location}")]
    Corrupt { location: String },
}

impl CheckpointError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    pub fn load(location: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Load {
            location: location.into(),
            message: msg.into(),
        }
    }
}

/// Failure reported by a [`Trainable`](crate::trainable::Trainable) while advancing a trial.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{trial} failed: {message}")]
pub struct TrainingStepError {
    pub trial: TrialId,
    pub message: String,
}

impl TrainingStepError {
    pub fn new(trial: TrialId, message: impl Into<String>) -> Self {
        Self {
            trial,
            message: message.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// A type alias for results using the top-level `PoptuneError`.
pub type Result<T> = std::result::Result<T, PoptuneError>;
