//! Trials — population members with their configuration and metric history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checkpoint::CheckpointRef;
use crate::config::{Mode, TimeAttr};
use crate::space::Configuration;

/// Unique identity of a trial within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(u32);

impl TrialId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial_{:05}", self.0)
    }
}

/// Lifecycle status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Error,
}

impl TrialStatus {
    /// Whether the trial has left the population for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Stopped | TrialStatus::Error)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the trial state machine. Self-transitions are no-ops.
    pub fn can_transition_to(&self, to: TrialStatus) -> bool {
        use TrialStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Running | Stopped | Error)
                | (Running, Paused | Stopped | Error)
                | (Paused, Running | Stopped | Error)
        )
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialStatus::Pending => write!(f, "pending"),
            TrialStatus::Running => write!(f, "running"),
            TrialStatus::Paused => write!(f, "paused"),
            TrialStatus::Stopped => write!(f, "stopped"),
            TrialStatus::Error => write!(f, "error"),
        }
    }
}

/// Why a trial left the population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// The trainable reported that it finished.
    Completed,
    /// The stop policy stopped this trial.
    StoppedByPolicy,
    /// The stop policy stopped the whole population.
    StoppedAll,
    /// The scheduler was shut down.
    Shutdown,
    Errored { message: String },
}

impl TrialOutcome {
    /// Terminal status that goes with this outcome.
    pub fn status(&self) -> TrialStatus {
        match self {
            TrialOutcome::Errored { .. } => TrialStatus::Error,
            _ => TrialStatus::Stopped,
        }
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialOutcome::Completed => write!(f, "completed"),
            TrialOutcome::StoppedByPolicy => write!(f, "stopped by policy"),
            TrialOutcome::StoppedAll => write!(f, "stopped with population"),
            TrialOutcome::Shutdown => write!(f, "shut down"),
            TrialOutcome::Errored { message } => write!(f, "errored: {message}"),
        }
    }
}

/// One metric report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub step: u64,
    pub metric: f64,
    pub reported_at: DateTime<Utc>,
}

/// A member of the population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub config: Configuration,
    pub status: TrialStatus,
    pub last_metric: Option<f64>,
    /// Step of the last accepted report (or of the checkpoint copied on exploit).
    pub step: u64,
    /// Number of accepted reports.
    pub iterations: u64,
    pub last_checkpoint: Option<CheckpointRef>,
    pub history: Vec<MetricPoint>,
    /// `time_attr` value at the last perturbation round this trial took part in.
    pub last_perturbation_time: u64,
    /// Number of exploits applied to this trial.
    pub perturbations: u32,
    pub perturbation_in_flight: bool,
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TrialOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    /// Create a pending trial with its initial configuration.
    pub fn new(id: TrialId, config: Configuration) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            status: TrialStatus::Pending,
            last_metric: None,
            step: 0,
            iterations: 0,
            last_checkpoint: None,
            history: Vec::new(),
            last_perturbation_time: 0,
            perturbations: 0,
            perturbation_in_flight: false,
            failures: 0,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current value of the configured time attribute.
    pub fn time_value(&self, attr: TimeAttr) -> u64 {
        match attr {
            TimeAttr::TrainingIteration => self.iterations,
            TimeAttr::Step => self.step,
        }
    }

    /// Best metric this trial ever reported.
    pub fn best_metric(&self, mode: Mode) -> Option<f64> {
        self.history
            .iter()
            .map(|p| p.metric)
            .filter(|m| !m.is_nan())
            .max_by(|a, b| mode.compare(*a, *b))
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
