//! Run results — best trials, their checkpoints, and how each trial ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::checkpoint::CheckpointRef;
use crate::config::Mode;
use crate::trial::{Trial, TrialId, TrialOutcome, TrialStatus};

/// Which metric a best-trial lookup compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The last reported metric.
    #[default]
    Last,
    /// The best metric ever reported.
    Best,
}

/// How trials left the population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub stopped: usize,
    pub shutdown: usize,
    pub errored: usize,
    /// Still live when the report was taken.
    pub unfinished: usize,
}

/// Final state of a tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneAnalysis {
    pub run_id: Uuid,
    pub name: String,
    pub metric: String,
    pub mode: Mode,
    pub trials: Vec<Trial>,
    /// Retained checkpoints of each trial's final lineage, oldest first.
    pub checkpoints: BTreeMap<TrialId, Vec<CheckpointRef>>,
    pub ticks: u64,
    pub perturbation_rounds: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TuneAnalysis {
    pub fn trial(&self, id: TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| t.id == id)
    }

    /// Best non-errored trial by final or historical-best metric.
    pub fn best_trial(&self, scope: Scope) -> Option<&Trial> {
        let mode = self.mode;
        self.trials
            .iter()
            .filter(|t| t.status != TrialStatus::Error)
            .filter_map(|t| {
                let metric = match scope {
                    Scope::Last => t.last_metric,
                    Scope::Best => t.best_metric(mode),
                };
                metric.filter(|m| !m.is_nan()).map(|m| (t, m))
            })
            .max_by(|(_, a), (_, b)| mode.compare(*a, *b))
            .map(|(t, _)| t)
    }

    /// Best-scoring retained checkpoint of a trial.
    ///
    /// A trial with no checkpoint of its own since its last exploit falls back
    /// to the donor checkpoint it resumed from. That reference belongs to the
    /// donor's lineage and may have been pruned by the donor's retention.
    pub fn best_checkpoint(&self, id: TrialId) -> Option<&CheckpointRef> {
        let mode = self.mode;
        self.checkpoints
            .get(&id)
            .and_then(|refs| {
                refs.iter()
                    .filter(|c| !c.metric().is_nan())
                    .max_by(|a, b| mode.compare(a.metric(), b.metric()))
            })
            .or_else(|| self.trial(id).and_then(|t| t.last_checkpoint.as_ref()))
    }

    /// Most recent checkpoint of a trial, with the same donor fallback as
    /// [`TuneAnalysis::best_checkpoint`].
    pub fn latest_checkpoint(&self, id: TrialId) -> Option<&CheckpointRef> {
        self.checkpoints
            .get(&id)
            .and_then(|refs| refs.last())
            .or_else(|| self.trial(id).and_then(|t| t.last_checkpoint.as_ref()))
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for trial in &self.trials {
            match &trial.outcome {
                Some(TrialOutcome::Completed) => counts.completed += 1,
                Some(TrialOutcome::StoppedByPolicy | TrialOutcome::StoppedAll) => {
                    counts.stopped += 1
                }
                Some(TrialOutcome::Shutdown) => counts.shutdown += 1,
                Some(TrialOutcome::Errored { .. }) => counts.errored += 1,
                None => counts.unfinished += 1,
            }
        }
        counts
    }

    /// Trials with the given outcome kind.
    pub fn trials_with(&self, pred: impl Fn(&TrialOutcome) -> bool) -> Vec<&Trial> {
        self.trials
            .iter()
            .filter(|t| t.outcome.as_ref().is_some_and(&pred))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// One line per trial, for terminal output.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.trials.len() + 1);
        let counts = self.outcome_counts();
        lines.push(format!(
            "{} ({}): {} ticks, {} perturbation rounds; completed={} stopped={} shutdown={} errored={}",
            self.name,
            self.run_id,
            self.ticks,
            self.perturbation_rounds,
            counts.completed,
            counts.stopped,
            counts.shutdown,
            counts.errored,
        ));
        for trial in &self.trials {
            let metric = trial
                .last_metric
                .map(|m| format!("{m:.4}"))
                .unwrap_or_else(|| "-".to_string());
            let outcome = trial
                .outcome
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| trial.status.to_string());
            lines.push(format!(
                "  {} step={} {}={} perturbed={}x [{}] {}",
                trial.id, trial.step, self.metric, metric, trial.perturbations, outcome, trial.config
            ));
        }
        lines.join("\n")
    }
}
