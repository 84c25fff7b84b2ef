//! Population registry — the single source of truth for every trial's state.
//!
//! All mutation goes through one lock, so concurrent reports to the same trial
//! are serialized and a [`PopulationSnapshot`] is always a consistent view of a
//! single generation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::checkpoint::CheckpointRef;
use crate::config::TimeAttr;
use crate::error::PopulationError;
use crate::perturbation::Exploit;
use crate::trial::{MetricPoint, Trial, TrialId, TrialOutcome, TrialStatus};

/// An accepted metric report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub trial: TrialId,
    pub step: u64,
    /// Number of reports the trial has made, including this one.
    pub training_iteration: u64,
    pub metric: f64,
}

/// Read-only view of the whole population at one generation.
#[derive(Debug, Clone)]
pub struct PopulationSnapshot {
    pub generation: u64,
    pub trials: Vec<Trial>,
}

impl PopulationSnapshot {
    pub fn get(&self, id: TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| t.id == id)
    }
}

#[derive(Default)]
struct RegistryState {
    trials: Vec<Trial>,
    index: HashMap<TrialId, usize>,
    generation: u64,
}

impl RegistryState {
    fn trial_mut(&mut self, id: TrialId) -> Result<&mut Trial, PopulationError> {
        let idx = *self
            .index
            .get(&id)
            .ok_or(PopulationError::UnknownTrial { id })?;
        self.generation += 1;
        Ok(&mut self.trials[idx])
    }

    fn trial(&self, id: TrialId) -> Result<&Trial, PopulationError> {
        self.index
            .get(&id)
            .map(|idx| &self.trials[*idx])
            .ok_or(PopulationError::UnknownTrial { id })
    }
}

fn transition(trial: &mut Trial, to: TrialStatus) -> Result<TrialStatus, PopulationError> {
    let from = trial.status;
    if !from.can_transition_to(to) {
        return Err(PopulationError::InvalidTransition {
            id: trial.id,
            from,
            to,
        });
    }
    trial.status = to;
    trial.updated_at = Utc::now();
    Ok(from)
}

/// Tracks all trials of a fixed-size population.
pub struct PopulationRegistry {
    capacity: usize,
    state: RwLock<RegistryState>,
}

impl PopulationRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.read().trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a trial to the population.
    pub fn register(&self, trial: Trial) -> Result<(), PopulationError> {
        let mut state = self.write();
        if state.index.contains_key(&trial.id) {
            return Err(PopulationError::DuplicateTrial { id: trial.id });
        }
        if state.trials.len() >= self.capacity {
            return Err(PopulationError::PopulationFull {
                capacity: self.capacity,
            });
        }
        let idx = state.trials.len();
        state.index.insert(trial.id, idx);
        state.trials.push(trial);
        state.generation += 1;
        Ok(())
    }

    /// Record a metric report.
    ///
    /// Fails with `UnknownTrial` for an unregistered id and with `StaleReport`
    /// when `step` is not after the trial's current step; a rejected report
    /// leaves the registry untouched.
    pub fn report(&self, id: TrialId, step: u64, metric: f64) -> Result<Report, PopulationError> {
        let mut state = self.write();
        let current = state.trial(id)?.step;
        if step <= current {
            return Err(PopulationError::StaleReport { id, step, current });
        }
        let trial = state.trial_mut(id)?;
        let now = Utc::now();
        trial.step = step;
        trial.iterations += 1;
        trial.last_metric = Some(metric);
        trial.history.push(MetricPoint {
            step,
            metric,
            reported_at: now,
        });
        trial.updated_at = now;
        Ok(Report {
            trial: id,
            step,
            training_iteration: trial.iterations,
            metric,
        })
    }

    /// A consistent copy of every trial, taken under one lock.
    pub fn snapshot(&self) -> PopulationSnapshot {
        let state = self.read();
        PopulationSnapshot {
            generation: state.generation,
            trials: state.trials.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn get(&self, id: TrialId) -> Result<Trial, PopulationError> {
        self.read().trial(id).cloned()
    }

    pub fn ids(&self) -> Vec<TrialId> {
        self.read().trials.iter().map(|t| t.id).collect()
    }

    /// Ids of trials with the given status, in population order.
    pub fn ids_with_status(&self, status: TrialStatus) -> Vec<TrialId> {
        self.read()
            .trials
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    pub fn live_ids(&self) -> Vec<TrialId> {
        self.read()
            .trials
            .iter()
            .filter(|t| t.status.is_live())
            .map(|t| t.id)
            .collect()
    }

    /// Whether every trial is stopped or errored.
    pub fn all_finished(&self) -> bool {
        self.read().trials.iter().all(Trial::is_finished)
    }

    /// Move a trial to a non-terminal status. Returns the previous status.
    pub fn set_status(&self, id: TrialId, to: TrialStatus) -> Result<TrialStatus, PopulationError> {
        let mut state = self.write();
        transition(state.trial_mut(id)?, to)
    }

    /// Move a live trial to its terminal status and record why.
    ///
    /// Finishing an already finished trial keeps its first outcome.
    pub fn finish(&self, id: TrialId, outcome: TrialOutcome) -> Result<bool, PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(id)?;
        if trial.is_finished() {
            return Ok(false);
        }
        transition(trial, outcome.status())?;
        trial.perturbation_in_flight = false;
        trial.outcome = Some(outcome);
        Ok(true)
    }

    pub fn record_checkpoint(&self, id: TrialId, checkpoint: CheckpointRef) -> Result<(), PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(id)?;
        trial.last_checkpoint = Some(checkpoint);
        trial.updated_at = Utc::now();
        Ok(())
    }

    /// Count a failed step; returns the failure total.
    pub fn record_failure(&self, id: TrialId) -> Result<u32, PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(id)?;
        trial.failures += 1;
        trial.updated_at = Utc::now();
        Ok(trial.failures)
    }

    /// Note that these trials took part in a perturbation round at `time`.
    pub fn mark_perturbed(&self, ready: &[(TrialId, u64)]) -> Result<(), PopulationError> {
        let mut state = self.write();
        for (id, time) in ready {
            state.trial_mut(*id)?.last_perturbation_time = *time;
        }
        Ok(())
    }

    /// Pause a running trial so an exploit can be applied to it.
    pub fn begin_perturbation(&self, id: TrialId) -> Result<(), PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(id)?;
        if trial.perturbation_in_flight {
            return Err(PopulationError::PerturbationInFlight { id });
        }
        transition(trial, TrialStatus::Paused)?;
        trial.perturbation_in_flight = true;
        Ok(())
    }

    /// Resume a paused trial without applying its exploit.
    pub fn abort_perturbation(&self, id: TrialId) -> Result<(), PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(id)?;
        trial.perturbation_in_flight = false;
        if trial.status == TrialStatus::Paused {
            transition(trial, TrialStatus::Running)?;
        }
        Ok(())
    }

    /// Copy the donor's state into the target and resume it with the mutated configuration.
    ///
    /// Everything copied comes from the exploit itself, i.e. from the snapshot
    /// the perturbation round was planned on.
    pub fn commit_exploit(&self, exploit: &Exploit, time_attr: TimeAttr) -> Result<(), PopulationError> {
        let mut state = self.write();
        let trial = state.trial_mut(exploit.target)?;
        if !trial.perturbation_in_flight {
            return Err(PopulationError::InvalidTransition {
                id: trial.id,
                from: trial.status,
                to: TrialStatus::Running,
            });
        }
        trial.config = exploit.config.clone();
        trial.step = exploit.donor_checkpoint.step();
        trial.last_metric = Some(exploit.donor_checkpoint.metric());
        trial.last_checkpoint = Some(exploit.donor_checkpoint.clone());
        trial.perturbations += 1;
        trial.perturbation_in_flight = false;
        trial.last_perturbation_time = trial.time_value(time_attr);
        transition(trial, TrialStatus::Running)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Configuration;
    use std::sync::Arc;

    fn registry_with(n: u32) -> PopulationRegistry {
        let registry = PopulationRegistry::new(n as usize);
        for i in 0..n {
            registry
                .register(Trial::new(TrialId::new(i), Configuration::new()))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_register_rejects_duplicates_and_overflow() {
        let registry = registry_with(2);
        assert_eq!(
            registry.register(Trial::new(TrialId::new(1), Configuration::new())),
            Err(PopulationError::DuplicateTrial { id: TrialId::new(1) })
        );
        assert_eq!(
            registry.register(Trial::new(TrialId::new(7), Configuration::new())),
            Err(PopulationError::PopulationFull { capacity: 2 })
        );
    }

    #[test]
    fn test_report_updates_metric_and_history() {
        let registry = registry_with(1);
        let id = TrialId::new(0);
        let report = registry.report(id, 1, 0.4).unwrap();
        assert_eq!(report.training_iteration, 1);
        registry.report(id, 2, 0.6).unwrap();

        let trial = registry.get(id).unwrap();
        assert_eq!(trial.step, 2);
        assert_eq!(trial.last_metric, Some(0.6));
        assert_eq!(trial.history.len(), 2);
    }

    #[test]
    fn test_stale_report_leaves_state_unchanged() {
        let registry = registry_with(1);
        let id = TrialId::new(0);
        registry.report(id, 3, 0.7).unwrap();
        let generation = registry.generation();

        let err = registry.report(id, 2, 0.1).unwrap_err();
        assert_eq!(
            err,
            PopulationError::StaleReport {
                id,
                step: 2,
                current: 3
            }
        );
        let trial = registry.get(id).unwrap();
        assert_eq!(trial.step, 3);
        assert_eq!(trial.last_metric, Some(0.7));
        assert_eq!(trial.history.len(), 1);
        assert_eq!(registry.generation(), generation);

        // Duplicates are stale too.
        assert!(registry.report(id, 3, 0.7).is_err());
    }

    #[test]
    fn test_unknown_trial() {
        let registry = registry_with(1);
        assert_eq!(
            registry.report(TrialId::new(5), 1, 0.0).unwrap_err(),
            PopulationError::UnknownTrial { id: TrialId::new(5) }
        );
    }

    #[test]
    fn test_stopped_trial_never_runs_again() {
        let registry = registry_with(1);
        let id = TrialId::new(0);
        registry.set_status(id, TrialStatus::Running).unwrap();
        assert!(registry.finish(id, TrialOutcome::StoppedByPolicy).unwrap());
        assert!(registry.set_status(id, TrialStatus::Running).is_err());
        assert!(!registry.finish(id, TrialOutcome::Completed).unwrap());
        assert_eq!(
            registry.get(id).unwrap().outcome,
            Some(TrialOutcome::StoppedByPolicy)
        );
    }

    #[test]
    fn test_one_perturbation_in_flight() {
        let registry = registry_with(1);
        let id = TrialId::new(0);
        registry.set_status(id, TrialStatus::Running).unwrap();
        registry.begin_perturbation(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, TrialStatus::Paused);
        assert_eq!(
            registry.begin_perturbation(id),
            Err(PopulationError::PerturbationInFlight { id })
        );
        registry.abort_perturbation(id).unwrap();
        let trial = registry.get(id).unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(!trial.perturbation_in_flight);
    }

    #[test]
    fn test_concurrent_reports_are_not_lost() {
        let registry = Arc::new(registry_with(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for step in 1..=100u64 {
                        registry
                            .report(TrialId::new(i), step, step as f64)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = registry.snapshot();
        assert!(snapshot
            .trials
            .iter()
            .all(|t| t.step == 100 && t.history.len() == 100));
    }
}
