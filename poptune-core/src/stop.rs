//! Stop policies — decide after each report whether a trial or the whole population halts.
//!
//! Policies are stateful and monotone: once `should_stop_all` returns `true`
//! it keeps returning `true` for the rest of the run.

use std::collections::HashMap;

use crate::config::{IterationScope, Mode, StopConfig};
use crate::registry::Report;
use crate::trial::TrialId;

/// Evaluated after every accepted report: `should_stop` first, then `should_stop_all`.
pub trait StopPolicy: Send {
    fn should_stop(&mut self, trial: TrialId, report: &Report) -> bool;

    fn should_stop_all(&mut self) -> bool;
}

/// Latches stop-all once any trial's metric passes a threshold.
#[derive(Debug, Clone)]
pub struct ThresholdStopper {
    pub threshold: f64,
    pub mode: Mode,
    tripped: bool,
}

impl ThresholdStopper {
    pub fn new(threshold: f64, mode: Mode) -> Self {
        Self {
            threshold,
            mode,
            tripped: false,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

impl StopPolicy for ThresholdStopper {
    fn should_stop(&mut self, _trial: TrialId, report: &Report) -> bool {
        if !self.tripped && self.mode.is_better(report.metric, self.threshold) {
            self.tripped = true;
        }
        self.tripped
    }

    fn should_stop_all(&mut self) -> bool {
        self.tripped
    }
}

/// Stops trials once their step counter reaches `max_iterations`.
#[derive(Debug, Clone)]
pub struct MaxIterationStopper {
    pub max_iterations: u64,
    pub scope: IterationScope,
    reached: bool,
}

impl MaxIterationStopper {
    pub fn new(max_iterations: u64, scope: IterationScope) -> Self {
        Self {
            max_iterations,
            scope,
            reached: false,
        }
    }
}

impl StopPolicy for MaxIterationStopper {
    fn should_stop(&mut self, _trial: TrialId, report: &Report) -> bool {
        let done = report.step >= self.max_iterations;
        if done {
            self.reached = true;
        }
        done
    }

    fn should_stop_all(&mut self) -> bool {
        self.scope == IterationScope::Population && self.reached
    }
}

#[derive(Debug, Clone, Default)]
struct PlateauState {
    best: Option<f64>,
    stale: usize,
}

/// Stops a trial after `patience` reports without improving by `min_delta`.
#[derive(Debug, Clone)]
pub struct PlateauStopper {
    pub patience: usize,
    pub min_delta: f64,
    pub mode: Mode,
    trials: HashMap<TrialId, PlateauState>,
}

impl PlateauStopper {
    pub fn new(patience: usize, min_delta: f64, mode: Mode) -> Self {
        Self {
            patience,
            min_delta,
            mode,
            trials: HashMap::new(),
        }
    }

    fn improved(&self, metric: f64, best: f64) -> bool {
        match self.mode {
            Mode::Max => metric > best + self.min_delta,
            Mode::Min => metric < best - self.min_delta,
        }
    }
}

impl StopPolicy for PlateauStopper {
    fn should_stop(&mut self, trial: TrialId, report: &Report) -> bool {
        let improved = match self.trials.get(&trial).and_then(|s| s.best) {
            None => true,
            Some(best) => self.improved(report.metric, best),
        };
        let state = self.trials.entry(trial).or_default();
        if improved {
            state.best = Some(report.metric);
            state.stale = 0;
            false
        } else {
            state.stale += 1;
            state.stale >= self.patience
        }
    }

    fn should_stop_all(&mut self) -> bool {
        false
    }
}

/// Stops when any member policy says so; the population-wide decision is latched.
#[derive(Default)]
pub struct CompositeStopPolicy {
    policies: Vec<Box<dyn StopPolicy>>,
    stopped_all: bool,
}

impl CompositeStopPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl StopPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    /// Threshold latch, iteration bound, and optional plateau detection.
    pub fn from_config(config: &StopConfig, mode: Mode) -> Self {
        let mut policy = Self::new();
        if let Some(threshold) = config.metric_threshold {
            policy = policy.with(ThresholdStopper::new(threshold, mode));
        }
        if let Some(max) = config.max_iterations {
            policy = policy.with(MaxIterationStopper::new(max, config.max_iterations_scope));
        }
        if let Some(patience) = config.plateau_patience {
            policy = policy.with(PlateauStopper::new(patience, config.plateau_min_delta, mode));
        }
        policy
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl StopPolicy for CompositeStopPolicy {
    fn should_stop(&mut self, trial: TrialId, report: &Report) -> bool {
        // Every member sees every report so stateful members stay current.
        let mut stop = self.stopped_all;
        for policy in &mut self.policies {
            stop |= policy.should_stop(trial, report);
        }
        stop
    }

    fn should_stop_all(&mut self) -> bool {
        if !self.stopped_all {
            self.stopped_all = self.policies.iter_mut().any(|p| p.should_stop_all());
        }
        self.stopped_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(trial: u32, step: u64, metric: f64) -> Report {
        Report {
            trial: TrialId::new(trial),
            step,
            training_iteration: step,
            metric,
        }
    }

    #[test]
    fn test_threshold_latches() {
        let mut stopper = ThresholdStopper::new(0.96, Mode::Max);
        assert!(!stopper.should_stop(TrialId::new(0), &report(0, 1, 0.5)));
        assert!(!stopper.should_stop_all());
        assert!(stopper.should_stop(TrialId::new(1), &report(1, 2, 0.97)));
        assert!(stopper.should_stop_all());
        assert!(stopper.should_stop(TrialId::new(2), &report(2, 3, 0.3)));
        assert!(stopper.should_stop_all());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut stopper = ThresholdStopper::new(0.96, Mode::Max);
        stopper.should_stop(TrialId::new(0), &report(0, 1, 0.96));
        assert!(!stopper.should_stop_all());
    }

    #[test]
    fn test_nan_metric_does_not_trip_threshold() {
        let mut stopper = ThresholdStopper::new(0.96, Mode::Max);
        assert!(!stopper.should_stop(TrialId::new(0), &report(0, 1, f64::NAN)));
        assert!(!stopper.should_stop_all());

        let config = StopConfig {
            metric_threshold: Some(0.96),
            ..StopConfig::default()
        };
        let mut policy = CompositeStopPolicy::from_config(&config, Mode::Max);
        policy.should_stop(TrialId::new(1), &report(1, 1, f64::NAN));
        assert!(!policy.should_stop_all());
        policy.should_stop(TrialId::new(1), &report(1, 2, 0.97));
        assert!(policy.should_stop_all());
    }

    #[test]
    fn test_threshold_min_mode() {
        let mut stopper = ThresholdStopper::new(0.1, Mode::Min);
        stopper.should_stop(TrialId::new(0), &report(0, 1, 0.2));
        assert!(!stopper.should_stop_all());
        stopper.should_stop(TrialId::new(0), &report(0, 2, 0.05));
        assert!(stopper.should_stop_all());
    }

    #[test]
    fn test_max_iterations_scopes() {
        let mut per_trial = MaxIterationStopper::new(5, IterationScope::Trial);
        assert!(per_trial.should_stop(TrialId::new(0), &report(0, 5, 0.1)));
        assert!(!per_trial.should_stop_all());

        let mut population = MaxIterationStopper::new(5, IterationScope::Population);
        assert!(!population.should_stop(TrialId::new(0), &report(0, 4, 0.1)));
        assert!(!population.should_stop_all());
        assert!(population.should_stop(TrialId::new(0), &report(0, 5, 0.1)));
        assert!(population.should_stop_all());
    }

    #[test]
    fn test_plateau_patience() {
        let mut stopper = PlateauStopper::new(3, 0.01, Mode::Max);
        let id = TrialId::new(0);
        assert!(!stopper.should_stop(id, &report(0, 1, 0.5)));
        assert!(!stopper.should_stop(id, &report(0, 2, 0.6)));
        assert!(!stopper.should_stop(id, &report(0, 3, 0.6)));
        assert!(!stopper.should_stop(id, &report(0, 4, 0.605)));
        assert!(stopper.should_stop(id, &report(0, 5, 0.6)));
        // Other trials keep their own counters.
        assert!(!stopper.should_stop(TrialId::new(1), &report(1, 5, 0.1)));
    }

    #[test]
    fn test_composite_stop_all_is_monotone() {
        let config = StopConfig {
            metric_threshold: Some(0.96),
            max_iterations: Some(100),
            ..StopConfig::default()
        };
        let mut policy = CompositeStopPolicy::from_config(&config, Mode::Max);
        assert_eq!(policy.len(), 2);

        policy.should_stop(TrialId::new(0), &report(0, 1, 0.97));
        assert!(policy.should_stop_all());
        for step in 2..10 {
            assert!(policy.should_stop(TrialId::new(1), &report(1, step, 0.3)));
            assert!(policy.should_stop_all());
        }
    }

    #[test]
    fn test_empty_composite_never_stops() {
        let mut policy = CompositeStopPolicy::new();
        assert!(!policy.should_stop(TrialId::new(0), &report(0, 1_000, 1.0)));
        assert!(!policy.should_stop_all());
    }
}
