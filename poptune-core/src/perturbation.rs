//! Exploit/explore — rank the population, clone top performers into the bottom
//! quantile, then mutate the cloned configurations.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::checkpoint::CheckpointRef;
use crate::config::{Mode, TimeAttr, TuneConfig};
use crate::registry::PopulationSnapshot;
use crate::space::{Configuration, MutationSpec, ParamValue};
use crate::trial::{Trial, TrialId, TrialStatus};

/// Parameters of the exploit/explore policy.
#[derive(Debug, Clone)]
pub struct PerturbationConfig {
    pub mode: Mode,
    pub time_attr: TimeAttr,
    pub interval: u64,
    pub quantile_fraction: f64,
    pub resample_probability: f64,
    pub perturbation_factors: Vec<f64>,
    pub mutations: BTreeMap<String, MutationSpec>,
}

impl From<&TuneConfig> for PerturbationConfig {
    fn from(config: &TuneConfig) -> Self {
        Self {
            mode: config.mode,
            time_attr: config.time_attr,
            interval: config.perturbation_interval,
            quantile_fraction: config.quantile_fraction,
            resample_probability: config.resample_probability,
            perturbation_factors: config.perturbation_factors.clone(),
            mutations: config.hyperparam_mutations.clone(),
        }
    }
}

/// How one hyperparameter changed during explore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    Resampled,
    Scaled { factor: f64 },
    Chosen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub name: String,
    pub from: Option<ParamValue>,
    pub to: ParamValue,
    pub kind: MutationKind,
}

/// Instruction to overwrite `target` with a mutated clone of `donor`.
#[derive(Debug, Clone)]
pub struct Exploit {
    pub target: TrialId,
    pub donor: TrialId,
    pub donor_checkpoint: CheckpointRef,
    /// Donor configuration after explore.
    pub config: Configuration,
    pub mutations: Vec<Mutation>,
}

/// Ranked split of the rankable trials.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantilePartition {
    pub bottom: Vec<TrialId>,
    pub middle: Vec<TrialId>,
    pub top: Vec<TrialId>,
}

/// Outcome of planning one perturbation round.
#[derive(Debug, Clone, Default)]
pub struct PerturbationPlan {
    /// Generation of the snapshot this plan was built from.
    pub generation: u64,
    /// Trials due this round with their current `time_attr` value.
    pub ready: Vec<(TrialId, u64)>,
    pub partition: QuantilePartition,
    pub exploits: Vec<Exploit>,
}

impl PerturbationPlan {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

/// Plans exploit/explore rounds over registry snapshots.
pub struct PerturbationEngine {
    config: PerturbationConfig,
    rng: StdRng,
}

impl PerturbationEngine {
    pub fn new(config: PerturbationConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &PerturbationConfig {
        &self.config
    }

    /// Running trials with a usable metric and no perturbation in flight.
    fn rankable<'a>(&self, snapshot: &'a PopulationSnapshot) -> Vec<&'a Trial> {
        snapshot
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Running && !t.perturbation_in_flight)
            .filter(|t| t.last_metric.is_some_and(|m| !m.is_nan()))
            .collect()
    }

    /// Rank trials worst-first and split off the bottom and top quantiles.
    ///
    /// A trial whose metric ties the first trial outside its quantile is moved
    /// to the middle, so boundary ties are neither targets nor donors.
    pub fn partition(&self, snapshot: &PopulationSnapshot) -> QuantilePartition {
        let mut ranked = self.rankable(snapshot);
        let mode = self.config.mode;
        ranked.sort_by(|a, b| {
            mode.compare(metric_of(a), metric_of(b))
                .then_with(|| a.id.cmp(&b.id))
        });

        let n = ranked.len();
        let k = ((n as f64 * self.config.quantile_fraction).ceil() as usize).min(n / 2);
        if k == 0 {
            return QuantilePartition {
                middle: ranked.iter().map(|t| t.id).collect(),
                ..QuantilePartition::default()
            };
        }

        let lower_edge = metric_of(ranked[k]);
        let upper_edge = metric_of(ranked[n - k - 1]);
        let mut partition = QuantilePartition::default();
        for (i, trial) in ranked.iter().enumerate() {
            let metric = metric_of(trial);
            if i < k && metric != lower_edge {
                partition.bottom.push(trial.id);
            } else if i >= n - k && metric != upper_edge {
                partition.top.push(trial.id);
            } else {
                partition.middle.push(trial.id);
            }
        }
        partition
    }

    /// Build the exploit instructions for one round.
    ///
    /// Only trials whose `time_attr` advanced by at least the interval since
    /// their last round are due; only due bottom-quantile trials are targeted.
    pub fn plan(&mut self, snapshot: &PopulationSnapshot) -> PerturbationPlan {
        let attr = self.config.time_attr;
        let ready: Vec<(TrialId, u64)> = self
            .rankable(snapshot)
            .into_iter()
            .filter(|t| {
                t.time_value(attr).saturating_sub(t.last_perturbation_time) >= self.config.interval
            })
            .map(|t| (t.id, t.time_value(attr)))
            .collect();
        if ready.is_empty() {
            return PerturbationPlan {
                generation: snapshot.generation,
                ..PerturbationPlan::default()
            };
        }

        let partition = self.partition(snapshot);
        let donors: Vec<&Trial> = partition
            .top
            .iter()
            .filter_map(|id| snapshot.get(*id))
            .filter(|t| t.last_checkpoint.is_some())
            .collect();
        let due: HashSet<TrialId> = ready.iter().map(|(id, _)| *id).collect();

        let mut exploits = Vec::new();
        for target in partition.bottom.iter().filter(|id| due.contains(id)) {
            let Some(donor) = donors.choose(&mut self.rng).copied() else {
                debug!(trial = %target, "No donor with a checkpoint; skipping exploit");
                continue;
            };
            let Some(checkpoint) = donor.last_checkpoint.clone() else {
                continue;
            };
            let (config, mutations) = self.explore(&donor.config);
            exploits.push(Exploit {
                target: *target,
                donor: donor.id,
                donor_checkpoint: checkpoint,
                config,
                mutations,
            });
        }

        PerturbationPlan {
            generation: snapshot.generation,
            ready,
            partition,
            exploits,
        }
    }

    /// Mutate every hyperparameter named in the mutation specs.
    pub fn explore(&mut self, config: &Configuration) -> (Configuration, Vec<Mutation>) {
        let mut next = config.clone();
        let mut mutations = Vec::with_capacity(self.config.mutations.len());
        for (name, spec) in &self.config.mutations {
            let from = config.get(name).cloned();
            let (to, kind) = mutate(
                spec,
                from.as_ref(),
                self.config.resample_probability,
                &self.config.perturbation_factors,
                &mut self.rng,
            );
            next = next.with(name.clone(), to.clone());
            mutations.push(Mutation {
                name: name.clone(),
                from,
                to,
                kind,
            });
        }
        (next, mutations)
    }
}

fn metric_of(trial: &Trial) -> f64 {
    trial.last_metric.unwrap_or(f64::NAN)
}

fn mutate<R: Rng + ?Sized>(
    spec: &MutationSpec,
    current: Option<&ParamValue>,
    resample_probability: f64,
    factors: &[f64],
    rng: &mut R,
) -> (ParamValue, MutationKind) {
    match spec {
        MutationSpec::Discrete { candidates } => {
            let value = candidates
                .choose(rng)
                .cloned()
                .or_else(|| current.cloned())
                .unwrap_or(ParamValue::Bool(false));
            (value, MutationKind::Chosen)
        }
        MutationSpec::Continuous { distribution, .. } => {
            let bounds = spec.effective_bounds();
            let scalable = current.and_then(|v| v.as_f64().map(|f| (v, f)));
            let factor = factors.choose(rng).copied();
            let resample = rng.gen_bool(resample_probability.clamp(0.0, 1.0));

            let (value, kind) = match (scalable, factor) {
                (Some((original, value)), Some(factor)) if !resample => {
                    let scaled = value * factor;
                    let scaled = bounds.map_or(scaled, |b| b.clamp(scaled));
                    let value = match original {
                        ParamValue::Int(_) => ParamValue::Int(scaled.round() as i64),
                        _ => ParamValue::Float(scaled),
                    };
                    (value, MutationKind::Scaled { factor })
                }
                _ => (distribution.sample(rng), MutationKind::Resampled),
            };

            let value = match (bounds, value) {
                (Some(b), ParamValue::Float(v)) => ParamValue::Float(b.clamp(v)),
                (Some(b), ParamValue::Int(v)) => {
                    ParamValue::Int(b.clamp(v as f64).round() as i64)
                }
                (_, value) => value,
            };
            (value, kind)
        }
    }
}
