//! Scheduler loop — drives every trial one reporting unit per tick, applies
//! stop decisions, and runs perturbation rounds when trials fall due.

use chrono::Utc;
use futures::FutureExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::TuneAnalysis;
use crate::checkpoint::{CheckpointLedger, CheckpointStore};
use crate::config::{TimeAttr, TuneConfig};
use crate::error::{PopulationError, Result, TrainingStepError};
use crate::perturbation::{Exploit, PerturbationConfig, PerturbationEngine};
use crate::registry::PopulationRegistry;
use crate::space::Configuration;
use crate::stop::{CompositeStopPolicy, StopPolicy};
use crate::trainable::{Resume, StepContext, StepResult, Trainable, TrainableFactory};
use crate::trial::{Trial, TrialId, TrialOutcome, TrialStatus};

/// A trial's training state between steps.
struct Worker {
    /// Taken while a step is in flight.
    trainable: Option<Box<dyn Trainable>>,
    resume: Option<Resume>,
    cancel: CancellationToken,
}

impl Worker {
    fn new(trainable: Box<dyn Trainable>) -> Self {
        Self {
            trainable: Some(trainable),
            resume: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// What came back from one worker task. `None` means the step never ran.
type StepOutput = (
    TrialId,
    Box<dyn Trainable>,
    Option<std::result::Result<StepResult, TrainingStepError>>,
);

/// Population-based training scheduler.
pub struct Scheduler {
    config: TuneConfig,
    registry: Arc<PopulationRegistry>,
    ledger: Arc<CheckpointLedger>,
    engine: PerturbationEngine,
    stopper: Box<dyn StopPolicy>,
    factory: Arc<dyn TrainableFactory>,
    workers: HashMap<TrialId, Worker>,
    shutdown: CancellationToken,
    run_id: Uuid,
    ticks: u64,
    rounds: u64,
}

impl Scheduler {
    /// Validate the configuration and register a freshly sampled population.
    pub fn new(
        config: TuneConfig,
        store: Arc<dyn CheckpointStore>,
        factory: impl TrainableFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            warn!("{warning}");
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let factory: Arc<dyn TrainableFactory> = Arc::new(factory);
        let registry = Arc::new(PopulationRegistry::new(config.population_size));
        let mut workers = HashMap::with_capacity(config.population_size);
        for index in 0..config.population_size as u32 {
            let id = TrialId::new(index);
            let trial_config = initial_config(&config, &mut rng);
            debug!(trial = %id, config = %trial_config, "Sampled initial configuration");
            registry.register(Trial::new(id, trial_config))?;
            workers.insert(id, Worker::new(factory.create(id)));
        }

        let engine = PerturbationEngine::new(
            PerturbationConfig::from(&config),
            config.seed.map(|s| s.wrapping_add(1)),
        );
        let stopper = Box::new(CompositeStopPolicy::from_config(&config.stop, config.mode));
        let ledger = Arc::new(CheckpointLedger::from_config(store, &config));

        Ok(Self {
            config,
            registry,
            ledger,
            engine,
            stopper,
            factory,
            workers,
            shutdown: CancellationToken::new(),
            run_id: Uuid::new_v4(),
            ticks: 0,
            rounds: 0,
        })
    }

    /// Replace the stop policy built from `config.stop`.
    pub fn with_stop_policy(mut self, policy: impl StopPolicy + 'static) -> Self {
        self.stopper = Box::new(policy);
        self
    }

    pub fn registry(&self) -> Arc<PopulationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn ledger(&self) -> Arc<CheckpointLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Cancel to stop every live trial at the next tick boundary.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until stop-all, shutdown, or every trial has finished.
    pub async fn run(mut self) -> Result<TuneAnalysis> {
        let started_at = Utc::now();
        info!(
            run = %self.run_id,
            name = %self.config.name,
            population = self.config.population_size,
            metric = %self.config.metric,
            mode = %self.config.mode,
            "Starting population-based training"
        );

        for id in self.registry.ids_with_status(TrialStatus::Pending) {
            self.registry.set_status(id, TrialStatus::Running)?;
        }

        loop {
            if self.shutdown.is_cancelled() {
                info!(run = %self.run_id, "Shutdown requested; stopping live trials");
                self.stop_live(TrialOutcome::Shutdown)?;
                break;
            }

            let running = self.registry.ids_with_status(TrialStatus::Running);
            if running.is_empty() {
                break;
            }
            self.ticks += 1;

            let (outputs, lost) = self.advance(&running)?;
            let outputs = join_all(outputs).await;
            let stop_all = self.collect(outputs, &running, lost).await?;
            if stop_all {
                info!(run = %self.run_id, tick = self.ticks, "Stop policy ended the run");
                self.stop_live(TrialOutcome::StoppedAll)?;
                break;
            }

            self.perturb().await?;
        }

        let collected = self.ledger.collect_garbage().await;
        if collected > 0 {
            debug!(collected, "Collected orphaned checkpoints");
        }

        let trials = self.registry.snapshot().trials;
        let checkpoints = trials
            .iter()
            .map(|t| (t.id, self.ledger.lineage(t.id)))
            .collect::<BTreeMap<_, _>>();
        let analysis = TuneAnalysis {
            run_id: self.run_id,
            name: self.config.name.clone(),
            metric: self.config.metric.clone(),
            mode: self.config.mode,
            trials,
            checkpoints,
            ticks: self.ticks,
            perturbation_rounds: self.rounds,
            started_at,
            finished_at: Utc::now(),
        };

        let counts = analysis.outcome_counts();
        info!(
            run = %self.run_id,
            ticks = self.ticks,
            rounds = self.rounds,
            completed = counts.completed,
            stopped = counts.stopped,
            shutdown = counts.shutdown,
            errored = counts.errored,
            "Run finished"
        );
        Ok(analysis)
    }

    /// Spawn one step for every running trial, bounded by `max_concurrent`.
    ///
    /// Returns the task set and the trials that had no trainable to run.
    fn advance(&mut self, running: &[TrialId]) -> Result<(JoinSet<StepOutput>, Vec<TrialId>)> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let round_possible = self.round_possible(running)?;
        let mut tasks = JoinSet::new();
        let mut lost = Vec::new();

        for id in running {
            let trial = self.registry.get(*id)?;
            let checkpoint_requested = round_possible || self.checkpoint_due(&trial);
            let Some(worker) = self.workers.get_mut(id) else {
                lost.push(*id);
                continue;
            };
            let Some(mut trainable) = worker.trainable.take() else {
                lost.push(*id);
                continue;
            };

            let ctx = StepContext {
                trial: *id,
                config: trial.config.clone(),
                step: trial.step,
                resume: worker.resume.take(),
                checkpoint_requested,
                cancel: worker.cancel.clone(),
            };
            let permits = Arc::clone(&permits);
            let trial_id = *id;
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (trial_id, trainable, None);
                };
                if ctx.cancel.is_cancelled() {
                    return (trial_id, trainable, None);
                }
                let result = AssertUnwindSafe(trainable.run_step(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(TrainingStepError::new(trial_id, "training step panicked"))
                    });
                (trial_id, trainable, Some(result))
            });
        }
        Ok((tasks, lost))
    }

    /// Apply every step result in population order.
    ///
    /// Returns whether the stop policy decided to stop the whole population.
    async fn collect(
        &mut self,
        mut outputs: Vec<StepOutput>,
        running: &[TrialId],
        mut lost: Vec<TrialId>,
    ) -> Result<bool> {
        outputs.sort_by_key(|(id, _, _)| *id);
        let returned: HashSet<TrialId> = outputs.iter().map(|(id, _, _)| *id).collect();
        let missing: Vec<TrialId> = running
            .iter()
            .filter(|id| !returned.contains(id) && !lost.contains(id))
            .copied()
            .collect();
        lost.extend(missing);

        let mut stop_all = false;
        for (id, trainable, result) in outputs {
            if let Some(worker) = self.workers.get_mut(&id) {
                worker.trainable = Some(trainable);
            }
            match result {
                None => debug!(trial = %id, "Step skipped for cancelled trial"),
                Some(Ok(step)) => stop_all |= self.on_step(id, step).await?,
                Some(Err(e)) => self.on_failure(id, e).await?,
            }
        }

        for id in lost {
            self.retire(
                id,
                TrialOutcome::Errored {
                    message: "worker task was lost".to_string(),
                },
            )?;
        }
        Ok(stop_all)
    }

    /// Forward one report, persist its checkpoint, and consult the stop policy.
    async fn on_step(&mut self, id: TrialId, result: StepResult) -> Result<bool> {
        let report = match self.registry.report(id, result.step, result.metric) {
            Ok(report) => report,
            Err(PopulationError::StaleReport { step, current, .. }) => {
                warn!(trial = %id, step, current, "Dropping stale report");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(trial = %id, step = report.step, metric = report.metric, "Report accepted");

        if let Some(blob) = result.checkpoint {
            match self.ledger.save(id, report.step, report.metric, blob).await {
                Ok(checkpoint) => {
                    self.registry.record_checkpoint(id, checkpoint)?;
                    let pruned = self.ledger.enforce_retention(id).await;
                    if !pruned.is_empty() {
                        debug!(trial = %id, pruned = pruned.len(), "Pruned checkpoints");
                    }
                }
                Err(e) => warn!(trial = %id, step = report.step, error = %e, "Failed to save checkpoint"),
            }
        }

        let stop_trial = self.stopper.should_stop(id, &report);
        let stop_all = self.stopper.should_stop_all();
        if result.done {
            self.retire(id, TrialOutcome::Completed)?;
        } else if stop_trial && !stop_all {
            self.retire(id, TrialOutcome::StoppedByPolicy)?;
        }
        Ok(stop_all)
    }

    /// Restart a failed trial if it has failures left, otherwise mark it errored.
    async fn on_failure(&mut self, id: TrialId, error: TrainingStepError) -> Result<()> {
        let failures = self.registry.record_failure(id)?;
        if failures > self.config.max_failures {
            self.retire(
                id,
                TrialOutcome::Errored {
                    message: error.message,
                },
            )?;
            return Ok(());
        }

        warn!(
            trial = %id,
            failures,
            max_failures = self.config.max_failures,
            error = %error,
            "Restarting trial from its latest checkpoint"
        );
        let resume = match self.registry.get(id)?.last_checkpoint {
            Some(checkpoint) => match self.ledger.load(&checkpoint).await {
                Ok(blob) => Some(Resume { checkpoint, blob }),
                Err(e) => {
                    warn!(trial = %id, error = %e, "Checkpoint unreadable; restarting from scratch");
                    None
                }
            },
            None => None,
        };
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.trainable = Some(self.factory.create(id));
            worker.resume = resume;
        }
        Ok(())
    }

    /// Finish a trial and release its trainable.
    fn retire(&mut self, id: TrialId, outcome: TrialOutcome) -> Result<()> {
        if self.registry.finish(id, outcome.clone())? {
            match &outcome {
                TrialOutcome::Errored { message } => {
                    warn!(trial = %id, error = %message, "Trial errored")
                }
                _ => info!(trial = %id, outcome = %outcome, "Trial finished"),
            }
        }
        if let Some(worker) = self.workers.remove(&id) {
            worker.cancel.cancel();
        }
        Ok(())
    }

    fn stop_live(&mut self, outcome: TrialOutcome) -> Result<()> {
        for id in self.registry.live_ids() {
            self.retire(id, outcome.clone())?;
        }
        Ok(())
    }

    fn checkpoint_due(&self, trial: &Trial) -> bool {
        let interval = self.config.checkpoint_interval;
        interval > 0 && (trial.step + 1) % interval == 0
    }

    /// Whether any running trial can fall due for perturbation after this tick.
    fn round_possible(&self, running: &[TrialId]) -> Result<bool> {
        let interval = self.config.perturbation_interval;
        for id in running {
            let trial = self.registry.get(*id)?;
            let next = match self.config.time_attr {
                TimeAttr::TrainingIteration => trial.iterations + 1,
                TimeAttr::Step => trial.step + 1,
            };
            if next.saturating_sub(trial.last_perturbation_time) >= interval {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Plan a perturbation round on a fresh snapshot and apply its exploits.
    async fn perturb(&mut self) -> Result<()> {
        let snapshot = self.registry.snapshot();
        let plan = self.engine.plan(&snapshot);
        if plan.is_empty() {
            return Ok(());
        }
        self.rounds += 1;
        self.registry.mark_perturbed(&plan.ready)?;
        info!(
            round = self.rounds,
            generation = plan.generation,
            ready = plan.ready.len(),
            bottom = ?plan.partition.bottom,
            top = ?plan.partition.top,
            exploits = plan.exploits.len(),
            "Perturbation round"
        );

        for exploit in &plan.exploits {
            self.apply_exploit(exploit).await?;
        }

        let collected = self.ledger.collect_garbage().await;
        if collected > 0 {
            debug!(collected, "Collected orphaned checkpoints");
        }
        Ok(())
    }

    /// Pause the target, read the donor checkpoint, then swap state in.
    ///
    /// An unreadable donor checkpoint aborts this exploit only; the target
    /// resumes unperturbed.
    async fn apply_exploit(&mut self, exploit: &Exploit) -> Result<()> {
        let target = exploit.target;
        match self.registry.begin_perturbation(target) {
            Ok(()) => {}
            Err(
                e @ (PopulationError::PerturbationInFlight { .. }
                | PopulationError::InvalidTransition { .. }),
            ) => {
                warn!(trial = %target, error = %e, "Skipping exploit");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let blob = match self.ledger.load(&exploit.donor_checkpoint).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(
                    trial = %target,
                    donor = %exploit.donor,
                    error = %e,
                    "Donor checkpoint unreadable; exploit aborted"
                );
                self.registry.abort_perturbation(target)?;
                return Ok(());
            }
        };

        self.registry.commit_exploit(exploit, self.config.time_attr)?;
        self.ledger.reset_lineage(target);
        if let Some(worker) = self.workers.get_mut(&target) {
            worker.resume = Some(Resume {
                checkpoint: exploit.donor_checkpoint.clone(),
                blob,
            });
        }
        for mutation in &exploit.mutations {
            debug!(
                trial = %target,
                param = %mutation.name,
                to = %mutation.to,
                kind = ?mutation.kind,
                "Mutated hyperparameter"
            );
        }
        info!(
            trial = %target,
            donor = %exploit.donor,
            step = exploit.donor_checkpoint.step(),
            config = %exploit.config,
            "Exploited donor"
        );
        Ok(())
    }
}

/// Sample the search space, then any mutation-only hyperparameters.
fn initial_config(config: &TuneConfig, rng: &mut StdRng) -> Configuration {
    let mut sampled = config.search_space.sample(rng);
    for (name, spec) in &config.hyperparam_mutations {
        if sampled.get(name).is_none() {
            sampled = sampled.with(name.clone(), spec.sample(rng));
        }
    }
    sampled
}

async fn join_all(mut tasks: JoinSet<StepOutput>) -> Vec<StepOutput> {
    let mut outputs = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(output) => outputs.push(output),
            Err(e) => warn!(error = %e, "Worker task failed to join"),
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::space::{Domain, MutationSpec};
    use async_trait::async_trait;

    /// Metric rises by `rate` per step; counts steps in its checkpoint.
    struct Linear {
        rate: f64,
        step: u64,
    }

    #[async_trait]
    impl Trainable for Linear {
        async fn run_step(
            &mut self,
            ctx: StepContext,
        ) -> std::result::Result<StepResult, TrainingStepError> {
            if let Some(resume) = &ctx.resume {
                self.step = resume.checkpoint.step();
            }
            self.step += 1;
            let metric = self.rate * self.step as f64;
            let mut result = StepResult::new(self.step, metric);
            if ctx.checkpoint_requested {
                result = result.with_checkpoint(self.step.to_le_bytes().to_vec());
            }
            Ok(result)
        }
    }

    fn config(population: usize) -> TuneConfig {
        TuneConfig {
            population_size: population,
            seed: Some(7),
            ..TuneConfig::default()
        }
    }

    fn linear_factory() -> impl TrainableFactory {
        |id: TrialId| -> Box<dyn Trainable> {
            Box::new(Linear {
                rate: 0.01 * (id.index() + 1) as f64,
                step: 0,
            })
        }
    }

    #[test]
    fn test_new_samples_search_space_and_mutations() {
        let mut cfg = config(3);
        cfg.search_space = crate::space::SearchSpace::new().with(
            "lr",
            Domain::Uniform {
                min: 0.001,
                max: 1.0,
            },
        );
        cfg.hyperparam_mutations.insert(
            "batch".into(),
            MutationSpec::discrete([16i64, 32, 64]),
        );
        let scheduler = Scheduler::new(
            cfg,
            Arc::new(InMemoryCheckpointStore::new()),
            linear_factory(),
        )
        .unwrap();

        let snapshot = scheduler.registry().snapshot();
        assert_eq!(snapshot.trials.len(), 3);
        for trial in &snapshot.trials {
            let lr = trial.config.get_f64("lr").unwrap();
            assert!((0.001..=1.0).contains(&lr));
            assert!(trial.config.get("batch").is_some());
            assert_eq!(trial.status, TrialStatus::Pending);
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = Scheduler::new(
            config(0),
            Arc::new(InMemoryCheckpointStore::new()),
            linear_factory(),
        );
        assert!(matches!(result, Err(crate::error::PoptuneError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_until_max_iterations() {
        let mut cfg = config(4);
        cfg.stop.max_iterations = Some(12);
        let scheduler = Scheduler::new(
            cfg,
            Arc::new(InMemoryCheckpointStore::new()),
            linear_factory(),
        )
        .unwrap();
        let analysis = scheduler.run().await.unwrap();

        assert!(analysis.trials.iter().all(|t| t.is_finished()));
        assert!(analysis.perturbation_rounds >= 2);
        assert_eq!(analysis.outcome_counts().stopped, 4);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_tick() {
        let scheduler = Scheduler::new(
            config(2),
            Arc::new(InMemoryCheckpointStore::new()),
            linear_factory(),
        )
        .unwrap();
        scheduler.shutdown_handle().cancel();
        let analysis = scheduler.run().await.unwrap();

        assert_eq!(analysis.ticks, 0);
        assert_eq!(analysis.outcome_counts().shutdown, 2);
    }

    #[test]
    fn test_checkpoint_cadence() {
        let scheduler = Scheduler::new(
            config(1),
            Arc::new(InMemoryCheckpointStore::new()),
            linear_factory(),
        )
        .unwrap();
        let mut trial = Trial::new(TrialId::new(0), Configuration::new());
        trial.step = 3;
        assert!(!scheduler.checkpoint_due(&trial));
        trial.step = 4;
        assert!(scheduler.checkpoint_due(&trial));
    }
}
