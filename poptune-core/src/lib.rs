//! # poptune-core — population-based training scheduler
//!
//! Coordinates a fixed-size population of resumable trials. Each tick advances
//! every running trial by one report; on the perturbation interval the bottom
//! quantile is overwritten with mutated clones of top performers, using
//! checkpoints to transfer training state.
//!
//! ```ignore
//! let scheduler = Scheduler::new(config, Arc::new(InMemoryCheckpointStore::new()), factory)?;
//! let analysis = scheduler.run().await?;
//! let best = analysis.best_trial(Scope::Last);
//! ```

// Foundation
pub mod config;
pub mod error;
pub mod logging;
pub mod space;

// Population state
pub mod checkpoint;
pub mod registry;
pub mod trial;

// Policy
pub mod perturbation;
pub mod stop;

// Execution
pub mod analysis;
pub mod scheduler;
pub mod trainable;

// Re-exports
pub use analysis::{OutcomeCounts, Scope, TuneAnalysis};
pub use checkpoint::{
    CheckpointLease, CheckpointLedger, CheckpointRef, CheckpointStore, InMemoryCheckpointStore,
};
pub use config::{
    IterationScope, LoggingConfig, Mode, Retention, StopConfig, TimeAttr, TuneConfig, load_config,
};
pub use error::{
    CheckpointError, ConfigError, PopulationError, PoptuneError, Result, TrainingStepError,
};
pub use logging::init_logging;
pub use perturbation::{
    Exploit, Mutation, MutationKind, PerturbationConfig, PerturbationEngine, PerturbationPlan,
    QuantilePartition,
};
pub use registry::{PopulationRegistry, PopulationSnapshot, Report};
pub use scheduler::Scheduler;
pub use space::{Bounds, Configuration, Domain, MutationSpec, ParamValue, SearchSpace};
pub use stop::{CompositeStopPolicy, MaxIterationStopper, PlateauStopper, StopPolicy, ThresholdStopper};
pub use trainable::{Resume, StepContext, StepResult, Trainable, TrainableFactory};
pub use trial::{MetricPoint, Trial, TrialId, TrialOutcome, TrialStatus};
