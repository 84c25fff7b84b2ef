//! Configuration system for poptune.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Environment variables are prefixed with `POPTUNE_` and nest with `__`
//! (`POPTUNE_STOP__METRIC_THRESHOLD=0.96`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::space::{MutationSpec, SearchSpace};

/// Optimization direction for the tracked metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Max,
    Min,
}

impl Mode {
    /// Order two metrics so that the better one compares greater.
    pub fn compare(&self, a: f64, b: f64) -> Ordering {
        match self {
            Mode::Max => a.total_cmp(&b),
            Mode::Min => b.total_cmp(&a),
        }
    }

    /// NaN is never better than anything, and nothing is better than NaN.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        !candidate.is_nan()
            && !incumbent.is_nan()
            && self.compare(candidate, incumbent) == Ordering::Greater
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Max => write!(f, "max"),
            Mode::Min => write!(f, "min"),
        }
    }
}

/// The time attribute perturbation readiness is keyed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAttr {
    /// Number of reports the trial has made.
    #[default]
    TrainingIteration,
    /// The step counter reported by the trainable.
    Step,
}

/// Which checkpoints survive retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Keep the newest `keep_checkpoints_num`.
    #[default]
    Recent,
    /// Keep the best-scoring, always including the newest.
    Score,
}

/// Whether hitting `max_iterations` stops one trial or the whole population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationScope {
    Trial,
    #[default]
    Population,
}

/// Stop-policy parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    /// Latch stop-all once any metric passes this value (in the optimization direction).
    #[serde(default)]
    pub metric_threshold: Option<f64>,
    /// Stop once a trial's step counter reaches this bound.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub max_iterations_scope: IterationScope,
    /// Stop a trial after this many reports without improvement.
    #[serde(default)]
    pub plateau_patience: Option<usize>,
    #[serde(default)]
    pub plateau_min_delta: f64,
}

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive for the stderr layer (e.g. `info`, `poptune_core=debug`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for JSON logs; file logging is off when unset.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
    #[serde(default = "default_json_level")]
    pub json_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_dir: None,
            json_level: default_json_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_level() -> String {
    "debug".to_string()
}

/// Tuning run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Run name used in logs and reports.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub time_attr: TimeAttr,
    /// Name of the tracked metric.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default)]
    pub mode: Mode,
    /// Minimum `time_attr` advance between perturbations of one trial.
    #[serde(default = "default_perturbation_interval")]
    pub perturbation_interval: u64,
    /// Request a checkpoint every N steps (0 disables the regular cadence).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints_num: usize,
    #[serde(default)]
    pub checkpoint_retention: Retention,
    /// Fraction of ranked trials in each of the top and bottom quantiles.
    #[serde(default = "default_quantile_fraction")]
    pub quantile_fraction: f64,
    /// Probability a continuous hyperparameter is resampled instead of scaled.
    #[serde(default = "default_resample_probability")]
    pub resample_probability: f64,
    #[serde(default = "default_perturbation_factors")]
    pub perturbation_factors: Vec<f64>,
    #[serde(default)]
    pub hyperparam_mutations: BTreeMap<String, MutationSpec>,
    /// Initial sampling space for each trial's configuration.
    #[serde(default)]
    pub search_space: SearchSpace,
    #[serde(default)]
    pub stop: StopConfig,
    /// Maximum number of training steps in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Restarts allowed per trial after a failed step.
    #[serde(default)]
    pub max_failures: u32,
    /// Seed for sampling and perturbation; entropy-seeded when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            time_attr: TimeAttr::default(),
            metric: default_metric(),
            mode: Mode::default(),
            perturbation_interval: default_perturbation_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            population_size: default_population_size(),
            keep_checkpoints_num: default_keep_checkpoints(),
            checkpoint_retention: Retention::default(),
            quantile_fraction: default_quantile_fraction(),
            resample_probability: default_resample_probability(),
            perturbation_factors: default_perturbation_factors(),
            hyperparam_mutations: BTreeMap::new(),
            search_space: SearchSpace::default(),
            stop: StopConfig::default(),
            max_concurrent: default_max_concurrent(),
            max_failures: 0,
            seed: None,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_name() -> String {
    "pbt".to_string()
}

fn default_metric() -> String {
    "mean_accuracy".to_string()
}

fn default_perturbation_interval() -> u64 {
    5
}

fn default_checkpoint_interval() -> u64 {
    5
}

fn default_population_size() -> usize {
    4
}

fn default_keep_checkpoints() -> usize {
    4
}

fn default_quantile_fraction() -> f64 {
    0.25
}

fn default_resample_probability() -> f64 {
    0.25
}

fn default_perturbation_factors() -> Vec<f64> {
    vec![0.8, 1.2]
}

fn default_max_concurrent() -> usize {
    8
}

impl TuneConfig {
    /// Reject configurations the scheduler cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.population_size == 0 {
            problems.push("population_size must be at least 1".to_string());
        }
        if self.perturbation_interval == 0 {
            problems.push("perturbation_interval must be at least 1".to_string());
        }
        if self.keep_checkpoints_num == 0 {
            problems.push("keep_checkpoints_num must be at least 1".to_string());
        }
        if self.max_concurrent == 0 {
            problems.push("max_concurrent must be at least 1".to_string());
        }
        if !(self.quantile_fraction > 0.0 && self.quantile_fraction <= 0.5) {
            problems.push(format!(
                "quantile_fraction {} must be in (0, 0.5]",
                self.quantile_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.resample_probability) {
            problems.push(format!(
                "resample_probability {} must be in [0, 1]",
                self.resample_probability
            ));
        }
        if self.perturbation_factors.is_empty() {
            problems.push("perturbation_factors must not be empty".to_string());
        }
        if self
            .perturbation_factors
            .iter()
            .any(|f| !(f.is_finite() && *f > 0.0))
        {
            problems.push("perturbation_factors must be positive and finite".to_string());
        }
        if let Some(threshold) = self.stop.metric_threshold {
            if !threshold.is_finite() {
                problems.push("stop.metric_threshold must be finite".to_string());
            }
        }
        for (name, spec) in &self.hyperparam_mutations {
            if let Err(e) = spec.validate() {
                problems.push(format!("hyperparam_mutations.{name}: {e}"));
            }
        }
        for (name, domain) in self.search_space.iter() {
            if let Err(e) = domain.validate() {
                problems.push(format!("search_space.{name}: {e}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: problems.join("; "),
            })
        }
    }

    /// Soft warnings about settings that run but are likely mistakes.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.population_size < 4 {
            warnings.push(format!(
                "population_size is {} - quantiles of fewer than 4 trials rarely separate",
                self.population_size
            ));
        }
        if self.hyperparam_mutations.is_empty() {
            warnings.push("hyperparam_mutations is empty - explore will not change configs".into());
        }
        if self.checkpoint_interval == 0 {
            warnings.push(
                "checkpoint_interval is 0 - checkpoints are only taken on perturbation ticks"
                    .to_string(),
            );
        }
        if self.stop.metric_threshold.is_none() && self.stop.max_iterations.is_none() {
            warnings.push("no stop condition set - the run ends only when trials finish".into());
        }

        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `POPTUNE_`)
/// 3. The TOML file at `path`, if it exists
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&TuneConfig>,
) -> Result<TuneConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TuneConfig::default()));

    if let Some(path) = path {
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
    }

    figment = figment.merge(Env::prefixed("POPTUNE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TuneConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Domain;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = TuneConfig::default();
        assert_eq!(config.mode, Mode::Max);
        assert_eq!(config.perturbation_interval, 5);
        assert_eq!(config.keep_checkpoints_num, 4);
        assert_eq!(config.population_size, 4);
        assert_eq!(config.perturbation_factors, vec![0.8, 1.2]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_compare() {
        assert!(Mode::Max.is_better(0.9, 0.5));
        assert!(Mode::Min.is_better(0.5, 0.9));
        assert!(!Mode::Max.is_better(0.5, 0.5));
        assert!(!Mode::Max.is_better(f64::NAN, 0.96));
        assert!(!Mode::Min.is_better(f64::NAN, 0.96));
        assert!(!Mode::Max.is_better(0.5, f64::NAN));
    }

    #[test]
    fn test_validate_rejects_bad_quantile() {
        let config = TuneConfig {
            quantile_fraction: 0.75,
            ..TuneConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quantile_fraction"));
    }

    #[test]
    fn test_validate_reports_mutation_problems() {
        let mut config = TuneConfig::default();
        config
            .hyperparam_mutations
            .insert("momentum".into(), MutationSpec::Discrete { candidates: vec![] });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hyperparam_mutations.momentum"));
    }

    #[test]
    fn test_warnings_for_small_population() {
        let config = TuneConfig {
            population_size: 2,
            ..TuneConfig::default()
        };
        assert!(config.warnings().iter().any(|w| w.contains("population_size")));
    }

    #[test]
    fn test_load_config_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("poptune.toml");
        std::fs::write(
            &path,
            r#"
perturbation_interval = 3
mode = "min"

[stop]
metric_threshold = 0.1

[hyperparam_mutations.lr]
kind = "continuous"
distribution = { type = "log_uniform", min = 0.0001, max = 0.1 }

[hyperparam_mutations.momentum]
kind = "discrete"
candidates = [0.8, 0.9, 0.99]
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.perturbation_interval, 3);
        assert_eq!(config.mode, Mode::Min);
        assert_eq!(config.stop.metric_threshold, Some(0.1));
        assert_eq!(
            config.hyperparam_mutations.get("lr"),
            Some(&MutationSpec::continuous(Domain::LogUniform {
                min: 0.0001,
                max: 0.1
            }))
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.keep_checkpoints_num, 4);
    }

    #[test]
    fn test_serialized_config_loads_back() {
        let mut config = TuneConfig {
            name: "roundtrip".into(),
            checkpoint_retention: Retention::Score,
            seed: Some(9),
            ..TuneConfig::default()
        };
        config
            .hyperparam_mutations
            .insert("momentum".into(), MutationSpec::discrete([0.8, 0.9]));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("poptune.toml");
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = load_config(Some(&path), None).unwrap();
        assert_eq!(loaded.name, "roundtrip");
        assert_eq!(loaded.checkpoint_retention, Retention::Score);
        assert_eq!(loaded.seed, Some(9));
        assert_eq!(loaded.hyperparam_mutations, config.hyperparam_mutations);
        assert_eq!(loaded.logging, config.logging);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/poptune.toml")), None).unwrap();
        assert_eq!(config.population_size, 4);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let overrides = TuneConfig {
            population_size: 16,
            ..TuneConfig::default()
        };
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.population_size, 16);
    }
}
