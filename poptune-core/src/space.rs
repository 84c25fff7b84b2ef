//! Hyperparameter values, configurations, and the distributions they are drawn from.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(_) | ParamValue::Text(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// An immutable mapping from hyperparameter name to value.
///
/// Updates produce a new configuration; a trial's configuration is replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ParamValue>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    /// Return a copy of this configuration with `name` set to `value`.
    pub fn with(&self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let mut values = self.0.clone();
        values.insert(name.into(), value.into());
        Self(values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Distribution a hyperparameter is sampled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    Uniform { min: f64, max: f64 },
    LogUniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
    /// Inclusive on both ends.
    IntRange { min: i64, max: i64 },
    Choice { values: Vec<ParamValue> },
    Constant { value: ParamValue },
}

impl Domain {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            Domain::Uniform { min, max } => ParamValue::Float(uniform(rng, *min, *max)),
            Domain::LogUniform { min, max } => {
                ParamValue::Float(uniform(rng, min.ln(), max.ln()).exp())
            }
            Domain::Normal { mean, std } => {
                let value = Normal::new(*mean, *std)
                    .map(|d| d.sample(rng))
                    .unwrap_or(*mean);
                ParamValue::Float(value)
            }
            Domain::IntRange { min, max } => {
                if max > min {
                    ParamValue::Int(rng.gen_range(*min..=*max))
                } else {
                    ParamValue::Int(*min)
                }
            }
            Domain::Choice { values } => values
                .choose(rng)
                .cloned()
                .unwrap_or(ParamValue::Bool(false)),
            Domain::Constant { value } => value.clone(),
        }
    }

    /// The closed interval implied by the distribution, when it has one.
    pub fn bounds(&self) -> Option<Bounds> {
        match self {
            Domain::Uniform { min, max } | Domain::LogUniform { min, max } => Some(Bounds {
                min: *min,
                max: *max,
            }),
            Domain::IntRange { min, max } => Some(Bounds {
                min: *min as f64,
                max: *max as f64,
            }),
            Domain::Normal { .. } | Domain::Choice { .. } | Domain::Constant { .. } => None,
        }
    }

    /// Whether every value this domain produces is numeric.
    pub fn is_numeric(&self) -> bool {
        match self {
            Domain::Uniform { .. }
            | Domain::LogUniform { .. }
            | Domain::Normal { .. }
            | Domain::IntRange { .. } => true,
            Domain::Choice { values } => values.iter().all(ParamValue::is_numeric),
            Domain::Constant { value } => value.is_numeric(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Domain::Uniform { min, max } if !(min.is_finite() && max.is_finite() && min <= max) => {
                Err(format!("uniform range [{min}, {max}] is invalid"))
            }
            Domain::LogUniform { min, max } if !(*min > 0.0 && min <= max && max.is_finite()) => {
                Err(format!("log-uniform range [{min}, {max}] must be positive and ordered"))
            }
            Domain::Normal { std, .. } if !(*std > 0.0 && std.is_finite()) => {
                Err(format!("normal std {std} must be positive"))
            }
            Domain::IntRange { min, max } if min > max => {
                Err(format!("integer range [{min}, {max}] is inverted"))
            }
            Domain::Choice { values } if values.is_empty() => {
                Err("choice has no values".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min { rng.gen_range(min..max) } else { min }
}

/// Closed numeric interval used to clamp mutated values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// How the explore step may change one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationSpec {
    /// Resampled from `distribution` or scaled by a perturbation factor, then clamped.
    Continuous {
        distribution: Domain,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<Bounds>,
    },
    /// Replaced by a uniformly chosen candidate.
    Discrete { candidates: Vec<ParamValue> },
}

impl MutationSpec {
    pub fn continuous(distribution: Domain) -> Self {
        MutationSpec::Continuous {
            distribution,
            bounds: None,
        }
    }

    pub fn discrete(candidates: impl IntoIterator<Item = impl Into<ParamValue>>) -> Self {
        MutationSpec::Discrete {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// Declared bounds, falling back to the bounds of the resample distribution.
    pub fn effective_bounds(&self) -> Option<Bounds> {
        match self {
            MutationSpec::Continuous {
                bounds: Some(bounds),
                ..
            } => Some(*bounds),
            MutationSpec::Continuous { distribution, .. } => distribution.bounds(),
            MutationSpec::Discrete { .. } => None,
        }
    }

    /// Draw a fresh value for a trial that has none yet.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            MutationSpec::Continuous { distribution, .. } => {
                let value = distribution.sample(rng);
                match (self.effective_bounds(), &value) {
                    (Some(b), ParamValue::Float(v)) => ParamValue::Float(b.clamp(*v)),
                    _ => value,
                }
            }
            MutationSpec::Discrete { candidates } => candidates
                .choose(rng)
                .cloned()
                .unwrap_or(ParamValue::Bool(false)),
        }
    }

    /// Whether `value` is one this spec could have produced.
    pub fn admits(&self, value: &ParamValue) -> bool {
        match self {
            MutationSpec::Continuous { .. } => match (self.effective_bounds(), value.as_f64()) {
                (Some(b), Some(v)) => b.contains(v),
                (None, Some(_)) => true,
                (_, None) => false,
            },
            MutationSpec::Discrete { candidates } => candidates.contains(value),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            MutationSpec::Continuous {
                distribution,
                bounds,
            } => {
                distribution.validate()?;
                if !distribution.is_numeric() {
                    return Err("continuous mutation needs a numeric distribution".to_string());
                }
                if let Some(b) = bounds {
                    if !(b.min <= b.max) {
                        return Err(format!("bounds [{}, {}] are inverted", b.min, b.max));
                    }
                }
                Ok(())
            }
            MutationSpec::Discrete { candidates } if candidates.is_empty() => {
                Err("discrete mutation has no candidates".to_string())
            }
            MutationSpec::Discrete { .. } => Ok(()),
        }
    }
}

/// Initial sampling space for the population.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace(BTreeMap<String, Domain>);

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, domain: Domain) -> Self {
        self.0.insert(name.into(), domain);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Domain)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sample one configuration; every domain is drawn independently.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        Configuration(
            self.0
                .iter()
                .map(|(name, domain)| (name.clone(), domain.sample(rng)))
                .collect(),
        )
    }
}
