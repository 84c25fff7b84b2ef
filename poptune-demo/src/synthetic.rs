//! Stand-in for an SGD-trained convnet: accuracy climbs at a rate set by
//! `lr` and `momentum`, with evaluation noise.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use poptune_core::{StepContext, StepResult, Trainable, TrainingStepError, TrialId};

const BEST_LR: f64 = 0.05;
const BEST_MOMENTUM: f64 = 0.9;

/// Everything needed to resume training.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    pub step: u64,
    /// Noise-free accuracy of the weights.
    pub quality: f64,
}

impl ModelState {
    pub fn evaluate(&self) -> f64 {
        self.quality
    }
}

pub struct SyntheticConvNet {
    state: ModelState,
    rng: StdRng,
}

impl SyntheticConvNet {
    pub fn boxed(trial: TrialId, seed: Option<u64>) -> Box<dyn Trainable> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ (u64::from(trial.index()) << 32)),
            None => StdRng::from_entropy(),
        };
        Box::new(Self {
            state: ModelState::default(),
            rng,
        })
    }

    /// Fraction of the remaining error one epoch removes.
    fn learning_rate_gain(lr: f64, momentum: f64) -> f64 {
        let lr_fit = (-(lr.ln() - BEST_LR.ln()).powi(2) / 4.0).exp();
        let momentum_fit = (1.0 - (momentum - BEST_MOMENTUM).abs() * 2.0).max(0.05);
        0.2 * lr_fit * momentum_fit
    }
}

#[async_trait]
impl Trainable for SyntheticConvNet {
    async fn run_step(&mut self, ctx: StepContext) -> Result<StepResult, TrainingStepError> {
        if let Some(resume) = &ctx.resume {
            self.state = serde_json::from_slice(&resume.blob)
                .map_err(|e| TrainingStepError::new(ctx.trial, format!("bad checkpoint: {e}")))?;
        }

        let lr = ctx.config.get_f64("lr").unwrap_or(0.01);
        let momentum = ctx.config.get_f64("momentum").unwrap_or(0.9);
        if !lr.is_finite() || lr <= 0.0 {
            return Err(TrainingStepError::new(ctx.trial, format!("invalid lr {lr}")));
        }

        // One epoch of "training".
        tokio::time::sleep(Duration::from_millis(5)).await;
        let gain = Self::learning_rate_gain(lr, momentum);
        let mut quality = self.state.quality + gain * (1.0 - self.state.quality);
        if lr > 0.5 && self.rng.gen_bool(0.3) {
            // Large steps occasionally overshoot.
            quality *= 0.9;
        }
        self.state.quality = quality.clamp(0.0, 1.0);
        self.state.step += 1;

        let accuracy = (self.state.quality + self.rng.gen_range(-0.01..0.01)).clamp(0.0, 1.0);
        let mut result = StepResult::new(self.state.step, accuracy);
        if ctx.checkpoint_requested {
            let blob = serde_json::to_vec(&self.state)
                .map_err(|e| TrainingStepError::new(ctx.trial, e.to_string()))?;
            result = result.with_checkpoint(blob);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_peaks_near_best_hyperparameters() {
        let best = SyntheticConvNet::learning_rate_gain(BEST_LR, BEST_MOMENTUM);
        assert!(best > SyntheticConvNet::learning_rate_gain(0.9, BEST_MOMENTUM));
        assert!(best > SyntheticConvNet::learning_rate_gain(BEST_LR, 0.1));
        assert!(best <= 0.2);
    }
}
