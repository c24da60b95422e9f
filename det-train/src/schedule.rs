//! Learning rate schedule engine.

use crate::{
    common::*,
    config::{LrDecayMethod, Params, Strategy},
};

/// The linear scaling rule reference batch size.
const REFERENCE_BATCH_SIZE: f64 = 64.0;

/// Step thresholds and rates derived from the primary parameters.
///
/// Derived exactly once before the schedule is evaluated and never
/// recomputed mid-run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleParams {
    pub adjusted_learning_rate: f64,
    pub lr_warmup_init: f64,
    pub lr_warmup_step: i64,
    pub first_lr_drop_step: i64,
    pub second_lr_drop_step: i64,
    pub total_steps: i64,
}

impl ScheduleParams {
    pub fn from_params(params: &Params) -> Result<Self> {
        // batch_size is per-shard under the tpu strategy
        let effective_batch_size = match params.strategy {
            Strategy::Tpu => params.batch_size * params.num_shards,
            Strategy::Horovod | Strategy::Other => params.batch_size,
        } as f64;

        // learning rate is proportional to the effective batch size
        let adjusted_learning_rate =
            params.learning_rate.raw() * effective_batch_size / REFERENCE_BATCH_SIZE;
        let steps_per_epoch = params.num_examples_per_epoch as f64 / effective_batch_size;

        let steps_of = |epochs: R64| (epochs.raw() * steps_per_epoch).round() as i64;

        let derived = Self {
            adjusted_learning_rate,
            lr_warmup_init: params.lr_warmup_init.raw(),
            lr_warmup_step: steps_of(params.lr_warmup_epoch),
            first_lr_drop_step: steps_of(params.first_lr_drop_epoch),
            second_lr_drop_step: steps_of(params.second_lr_drop_epoch),
            total_steps: steps_of(params.num_epochs),
        };
        ensure!(
            derived.total_steps > 0,
            "total_steps must be positive, but got {}",
            derived.total_steps
        );
        Ok(derived)
    }

    fn warmup_lr(&self, step: i64) -> f64 {
        self.lr_warmup_init
            + step as f64 / self.lr_warmup_step as f64
                * (self.adjusted_learning_rate - self.lr_warmup_init)
    }
}

/// Learning rate as a pure function of the global step.
#[derive(Debug, Clone)]
pub enum LrSchedule {
    Stepwise { params: ScheduleParams },
    Cosine { params: ScheduleParams },
    Polynomial { params: ScheduleParams, power: f64 },
    Constant { lr: f64 },
}

impl LrSchedule {
    pub fn from_params(params: &Params) -> Result<Self> {
        let derived = ScheduleParams::from_params(params)?;

        let schedule = match params.lr_decay_method {
            LrDecayMethod::Stepwise => {
                info!("LR schedule method: stepwise");
                Self::Stepwise { params: derived }
            }
            LrDecayMethod::Cosine => {
                info!("LR schedule method: cosine");
                Self::Cosine { params: derived }
            }
            LrDecayMethod::Polynomial => {
                info!("LR schedule method: polynomial");
                Self::Polynomial {
                    params: derived,
                    power: params.poly_lr_power.raw(),
                }
            }
            LrDecayMethod::Constant => {
                info!("LR schedule method: constant");
                Self::Constant {
                    lr: derived.adjusted_learning_rate,
                }
            }
        };
        Ok(schedule)
    }

    /// Learning rate at a global step. Pure and deterministic.
    pub fn lr(&self, step: i64) -> f64 {
        match self {
            Self::Stepwise { params } => {
                let mut lr = if step < params.lr_warmup_step {
                    params.warmup_lr(step)
                } else {
                    params.adjusted_learning_rate
                };

                // cascaded thresholds; a later threshold overrides earlier ones
                let drops = [
                    (1.0, params.lr_warmup_step),
                    (0.1, params.first_lr_drop_step),
                    (0.01, params.second_lr_drop_step),
                ];
                for (mult, drop_step) in drops {
                    if step >= drop_step {
                        lr = params.adjusted_learning_rate * mult;
                    }
                }
                lr
            }
            // cosine decay counts steps from the end of warmup, so the rate
            // is continuous at the warmup boundary and reaches zero exactly
            // at total_steps
            Self::Cosine { params } => {
                if step < params.lr_warmup_step {
                    params.warmup_lr(step)
                } else {
                    let decay_steps = (params.total_steps - params.lr_warmup_step) as f64;
                    let progress = (step - params.lr_warmup_step) as f64 / decay_steps;
                    params.adjusted_learning_rate
                        * 0.5
                        * (1.0 + (std::f64::consts::PI * progress).cos())
                }
            }
            Self::Polynomial { params, power } => {
                if step < params.lr_warmup_step {
                    params.warmup_lr(step)
                } else {
                    params.adjusted_learning_rate
                        * (1.0 - step as f64 / params.total_steps as f64).powf(*power)
                }
            }
            Self::Constant { lr } => *lr,
        }
    }
}
