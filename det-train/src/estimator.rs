//! Mode-dispatched training, evaluation and prediction orchestration.

use crate::{
    checkpoint::{self, Scaffold},
    common::*,
    config::{Params, Strategy},
    ema::Ema,
    optim::{self, Optimizer},
    schedule::LrSchedule,
};
use det_loss::{
    reg_l2_loss, DetectionLabels, DetectionLoss, DetectionLossInit, DetectionLossOutput,
};

/// Execution mode, selected per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

/// The forward-pass collaborator producing per-level classification and box
/// regression maps, keyed by pyramid level in level order.
pub trait Detector {
    fn forward(
        &self,
        input: &Tensor,
        is_training: bool,
    ) -> Result<(IndexMap<i64, Tensor>, IndexMap<i64, Tensor>)>;
}

/// Turns raw per-level outputs into final detections, bounded to a fixed
/// maximum candidate count before non-max suppression.
pub trait Postprocess {
    fn generate_detections(
        &self,
        cls_outputs: &IndexMap<i64, Tensor>,
        box_outputs: &IndexMap<i64, Tensor>,
        image_scales: &Tensor,
        source_ids: &Tensor,
    ) -> Result<Tensor>;
}

/// Detection quality metric collaborator. Ground-truth based evaluation
/// passes the groundtruth records; test-set submission mode passes none.
pub trait DetectionMetric {
    fn evaluate(
        &self,
        detections: &Tensor,
        groundtruth: Option<&Tensor>,
    ) -> Result<IndexMap<String, f64>>;
}

/// Raw per-level outputs of a prediction pass.
#[derive(Debug)]
pub struct Predictions {
    pub image: Tensor,
    pub cls_outputs: IndexMap<i64, Tensor>,
    pub box_outputs: IndexMap<i64, Tensor>,
}

/// Observable scalars of one training step.
#[derive(Debug)]
pub struct TrainOutput {
    pub step: i64,
    pub learning_rate: f64,
    pub losses: DetectionLossOutput,
    pub reg_l2_loss: Tensor,
    pub total_loss: Tensor,
    /// Pre-clip global gradient norm, when clipping is enabled.
    pub grad_norm: Option<f64>,
}

/// Loss and quality metrics of one evaluation pass.
#[derive(Debug)]
pub struct EvalOutput {
    pub losses: DetectionLossOutput,
    pub total_loss: Tensor,
    pub metrics: IndexMap<String, f64>,
}

/// Drives the forward pass, the loss and schedule engines, the optimizer
/// step, and the EMA shadow update.
pub struct Estimator<M>
where
    M: Detector,
{
    params: Params,
    vs: nn::VarStore,
    model: M,
    detection_loss: DetectionLoss,
    schedule: LrSchedule,
    optimizer: Optimizer,
    ema: Option<Ema>,
    global_step: Tensor,
}

impl<M> Estimator<M>
where
    M: Detector,
{
    /// Validate the parameters and assemble the training objective around an
    /// already-built model.
    pub fn new(params: Params, vs: nn::VarStore, model: M) -> Result<Self> {
        params.validate()?;

        let detection_loss = DetectionLossInit {
            num_classes: params.num_classes,
            alpha: params.alpha.raw(),
            gamma: params.gamma.raw(),
            label_smoothing: params.label_smoothing.raw(),
            delta: params.delta.raw(),
            box_loss_weight: params.box_loss_weight.raw(),
            iou_loss_weight: params.iou_loss_weight.raw(),
            iou_loss_type: params.iou_loss_type,
            data_format: params.data_format,
        }
        .build()?;

        let schedule = LrSchedule::from_params(&params)?;

        const INIT_LR: f64 = 0.0;
        let optimizer =
            optim::build_optimizer(params.optimizer, &vs, params.momentum.raw(), INIT_LR)?;

        let ema = if params.moving_average_decay.raw() > 0.0 {
            Some(Ema::new(params.moving_average_decay.raw(), &vs)?)
        } else {
            None
        };

        let global_step = vs.root().zeros_no_train("global_step", &[]);

        Ok(Self {
            params,
            vs,
            model,
            detection_loss,
            schedule,
            optimizer,
            ema,
            global_step,
        })
    }

    /// One-time variable initialization for a run. Executed once at run
    /// start, never per-step.
    pub fn init(&mut self, mode: Mode) -> Result<()> {
        match Scaffold::select(mode, &self.params)? {
            Scaffold::RestoreCheckpoint {
                path,
                ckpt_scope,
                var_scope,
                exclude,
            } => {
                checkpoint::restore_scoped(
                    &mut self.vs,
                    &path,
                    &ckpt_scope,
                    &var_scope,
                    exclude.as_deref(),
                )?;
                // shadows restart from the restored weights
                if let Some(ema) = &mut self.ema {
                    *ema = Ema::new(self.params.moving_average_decay.raw(), &self.vs)?;
                }
            }
            Scaffold::RestoreEma => {
                if let Some(ema) = &self.ema {
                    info!(
                        "load EMA vars with ema_decay={}",
                        self.params.moving_average_decay
                    );
                    ema.apply_to(&mut self.vs);
                }
            }
            Scaffold::None => {}
        }
        Ok(())
    }

    pub fn global_step(&self) -> i64 {
        f64::from(&self.global_step) as i64
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Forward pass with outputs cast to full precision. The model may
    /// compute in reduced precision; losses and metrics never do.
    fn forward(
        &self,
        input: &Tensor,
        is_training: bool,
    ) -> Result<(IndexMap<i64, Tensor>, IndexMap<i64, Tensor>)> {
        let (cls_outputs, box_outputs) = self.model.forward(input, is_training)?;

        let to_float = |outputs: IndexMap<i64, Tensor>| {
            outputs
                .into_iter()
                .map(|(level, tensor)| (level, tensor.to_kind(Kind::Float)))
                .collect()
        };
        Ok((to_float(cls_outputs), to_float(box_outputs)))
    }

    /// One optimization step over a batch.
    pub fn train_step(&mut self, features: &Tensor, labels: &DetectionLabels) -> Result<TrainOutput> {
        let step = self.global_step();

        // batch-norm statistics update inside the forward pass, before the
        // weight update below
        let (cls_outputs, box_outputs) =
            self.forward(features, self.params.is_training_bn)?;

        let mut learning_rate = self.schedule.lr(step);
        if self.params.strategy == Strategy::Horovod {
            learning_rate *= self.params.num_shards as f64;
        }
        self.optimizer.set_lr(learning_rate);

        let losses = self
            .detection_loss
            .forward(&cls_outputs, &box_outputs, labels)?;
        let reg_loss = reg_l2_loss(self.params.weight_decay.raw(), &self.vs.variables());
        let total_loss: Tensor = &losses.total_loss + &reg_loss;

        self.optimizer.zero_grad();
        total_loss.backward();

        let clip_norm = self.params.clip_gradients_norm.raw();
        let grad_norm = if clip_norm > 0.0 {
            let trainables = self.vs.trainable_variables();
            Some(optim::clip_grad_norm(&trainables, clip_norm))
        } else {
            None
        };

        self.optimizer.step();

        // shadow update strictly after the optimizer step commits, counting
        // the step that just completed
        let next_step = step + 1;
        if let Some(ema) = &mut self.ema {
            ema.update(&self.vs, next_step);
        }

        tch::no_grad(|| {
            let _ = self.global_step.copy_(&Tensor::from(next_step as f64));
        });

        info!(
            "step: {}\tlr: {:.5}\tloss: {:.5}",
            step,
            learning_rate,
            f64::from(&total_loss)
        );

        Ok(TrainOutput {
            step,
            learning_rate,
            losses,
            reg_l2_loss: reg_loss,
            total_loss,
            grad_norm,
        })
    }

    /// Loss computation plus delegation to the postprocessing and metric
    /// collaborators. The loss is logged, never optimized.
    pub fn evaluate(
        &self,
        features: &Tensor,
        labels: &DetectionLabels,
        postprocess: &impl Postprocess,
        metric: &impl DetectionMetric,
    ) -> Result<EvalOutput> {
        let (cls_outputs, box_outputs) = self.forward(features, false)?;

        let losses = self
            .detection_loss
            .forward(&cls_outputs, &box_outputs, labels)?;
        let reg_loss = reg_l2_loss(self.params.weight_decay.raw(), &self.vs.variables());
        let total_loss: Tensor = &losses.total_loss + reg_loss;

        let image_scales = labels
            .image_scales
            .as_ref()
            .ok_or_else(|| format_err!("image_scales are required in eval mode"))?;
        let source_ids = labels
            .source_ids
            .as_ref()
            .ok_or_else(|| format_err!("source_ids are required in eval mode"))?;

        let detections =
            postprocess.generate_detections(&cls_outputs, &box_outputs, image_scales, source_ids)?;

        // test-set submission mode evaluates without groundtruth
        let groundtruth = if self.params.testdev_dir.is_some() {
            None
        } else {
            Some(labels.groundtruth_data.as_ref().ok_or_else(|| {
                format_err!("groundtruth_data is required for groundtruth-based eval")
            })?)
        };

        let mut metrics: IndexMap<String, f64> = IndexMap::new();
        metrics.insert("cls_loss".into(), f64::from(&losses.cls_loss));
        metrics.insert("box_loss".into(), f64::from(&losses.box_loss));
        metrics.extend(metric.evaluate(&detections, groundtruth)?);

        Ok(EvalOutput {
            losses,
            total_loss,
            metrics,
        })
    }

    /// Forward pass only; raw per-level outputs plus the input image.
    pub fn predict(&self, features: &Tensor) -> Result<Predictions> {
        let (cls_outputs, box_outputs) = self.forward(features, false)?;

        Ok(Predictions {
            image: features.shallow_clone(),
            cls_outputs,
            box_outputs,
        })
    }
}
