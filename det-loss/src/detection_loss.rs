//! Multi-level detection loss aggregation.

use crate::{
    box_loss::BoxLoss,
    common::*,
    focal_loss::{FocalLoss, FocalLossInit},
    iou_loss::{BoxIouLoss, IouKind},
};

/// The class target value marking anchors excluded from the loss.
pub const IGNORE_LABEL: i64 = -2;

/// Tensor layout of per-level prediction maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    ChannelsFirst,
    ChannelsLast,
}

impl FromStr for DataFormat {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let format = match text {
            "channels_first" => Self::ChannelsFirst,
            "channels_last" => Self::ChannelsLast,
            _ => bail!("unknown data_format '{}'", text),
        };
        Ok(format)
    }
}

/// Ground truth bundle produced by the external data pipeline.
///
/// The per-level maps are keyed by pyramid level and iterate in level order.
#[derive(Debug)]
pub struct DetectionLabels {
    /// Per-level integer class target maps. [IGNORE_LABEL] marks ignored
    /// anchors, other negative values mark background.
    pub cls_targets: IndexMap<i64, Tensor>,
    /// Per-level box regression target maps. All-zero entries mark anchors
    /// without a regression target.
    pub box_targets: IndexMap<i64, Tensor>,
    /// Mean positive-anchor count per image, already averaged across replicas.
    pub mean_num_positives: Tensor,
    /// Image rescaling factors, passed through to postprocessing in eval mode.
    pub image_scales: Option<Tensor>,
    /// Source image identifiers, passed through in eval mode.
    pub source_ids: Option<Tensor>,
    /// Raw groundtruth records for the metric collaborator in eval mode.
    pub groundtruth_data: Option<Tensor>,
}

impl DetectionLabels {
    /// The positive-example normalizer. The added one guards against division
    /// by zero when a batch has no positive anchors.
    pub fn num_positives_sum(&self) -> f64 {
        f64::from(self.mean_num_positives.sum(Kind::Float)) + 1.0
    }
}

/// Detection loss initializer.
#[derive(Debug, Clone)]
pub struct DetectionLossInit {
    pub num_classes: i64,
    pub alpha: f64,
    pub gamma: f64,
    pub label_smoothing: f64,
    pub delta: f64,
    pub box_loss_weight: f64,
    pub iou_loss_weight: f64,
    pub iou_loss_type: Option<IouKind>,
    pub data_format: DataFormat,
}

impl Default for DetectionLossInit {
    fn default() -> Self {
        Self {
            num_classes: 90,
            alpha: 0.25,
            gamma: 1.5,
            label_smoothing: 0.0,
            delta: 0.1,
            box_loss_weight: 50.0,
            iou_loss_weight: 1.0,
            iou_loss_type: None,
            data_format: DataFormat::ChannelsLast,
        }
    }
}

impl DetectionLossInit {
    pub fn build(self) -> Result<DetectionLoss> {
        let Self {
            num_classes,
            alpha,
            gamma,
            label_smoothing,
            delta,
            box_loss_weight,
            iou_loss_weight,
            iou_loss_type,
            data_format,
        } = self;

        ensure!(
            num_classes > 0,
            "num_classes must be positive, but got {}",
            num_classes
        );
        ensure!(
            box_loss_weight >= 0.0,
            "box_loss_weight must be non-negative, but got {}",
            box_loss_weight
        );
        ensure!(
            iou_loss_weight >= 0.0,
            "iou_loss_weight must be non-negative, but got {}",
            iou_loss_weight
        );

        let focal_loss = FocalLossInit {
            alpha,
            gamma,
            label_smoothing,
        }
        .build()?;
        let box_loss = BoxLoss::new(delta)?;
        let box_iou_loss = iou_loss_type.map(BoxIouLoss::new);

        Ok(DetectionLoss {
            num_classes,
            focal_loss,
            box_loss,
            box_iou_loss,
            box_loss_weight,
            iou_loss_weight,
            data_format,
        })
    }
}

/// Per-loss-type scalars of one forward pass.
#[derive(Debug, TensorLike)]
pub struct DetectionLossOutput {
    pub total_loss: Tensor,
    pub cls_loss: Tensor,
    pub box_loss: Tensor,
    pub box_iou_loss: Tensor,
}

/// Total detection loss over all pyramid levels.
#[derive(Debug)]
pub struct DetectionLoss {
    num_classes: i64,
    focal_loss: FocalLoss,
    box_loss: BoxLoss,
    box_iou_loss: Option<BoxIouLoss>,
    box_loss_weight: f64,
    iou_loss_weight: f64,
    data_format: DataFormat,
}

impl DetectionLoss {
    /// Compute classification, box regression and optional IoU losses summed
    /// over all levels.
    pub fn forward(
        &self,
        cls_outputs: &IndexMap<i64, Tensor>,
        box_outputs: &IndexMap<i64, Tensor>,
        labels: &DetectionLabels,
    ) -> Result<DetectionLossOutput> {
        ensure!(!cls_outputs.is_empty(), "cls_outputs must not be empty");
        let device = cls_outputs
            .values()
            .next()
            .map(|tensor| tensor.device())
            .unwrap_or(Device::Cpu);

        let num_positives_sum = labels.num_positives_sum();

        let init = (vec![], vec![], vec![]);
        let (cls_losses, box_losses, iou_losses) =
            cls_outputs
                .iter()
                .try_fold(init, |mut state, (&level, cls_out)| -> Result<_> {
                    let (cls_losses, box_losses, iou_losses) = &mut state;

                    let cls_t = labels.cls_targets.get(&level).ok_or_else(|| {
                        format_err!("missing class targets for pyramid level {}", level)
                    })?;
                    let box_t = labels.box_targets.get(&level).ok_or_else(|| {
                        format_err!("missing box targets for pyramid level {}", level)
                    })?;
                    let box_out = box_outputs.get(&level).ok_or_else(|| {
                        format_err!("missing box outputs for pyramid level {}", level)
                    })?;

                    cls_losses.push(self.cls_loss_at_level(
                        cls_out,
                        cls_t,
                        num_positives_sum,
                    )?);

                    if self.box_loss_weight > 0.0 {
                        box_losses.push(self.box_loss.forward(box_out, box_t, num_positives_sum));
                    }
                    if let Some(box_iou_loss) = &self.box_iou_loss {
                        iou_losses.push(box_iou_loss.forward(box_out, box_t, num_positives_sum));
                    }

                    Ok(state)
                })?;

        let zero = || Tensor::zeros(&[], (Kind::Float, device));
        let sum_or_zero = |losses: Vec<Tensor>| {
            if losses.is_empty() {
                zero()
            } else {
                Tensor::stack(&losses, 0).sum(Kind::Float)
            }
        };

        let cls_loss = sum_or_zero(cls_losses);
        let box_loss = sum_or_zero(box_losses);
        let box_iou_loss = sum_or_zero(iou_losses);
        let total_loss: Tensor = &cls_loss
            + self.box_loss_weight * &box_loss
            + self.iou_loss_weight * &box_iou_loss;

        Ok(DetectionLossOutput {
            total_loss,
            cls_loss,
            box_loss,
            box_iou_loss,
        })
    }

    /// Focal classification loss of one level, with ignored anchors masked
    /// out before the sum.
    fn cls_loss_at_level(
        &self,
        cls_out: &Tensor,
        cls_t: &Tensor,
        num_positives_sum: f64,
    ) -> Result<Tensor> {
        // negative class targets (background and ignored anchors) one-hot
        // encode to all-zero rows
        let valid = cls_t.ge(0).unsqueeze(-1).to_kind(Kind::Float);
        let one_hot = cls_t
            .clamp_min(0)
            .one_hot(self.num_classes)
            .to_kind(Kind::Float)
            * valid;

        let cls_loss = match self.data_format {
            DataFormat::ChannelsLast => {
                let (bs, width, height, _anchors) = cls_t.size4().with_context(|| {
                    format!("expected 4D class targets, but got shape {:?}", cls_t.size())
                })?;
                let targets = one_hot.view([bs, width, height, -1]);
                let loss = self.focal_loss.forward(cls_out, &targets, num_positives_sum);
                loss.view([bs, width, height, -1, self.num_classes])
            }
            DataFormat::ChannelsFirst => {
                let (bs, _anchors, width, height) = cls_t.size4().with_context(|| {
                    format!("expected 4D class targets, but got shape {:?}", cls_t.size())
                })?;
                let targets = one_hot.view([bs, -1, width, height]);
                let loss = self.focal_loss.forward(cls_out, &targets, num_positives_sum);
                loss.view([bs, -1, width, height, self.num_classes])
            }
        };

        let keep = cls_t.ne(IGNORE_LABEL).unsqueeze(-1).to_kind(Kind::Float);
        Ok((cls_loss * keep).sum(Kind::Float))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    const NUM_CLASSES: i64 = 3;
    const ANCHORS: i64 = 2;

    fn labels_with(cls_fill: i64, box_targets: Tensor) -> DetectionLabels {
        let cls_targets = Tensor::full(&[1, 2, 2, ANCHORS], cls_fill, (Kind::Int64, Device::Cpu));
        DetectionLabels {
            cls_targets: IndexMap::from_iter([(3, cls_targets)]),
            box_targets: IndexMap::from_iter([(3, box_targets)]),
            mean_num_positives: Tensor::of_slice(&[0.5f32]),
            image_scales: None,
            source_ids: None,
            groundtruth_data: None,
        }
    }

    fn outputs() -> (IndexMap<i64, Tensor>, IndexMap<i64, Tensor>) {
        let cls_outputs = IndexMap::from_iter([(
            3,
            Tensor::rand(&[1, 2, 2, ANCHORS * NUM_CLASSES], (Kind::Float, Device::Cpu)),
        )]);
        let box_outputs = IndexMap::from_iter([(
            3,
            Tensor::rand(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)),
        )]);
        (cls_outputs, box_outputs)
    }

    fn loss_fn() -> Result<DetectionLoss> {
        DetectionLossInit {
            num_classes: NUM_CLASSES,
            iou_loss_type: Some(IouKind::Giou),
            ..Default::default()
        }
        .build()
    }

    #[test]
    fn num_positives_sum_is_at_least_one() {
        let labels = labels_with(0, Tensor::zeros(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)));
        let labels = DetectionLabels {
            mean_num_positives: Tensor::zeros(&[4], (Kind::Float, Device::Cpu)),
            ..labels
        };
        assert_eq!(labels.num_positives_sum(), 1.0);
    }

    #[test]
    fn ignored_anchors_contribute_no_classification_loss() -> Result<()> {
        let loss_fn = loss_fn()?;
        let (cls_outputs, box_outputs) = outputs();
        let labels = labels_with(
            IGNORE_LABEL,
            Tensor::zeros(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)),
        );

        let output = loss_fn.forward(&cls_outputs, &box_outputs, &labels)?;
        assert_eq!(f64::from(&output.cls_loss), 0.0);
        Ok(())
    }

    #[test]
    fn zero_box_targets_contribute_no_box_loss() -> Result<()> {
        let loss_fn = loss_fn()?;
        let (cls_outputs, box_outputs) = outputs();
        let labels = labels_with(
            0,
            Tensor::zeros(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)),
        );

        let output = loss_fn.forward(&cls_outputs, &box_outputs, &labels)?;
        assert_eq!(f64::from(&output.box_loss), 0.0);
        assert_eq!(f64::from(&output.box_iou_loss), 0.0);
        Ok(())
    }

    #[test]
    fn total_loss_combines_weighted_components() -> Result<()> {
        let loss_fn = loss_fn()?;
        let (cls_outputs, box_outputs) = outputs();
        let labels = labels_with(
            1,
            Tensor::rand(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)),
        );

        let output = loss_fn.forward(&cls_outputs, &box_outputs, &labels)?;
        let expect = f64::from(&output.cls_loss)
            + 50.0 * f64::from(&output.box_loss)
            + 1.0 * f64::from(&output.box_iou_loss);
        assert!(abs_diff_eq!(
            f64::from(&output.total_loss),
            expect,
            epsilon = 1e-5
        ));
        Ok(())
    }

    #[test]
    fn missing_level_targets_fail() -> Result<()> {
        let loss_fn = loss_fn()?;
        let (cls_outputs, box_outputs) = outputs();
        let mut labels = labels_with(
            0,
            Tensor::zeros(&[1, 2, 2, ANCHORS * 4], (Kind::Float, Device::Cpu)),
        );
        labels.cls_targets.clear();

        assert!(loss_fn.forward(&cls_outputs, &box_outputs, &labels).is_err());
        Ok(())
    }
}
