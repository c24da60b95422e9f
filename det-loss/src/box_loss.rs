use crate::common::*;

/// Huber box regression loss.
///
/// `delta` is typically around the mean magnitude of the regression targets.
#[derive(Debug, Clone)]
pub struct BoxLoss {
    delta: f64,
}

impl BoxLoss {
    pub fn new(delta: f64) -> Result<Self> {
        ensure!(delta > 0.0, "delta must be positive, but got {}", delta);
        Ok(Self { delta })
    }

    /// Sum of elementwise Huber losses normalized by `num_positives * 4`.
    ///
    /// Zero box targets mark anchors without a regression target and are
    /// masked out entirely.
    pub fn forward(&self, box_outputs: &Tensor, box_targets: &Tensor, num_positives: f64) -> Tensor {
        debug_assert_eq!(
            box_outputs.size(),
            box_targets.size(),
            "box outputs and targets must have equal shape"
        );

        let normalizer = num_positives * 4.0;
        let mask = box_targets.ne(0.0).to_kind(Kind::Float);
        let loss = box_outputs.huber_loss(box_targets, Reduction::None, self.delta);
        (loss * mask).sum(Kind::Float) / normalizer
    }
}
