use crate::common::*;

/// Focal loss initializer.
#[derive(Debug, Clone)]
pub struct FocalLossInit {
    /// The weighting factor of positive examples. Negative examples are
    /// weighted by `1 - alpha`.
    pub alpha: f64,
    /// The exponent modulating loss from hard and easy examples.
    pub gamma: f64,
    /// The label smoothing coefficient in range [0, 1].
    pub label_smoothing: f64,
}

impl Default for FocalLossInit {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            gamma: 1.5,
            label_smoothing: 0.0,
        }
    }
}

impl FocalLossInit {
    pub fn build(self) -> Result<FocalLoss> {
        let Self {
            alpha,
            gamma,
            label_smoothing,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&alpha),
            "alpha must be in range [0, 1], but got {}",
            alpha
        );
        ensure!(gamma >= 0.0, "gamma must be non-negative, but got {}", gamma);
        ensure!(
            (0.0..=1.0).contains(&label_smoothing),
            "label_smoothing must be in range [0, 1], but got {}",
            label_smoothing
        );

        Ok(FocalLoss {
            alpha,
            gamma,
            label_smoothing,
        })
    }
}

/// Focal loss calculator.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    alpha: f64,
    gamma: f64,
    label_smoothing: f64,
}

impl FocalLoss {
    /// Compute the elementwise focal loss between logits and one-hot targets,
    /// divided by `normalizer`.
    ///
    /// No reduction is applied. The caller masks ignored entries and sums.
    pub fn forward(&self, logits: &Tensor, targets: &Tensor, normalizer: f64) -> Tensor {
        debug_assert_eq!(
            logits.size(),
            targets.size(),
            "logits and targets must have equal shape"
        );

        let Self {
            alpha,
            gamma,
            label_smoothing,
        } = *self;

        // the modulation factors are computed before label smoothing so that
        // smoothing does not inflate them
        let pred_prob = logits.sigmoid();
        let p_t: Tensor = targets * &pred_prob + (1.0 - targets) * (1.0 - &pred_prob);
        let alpha_factor = targets * alpha + (1.0 - targets) * (1.0 - alpha);
        let modulating_factor = (-&p_t + 1.0).pow(&gamma.into());

        let targets = targets * (1.0 - label_smoothing) + 0.5 * label_smoothing;
        let ce = logits.binary_cross_entropy_with_logits::<Tensor>(
            &targets,
            None,
            None,
            Reduction::None,
        );

        alpha_factor * modulating_factor * ce / normalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(lhs: &Tensor, rhs: &Tensor) -> f64 {
        f64::from((lhs - rhs).abs().max())
    }

    #[test]
    fn focal_loss_degenerates_to_scaled_cross_entropy() -> Result<()> {
        let loss_fn = FocalLossInit {
            alpha: 0.5,
            gamma: 0.0,
            label_smoothing: 0.0,
        }
        .build()?;

        let logits = Tensor::of_slice(&[2.0f32, -1.0, 0.5, -3.0]).view([2, 2]);
        let targets = Tensor::of_slice(&[1.0f32, 0.0, 0.0, 1.0]).view([2, 2]);
        let normalizer = 3.0;

        let loss = loss_fn.forward(&logits, &targets, normalizer);
        let expect = logits.binary_cross_entropy_with_logits::<Tensor>(
            &targets,
            None,
            None,
            Reduction::None,
        ) * 0.5
            / normalizer;

        assert!(max_abs_diff(&loss, &expect) < 1e-6);
        Ok(())
    }

    #[test]
    fn zero_smoothing_keeps_targets_exact() -> Result<()> {
        let smoothed = FocalLossInit {
            label_smoothing: 0.0,
            ..Default::default()
        }
        .build()?;
        let reference = FocalLossInit::default().build()?;

        let logits = Tensor::of_slice(&[0.3f32, -0.7, 1.2, 0.0]).view([2, 2]);
        let targets = Tensor::of_slice(&[1.0f32, 0.0, 1.0, 0.0]).view([2, 2]);

        let lhs = smoothed.forward(&logits, &targets, 1.0);
        let rhs = reference.forward(&logits, &targets, 1.0);

        assert!(max_abs_diff(&lhs, &rhs) < 1e-7);
        Ok(())
    }

    #[test]
    fn smoothing_changes_cross_entropy_but_not_modulation() -> Result<()> {
        // hand-computed: with gamma = 0 and alpha = 0.5, the smoothed loss is
        // 0.5 * bce(smoothed targets, logits)
        let smoothing = 0.1;
        let loss_fn = FocalLossInit {
            alpha: 0.5,
            gamma: 0.0,
            label_smoothing: smoothing,
        }
        .build()?;

        let logits = Tensor::of_slice(&[1.5f32, -0.5]).view([1, 2]);
        let targets = Tensor::of_slice(&[1.0f32, 0.0]).view([1, 2]);

        let smoothed_targets: Tensor = &targets * (1.0 - smoothing) + 0.5 * smoothing;
        let expect = logits.binary_cross_entropy_with_logits::<Tensor>(
            &smoothed_targets,
            None,
            None,
            Reduction::None,
        ) * 0.5;

        let loss = loss_fn.forward(&logits, &targets, 1.0);
        assert!(max_abs_diff(&loss, &expect) < 1e-6);
        Ok(())
    }

    #[test]
    fn invalid_coefficients_are_rejected() {
        assert!(FocalLossInit {
            gamma: -1.0,
            ..Default::default()
        }
        .build()
        .is_err());
        assert!(FocalLossInit {
            label_smoothing: 1.5,
            ..Default::default()
        }
        .build()
        .is_err());
    }
}
