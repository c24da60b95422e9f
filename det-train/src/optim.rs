//! Optimizer construction and gradient clipping.

use crate::{common::*, config::OptimizerKind};

/// The optimizer selected by configuration.
pub enum Optimizer {
    Sgd(nn::Optimizer),
    Adam(nn::Optimizer),
}

impl Optimizer {
    pub fn set_lr(&mut self, lr: f64) {
        match self {
            Self::Sgd(optimizer) => optimizer.set_lr(lr),
            Self::Adam(optimizer) => optimizer.set_lr(lr),
        }
    }

    pub fn zero_grad(&mut self) {
        match self {
            Self::Sgd(optimizer) => optimizer.zero_grad(),
            Self::Adam(optimizer) => optimizer.zero_grad(),
        }
    }

    pub fn step(&mut self) {
        match self {
            Self::Sgd(optimizer) => optimizer.step(),
            Self::Adam(optimizer) => optimizer.step(),
        }
    }
}

/// Build the optimizer over the trainable variables of the var store.
///
/// The real learning rate is installed by the schedule before every step.
pub fn build_optimizer(
    kind: OptimizerKind,
    vs: &nn::VarStore,
    momentum: f64,
    initial_lr: f64,
) -> Result<Optimizer> {
    let optimizer = match kind {
        OptimizerKind::Sgd => Optimizer::Sgd(
            nn::Sgd {
                momentum,
                ..Default::default()
            }
            .build(vs, initial_lr)?,
        ),
        OptimizerKind::Adam => Optimizer::Adam(nn::Adam::default().build(vs, initial_lr)?),
    };
    Ok(optimizer)
}

/// Global L2 norm over the gradients of the given variables.
pub fn global_grad_norm(vars: &[Tensor]) -> f64 {
    let total: f64 = vars
        .iter()
        .map(|var| var.grad())
        .filter(|grad| grad.defined())
        .map(|grad| f64::from((&grad * &grad).sum(Kind::Float)))
        .sum();
    total.sqrt()
}

/// Rescale gradients in place so their global norm does not exceed
/// `max_norm`. Returns the pre-clip norm.
pub fn clip_grad_norm(vars: &[Tensor], max_norm: f64) -> f64 {
    let grad_norm = global_grad_norm(vars);

    if grad_norm > max_norm {
        let scale = max_norm / grad_norm;
        tch::no_grad(|| {
            vars.iter().for_each(|var| {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.copy_(&(&grad * scale));
                }
            });
        });
    }

    grad_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn var_with_grad(value: f32) -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let var = vs.root().var("w", &[4], nn::Init::Const(value as f64));
        let loss = (&var * &var).sum(Kind::Float);
        loss.backward();
        (vs, var)
    }

    #[test]
    fn global_norm_matches_manual_computation() {
        let (_vs, var) = var_with_grad(1.0);
        // d(sum(w^2))/dw = 2w, four entries of 2.0
        let expect = (4.0 * 4.0f64).sqrt();
        assert!(abs_diff_eq!(
            global_grad_norm(&[var]),
            expect,
            epsilon = 1e-6
        ));
    }

    #[test]
    fn clipping_reports_the_preclip_norm_and_rescales() {
        let (_vs, var) = var_with_grad(1.0);
        let max_norm = 1.0;

        let reported = clip_grad_norm(&[var.shallow_clone()], max_norm);
        assert!(abs_diff_eq!(reported, 4.0, epsilon = 1e-6));

        let after = global_grad_norm(&[var]);
        assert!(abs_diff_eq!(after, max_norm, epsilon = 1e-6));
    }

    #[test]
    fn small_gradients_are_left_untouched() {
        let (_vs, var) = var_with_grad(0.1);
        let before = global_grad_norm(&[var.shallow_clone()]);
        let reported = clip_grad_norm(&[var.shallow_clone()], 100.0);
        let after = global_grad_norm(&[var]);

        assert!(abs_diff_eq!(reported, before, epsilon = 1e-9));
        assert!(abs_diff_eq!(after, before, epsilon = 1e-9));
    }

    #[test]
    fn both_optimizer_kinds_build() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[2], nn::Init::Const(0.0));
        build_optimizer(OptimizerKind::Sgd, &vs, 0.9, 0.01)?;
        build_optimizer(OptimizerKind::Adam, &vs, 0.9, 0.01)?;
        Ok(())
    }
}
