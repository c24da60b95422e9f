//! Exponential moving average shadow weights.

use crate::common::*;

/// Shadow copies of the trainable variables.
///
/// Shadows are updated strictly after the optimizer step commits and are
/// never read by gradient computation.
#[derive(Debug)]
pub struct Ema {
    decay: f64,
    shadow: Vec<(String, Tensor)>,
}

impl Ema {
    /// Snapshot every trainable variable into a same-shape shadow copy.
    pub fn new(decay: f64, vs: &nn::VarStore) -> Result<Self> {
        ensure!(
            (0.0..1.0).contains(&decay),
            "moving average decay must be in range [0, 1), but got {}",
            decay
        );

        let shadow: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_name, var)| var.requires_grad())
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, var)| {
                let copy = tch::no_grad(|| var.detach().copy());
                (name, copy)
            })
            .collect();

        Ok(Self { decay, shadow })
    }

    /// The decay ramps up with the update count so early steps track the raw
    /// weights more closely.
    fn effective_decay(&self, num_updates: i64) -> f64 {
        let n = num_updates as f64;
        self.decay.min((1.0 + n) / (10.0 + n))
    }

    /// Fold the current variable values into the shadows.
    pub fn update(&mut self, vs: &nn::VarStore, num_updates: i64) {
        let decay = self.effective_decay(num_updates);
        let vars = vs.variables();

        tch::no_grad(|| {
            self.shadow.iter_mut().for_each(|(name, shadow)| {
                if let Some(var) = vars.get(name) {
                    let updated: Tensor = decay * &*shadow + (1.0 - decay) * var.detach();
                    let _ = shadow.copy_(&updated);
                }
            });
        });
    }

    /// Install the shadow values into the var store. Used at evaluation time
    /// in place of the raw trained weights.
    pub fn apply_to(&self, vs: &mut nn::VarStore) {
        let vars = vs.variables();

        tch::no_grad(|| {
            self.shadow.iter().for_each(|(name, shadow)| {
                if let Some(var) = vars.get(name) {
                    let mut var = var.shallow_clone();
                    let _ = var.copy_(shadow);
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn update_blends_shadow_and_variable() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let var = vs.root().var("w", &[1], nn::Init::Const(1.0));

        let mut ema = Ema::new(0.5, &vs)?;

        // move the variable, then fold it in; large num_updates keeps the
        // configured decay
        tch::no_grad(|| {
            let mut var = var.shallow_clone();
            let _ = var.copy_(&Tensor::of_slice(&[3.0f32]));
        });
        ema.update(&vs, 1_000_000);

        // shadow = 0.5 * 1.0 + 0.5 * 3.0
        let (_name, shadow) = &ema.shadow[0];
        assert!(abs_diff_eq!(f64::from(shadow), 2.0, epsilon = 1e-6));
        Ok(())
    }

    #[test]
    fn early_updates_use_the_ramped_decay() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _var = vs.root().var("w", &[1], nn::Init::Const(0.0));
        let ema = Ema::new(0.9998, &vs)?;

        // (1 + 0) / (10 + 0) = 0.1 beats the configured decay at step zero
        assert!(abs_diff_eq!(ema.effective_decay(0), 0.1));
        assert!(abs_diff_eq!(
            ema.effective_decay(10_000_000),
            0.9998,
            epsilon = 1e-9
        ));
        Ok(())
    }

    #[test]
    fn apply_to_installs_shadow_weights() -> Result<()> {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let var = vs.root().var("w", &[1], nn::Init::Const(1.0));

        let ema = Ema::new(0.5, &vs)?;

        tch::no_grad(|| {
            let mut var = var.shallow_clone();
            let _ = var.copy_(&Tensor::of_slice(&[42.0f32]));
        });
        ema.apply_to(&mut vs);

        assert!(abs_diff_eq!(f64::from(&var), 1.0, epsilon = 1e-6));
        Ok(())
    }

    #[test]
    fn invalid_decay_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(Ema::new(1.0, &vs).is_err());
        assert!(Ema::new(-0.1, &vs).is_err());
    }
}
