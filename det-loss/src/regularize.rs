use crate::common::*;
use regex::Regex;

/// L2 penalty over kernel and weight variables.
///
/// The caller passes its named variable collection explicitly. Biases and
/// batch-norm affine parameters are excluded by name, and non-trainable
/// variables (running statistics) are skipped. Iteration is in sorted name
/// order so the sum is deterministic.
pub fn reg_l2_loss(weight_decay: f64, named_vars: &HashMap<String, Tensor>) -> Tensor {
    let var_match = Regex::new(r"(kernel|weight)$").unwrap();
    let device = named_vars
        .values()
        .next()
        .map(|var| var.device())
        .unwrap_or(Device::Cpu);

    let penalty = named_vars
        .iter()
        .sorted_by_key(|(name, _)| name.to_owned())
        .filter(|(name, var)| var_match.is_match(name) && var.requires_grad())
        .fold(
            Tensor::zeros(&[], (Kind::Float, device)),
            |sum, (_name, var)| sum + (var * var).sum(Kind::Float) / 2.0,
        );

    weight_decay * penalty
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn bias_only_collections_have_zero_penalty() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _bias = root.sub("head").var("bias", &[4], nn::Init::Const(1.0));
        let _scale = root.sub("bn").var("gamma", &[4], nn::Init::Const(1.0));

        let loss = reg_l2_loss(1e-4, &vs.variables());
        assert_eq!(f64::from(&loss), 0.0);
    }

    #[test]
    fn weights_are_penalized_by_half_squared_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _weight = root.sub("conv").var("weight", &[2, 2], nn::Init::Const(2.0));

        let weight_decay = 0.5;
        let loss = f64::from(&reg_l2_loss(weight_decay, &vs.variables()));

        // four entries of 2.0: l2 = 4 * 4 / 2 = 8
        assert!(abs_diff_eq!(loss, weight_decay * 8.0, epsilon = 1e-6));
    }

    #[test]
    fn penalty_ignores_non_matching_names() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _weight = root.sub("conv").var("weight", &[2], nn::Init::Const(1.0));
        let with_weight = f64::from(&reg_l2_loss(1.0, &vs.variables()));

        let _bias = root.sub("conv").var("bias", &[16], nn::Init::Const(3.0));
        let with_bias = f64::from(&reg_l2_loss(1.0, &vs.variables()));

        assert!(abs_diff_eq!(with_weight, with_bias, epsilon = 1e-6));
    }
}
