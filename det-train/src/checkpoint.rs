//! Checkpoint saving and scoped restoration.

use crate::{
    common::*,
    config::{ConfigError, Params},
    estimator::Mode,
};
use chrono::Local;
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// Save parameters to a checkpoint file under the model directory.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    model_dir: &Path,
    training_step: i64,
    loss: f64,
) -> Result<()> {
    let filename = format!(
        "{}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        training_step,
        loss
    );
    let path = model_dir.join(filename);
    vs.save(&path)?;
    Ok(())
}

/// Mapping from checkpoint variable names to live variable names.
///
/// Live names under `var_scope` are remapped to the corresponding names under
/// `ckpt_scope`; names matching the exclusion regex are dropped. Empty scopes
/// map every variable unchanged.
pub fn ckpt_var_map(
    live_names: &[String],
    ckpt_scope: &str,
    var_scope: &str,
    exclude: Option<&Regex>,
) -> IndexMap<String, String> {
    live_names
        .iter()
        .sorted()
        .filter_map(|live_name| {
            let suffix = live_name.strip_prefix(var_scope)?;
            if let Some(exclude) = exclude {
                if exclude.is_match(live_name) {
                    return None;
                }
            }
            Some((format!("{}{}", ckpt_scope, suffix), live_name.clone()))
        })
        .collect()
}

/// Restore variables from a checkpoint with scope prefix remapping.
pub fn restore_scoped(
    vs: &mut nn::VarStore,
    ckpt_path: &Path,
    ckpt_scope: &str,
    var_scope: &str,
    exclude: Option<&str>,
) -> Result<()> {
    let exclude = exclude
        .map(Regex::new)
        .transpose()
        .with_context(|| "invalid variable exclusion expression")?;

    let live_vars = vs.variables();
    let live_names: Vec<_> = live_vars.keys().cloned().collect();
    let var_map = ckpt_var_map(&live_names, ckpt_scope, var_scope, exclude.as_ref());

    let named_tensors = Tensor::load_multi(ckpt_path)
        .with_context(|| format!("failed to load checkpoint '{}'", ckpt_path.display()))?;

    let mut num_restored = 0;
    tch::no_grad(|| -> Result<()> {
        for (ckpt_name, tensor) in named_tensors {
            if let Some(live_name) = var_map.get(&ckpt_name) {
                let mut live = live_vars[live_name].shallow_clone();
                ensure!(
                    live.size() == tensor.size(),
                    "shape mismatch for variable '{}': {:?} vs {:?}",
                    live_name,
                    live.size(),
                    tensor.size()
                );
                let _ = live.copy_(&tensor);
                num_restored += 1;
            }
        }
        Ok(())
    })?;

    info!(
        "restored {} variables from {}",
        num_restored,
        ckpt_path.display()
    );
    Ok(())
}

/// How variables are initialized before a run starts.
///
/// Selected once by a pure function of the mode and the finalized parameters;
/// the restore itself executes once at run initialization, never per-step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scaffold {
    RestoreCheckpoint {
        path: PathBuf,
        ckpt_scope: String,
        var_scope: String,
        exclude: Option<String>,
    },
    RestoreEma,
    None,
}

impl Scaffold {
    pub fn select(mode: Mode, params: &Params) -> Result<Self> {
        let scaffold = match mode {
            Mode::Train => match (&params.ckpt, &params.backbone_ckpt) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::ConfigurationConflict {
                        message: "ckpt and backbone_ckpt are mutually exclusive".into(),
                    }
                    .into())
                }
                (Some(ckpt), None) => {
                    // a full checkpoint restores every variable
                    Self::RestoreCheckpoint {
                        path: ckpt.clone(),
                        ckpt_scope: String::new(),
                        var_scope: String::new(),
                        exclude: params.var_exclude_expr.clone(),
                    }
                }
                (None, Some(backbone_ckpt)) => {
                    let var_scope = format!("{}.", params.backbone_name);
                    // the backbone name is the default checkpoint scope
                    let ckpt_scope = match &params.ckpt_var_scope {
                        Some(scope) => format!("{}.", scope),
                        None => var_scope.clone(),
                    };
                    Self::RestoreCheckpoint {
                        path: backbone_ckpt.clone(),
                        ckpt_scope,
                        var_scope,
                        exclude: params.var_exclude_expr.clone(),
                    }
                }
                (None, None) => Self::None,
            },
            Mode::Eval => {
                if params.moving_average_decay.raw() > 0.0 {
                    Self::RestoreEma
                } else {
                    Self::None
                }
            }
            Mode::Predict => Self::None,
        };
        Ok(scaffold)
    }
}
