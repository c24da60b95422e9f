//! Training parameter surface.

use crate::common::*;
use det_loss::{DataFormat, IouKind};

/// Configuration errors that fail fast before any tensor computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An unrecognized selector string, with the offending value.
    InvalidConfiguration {
        field: &'static str,
        value: String,
    },
    /// Mutually exclusive options supplied together.
    ConfigurationConflict { message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { field, value } => {
                write!(f, "invalid {}: '{}'", field, value)
            }
            Self::ConfigurationConflict { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Distribution strategy of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Tpu,
    Horovod,
    Other,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let strategy = match text {
            "tpu" => Self::Tpu,
            "horovod" => Self::Horovod,
            "other" => Self::Other,
            _ => {
                return Err(ConfigError::InvalidConfiguration {
                    field: "strategy",
                    value: text.to_owned(),
                })
            }
        };
        Ok(strategy)
    }
}

/// Learning rate decay strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrDecayMethod {
    Stepwise,
    Cosine,
    Polynomial,
    Constant,
}

impl FromStr for LrDecayMethod {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let method = match text {
            "stepwise" => Self::Stepwise,
            "cosine" => Self::Cosine,
            "polynomial" => Self::Polynomial,
            "constant" => Self::Constant,
            _ => {
                return Err(ConfigError::InvalidConfiguration {
                    field: "lr_decay_method",
                    value: text.to_owned(),
                })
            }
        };
        Ok(method)
    }
}

/// Optimizer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let kind = match text {
            "sgd" => Self::Sgd,
            "adam" => Self::Adam,
            _ => {
                return Err(ConfigError::InvalidConfiguration {
                    field: "optimizer",
                    value: text.to_owned(),
                })
            }
        };
        Ok(kind)
    }
}

/// Model architecture family, derived from the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    EfficientDet,
    RetinaNet,
}

/// The flat training parameter record.
///
/// All fields are primary; derived schedule fields live in
/// [ScheduleParams](crate::ScheduleParams) and are computed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub name: String,
    pub strategy: Strategy,
    pub batch_size: usize,
    pub num_shards: usize,
    pub learning_rate: R64,
    pub lr_decay_method: LrDecayMethod,
    pub lr_warmup_init: R64,
    pub lr_warmup_epoch: R64,
    pub first_lr_drop_epoch: R64,
    pub second_lr_drop_epoch: R64,
    pub poly_lr_power: R64,
    pub num_epochs: R64,
    pub num_examples_per_epoch: usize,
    pub optimizer: OptimizerKind,
    pub momentum: R64,
    pub clip_gradients_norm: R64,
    pub moving_average_decay: R64,
    pub weight_decay: R64,
    pub alpha: R64,
    pub gamma: R64,
    pub label_smoothing: R64,
    pub delta: R64,
    pub box_loss_weight: R64,
    pub iou_loss_weight: R64,
    pub iou_loss_type: Option<IouKind>,
    pub num_classes: i64,
    pub data_format: DataFormat,
    pub ckpt: Option<PathBuf>,
    pub backbone_ckpt: Option<PathBuf>,
    pub backbone_name: String,
    pub ckpt_var_scope: Option<String>,
    pub var_exclude_expr: Option<String>,
    pub mixed_precision: bool,
    pub is_training_bn: bool,
    pub val_json_file: Option<PathBuf>,
    pub testdev_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            name: "efficientdet-d0".into(),
            strategy: Strategy::Other,
            batch_size: 64,
            num_shards: 8,
            learning_rate: r64(0.08),
            lr_decay_method: LrDecayMethod::Cosine,
            lr_warmup_init: r64(0.008),
            lr_warmup_epoch: r64(1.0),
            first_lr_drop_epoch: r64(200.0),
            second_lr_drop_epoch: r64(250.0),
            poly_lr_power: r64(0.9),
            num_epochs: r64(300.0),
            num_examples_per_epoch: 120_000,
            optimizer: OptimizerKind::Sgd,
            momentum: r64(0.9),
            clip_gradients_norm: r64(10.0),
            moving_average_decay: r64(0.9998),
            weight_decay: r64(4e-5),
            alpha: r64(0.25),
            gamma: r64(1.5),
            label_smoothing: r64(0.0),
            delta: r64(0.1),
            box_loss_weight: r64(50.0),
            iou_loss_weight: r64(1.0),
            iou_loss_type: None,
            num_classes: 90,
            data_format: DataFormat::ChannelsLast,
            ckpt: None,
            backbone_ckpt: None,
            backbone_name: "efficientnet-b0".into(),
            ckpt_var_scope: None,
            var_exclude_expr: None,
            mixed_precision: false,
            is_training_bn: true,
            val_json_file: None,
            testdev_dir: None,
            model_dir: None,
        }
    }
}

impl Params {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let params = json5::from_str(&text)?;
        Ok(params)
    }

    /// Validate primary fields before any graph or tensor work starts.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.num_shards > 0, "num_shards must be positive");
        ensure!(
            self.num_examples_per_epoch > 0,
            "num_examples_per_epoch must be positive"
        );
        ensure!(
            self.learning_rate.raw() > 0.0,
            "learning_rate must be positive, but got {}",
            self.learning_rate
        );
        ensure!(
            (0.0..1.0).contains(&self.moving_average_decay.raw()),
            "moving_average_decay must be in range [0, 1), but got {}",
            self.moving_average_decay
        );

        if self.val_json_file.is_some() && self.testdev_dir.is_some() {
            return Err(ConfigError::ConfigurationConflict {
                message: "val_json_file and testdev_dir are mutually exclusive".into(),
            }
            .into());
        }

        self.model_family()?;
        Ok(())
    }

    /// Architecture family of the configured model name.
    pub fn model_family(&self) -> Result<ModelFamily> {
        if self.name.contains("retinanet") {
            Ok(ModelFamily::RetinaNet)
        } else if self.name.contains("efficientdet") {
            Ok(ModelFamily::EfficientDet)
        } else {
            Err(ConfigError::InvalidConfiguration {
                field: "name",
                value: self.name.clone(),
            }
            .into())
        }
    }
}
