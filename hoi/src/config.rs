use std::{ffi::OsString, path::{Path, PathBuf}};

use burn::config::Config;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HoiError, Result};

/// Options where an empty string means "not set".
const UNSET_WHEN_EMPTY: [&str; 5] = ["frozen_weights", "coco_path", "coco_panoptic_path", "resume", "verb_alpha"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum PositionEmbedding {
    Sine,
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum VerbLossType {
    Focal,
    Bce,
}

/// How subject and object box costs are combined in the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum BoxMatcher {
    SplitMax,
    SplitSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DatasetFile {
    Hico,
    Vcoco,
}

impl DatasetFile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetFile::Hico => "hico",
            DatasetFile::Vcoco => "vcoco",
        }
    }
}

/// Parsed form of the `--device` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Mps,
}

impl DeviceKind {
    /// `cpu`, `cuda`, `cuda:<index>` or `mps`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" => Ok(DeviceKind::Cuda(0)),
            "mps" => Ok(DeviceKind::Mps),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(DeviceKind::Cuda)
                .ok_or_else(|| HoiError::Usage(format!("unrecognized device `{name}`"))),
        }
    }
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(name = "hoi", about = "HOI Relation Extraction Model", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct HoiConfig {
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,
    #[arg(long, default_value_t = 1e-5)]
    pub lr_backbone: f64,
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,
    #[arg(long, default_value_t = 60)]
    pub epochs: usize,
    #[arg(long, default_value_t = 40)]
    pub lr_drop: usize,
    /// Gradient clipping max norm
    #[arg(long, default_value_t = 0.1)]
    pub clip_max_norm: f64,

    /// Path to the pretrained model. If set, only the prediction heads are trained
    #[arg(long)]
    pub frozen_weights: Option<PathBuf>,
    /// Name of the convolutional backbone to use
    #[arg(long, default_value = "resnet50")]
    pub backbone: String,
    /// Replace stride with dilation in the last convolutional block (DC5)
    #[arg(long)]
    pub dilation: bool,
    #[arg(long, value_enum, default_value_t = PositionEmbedding::Sine)]
    pub position_embedding: PositionEmbedding,

    #[arg(long, default_value_t = 4)]
    pub enc_layers: usize,
    #[arg(long, default_value_t = 6)]
    pub dec_layers: usize,
    #[arg(long, default_value_t = 2)]
    pub hoi_enc_layers: usize,
    #[arg(long, default_value_t = 0)]
    pub hoi_dec_layers: usize,
    #[arg(long, default_value_t = 2048)]
    pub dim_feedforward: usize,
    #[arg(long, default_value_t = 2048)]
    pub dim_feedforward_hoi: usize,
    #[arg(long, default_value_t = 256)]
    pub hidden_dim: usize,
    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,
    #[arg(long, default_value_t = 8)]
    pub nheads: usize,
    #[arg(long, default_value_t = 8)]
    pub nheads_hoi: usize,
    #[arg(long, default_value_t = 100)]
    pub num_queries: usize,
    #[arg(long)]
    pub pre_norm: bool,

    #[arg(long)]
    pub load_bottleneck_dec_ca_weights: bool,
    #[arg(long, default_value = "hoi_bottleneck")]
    pub hoi_enc_type: String,
    #[arg(long, default_value = "vanilla_bottleneck")]
    pub vanilla_dec_type: String,
    #[arg(long, default_value = "vanilla")]
    pub hoi_dec_type: String,

    /// Train segmentation head if the flag is provided
    #[arg(long)]
    pub masks: bool,

    /// Train for HOI if the flag is provided
    #[arg(long)]
    pub hoi: bool,
    #[arg(long, default_value_t = 80)]
    pub num_obj_classes: usize,
    #[arg(long, default_value_t = 117)]
    pub num_verb_classes: usize,
    #[arg(long, default_value = "hoi_params/detr-r50-pre.pth")]
    pub pretrained: String,
    #[arg(long, default_value_t = 0)]
    pub subject_category_id: usize,
    #[arg(long, value_enum, default_value_t = VerbLossType::Focal)]
    pub verb_loss_type: VerbLossType,
    #[arg(long, default_value_t = 2.0)]
    pub verb_gamma: f64,
    #[arg(long)]
    pub verb_alpha: Option<f64>,
    #[arg(long)]
    pub split_query: bool,
    #[arg(long)]
    pub interact_query: bool,

    /// Auxiliary decoding losses (loss at each layer), cleared by `--no_aux_loss`
    #[arg(long = "no_aux_loss", action = ArgAction::SetFalse)]
    pub aux_loss: bool,
    #[arg(long)]
    pub use_matching: bool,

    #[arg(long, default_value_t = 1.0)]
    pub set_cost_class: f64,
    #[arg(long, default_value_t = 2.5)]
    pub set_cost_bbox: f64,
    #[arg(long, default_value_t = 1.0)]
    pub set_cost_giou: f64,
    #[arg(long, default_value_t = 1.0)]
    pub set_cost_obj_class: f64,
    #[arg(long, default_value_t = 1.0)]
    pub set_cost_verb_class: f64,
    #[arg(long, value_enum, default_value_t = BoxMatcher::SplitMax)]
    pub box_matcher: BoxMatcher,
    #[arg(long, default_value_t = 1.0)]
    pub set_cost_matching: f64,

    #[arg(long, default_value_t = 1.0)]
    pub mask_loss_coef: f64,
    #[arg(long, default_value_t = 1.0)]
    pub dice_loss_coef: f64,
    #[arg(long, default_value_t = 2.5)]
    pub bbox_loss_coef: f64,
    #[arg(long, default_value_t = 1.0)]
    pub giou_loss_coef: f64,
    #[arg(long, default_value_t = 1.0)]
    pub obj_loss_coef: f64,
    #[arg(long, default_value_t = 1.0)]
    pub verb_loss_coef: f64,
    /// Relative classification weight of the no-object class
    #[arg(long, default_value_t = 0.1)]
    pub eos_coef: f64,

    #[arg(long, value_enum, default_value_t = DatasetFile::Hico)]
    pub dataset_file: DatasetFile,
    #[arg(long)]
    pub coco_path: Option<PathBuf>,
    #[arg(long)]
    pub coco_panoptic_path: Option<PathBuf>,
    #[arg(long)]
    pub remove_difficult: bool,
    #[arg(long, default_value = "data/hico_20160224_det")]
    pub hoi_path: PathBuf,

    #[arg(long, default_value = "logs_hoi")]
    pub output_dir: PathBuf,
    #[arg(long, default_value = "cuda")]
    pub device: String,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long)]
    pub resume: Option<PathBuf>,
    #[arg(long, default_value_t = 0)]
    pub start_epoch: usize,
    #[arg(long)]
    pub eval: bool,
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 1)]
    pub world_size: usize,
    #[arg(long, default_value = "env://")]
    pub dist_url: String,

    #[arg(long, default_value_t = 0)]
    pub freeze_mode: usize,
    #[arg(long)]
    pub obj_reweight: bool,
    #[arg(long)]
    pub verb_reweight: bool,
    #[arg(long)]
    pub use_static_weights: bool,
    /// Max size of the label queue used for reweighting, one HICO epoch by default
    #[arg(long, default_value_t = 4704.0)]
    pub queue_size: f64,
    #[arg(long, default_value_t = 0.7)]
    pub p_obj: f64,
    #[arg(long, default_value_t = 0.7)]
    pub p_verb: f64,

    #[arg(long)]
    pub use_nms_filter: bool,
    #[arg(long, default_value_t = 0.7)]
    pub thres_nms: f64,
    #[arg(long, default_value_t = 1.0)]
    pub nms_alpha: f64,
    #[arg(long, default_value_t = 0.5)]
    pub nms_beta: f64,
    #[arg(long, default_value = "results.json")]
    pub json_file: String,
}

impl Config for HoiConfig {}

impl Default for HoiConfig {
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl HoiConfig {
    /// Defaults used when the controller is built without explicit overrides.
    pub fn controller_default() -> Self {
        Self { hoi: true, ..Self::default() }
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::try_parse_from(args).map_err(|err| HoiError::Usage(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies a JSON object of `option -> value` on top of the defaults.
    pub fn from_overrides(overrides: &Value) -> Result<Self> {
        let Value::Object(overrides) = overrides else {
            return Err(HoiError::Usage(format!("overrides must be an object, got {overrides}")));
        };
        let Value::Object(mut merged) = serde_json::to_value(Self::default())? else {
            return Err(HoiError::Config("default options are not a key/value set".to_string()));
        };

        for (key, value) in overrides {
            if !merged.contains_key(key) {
                return Err(HoiError::Usage(format!("unrecognized option `{key}`")));
            }
            let value = match value {
                Value::String(s) if s.is_empty() && UNSET_WHEN_EMPTY.contains(&key.as_str()) => Value::Null,
                _ => value.clone(),
            };
            merged.insert(key.clone(), value);
        }

        let config: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|err| HoiError::Usage(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.lr_drop == 0 {
            errors.push("lr_drop must be greater than 0".to_string());
        }
        if self.num_queries == 0 {
            errors.push("num_queries must be greater than 0".to_string());
        }
        if self.world_size == 0 {
            errors.push("world_size must be greater than 0".to_string());
        }
        if self.hidden_dim == 0 || self.hidden_dim % 2 != 0 {
            errors.push(format!("hidden_dim must be a positive even number, got {}", self.hidden_dim));
        }
        if self.nheads == 0 || self.hidden_dim % self.nheads != 0 {
            errors.push(format!("hidden_dim {} is not divisible by nheads {}", self.hidden_dim, self.nheads));
        }
        if self.nheads_hoi == 0 || self.hidden_dim % self.nheads_hoi != 0 {
            errors.push(format!("hidden_dim {} is not divisible by nheads_hoi {}", self.hidden_dim, self.nheads_hoi));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !(self.p_obj > 0.0 && self.p_obj <= 1.0) || !(self.p_verb > 0.0 && self.p_verb <= 1.0) {
            errors.push("p_obj and p_verb must be in (0, 1]".to_string());
        }
        if self.queue_size <= 0.0 {
            errors.push("queue_size must be positive".to_string());
        }
        if self.lr < 0.0 || self.lr_backbone < 0.0 || self.weight_decay < 0.0 {
            errors.push("learning rates and weight_decay must not be negative".to_string());
        }

        if let Err(err) = DeviceKind::parse(&self.device) {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HoiError::Config(errors.join("; ")))
        }
    }

    pub fn resume_path(&self) -> Option<&Path> {
        self.resume.as_deref().filter(|path| !path.as_os_str().is_empty())
    }

    pub fn frozen_weights_path(&self) -> Option<&Path> {
        self.frozen_weights.as_deref().filter(|path| !path.as_os_str().is_empty())
    }

    pub fn device_kind(&self) -> Result<DeviceKind> {
        DeviceKind::parse(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_follow_the_option_table() {
        let config = HoiConfig::default();
        assert_eq!(config.lr, 1e-4);
        assert_eq!(config.lr_backbone, 1e-5);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.epochs, 60);
        assert_eq!(config.lr_drop, 40);
        assert_eq!(config.enc_layers, 4);
        assert_eq!(config.num_verb_classes, 117);
        assert_eq!(config.queue_size, 4704.0);
        assert_eq!(config.position_embedding, PositionEmbedding::Sine);
        assert_eq!(config.box_matcher, BoxMatcher::SplitMax);
        assert_eq!(config.hoi_path, PathBuf::from("data/hico_20160224_det"));
        assert!(config.aux_loss);
        assert!(!config.hoi);
        assert!(config.frozen_weights.is_none());
        assert!(config.verb_alpha.is_none());
        assert!(HoiConfig::controller_default().hoi);
    }

    #[test]
    fn cli_flags_use_option_names() {
        let config = HoiConfig::from_args([
            "hoi", "--lr_backbone", "0.001", "--no_aux_loss", "--hoi", "--position_embedding", "learned",
            "--box_matcher", "split_sum", "--verb_alpha", "0.25",
        ])
        .unwrap();
        assert_eq!(config.lr_backbone, 0.001);
        assert!(!config.aux_loss);
        assert!(config.hoi);
        assert_eq!(config.position_embedding, PositionEmbedding::Learned);
        assert_eq!(config.box_matcher, BoxMatcher::SplitSum);
        assert_eq!(config.verb_alpha, Some(0.25));
    }

    #[test]
    fn cli_rejects_unknown_flag_and_bad_choice() {
        assert!(matches!(HoiConfig::from_args(["hoi", "--learning_rate", "1"]), Err(HoiError::Usage(_))));
        assert!(matches!(
            HoiConfig::from_args(["hoi", "--position_embedding", "rotary"]),
            Err(HoiError::Usage(_))
        ));
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let config = HoiConfig::from_overrides(&json!({
            "hoi": true,
            "epochs": 3,
            "set_cost_bbox": 5,
            "resume": "",
            "output_dir": "/tmp/out",
        }))
        .unwrap();
        assert!(config.hoi);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.set_cost_bbox, 5.0);
        assert!(config.resume_path().is_none());
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.lr, 1e-4);
    }

    #[test]
    fn overrides_reject_unknown_keys_types_and_choices() {
        let unknown = HoiConfig::from_overrides(&json!({ "no_such_option": 1 }));
        assert!(matches!(unknown, Err(HoiError::Usage(msg)) if msg.contains("no_such_option")));

        let bad_type = HoiConfig::from_overrides(&json!({ "epochs": "many" }));
        assert!(matches!(bad_type, Err(HoiError::Usage(_))));

        let bad_choice = HoiConfig::from_overrides(&json!({ "verb_loss_type": "hinge" }));
        assert!(matches!(bad_choice, Err(HoiError::Usage(_))));

        assert!(matches!(HoiConfig::from_overrides(&json!([1, 2])), Err(HoiError::Usage(_))));
    }

    #[test]
    fn validate_collects_numeric_errors() {
        let config = HoiConfig { batch_size: 0, lr_drop: 0, nheads: 7, ..HoiConfig::default() };
        let Err(HoiError::Config(msg)) = config.validate() else {
            panic!("expected a config error");
        };
        assert!(msg.contains("batch_size"));
        assert!(msg.contains("lr_drop"));
        assert!(msg.contains("nheads"));
    }

    #[test]
    fn config_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = HoiConfig { seed: 7, masks: true, ..HoiConfig::controller_default() };
        config.save(&path).unwrap();
        assert_eq!(HoiConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn device_strings_are_parsed_strictly() {
        assert_eq!(DeviceKind::parse("cpu").unwrap(), DeviceKind::Cpu);
        assert_eq!(DeviceKind::parse("cuda").unwrap(), DeviceKind::Cuda(0));
        assert_eq!(DeviceKind::parse("cuda:3").unwrap(), DeviceKind::Cuda(3));
        assert_eq!(DeviceKind::parse("mps").unwrap(), DeviceKind::Mps);
        assert!(matches!(DeviceKind::parse("cuda:x"), Err(HoiError::Usage(_))));
        assert!(matches!(DeviceKind::parse("tpu"), Err(HoiError::Usage(_))));

        let config = HoiConfig { device: "gpu0".to_string(), ..HoiConfig::default() };
        assert!(matches!(config.validate(), Err(HoiError::Config(msg)) if msg.contains("gpu0")));
    }
}
