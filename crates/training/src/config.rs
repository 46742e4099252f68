use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use model::{ModelConfig, StageConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }
        if self.model.image_size == 0 {
            errors.push("model.image_size must be greater than 0".to_string());
        }
        if self.model.window_size == 0 {
            errors.push("model.window_size must be greater than 0".to_string());
        }

        if self.data.splits.is_empty() {
            errors.push("data.splits must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.loss.gamma < 0.0 {
            errors.push("loss.gamma must be >= 0".to_string());
        }
        if self.loss.alpha <= 0.0 {
            errors.push("loss.alpha must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push("loss.label_smoothing must be in [0, 1)".to_string());
        }

        if !(0.0 < self.schedule.plateau_factor && self.schedule.plateau_factor < 1.0) {
            errors.push("schedule.plateau_factor must be in (0, 1)".to_string());
        }
        if self.schedule.plateau_patience == 0 {
            errors.push("schedule.plateau_patience must be greater than 0".to_string());
        }
        if self.schedule.min_learning_rate < 0.0 {
            errors.push("schedule.min_learning_rate must be >= 0".to_string());
        }
        if self.schedule.min_learning_rate > self.optimizer.learning_rate {
            errors.push(
                "schedule.min_learning_rate cannot exceed optimizer.learning_rate".to_string(),
            );
        }
        if self.schedule.early_stop_patience == 0 {
            errors.push("schedule.early_stop_patience must be greater than 0".to_string());
        }
        if self.schedule.early_stop_patience <= self.schedule.plateau_patience {
            errors.push(
                "schedule.early_stop_patience should exceed schedule.plateau_patience".to_string(),
            );
        }

        if self.runtime.max_epochs == 0 {
            errors.push("runtime.max_epochs must be greater than 0".to_string());
        }
        if self.runtime.artifacts_dir.as_os_str().is_empty() {
            errors.push("runtime.artifacts_dir must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if self.data.root.is_relative() {
            self.data.root = base.join(&self.data.root);
        }
        if self.runtime.artifacts_dir.is_relative() {
            self.runtime.artifacts_dir = base.join(&self.runtime.artifacts_dir);
        }
        if let Some(dir) = self.runtime.logging.tensorboard.as_mut() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Resolves the architecture the configuration describes.
    pub fn build_model_config(&self, device: Device) -> ModelConfig {
        let mut config = ModelConfig::new(self.model.num_classes, device);
        config.image_size = self.model.image_size;
        config.window_size = self.model.window_size;
        config.stem_channels = self.model.stem_channels;
        if let Some(stages) = &self.model.stages {
            config.stages = stages.clone();
        }
        if let Some(hidden) = self.model.head_hidden {
            config.head_hidden = hidden;
        }
        if let Some(heads) = self.model.head_num_heads {
            config.head_num_heads = heads;
        }
        config
    }
}

/// Architecture knobs. The defaults reproduce the reference network; tests
/// shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_stem_channels")]
    pub stem_channels: usize,
    #[serde(default)]
    pub head_hidden: Option<usize>,
    #[serde(default)]
    pub head_num_heads: Option<usize>,
    #[serde(default)]
    pub stages: Option<Vec<StageConfig>>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            image_size: default_image_size(),
            window_size: default_window_size(),
            stem_channels: default_stem_channels(),
            head_hidden: None,
            head_num_heads: None,
            stages: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root directory holding `{split}/train` and `{split}/test` shard
    /// directories.
    pub root: PathBuf,
    #[serde(default = "default_splits")]
    pub splits: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            alpha: default_alpha(),
            label_smoothing: default_label_smoothing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_plateau_factor")]
    pub plateau_factor: f64,
    #[serde(default = "default_plateau_patience")]
    pub plateau_patience: usize,
    #[serde(default = "default_min_learning_rate")]
    pub min_learning_rate: f64,
    #[serde(default = "default_early_stop_patience")]
    pub early_stop_patience: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            plateau_factor: default_plateau_factor(),
            plateau_patience: default_plateau_patience(),
            min_learning_rate: default_min_learning_rate(),
            early_stop_patience: default_early_stop_patience(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_epochs: default_max_epochs(),
            artifacts_dir: default_artifacts_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

fn default_num_classes() -> usize {
    11
}
fn default_image_size() -> usize {
    224
}
fn default_window_size() -> usize {
    7
}
fn default_stem_channels() -> usize {
    24
}
fn default_splits() -> Vec<String> {
    vec!["90-10".to_string()]
}
fn default_batch_size() -> usize {
    24
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_epsilon() -> f64 {
    1e-8
}
fn default_gamma() -> f64 {
    2.0
}
fn default_alpha() -> f64 {
    0.25
}
fn default_label_smoothing() -> f64 {
    0.1
}
fn default_plateau_factor() -> f64 {
    0.5
}
fn default_plateau_patience() -> usize {
    3
}
fn default_min_learning_rate() -> f64 {
    1e-20
}
fn default_early_stop_patience() -> usize {
    10
}
fn default_seed() -> u64 {
    42
}
fn default_max_epochs() -> usize {
    200
}
fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}
fn default_true() -> bool {
    true
}
fn default_flush_every() -> usize {
    20
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) => None,
            TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
