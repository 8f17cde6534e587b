use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{loss::LossKind, models::ModelConfig, optimizer::OptimizerKind, scheduler::LrSchedule};

/// Settings of one weak-to-strong training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_ds_name")]
    pub ds_name: String,
    /// Directory holding one sub-directory of JSONL splits per dataset.
    pub data_root: PathBuf,
    #[serde(default = "default_n_docs")]
    pub n_docs: usize,
    #[serde(default = "default_n_test_docs")]
    pub n_test_docs: usize,
    #[serde(default = "default_model_size")]
    pub model_size: String,
    /// Overrides the model's default learning rate.
    #[serde(default)]
    pub lr: Option<f64>,
    /// Overrides the model's default optimizer.
    #[serde(default)]
    pub optim: Option<String>,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub force_retrain: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub minibatch_size_per_device: Option<usize>,
    #[serde(default)]
    pub train_with_dropout: bool,
    #[serde(default = "default_results_folder")]
    pub results_folder: PathBuf,
    #[serde(default)]
    pub linear_probe: bool,
    #[serde(default = "default_lr_schedule")]
    pub lr_schedule: String,
    #[serde(default)]
    pub log_prefix: String,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    #[serde(default = "default_loss")]
    pub loss: String,
    #[serde(default)]
    pub loss_options: LossOptions,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_ctx")]
    pub max_ctx: usize,
    /// Train on previously written weak labels instead of the ground truth.
    #[serde(default)]
    pub weak_labels_path: Option<PathBuf>,
    #[serde(default = "default_sweep_subfolder")]
    pub sweep_subfolder: String,
    /// `tokenizer.json` to use; defaults to the one next to the model weights.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    /// Shard the saved weights once they exceed this many bytes.
    #[serde(default)]
    pub max_shard_bytes: Option<usize>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Additional model entries on top of the built-in presets.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossOptions {
    #[serde(default = "default_aux_coef")]
    pub aux_coef: f64,
    #[serde(default = "default_warmup_frac")]
    pub warmup_frac: f64,
    #[serde(default = "default_exponent")]
    pub alpha: f64,
    #[serde(default = "default_exponent")]
    pub beta: f64,
}

impl Default for LossOptions {
    fn default() -> Self {
        Self {
            aux_coef: default_aux_coef(),
            warmup_frac: default_warmup_frac(),
            alpha: default_exponent(),
            beta: default_exponent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write `log.jsonl` (and optional TensorBoard events) under the save path.
    #[serde(default = "default_true")]
    pub kv_log: bool,
    #[serde(default)]
    pub tensorboard: bool,
    /// Append one row per logging interval to `metrics.csv` under the save path.
    #[serde(default)]
    pub metrics_csv: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            kv_log: true,
            tensorboard: false,
            metrics_csv: false,
        }
    }
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
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

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let config = Self::from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.ds_name.trim().is_empty() {
            errors.push("ds_name must not be empty".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if let Some(mb) = self.minibatch_size_per_device {
            if mb == 0 {
                errors.push("minibatch_size_per_device must be greater than 0".to_string());
            }
        }
        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }
        if self.max_ctx == 0 {
            errors.push("max_ctx must be greater than 0".to_string());
        }
        if let Some(lr) = self.lr {
            if lr <= 0.0 {
                errors.push("lr must be greater than 0".to_string());
            }
        }
        if let Some(0) = self.max_shard_bytes {
            errors.push("max_shard_bytes must be greater than 0".to_string());
        }
        if let Some(optim) = &self.optim {
            if let Err(err) = optim.parse::<OptimizerKind>() {
                errors.extend(err.into_messages());
            }
        }
        if let Err(err) = self.lr_schedule.parse::<LrSchedule>() {
            errors.extend(err.into_messages());
        }
        if let Err(err) = self.loss.parse::<LossKind>() {
            errors.extend(err.into_messages());
        }
        if !(0.0..=1.0).contains(&self.loss_options.aux_coef) {
            errors.push("loss_options.aux_coef must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.loss_options.warmup_frac) {
            errors.push("loss_options.warmup_frac must be in [0, 1]".to_string());
        }
        for model in &self.models {
            if model.name.trim().is_empty() {
                errors.push("models entries must have a name".to_string());
            }
            if model.eval_batch_size == 0 {
                errors.push(format!("models.{}.eval_batch_size must be greater than 0", model.name));
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    pub fn optimizer_override(&self) -> Result<Option<OptimizerKind>, TrainingError> {
        self.optim.as_deref().map(str::parse).transpose()
    }

    pub fn lr_schedule(&self) -> Result<LrSchedule, TrainingError> {
        self.lr_schedule.parse()
    }

    pub fn loss_kind(&self) -> Result<LossKind, TrainingError> {
        self.loss.parse()
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data_root, base);
        absolutize_in_place(&mut self.results_folder, base);
        for path in [self.weak_labels_path.as_mut(), self.tokenizer_path.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
        let local_model = base.join(&self.model_size);
        if Path::new(&self.model_size).is_relative() && local_model.is_dir() {
            self.model_size = local_model.to_string_lossy().into_owned();
        }
        for model in &mut self.models {
            let candidate = base.join(&model.name);
            if Path::new(&model.name).is_relative() && candidate.is_dir() {
                model.name = candidate.to_string_lossy().into_owned();
            }
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_ds_name() -> String {
    "sciq".to_string()
}

fn default_n_docs() -> usize {
    20_000
}

fn default_n_test_docs() -> usize {
    10_000
}

fn default_model_size() -> String {
    "gpt2".to_string()
}

fn default_epochs() -> usize {
    2
}

fn default_results_folder() -> PathBuf {
    PathBuf::from("results")
}

fn default_lr_schedule() -> String {
    "cosine_anneal".to_string()
}

fn default_log_every() -> usize {
    10
}

fn default_loss() -> String {
    "xent".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_max_ctx() -> usize {
    1024
}

fn default_sweep_subfolder() -> String {
    "default".to_string()
}

fn default_aux_coef() -> f64 {
    0.5
}

fn default_warmup_frac() -> f64 {
    0.1
}

fn default_exponent() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Dataset(datasets::Error),
    Model(model::Error),
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

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    fn into_messages(self) -> Vec<String> {
        match self {
            TrainingError::Validation(messages) => messages,
            other => vec![other.to_string()],
        }
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "I/O error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Dataset(err) => write!(f, "dataset error: {}", err),
            TrainingError::Model(err) => write!(f, "model error: {}", err),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Dataset(err) => Some(err),
            TrainingError::Model(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
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

impl From<csv::Error> for TrainingError {
    fn from(value: csv::Error) -> Self {
        TrainingError::Runtime(format!("metrics csv: {}", value))
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<datasets::Error> for TrainingError {
    fn from(value: datasets::Error) -> Self {
        TrainingError::Dataset(value)
    }
}

impl From<model::Error> for TrainingError {
    fn from(value: model::Error) -> Self {
        TrainingError::Model(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn toml_config_fills_defaults_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "exp.toml",
            "data_root = \"data\"\nds_name = \"boolq\"\nlr = 1e-4\n",
        );
        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.ds_name, "boolq");
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.epochs, 2);
        assert_eq!(config.lr_schedule().unwrap(), LrSchedule::CosineAnneal);
        assert_eq!(config.data_root, dir.path().join("data"));
        assert_eq!(config.results_folder, dir.path().join("results"));
    }

    #[test]
    fn json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "exp.json",
            r#"{"data_root": "/data", "optim": "adafactor", "loss": "logconf"}"#,
        );
        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.optimizer_override().unwrap(), Some(OptimizerKind::Adafactor));
        assert_eq!(config.loss_kind().unwrap(), LossKind::Logconf);
        assert_eq!(config.data_root, PathBuf::from("/data"));
    }

    #[test]
    fn validation_collects_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "bad.toml",
            "data_root = \"d\"\nbatch_size = 0\noptim = \"sgd\"\nlr_schedule = \"linear\"\n",
        );
        match ExperimentConfig::load(&path) {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 3, "{messages:?}");
                assert!(messages.iter().any(|m| m.contains("sgd")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "exp.yaml", "data_root: x");
        assert!(matches!(
            ExperimentConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
