//! End-to-end run of one weak-to-strong training configuration.
//!
//! Loads and tokenizes the dataset, trains (or resumes) the model under
//! `<results_folder>/<sweep_subfolder>/<config_name>`, writes the model's
//! predictions on the held-out half as weak labels, and a summary file next
//! to the run directory.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use candle_core::Device;
use datasets::{
    load_tokenizer, tokenize_dataset, weak_labels, DatasetRegistry, Example, SplitSizes,
    TextTokenizer,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    checkpoint::write_json,
    config::ExperimentConfig,
    device::available_devices,
    eval::mean_accuracy,
    logging::KvLogger,
    models::{ModelConfig, ModelRegistry},
    orchestrate::{train_and_save_model, TrainAndSaveOptions, TrainAndSaveResult},
    TrainingError,
};

pub const WEAK_LABELS_FILE: &str = "weak_labels.jsonl";
pub const METRICS_CSV_FILE: &str = "metrics.csv";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Written to `<results_folder>/<sweep_subfolder>/<config_name>.results_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub config_name: String,
    pub config: BTreeMap<String, Value>,
    pub avg_acc_test: Option<f64>,
    pub avg_acc_inference: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub config_name: String,
    pub save_path: PathBuf,
    pub summary_path: PathBuf,
    /// Set when the run produced predictions on the inference half.
    pub weak_labels_path: Option<PathBuf>,
    pub result: TrainAndSaveResult,
}

/// Key of `config` shortened to the first three letters of each `_`-separated word.
fn shorten_key(key: &str) -> String {
    key.split('_').map(|word| word.chars().take(3).collect::<String>()).collect()
}

fn shorten_value(value: &Value) -> String {
    match value {
        Value::Bool(flag) => if *flag { "1" } else { "0" }.to_string(),
        Value::String(text) => {
            let last = text.rsplit('/').next().unwrap_or(text);
            if last.contains('_') {
                last.split('_')
                    .map(|word| word.chars().take(4).collect::<String>())
                    .collect::<Vec<_>>()
                    .join("_")
            } else {
                last.to_string()
            }
        }
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// Folder name encoding `config` as sorted `key=value` pairs joined by `-`.
pub fn config_name(config: &BTreeMap<String, Value>) -> String {
    config
        .iter()
        .map(|(key, value)| format!("{}={}", shorten_key(key), shorten_value(value)))
        .collect::<Vec<_>>()
        .join("-")
}

/// Resolved hyperparameters that identify a run.
pub fn run_config(
    cfg: &ExperimentConfig,
    model_config: &ModelConfig,
    lr: f64,
    optimizer: &str,
) -> BTreeMap<String, Value> {
    let model_name = Path::new(&model_config.name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_config.name.clone());
    let mut config = BTreeMap::new();
    config.insert("batch_size".into(), Value::from(cfg.batch_size));
    config.insert("max_ctx".into(), Value::from(cfg.max_ctx));
    config.insert("ds_name".into(), Value::from(cfg.ds_name.clone()));
    config.insert("loss".into(), Value::from(cfg.loss.clone()));
    config.insert("n_docs".into(), Value::from(cfg.n_docs));
    config.insert("n_test_docs".into(), Value::from(cfg.n_test_docs));
    config.insert("model_size".into(), Value::from(model_name));
    config.insert("lr".into(), Value::from(lr));
    config.insert("optim".into(), Value::from(optimizer));
    config.insert("epochs".into(), Value::from(cfg.epochs));
    config.insert("force_retrain".into(), Value::from(cfg.force_retrain));
    config.insert("seed".into(), Value::from(cfg.seed));
    config.insert(
        "minibatch_size_per_device".into(),
        cfg.minibatch_size_per_device.map_or(Value::Null, Value::from),
    );
    config.insert("train_with_dropout".into(), Value::from(cfg.train_with_dropout));
    config.insert("linear_probe".into(), Value::from(cfg.linear_probe));
    config.insert("lr_schedule".into(), Value::from(cfg.lr_schedule.clone()));
    config.insert("sweep_subfolder".into(), Value::from(cfg.sweep_subfolder.clone()));
    if let Some(path) = &cfg.weak_labels_path {
        let source = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        config.insert("weak_labels".into(), Value::from(source));
    }
    config
}

/// Model registry with the built-in presets plus the entries of `cfg.models`.
pub fn model_registry(cfg: &ExperimentConfig) -> ModelRegistry {
    let mut registry = ModelRegistry::with_builtin();
    for model in &cfg.models {
        registry.register(model.clone());
    }
    registry
}

/// Runs `cfg` with the tokenizer it names and every detected device.
pub fn run_experiment(cfg: &ExperimentConfig) -> Result<ExperimentOutcome, TrainingError> {
    let registry = model_registry(cfg);
    let model_config = registry.resolve(&cfg.model_size)?;
    let tokenizer_path = match &cfg.tokenizer_path {
        Some(path) => path.clone(),
        None => Path::new(&model_config.name).join(TOKENIZER_FILE),
    };
    if !tokenizer_path.is_file() {
        return Err(TrainingError::initialization(format!(
            "tokenizer not found at {}; set tokenizer_path",
            tokenizer_path.display()
        )));
    }
    let tokenizer = load_tokenizer(&tokenizer_path)?;
    run_experiment_with(cfg, &tokenizer, available_devices())
}

/// Runs `cfg` with an explicit tokenizer and device list.
pub fn run_experiment_with<T>(
    cfg: &ExperimentConfig,
    tokenizer: &T,
    devices: Vec<Device>,
) -> Result<ExperimentOutcome, TrainingError>
where
    T: TextTokenizer + ?Sized,
{
    cfg.validate()?;
    let model_config = model_registry(cfg).resolve(&cfg.model_size)?;
    let lr = cfg.lr.unwrap_or(model_config.default_lr);
    let optimizer = cfg
        .optimizer_override()?
        .unwrap_or(model_config.default_optimizer);
    let lr_schedule = cfg.lr_schedule()?;
    let loss = cfg.loss_kind()?;

    let datasets = DatasetRegistry::with_builtin(&cfg.data_root);
    let split_sizes = SplitSizes::new()
        .with("train", Some(cfg.n_docs))
        .with("test", Some(cfg.n_test_docs));
    let mut splits = datasets.load(&cfg.ds_name, cfg.seed, &split_sizes)?;
    let train = splits.remove("train").unwrap_or_default();
    let test = splits.remove("test").unwrap_or_default();

    let (train1, train2): (Vec<Example>, Option<Vec<Example>>) = match &cfg.weak_labels_path {
        None => {
            let (first, second) = weak_labels::split_halves(train);
            (first, Some(second))
        }
        Some(path) => {
            log::info!("training on weak labels from {}", path.display());
            (weak_labels::load_examples(path)?, None)
        }
    };
    log::info!(
        "len(train1): {} len(train2): {}",
        train1.len(),
        train2.as_ref().map_or(0, Vec::len)
    );

    let train1 = tokenize_dataset(train1, tokenizer, cfg.max_ctx)?;
    let train2 = train2
        .map(|ds| tokenize_dataset(ds, tokenizer, cfg.max_ctx))
        .transpose()?;
    let test = tokenize_dataset(test, tokenizer, cfg.max_ctx)?;

    let run_config = run_config(cfg, &model_config, lr, &optimizer.to_string());
    let config_name = config_name(&run_config);
    let sweep_dir = cfg.results_folder.join(&cfg.sweep_subfolder);
    let save_path = sweep_dir.join(&config_name);
    log::info!("running {} in {}", config_name, save_path.display());

    let mut logger = if cfg.logging.kv_log {
        KvLogger::create(
            &save_path.join(format!("{}logs", cfg.log_prefix)),
            cfg.logging.tensorboard,
        )?
    } else {
        KvLogger::disabled()
    };

    let opts = TrainAndSaveOptions {
        batch_size: cfg.batch_size,
        lr,
        epochs: cfg.epochs,
        eval_batch_size: Some(model_config.eval_batch_size),
        minibatch_size_per_device: cfg.minibatch_size_per_device,
        save_path: Some(save_path.clone()),
        loss,
        loss_options: cfg.loss_options.clone(),
        force_retrain: cfg.force_retrain,
        train_with_dropout: cfg.train_with_dropout,
        linear_probe: cfg.linear_probe,
        lr_schedule,
        optimizer,
        log_every: cfg.log_every,
        csv_path: cfg
            .logging
            .metrics_csv
            .then(|| save_path.join(METRICS_CSV_FILE)),
        max_shard_bytes: cfg.max_shard_bytes,
        devices,
    };
    let result = train_and_save_model(
        &model_config,
        &train1,
        &test,
        train2.as_deref(),
        &opts,
        &mut logger,
    )?;

    let weak_labels_path = match &result.inference_results {
        Some(records) => {
            let path = save_path.join(WEAK_LABELS_FILE);
            let examples: Vec<Example> = records.iter().map(|r| r.to_example()).collect();
            weak_labels::save_examples(&path, &examples)?;
            log::info!("wrote {} weak labels to {}", examples.len(), path.display());
            Some(path)
        }
        None => None,
    };

    let summary = ExperimentSummary {
        config_name: config_name.clone(),
        config: run_config,
        avg_acc_test: finite(mean_accuracy(&result.test_results)),
        avg_acc_inference: result
            .inference_results
            .as_deref()
            .and_then(|records| finite(mean_accuracy(records))),
    };
    let summary_path = sweep_dir.join(format!("{config_name}.results_summary.json"));
    write_json(&summary_path, &summary)?;

    Ok(ExperimentOutcome {
        config_name,
        save_path,
        summary_path,
        weak_labels_path,
        result,
    })
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_name_sorts_and_shortens() {
        let mut config = BTreeMap::new();
        config.insert("model_size".to_string(), Value::from("openai/gpt2-medium"));
        config.insert("lr_schedule".to_string(), Value::from("cosine_anneal"));
        config.insert("batch_size".to_string(), Value::from(32));
        config.insert("linear_probe".to_string(), Value::from(false));
        config.insert("minibatch_size_per_device".to_string(), Value::Null);
        assert_eq!(
            config_name(&config),
            "bs=32-lp=0-lrsch=cosi_anne-minsizperdev=None-mods=gpt2-medium"
        );
    }

    #[test]
    fn run_config_records_resolved_values() {
        let cfg: ExperimentConfig = toml::from_str("data_root = \"/data\"\n").unwrap();
        let model = ModelConfig::new("/models/tiny", 1e-3, 4);
        let config = run_config(&cfg, &model, 1e-3, "adam");
        assert_eq!(config["model_size"], Value::from("tiny"));
        assert_eq!(config["optim"], Value::from("adam"));
        assert_eq!(config["ds_name"], Value::from("sciq"));
        assert!(!config.contains_key("weak_labels"));
    }
}
