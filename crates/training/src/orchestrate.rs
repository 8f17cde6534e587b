use std::{path::PathBuf, time::Instant};

use candle_core::Device;
use datasets::Example;
use model::{weight_files, LoadOptions, TransformerWithHead};

use crate::{
    checkpoint::{maybe_load_model, save_results, LoadOutcome, ResultsSummary},
    config::LossOptions,
    device::{accelerator_count, ExecutionPlan},
    eval::{eval_model_acc, mean_accuracy, EvalRecord},
    logging::KvLogger,
    loss::LossKind,
    models::ModelConfig,
    optimizer::OptimizerKind,
    scheduler::LrSchedule,
    trainer::{train_model, TrainOptions},
    TrainingError,
};

/// Settings of [`train_and_save_model`].
#[derive(Debug, Clone)]
pub struct TrainAndSaveOptions {
    pub batch_size: usize,
    pub lr: f64,
    pub epochs: usize,
    /// Defaults to `batch_size`.
    pub eval_batch_size: Option<usize>,
    /// Defaults to 1.
    pub minibatch_size_per_device: Option<usize>,
    pub save_path: Option<PathBuf>,
    pub loss: LossKind,
    pub loss_options: LossOptions,
    pub force_retrain: bool,
    pub train_with_dropout: bool,
    pub linear_probe: bool,
    pub lr_schedule: LrSchedule,
    pub optimizer: OptimizerKind,
    pub log_every: usize,
    pub csv_path: Option<PathBuf>,
    pub max_shard_bytes: Option<usize>,
    /// Devices available to the run; the first one is primary.
    pub devices: Vec<Device>,
}

impl Default for TrainAndSaveOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            lr: 5e-5,
            epochs: 1,
            eval_batch_size: None,
            minibatch_size_per_device: None,
            save_path: None,
            loss: LossKind::Xent,
            loss_options: LossOptions::default(),
            force_retrain: false,
            train_with_dropout: false,
            linear_probe: false,
            lr_schedule: LrSchedule::Constant,
            optimizer: OptimizerKind::Adam,
            log_every: 10,
            csv_path: None,
            max_shard_bytes: None,
            devices: vec![Device::Cpu],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainAndSaveResult {
    pub test_results: Vec<EvalRecord>,
    pub inference_results: Option<Vec<EvalRecord>>,
    pub load_outcome: LoadOutcome,
    pub plan: ExecutionPlan,
}

/// Builds the model, resumes it from `save_path` when that run already
/// finished, otherwise trains and saves it, then evaluates the inference set.
pub fn train_and_save_model(
    model_config: &ModelConfig,
    train_ds: &[Example],
    test_ds: &[Example],
    inference_ds: Option<&[Example]>,
    opts: &TrainAndSaveOptions,
    logger: &mut KvLogger,
) -> Result<TrainAndSaveResult, TrainingError> {
    let eval_batch_size = opts.eval_batch_size.unwrap_or(opts.batch_size);
    let per_device = opts.minibatch_size_per_device.unwrap_or(1);

    let devices = if opts.devices.is_empty() {
        vec![Device::Cpu]
    } else {
        opts.devices.clone()
    };
    let (plan, minibatch_size) = ExecutionPlan::choose(
        model_config.model_parallel,
        accelerator_count(&devices),
        per_device,
        opts.batch_size,
    )?;

    let load_options = LoadOptions {
        num_labels: 2,
        linear_probe: opts.linear_probe,
        devices: plan.model_devices(&devices),
        custom_kwargs: model_config.custom_kwargs.clone(),
    };
    let mut model = TransformerWithHead::from_pretrained(&model_config.name, &load_options)?;
    log::debug!("execution plan {:?} with minibatch size {}", plan, minibatch_size);

    let load_outcome = match opts.save_path.as_deref() {
        Some(save_path) => maybe_load_model(&mut model, save_path, opts.force_retrain),
        None => LoadOutcome::NotFound,
    };

    let mut weights = Vec::new();
    let test_results = if load_outcome.is_loaded() {
        if let Some(save_path) = opts.save_path.as_deref() {
            weights = weight_files(save_path)?;
        }
        eval_model_acc(&mut model, test_ds, eval_batch_size)?
    } else {
        if model_config.gradient_checkpointing {
            model.enable_gradient_checkpointing();
        }
        let train_opts = TrainOptions {
            batch_size: opts.batch_size,
            lr: opts.lr,
            loss: opts.loss,
            loss_options: opts.loss_options.clone(),
            log_every: opts.log_every,
            eval_batch_size,
            minibatch_size,
            train_with_dropout: opts.train_with_dropout,
            epochs: opts.epochs,
            lr_schedule: opts.lr_schedule,
            optimizer: opts.optimizer,
            csv_path: opts.csv_path.clone(),
        };
        let start = Instant::now();
        let outcome = train_model(&mut model, train_ds, &train_opts, inference_ds, Some(test_ds), logger)?;
        log::info!("Model training took {:.2} seconds", start.elapsed().as_secs_f64());

        if let Some(save_path) = opts.save_path.as_deref() {
            weights = model.save_pretrained(save_path, opts.max_shard_bytes)?;
            log::info!("saved {}", save_path.display());
        }
        outcome.final_eval.unwrap_or_default()
    };

    let inference_results = match inference_ds {
        Some(inference_ds) if !inference_ds.is_empty() => {
            log::info!("Inference accuracy:");
            let records = eval_model_acc(&mut model, inference_ds, eval_batch_size)?;
            logger.logkv("inference_accuracy", mean_accuracy(&records));
            Some(records)
        }
        _ => None,
    };

    if let Some(save_path) = opts.save_path.as_deref() {
        let summary = ResultsSummary {
            avg_acc_test: mean_accuracy(&test_results),
            avg_acc_inference: inference_results
                .as_deref()
                .map(mean_accuracy)
                .unwrap_or(f64::NAN),
            test_results: test_results.clone(),
            inference_results: inference_results.clone().unwrap_or_default(),
        };
        save_results(save_path, &weights, &summary)?;
    }

    logger.flush()?;

    Ok(TrainAndSaveResult {
        test_results,
        inference_results,
        load_outcome,
        plan,
    })
}
