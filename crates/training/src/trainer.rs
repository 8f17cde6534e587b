use std::path::PathBuf;

use candle_core::{DType, Tensor, D};
use datasets::Example;
use model::Classifier;

use crate::{
    config::LossOptions,
    data::{pad_collate, EpochCursor},
    eval::{average_loss, eval_model_acc, mean_accuracy, EvalRecord},
    logging::{KvLogger, MetricsCsv, MetricsRow},
    loss::LossKind,
    metrics::RollingMetrics,
    optimizer::{OptimizerKind, TrainerOptimizer},
    scheduler::{LRScheduler, LrSchedule},
    TrainingError,
};

/// Hyperparameters of one [`train_model`] run.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub batch_size: usize,
    pub lr: f64,
    pub loss: LossKind,
    pub loss_options: LossOptions,
    /// Log interval in steps; 0 disables interval logging.
    pub log_every: usize,
    pub eval_batch_size: usize,
    pub minibatch_size: usize,
    pub train_with_dropout: bool,
    pub epochs: usize,
    pub lr_schedule: LrSchedule,
    pub optimizer: OptimizerKind,
    pub csv_path: Option<PathBuf>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            lr: 5e-5,
            loss: LossKind::Xent,
            loss_options: LossOptions::default(),
            log_every: 10,
            eval_batch_size: 256,
            minibatch_size: 8,
            train_with_dropout: false,
            epochs: 1,
            lr_schedule: LrSchedule::CosineAnneal,
            optimizer: OptimizerKind::Adam,
            csv_path: None,
        }
    }
}

impl TrainOptions {
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.minibatch_size == 0 {
            errors.push("minibatch_size must be greater than 0".to_string());
        } else if self.batch_size % self.minibatch_size != 0 {
            errors.push(format!(
                "batch size {} must be divisible by minibatch size {}",
                self.batch_size, self.minibatch_size
            ));
        }
        if self.eval_batch_size == 0 {
            errors.push("eval_batch_size must be greater than 0".to_string());
        }
        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub steps_run: usize,
    /// Final accuracy evaluation on the test set, when one was given.
    pub final_eval: Option<Vec<EvalRecord>>,
}

/// Trains `model` on `ds` for `floor(len * epochs / batch_size)` steps.
///
/// Every step logs `step`, `progress`, `loss`, `train_accuracy` and `lr` to
/// `logger`. Every `log_every` steps the loss on `eval_ds` and `test_ds` is
/// measured and the rolling training metrics are reported and reset.
pub fn train_model<M>(
    model: &mut M,
    ds: &[Example],
    opts: &TrainOptions,
    eval_ds: Option<&[Example]>,
    test_ds: Option<&[Example]>,
    logger: &mut KvLogger,
) -> Result<TrainOutcome, TrainingError>
where
    M: Classifier + ?Sized,
{
    log::info!(
        "LR {} batch_size {} minibatch_size {}",
        opts.lr,
        opts.batch_size,
        opts.minibatch_size
    );
    opts.validate()?;

    let mut cursor = EpochCursor::new(ds.len(), opts.epochs);
    let nsteps = cursor.nsteps(opts.batch_size);
    if nsteps == 0 {
        return Err(TrainingError::invalid(format!(
            "{} examples over {} epochs give no full batch of {}",
            ds.len(),
            opts.epochs,
            opts.batch_size
        )));
    }

    let mut csv = opts
        .csv_path
        .as_deref()
        .map(MetricsCsv::create)
        .transpose()?;

    model.set_training(opts.train_with_dropout);
    let loss_fn = opts.loss.build(&opts.loss_options);
    let mut scheduler = opts.lr_schedule.build(opts.lr, nsteps)?;
    let mut optimizer =
        TrainerOptimizer::new(opts.optimizer, model.trainable_parameters(), opts.lr)?;
    let minibatches_per_step = opts.batch_size / opts.minibatch_size;

    let mut rolling = RollingMetrics::new();
    let mut val_loss: Option<f64> = None;
    let mut test_loss: Option<f64> = None;

    for step in 0..nsteps {
        let step_frac = step as f64 / nsteps as f64;

        let mut all_logits = Vec::with_capacity(minibatches_per_step);
        let mut all_labels = Vec::with_capacity(minibatches_per_step);
        for _ in 0..minibatches_per_step {
            let Some(indices) = cursor.next_minibatch(opts.minibatch_size) else {
                break;
            };
            let examples: Vec<&Example> = indices.iter().map(|&i| &ds[i]).collect();
            let batch = pad_collate(&examples, model.device())?;
            all_logits.push(model.classify(&batch.input_ids)?);
            all_labels.push(batch.labels);
        }
        if all_logits.is_empty() {
            return Err(TrainingError::runtime(format!(
                "data exhausted at step {step} of {nsteps}"
            )));
        }

        let logits = Tensor::cat(&all_logits, 0)?;
        let labels = Tensor::cat(&all_labels, 0)?;
        let loss = loss_fn.compute(&logits, &labels, step_frac)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64;
        let accuracy = batch_accuracy(&logits, &labels)?;
        rolling.record(loss_value, accuracy);

        let lr = scheduler.step();
        logger.logkvs([
            ("step", serde_json::Value::from(step)),
            ("progress", serde_json::Value::from(step_frac)),
            ("loss", serde_json::Value::from(loss_value)),
            ("train_accuracy", serde_json::Value::from(accuracy)),
            ("lr", serde_json::Value::from(lr)),
        ]);

        optimizer.set_learning_rate(lr);
        let mut grads = loss.backward()?;
        optimizer.step(&mut grads)?;
        drop(grads);

        if opts.log_every > 0 && step % opts.log_every == 0 {
            if let Some(eval_ds) = eval_ds {
                val_loss =
                    average_loss(model, eval_ds, loss_fn.as_ref(), opts.eval_batch_size, step_frac)?;
            }
            if let Some(test_ds) = test_ds {
                test_loss =
                    average_loss(model, test_ds, loss_fn.as_ref(), opts.eval_batch_size, step_frac)?;
            }
            model.set_training(opts.train_with_dropout);

            log::info!(
                "Step: {}/{} Recent training losses: {} {} {}",
                step,
                nsteps,
                rolling.mean_loss(),
                rolling.mean_accuracy(),
                rolling.len()
            );
            if let Some(val_loss) = val_loss {
                log::info!("Step: {}/{} Recent validation losses: {}", step, nsteps, val_loss);
            }
            if let Some(test_loss) = test_loss {
                log::info!("Step: {}/{} Recent test losses: {}", step, nsteps, test_loss);
            }

            if let Some(csv) = csv.as_mut() {
                csv.write_row(&MetricsRow {
                    step,
                    progress: step_frac,
                    train_loss: rolling.mean_loss(),
                    train_accuracy: rolling.mean_accuracy(),
                    validation_loss: val_loss,
                    test_loss,
                    lr,
                })?;
            }
            rolling.reset();
        }

        logger.dumpkvs()?;
    }

    let final_eval = match test_ds {
        Some(test_ds) => {
            log::info!("Final evaluation (test_ds):");
            let records = eval_model_acc(model, test_ds, opts.eval_batch_size)?;
            logger.logkv("test_accuracy", mean_accuracy(&records));
            logger.dumpkvs()?;
            Some(records)
        }
        None => None,
    };

    Ok(TrainOutcome {
        steps_run: nsteps,
        final_eval,
    })
}

/// Share of rows whose logit argmax matches the label argmax.
fn batch_accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64, TrainingError> {
    let predicted = logits.argmax(D::Minus1)?;
    let expected = labels.to_device(logits.device())?.argmax(D::Minus1)?;
    let accuracy = predicted
        .eq(&expected)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_vec0::<f32>()?;
    Ok(accuracy as f64)
}
