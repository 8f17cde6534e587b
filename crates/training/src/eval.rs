use candle_core::{DType, D};
use candle_nn::ops;
use datasets::Example;
use model::Classifier;
use serde::{Deserialize, Serialize};

use crate::{
    data::{eval_batches, pad_collate},
    loss::LossFn,
    metrics::{mean, mean_and_stderr},
    TrainingError,
};

/// Prediction for one evaluated example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub txt: String,
    pub input_ids: Vec<u32>,
    /// Class of the example's own (soft) label.
    pub gt_label: u8,
    /// Predicted class.
    pub hard_label: u8,
    pub acc: bool,
    pub logits: Vec<f32>,
    /// Predicted class probabilities.
    pub soft_label: Vec<f32>,
}

impl EvalRecord {
    /// The prediction as a weakly labelled training example.
    pub fn to_example(&self) -> Example {
        let p1 = self.soft_label.get(1).copied().unwrap_or(0.0);
        let p0 = self.soft_label.first().copied().unwrap_or(1.0 - p1);
        Example {
            txt: self.txt.clone(),
            hard_label: self.hard_label,
            soft_label: [p0, p1],
            input_ids: self.input_ids.clone(),
        }
    }
}

/// Evaluates `model` on `ds` in fixed batch order with dropout off and no gradient tracking.
pub fn eval_model_acc<M>(
    model: &mut M,
    ds: &[Example],
    eval_batch_size: usize,
) -> Result<Vec<EvalRecord>, TrainingError>
where
    M: Classifier + ?Sized,
{
    model.set_training(false);
    let device = model.device().clone();
    let mut results = Vec::with_capacity(ds.len());

    for chunk in eval_batches(ds, eval_batch_size) {
        let refs: Vec<&Example> = chunk.iter().collect();
        let batch = pad_collate(&refs, &device)?;
        let raw_logits = model
            .classify(&batch.input_ids)?
            .detach()
            .to_dtype(DType::F32)?;
        let probs = ops::softmax(&raw_logits, D::Minus1)?;
        let preds = probs.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let logits = raw_logits.to_vec2::<f32>()?;
        let probs = probs.to_vec2::<f32>()?;

        for (((example, pred), logit), prob) in chunk.iter().zip(preds).zip(logits).zip(probs) {
            let gt_label = example.target_class() as u8;
            let hard_label = pred as u8;
            results.push(EvalRecord {
                txt: example.txt.clone(),
                input_ids: example.input_ids.clone(),
                gt_label,
                hard_label,
                acc: gt_label == hard_label,
                logits: logit,
                soft_label: prob,
            });
        }
    }

    let accs: Vec<f64> = results.iter().map(|r| f64::from(u8::from(r.acc))).collect();
    let (m, stderr) = mean_and_stderr(&accs);
    log::info!("Accuracy: {} +/- {}", m, stderr);
    Ok(results)
}

/// Mean of `acc` over `records`; NaN when there are none.
pub fn mean_accuracy(records: &[EvalRecord]) -> f64 {
    let accs: Vec<f64> = records.iter().map(|r| f64::from(u8::from(r.acc))).collect();
    mean(&accs)
}

/// Mean per-batch loss of `model` on `ds`, or `None` for an empty dataset.
pub fn average_loss<M>(
    model: &mut M,
    ds: &[Example],
    loss_fn: &dyn LossFn,
    eval_batch_size: usize,
    step_frac: f64,
) -> Result<Option<f64>, TrainingError>
where
    M: Classifier + ?Sized,
{
    if ds.is_empty() {
        return Ok(None);
    }
    model.set_training(false);
    let device = model.device().clone();
    let mut total = 0.0;
    let mut count = 0usize;
    for chunk in eval_batches(ds, eval_batch_size) {
        let refs: Vec<&Example> = chunk.iter().collect();
        let batch = pad_collate(&refs, &device)?;
        let logits = model.classify(&batch.input_ids)?.detach();
        let loss = loss_fn.compute(&logits, &batch.labels, step_frac)?;
        total += loss.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64;
        count += 1;
    }
    Ok(Some(total / count as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor, Var};

    /// Always predicts class 0.
    struct ConstantClassifier {
        device: Device,
        training: bool,
    }

    impl Classifier for ConstantClassifier {
        fn classify(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
            let (batch, _) = input_ids.dims2()?;
            let row = Tensor::new(&[2.0f32, -2.0], &self.device)?;
            row.unsqueeze(0)?.repeat((batch, 1))
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn trainable_parameters(&self) -> Vec<(String, Var)> {
            Vec::new()
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn dataset(positives: usize, total: usize) -> Vec<Example> {
        (0..total)
            .map(|i| {
                let hard_label = u8::from(i < positives);
                Example {
                    txt: format!("example {i}"),
                    hard_label,
                    soft_label: datasets::soft_label_for(hard_label),
                    input_ids: vec![1, 2, (i % 7) as u32 + 1],
                }
            })
            .collect()
    }

    #[test]
    fn constant_classifier_scores_the_majority_rate() {
        let mut model = ConstantClassifier {
            device: Device::Cpu,
            training: true,
        };
        let ds = dataset(3, 10);
        let records = eval_model_acc(&mut model, &ds, 4).unwrap();
        assert!(!model.training);
        assert_eq!(records.len(), 10);
        assert!((mean_accuracy(&records) - 0.7).abs() < 1e-12);
        assert!(records.iter().all(|r| r.hard_label == 0));
        assert_eq!(records[0].gt_label, 1);
        assert_eq!(records[0].txt, "example 0");
        assert!((records[0].soft_label.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn records_convert_to_weak_examples() {
        let record = EvalRecord {
            txt: "t".into(),
            input_ids: vec![3, 4],
            gt_label: 1,
            hard_label: 0,
            acc: false,
            logits: vec![0.4, 0.1],
            soft_label: vec![0.6, 0.4],
        };
        let example = record.to_example();
        assert_eq!(example.hard_label, 0);
        assert_eq!(example.soft_label, [0.6, 0.4]);
        assert_eq!(example.input_ids, vec![3, 4]);
    }

    #[test]
    fn empty_inputs_give_nan_and_none() {
        assert!(mean_accuracy(&[]).is_nan());
        let mut model = ConstantClassifier {
            device: Device::Cpu,
            training: false,
        };
        let loss = crate::loss::CrossEntropyLoss;
        assert_eq!(average_loss(&mut model, &[], &loss, 4, 0.0).unwrap(), None);
        let value = average_loss(&mut model, &dataset(0, 4), &loss, 4, 0.0)
            .unwrap()
            .unwrap();
        assert!(value > 0.0 && value < 0.1);
    }
}
