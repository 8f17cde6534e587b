use std::{fmt, str::FromStr};

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::LossOptions, TrainingError};

/// Classification loss over `(batch, classes)` logits and soft labels of the same shape.
pub trait LossFn: Send {
    /// `step_frac` is the fraction of training completed, in `[0, 1)`.
    fn compute(&self, logits: &Tensor, labels: &Tensor, step_frac: f64) -> Result<Tensor, TrainingError>;
}

/// Losses selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Xent,
    Product,
    Logconf,
}

impl LossKind {
    pub fn build(self, options: &LossOptions) -> Box<dyn LossFn> {
        match self {
            LossKind::Xent => Box::new(CrossEntropyLoss),
            LossKind::Product => Box::new(ProductLoss {
                alpha: options.alpha,
                beta: options.beta,
            }),
            LossKind::Logconf => Box::new(LogConfidenceLoss {
                aux_coef: options.aux_coef,
                warmup_frac: options.warmup_frac,
            }),
        }
    }
}

impl FromStr for LossKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xent" => Ok(LossKind::Xent),
            "product" => Ok(LossKind::Product),
            "logconf" => Ok(LossKind::Logconf),
            other => Err(TrainingError::invalid(format!(
                "unknown loss '{other}', expected 'xent', 'product' or 'logconf'"
            ))),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossKind::Xent => "xent",
            LossKind::Product => "product",
            LossKind::Logconf => "logconf",
        };
        f.write_str(name)
    }
}

fn check_shapes(logits: &Tensor, labels: &Tensor) -> Result<(), TrainingError> {
    let (batch, classes) = logits.dims2()?;
    if batch == 0 || classes == 0 {
        return Err(TrainingError::runtime("loss requires a non-empty batch of logits"));
    }
    if labels.dims() != logits.dims() {
        return Err(TrainingError::runtime(format!(
            "labels shape {:?} does not match logits shape {:?}",
            labels.dims(),
            logits.dims()
        )));
    }
    Ok(())
}

/// Mean over the batch of `-(target * log_softmax(logits)).sum(-1)`.
pub fn soft_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    check_shapes(logits, target)?;
    let log_probs = ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let target = target.to_dtype(DType::F32)?.to_device(log_probs.device())?;
    let per_example = (target * log_probs)?.sum(D::Minus1)?.neg()?;
    Ok(per_example.mean_all()?)
}

/// Cross entropy against the (possibly soft) labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl LossFn for CrossEntropyLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor, _step_frac: f64) -> Result<Tensor, TrainingError> {
        soft_cross_entropy(logits, labels)
    }
}

/// Cross entropy against `preds^beta * labels^alpha`, renormalised and detached.
#[derive(Debug, Clone, Copy)]
pub struct ProductLoss {
    pub alpha: f64,
    pub beta: f64,
}

impl LossFn for ProductLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor, _step_frac: f64) -> Result<Tensor, TrainingError> {
        check_shapes(logits, labels)?;
        let preds = ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
        let labels = labels.to_dtype(DType::F32)?.to_device(preds.device())?;
        let target = (preds.powf(self.beta)? * labels.powf(self.alpha)?)?;
        let target = target
            .broadcast_div(&target.sum_keepdim(D::Minus1)?)?
            .detach();
        soft_cross_entropy(logits, &target)
    }
}

/// Cross entropy against labels mixed with the model's own thresholded predictions.
///
/// The mixing coefficient ramps linearly from 0 to `aux_coef` over the first
/// `warmup_frac` of training. Predictions are thresholded so that the share of
/// strong positives matches the mean weak label.
#[derive(Debug, Clone, Copy)]
pub struct LogConfidenceLoss {
    pub aux_coef: f64,
    pub warmup_frac: f64,
}

impl LogConfidenceLoss {
    pub fn coefficient(&self, step_frac: f64) -> f64 {
        let ramp = if step_frac > self.warmup_frac { 1.0 } else { step_frac };
        ramp * self.aux_coef
    }
}

impl LossFn for LogConfidenceLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor, step_frac: f64) -> Result<Tensor, TrainingError> {
        check_shapes(logits, labels)?;
        let device = logits.device();
        let coef = self.coefficient(step_frac);
        let preds = ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
        let labels = labels.to_dtype(DType::F32)?.to_device(device)?;

        let first_class: Vec<f32> = preds.narrow(1, 0, 1)?.squeeze(1)?.to_vec1()?;
        let positive_rate = labels.narrow(1, 1, 1)?.mean_all()?.to_vec0::<f32>()? as f64;
        let threshold = quantile(&first_class, positive_rate);

        let strong: Vec<f32> = first_class
            .iter()
            .flat_map(|&p| {
                if p as f64 >= threshold {
                    [1.0, 0.0]
                } else {
                    [0.0, 1.0]
                }
            })
            .collect();
        let strong = Tensor::from_vec(strong, (first_class.len(), 2), device)?;
        if strong.dims() != labels.dims() {
            return Err(TrainingError::runtime(
                "logconf loss is only defined for two classes",
            ));
        }

        let target = (labels.affine(1.0 - coef, 0.0)? + strong.affine(coef, 0.0)?)?;
        soft_cross_entropy(logits, &target)
    }
}

/// `q`-quantile of `values` with linear interpolation between order statistics.
pub fn quantile(values: &[f32], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f32 {
        t.to_vec0::<f32>().unwrap()
    }

    fn batch() -> (Tensor, Tensor) {
        let logits = Tensor::new(
            &[[2.0f32, -1.0], [0.5, 0.3], [-1.0, 1.5], [0.0, 0.2]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(
            &[[1.0f32, 0.0], [0.0, 1.0], [0.0, 1.0], [0.7, 0.3]],
            &Device::Cpu,
        )
        .unwrap();
        (logits, labels)
    }

    #[test]
    fn xent_of_uniform_logits_is_ln2() {
        let logits = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [0.5, 0.5]], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss.compute(&logits, &labels, 0.0).unwrap();
        assert!((scalar(loss) - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn logconf_matches_xent_at_start() {
        let (logits, labels) = batch();
        let options = LossOptions::default();
        let xent = scalar(LossKind::Xent.build(&options).compute(&logits, &labels, 0.0).unwrap());
        let logconf = scalar(
            LossKind::Logconf
                .build(&options)
                .compute(&logits, &labels, 0.0)
                .unwrap(),
        );
        assert!((xent - logconf).abs() < 1e-6);
    }

    #[test]
    fn logconf_coefficient_ramps_then_saturates() {
        let loss = LogConfidenceLoss {
            aux_coef: 0.5,
            warmup_frac: 0.1,
        };
        assert_eq!(loss.coefficient(0.0), 0.0);
        assert!((loss.coefficient(0.05) - 0.025).abs() < 1e-12);
        assert_eq!(loss.coefficient(0.5), 0.5);
    }

    #[test]
    fn product_with_uniform_predictions_matches_xent() {
        let logits = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[0.8f32, 0.2], [0.1, 0.9]], &Device::Cpu).unwrap();
        let product = scalar(
            LossKind::Product
                .build(&LossOptions::default())
                .compute(&logits, &labels, 0.3)
                .unwrap(),
        );
        let xent = scalar(CrossEntropyLoss.compute(&logits, &labels, 0.3).unwrap());
        assert!((product - xent).abs() < 1e-6);
    }

    #[test]
    fn quantile_interpolates() {
        assert_eq!(quantile(&[3.0, 1.0, 2.0], 0.5), 2.0);
        assert!((quantile(&[0.0, 1.0], 0.25) - 0.25).abs() < 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn names_parse() {
        assert_eq!("logconf".parse::<LossKind>().unwrap(), LossKind::Logconf);
        assert_eq!(LossKind::Product.to_string(), "product");
        assert!("hinge".parse::<LossKind>().is_err());
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let logits = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss.compute(&logits, &labels, 0.0).is_err());
    }
}
