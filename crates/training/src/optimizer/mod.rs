use std::{fmt, str::FromStr};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

const ADAFACTOR_EPS_SQ: f64 = 1e-30;
const ADAFACTOR_EPS_SCALE: f64 = 1e-3;
const ADAFACTOR_CLIP: f64 = 1.0;
const ADAFACTOR_DECAY: f64 = -0.8;
const ADAFACTOR_MAX_RELATIVE_STEP: f64 = 1e-2;

/// Optimizers selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Adafactor,
}

impl FromStr for OptimizerKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "adafactor" => Ok(OptimizerKind::Adafactor),
            other => Err(TrainingError::invalid(format!(
                "unknown optimizer '{other}', expected 'adam' or 'adafactor'"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => f.write_str("adam"),
            OptimizerKind::Adafactor => f.write_str("adafactor"),
        }
    }
}

/// Second-moment state kept per parameter.
#[derive(Debug)]
enum SecondMoment {
    Full(Tensor),
    /// Row and column running means for a matrix parameter.
    Factored { row: Tensor, col: Tensor },
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Option<Tensor>,
    second_moment: SecondMoment,
}

/// Adam or Adafactor over a fixed set of named parameters.
///
/// Adam follows the learning rate set through [`set_learning_rate`](Self::set_learning_rate).
/// Adafactor uses relative steps of `min(1e-2, 1/sqrt(step))` scaled by the
/// parameter RMS and ignores the learning rate.
#[derive(Debug)]
pub struct TrainerOptimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    params: Vec<ParameterSlot>,
    step: usize,
}

impl TrainerOptimizer {
    pub fn new(
        kind: OptimizerKind,
        named_parameters: Vec<(String, Var)>,
        learning_rate: f64,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let dims = tensor.dims().to_vec();

            let (first_moment, second_moment) = match kind {
                OptimizerKind::Adam => (
                    Some(Tensor::zeros(dims.as_slice(), DType::F32, device)?),
                    SecondMoment::Full(Tensor::zeros(dims.as_slice(), DType::F32, device)?),
                ),
                OptimizerKind::Adafactor if dims.len() == 2 => (
                    None,
                    SecondMoment::Factored {
                        row: Tensor::zeros((dims[0], 1), DType::F32, device)?,
                        col: Tensor::zeros((1, dims[1]), DType::F32, device)?,
                    },
                ),
                OptimizerKind::Adafactor => (
                    None,
                    SecondMoment::Full(Tensor::zeros(dims.as_slice(), DType::F32, device)?),
                ),
            };

            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        log::debug!(
            "{} optimizer over {} parameter tensors",
            kind,
            params.len()
        );

        Ok(Self {
            kind,
            learning_rate,
            params,
            step: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Names of the parameters being optimized, in update order.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let step = self.step;
        let lr = self.learning_rate;
        let kind = self.kind;

        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let base = slot.param.as_tensor().to_dtype(DType::F32)?;
            let next = match kind {
                OptimizerKind::Adam => adam_update(slot, &base, &grad, lr, step)?,
                OptimizerKind::Adafactor => adafactor_update(slot, &base, &grad, step)?,
            };
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype)?
            };
            slot.param.set(&cast)?;
        }

        Ok(())
    }
}

fn adam_update(
    slot: &mut ParameterSlot,
    base: &Tensor,
    grad: &Tensor,
    lr: f64,
    step: usize,
) -> Result<Tensor, TrainingError> {
    let bias_correction1 = 1.0 - ADAM_BETA1.powi(step as i32);
    let bias_correction2 = 1.0 - ADAM_BETA2.powi(step as i32);

    let prev_m = slot
        .first_moment
        .as_ref()
        .ok_or_else(|| TrainingError::runtime(format!("missing first moment for '{}'", slot.name)))?;
    let SecondMoment::Full(prev_v) = &slot.second_moment else {
        return Err(TrainingError::runtime(format!(
            "unexpected factored state for '{}'",
            slot.name
        )));
    };

    let new_m = prev_m
        .affine(ADAM_BETA1, 0.0)?
        .add(&grad.affine(1.0 - ADAM_BETA1, 0.0)?)?;
    let new_v = prev_v
        .affine(ADAM_BETA2, 0.0)?
        .add(&grad.sqr()?.affine(1.0 - ADAM_BETA2, 0.0)?)?;

    let m_hat = new_m.affine(1.0 / bias_correction1, 0.0)?;
    let denom = new_v
        .affine(1.0 / bias_correction2, 0.0)?
        .sqrt()?
        .affine(1.0, ADAM_EPS)?;
    let update = m_hat.div(&denom)?.affine(lr, 0.0)?;

    slot.first_moment = Some(new_m);
    slot.second_moment = SecondMoment::Full(new_v);
    Ok(base.sub(&update)?)
}

fn adafactor_update(
    slot: &mut ParameterSlot,
    base: &Tensor,
    grad: &Tensor,
    step: usize,
) -> Result<Tensor, TrainingError> {
    let lr_t = relative_step(step) * rms(base)?.max(ADAFACTOR_EPS_SCALE);
    let beta2t = 1.0 - (step as f64).powf(ADAFACTOR_DECAY);
    let grad_sq = grad.sqr()?.affine(1.0, ADAFACTOR_EPS_SQ)?;

    let update = match &slot.second_moment {
        SecondMoment::Factored { row, col } => {
            let row = row
                .affine(beta2t, 0.0)?
                .add(&grad_sq.mean_keepdim(1)?.affine(1.0 - beta2t, 0.0)?)?;
            let col = col
                .affine(beta2t, 0.0)?
                .add(&grad_sq.mean_keepdim(0)?.affine(1.0 - beta2t, 0.0)?)?;
            let row_factor = row.broadcast_div(&row.mean_keepdim(0)?)?.sqrt()?.recip()?;
            let col_factor = col.sqrt()?.recip()?;
            let update = row_factor.broadcast_mul(&col_factor)?.mul(grad)?;
            slot.second_moment = SecondMoment::Factored { row, col };
            update
        }
        SecondMoment::Full(v) => {
            let v = v
                .affine(beta2t, 0.0)?
                .add(&grad_sq.affine(1.0 - beta2t, 0.0)?)?;
            let update = v.sqrt()?.recip()?.mul(grad)?;
            slot.second_moment = SecondMoment::Full(v);
            update
        }
    };

    let clip = (rms(&update)? / ADAFACTOR_CLIP).max(1.0);
    let update = update.affine(lr_t / clip, 0.0)?;
    Ok(base.sub(&update)?)
}

fn relative_step(step: usize) -> f64 {
    ADAFACTOR_MAX_RELATIVE_STEP.min(1.0 / (step as f64).sqrt())
}

fn rms(tensor: &Tensor) -> Result<f64, TrainingError> {
    let count = tensor.elem_count().max(1) as f64;
    let sum_sq = tensor.sqr()?.sum_all()?.to_vec0::<f32>()? as f64;
    Ok((sum_sq / count).sqrt())
}
