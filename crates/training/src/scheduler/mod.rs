use std::{f64::consts::PI, fmt, str::FromStr};

use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Returns the learning rate of the current step and advances by one.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Learning-rate schedules selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrSchedule {
    Constant,
    CosineAnneal,
}

impl LrSchedule {
    /// Multiplier applied to the base learning rate at `step` of `total_steps`.
    pub fn multiplier(self, step: usize, total_steps: usize) -> f64 {
        match self {
            LrSchedule::Constant => 1.0,
            LrSchedule::CosineAnneal => {
                let progress = (step as f64 / total_steps.max(1) as f64).clamp(0.0, 1.0);
                0.5 * (1.0 + f64::cos(PI * progress))
            }
        }
    }

    pub fn learning_rate_at(self, base_lr: f64, step: usize, total_steps: usize) -> f64 {
        base_lr * self.multiplier(step, total_steps)
    }

    pub fn build(self, base_lr: f64, total_steps: usize) -> Result<Box<dyn LRScheduler>, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        let scheduler: Box<dyn LRScheduler> = match self {
            LrSchedule::Constant => Box::new(Constant {
                base_lr,
                current_lr: base_lr,
            }),
            LrSchedule::CosineAnneal => Box::new(CosineAnneal {
                base_lr,
                total_steps,
                step: 0,
                current_lr: base_lr,
            }),
        };
        Ok(scheduler)
    }
}

impl FromStr for LrSchedule {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(LrSchedule::Constant),
            "cosine_anneal" => Ok(LrSchedule::CosineAnneal),
            other => Err(TrainingError::invalid(format!(
                "unknown lr_schedule '{other}', expected 'constant' or 'cosine_anneal'"
            ))),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrSchedule::Constant => f.write_str("constant"),
            LrSchedule::CosineAnneal => f.write_str("cosine_anneal"),
        }
    }
}

struct Constant {
    base_lr: f64,
    current_lr: f64,
}

impl LRScheduler for Constant {
    fn step(&mut self) -> f64 {
        self.current_lr = self.base_lr;
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

struct CosineAnneal {
    base_lr: f64,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl LRScheduler for CosineAnneal {
    fn step(&mut self) -> f64 {
        let lr = LrSchedule::CosineAnneal.learning_rate_at(self.base_lr, self.step, self.total_steps);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_starts_at_base_and_never_increases() {
        let mut scheduler = LrSchedule::CosineAnneal.build(1e-3, 50).unwrap();
        let lrs: Vec<f64> = (0..=50).map(|_| scheduler.step()).collect();
        assert!((lrs[0] - 1e-3).abs() < 1e-15);
        for pair in lrs.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(lrs[50].abs() < 1e-15);
        assert!((scheduler.learning_rate() - lrs[50]).abs() < 1e-18);
    }

    #[test]
    fn cosine_is_half_way_at_midpoint() {
        let lr = LrSchedule::CosineAnneal.learning_rate_at(2.0, 5, 10);
        assert!((lr - 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_keeps_base_rate() {
        let mut scheduler = LrSchedule::Constant.build(5e-5, 3).unwrap();
        for _ in 0..5 {
            assert_eq!(scheduler.step(), 5e-5);
        }
    }

    #[test]
    fn names_parse_and_reject_unknown() {
        assert_eq!("constant".parse::<LrSchedule>().unwrap(), LrSchedule::Constant);
        assert_eq!(
            "cosine_anneal".parse::<LrSchedule>().unwrap().to_string(),
            "cosine_anneal"
        );
        assert!(matches!(
            "linear".parse::<LrSchedule>(),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn zero_steps_is_rejected() {
        assert!(LrSchedule::Constant.build(1e-3, 0).is_err());
    }
}
