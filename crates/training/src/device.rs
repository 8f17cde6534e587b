use candle_core::Device;

use crate::TrainingError;

/// Set to any value to ignore accelerators.
pub const FORCE_CPU_ENV: &str = "CANDLE_FORCE_CPU";

const MAX_PROBED_DEVICES: usize = 16;

/// Every usable CUDA device, or just the CPU when none is available.
pub fn available_devices() -> Vec<Device> {
    if std::env::var_os(FORCE_CPU_ENV).is_some() || !candle_core::utils::cuda_is_available() {
        return vec![Device::Cpu];
    }
    let mut devices = Vec::new();
    for ordinal in 0..MAX_PROBED_DEVICES {
        match Device::new_cuda(ordinal) {
            Ok(device) => devices.push(device),
            Err(_) => break,
        }
    }
    if devices.is_empty() {
        log::warn!("CUDA reported available but no device could be opened; using CPU");
        devices.push(Device::Cpu);
    }
    devices
}

/// Number of accelerator devices in `devices`.
pub fn accelerator_count(devices: &[Device]) -> usize {
    devices.iter().filter(|device| !device.is_cpu()).count()
}

/// How the model is spread over the available devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// Blocks spread contiguously over every device.
    ModelParallel,
    /// Minibatches sized for `replicas` devices, run on the primary one.
    DataParallel { replicas: usize },
    Single,
}

impl ExecutionPlan {
    /// Picks the plan and the training minibatch size.
    pub fn choose(
        model_parallel: bool,
        n_accelerators: usize,
        minibatch_size_per_device: usize,
        batch_size: usize,
    ) -> Result<(Self, usize), TrainingError> {
        if model_parallel {
            if n_accelerators <= 1 {
                return Err(TrainingError::invalid(format!(
                    "model parallel training needs more than one accelerator, found {}",
                    n_accelerators
                )));
            }
            return Ok((ExecutionPlan::ModelParallel, minibatch_size_per_device));
        }
        if n_accelerators > 1 {
            let minibatch = (minibatch_size_per_device * n_accelerators).min(batch_size);
            log::info!(
                "Using {} GPUs, setting minibatch_size to {}",
                n_accelerators,
                minibatch
            );
            return Ok((
                ExecutionPlan::DataParallel {
                    replicas: n_accelerators,
                },
                minibatch,
            ));
        }
        Ok((ExecutionPlan::Single, minibatch_size_per_device))
    }

    /// Devices the model's parameters live on.
    pub fn model_devices(&self, devices: &[Device]) -> Vec<Device> {
        match self {
            ExecutionPlan::ModelParallel => devices.to_vec(),
            ExecutionPlan::DataParallel { .. } | ExecutionPlan::Single => {
                devices.first().cloned().into_iter().collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_device_uses_per_device_minibatch() {
        assert_eq!(
            ExecutionPlan::choose(false, 0, 4, 32).unwrap(),
            (ExecutionPlan::Single, 4)
        );
        assert_eq!(
            ExecutionPlan::choose(false, 1, 4, 32).unwrap(),
            (ExecutionPlan::Single, 4)
        );
    }

    #[test]
    fn data_parallel_scales_and_caps_minibatch() {
        assert_eq!(
            ExecutionPlan::choose(false, 4, 4, 32).unwrap(),
            (ExecutionPlan::DataParallel { replicas: 4 }, 16)
        );
        assert_eq!(
            ExecutionPlan::choose(false, 4, 16, 32).unwrap().1,
            32
        );
    }

    #[test]
    fn model_parallel_requires_several_devices() {
        assert!(matches!(
            ExecutionPlan::choose(true, 1, 2, 32),
            Err(TrainingError::Validation(_))
        ));
        assert_eq!(
            ExecutionPlan::choose(true, 2, 2, 32).unwrap(),
            (ExecutionPlan::ModelParallel, 2)
        );
    }

    #[test]
    fn cpu_only_plan_keeps_one_device() {
        let devices = vec![Device::Cpu];
        assert_eq!(accelerator_count(&devices), 0);
        assert_eq!(ExecutionPlan::Single.model_devices(&devices).len(), 1);
    }
}
