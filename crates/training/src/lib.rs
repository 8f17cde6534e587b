pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod eval;
pub mod experiment;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod orchestrate;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{maybe_load_model, read_results, save_results, LoadOutcome, ResultsSummary};
pub use config::{ExperimentConfig, LoggingConfig, LossOptions, TrainingError};
pub use device::{available_devices, ExecutionPlan};
pub use eval::{eval_model_acc, mean_accuracy, EvalRecord};
pub use experiment::{config_name, run_experiment, run_experiment_with, ExperimentOutcome, ExperimentSummary};
pub use logging::{KvLogger, MetricsCsv, MetricsRow};
pub use loss::{LossFn, LossKind};
pub use models::{ModelConfig, ModelRegistry};
pub use optimizer::{OptimizerKind, TrainerOptimizer};
pub use orchestrate::{train_and_save_model, TrainAndSaveOptions, TrainAndSaveResult};
pub use scheduler::{LRScheduler, LrSchedule};
pub use trainer::{train_model, TrainOptions, TrainOutcome};
