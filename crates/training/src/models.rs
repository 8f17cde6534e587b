use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{optimizer::OptimizerKind, TrainingError};

/// Training defaults for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Preset name or local checkpoint directory.
    pub name: String,
    pub default_lr: f64,
    pub eval_batch_size: usize,
    #[serde(default)]
    pub custom_kwargs: Map<String, Value>,
    #[serde(default)]
    pub gradient_checkpointing: bool,
    #[serde(default)]
    pub model_parallel: bool,
    #[serde(default = "default_optimizer")]
    pub default_optimizer: OptimizerKind,
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Adam
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, default_lr: f64, eval_batch_size: usize) -> Self {
        Self {
            name: name.into(),
            default_lr,
            eval_batch_size,
            custom_kwargs: Map::new(),
            gradient_checkpointing: false,
            model_parallel: false,
            default_optimizer: default_optimizer(),
        }
    }

    pub fn with_gradient_checkpointing(mut self) -> Self {
        self.gradient_checkpointing = true;
        self
    }

    pub fn with_model_parallel(mut self) -> Self {
        self.model_parallel = true;
        self
    }
}

/// Name-keyed table of [`ModelConfig`]s.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the GPT-2 family presets.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ModelConfig::new("gpt2", 5e-5, 32));
        registry.register(ModelConfig::new("gpt2-medium", 5e-5, 32));
        registry.register(ModelConfig::new("gpt2-large", 1e-5, 32));
        registry.register(ModelConfig::new("gpt2-xl", 1e-5, 2).with_gradient_checkpointing());
        registry
    }

    /// Adds or replaces the entry for `config.name`.
    pub fn register(&mut self, config: ModelConfig) {
        if self.models.contains_key(&config.name) {
            log::debug!("replacing model config '{}'", config.name);
        }
        self.models.insert(config.name.clone(), config);
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Looks up `name`, falling back to a local checkpoint directory with `gpt2` defaults.
    pub fn resolve(&self, name: &str) -> Result<ModelConfig, TrainingError> {
        if let Some(config) = self.models.get(name) {
            return Ok(config.clone());
        }
        let dir = Path::new(name);
        if dir.join("config.json").is_file() {
            log::info!("using local checkpoint {} with default settings", dir.display());
            let defaults = self
                .models
                .get("gpt2")
                .cloned()
                .unwrap_or_else(|| ModelConfig::new("gpt2", 5e-5, 32));
            return Ok(ModelConfig {
                name: name.to_string(),
                ..defaults
            });
        }
        Err(TrainingError::invalid(format!(
            "unknown model '{}', expected one of: {}",
            name,
            self.names().join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_presets_have_expected_defaults() {
        let registry = ModelRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["gpt2", "gpt2-large", "gpt2-medium", "gpt2-xl"]);
        let xl = registry.resolve("gpt2-xl").unwrap();
        assert_eq!(xl.eval_batch_size, 2);
        assert!(xl.gradient_checkpointing);
        assert_eq!(registry.resolve("gpt2").unwrap().default_optimizer, OptimizerKind::Adam);
    }

    #[test]
    fn local_directory_resolves_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let name = dir.path().to_string_lossy().into_owned();
        let config = ModelRegistry::with_builtin().resolve(&name).unwrap();
        assert_eq!(config.name, name);
        assert_eq!(config.default_lr, 5e-5);
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(matches!(
            ModelRegistry::with_builtin().resolve("Qwen/Qwen-7B"),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn registered_entries_deserialize_from_toml() {
        let config: ModelConfig = toml::from_str(
            "name = \"tiny\"\ndefault_lr = 1e-3\neval_batch_size = 4\ndefault_optimizer = \"adafactor\"\n",
        )
        .unwrap();
        let mut registry = ModelRegistry::new();
        registry.register(config);
        assert_eq!(
            registry.get("tiny").unwrap().default_optimizer,
            OptimizerKind::Adafactor
        );
    }
}
