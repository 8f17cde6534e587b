use std::fs;
use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Error, Result};

/// File written next to the weights describing the architecture.
pub const CONFIG_FILE: &str = "config.json";

/// Architecture of the decoder backbone plus its classification head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default)]
    pub pad_token_id: u32,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_num_labels() -> usize {
    2
}

impl ArchitectureConfig {
    fn gpt2_family(n_embd: usize, n_layer: usize, n_head: usize) -> Self {
        Self {
            vocab_size: 50257,
            n_positions: 1024,
            n_embd,
            n_layer,
            n_head,
            layer_norm_epsilon: default_layer_norm_epsilon(),
            dropout: 0.0,
            dtype: default_dtype(),
            num_labels: default_num_labels(),
            pad_token_id: 0,
        }
    }

    pub fn gpt2() -> Self {
        Self::gpt2_family(768, 12, 12)
    }

    pub fn gpt2_medium() -> Self {
        Self::gpt2_family(1024, 24, 16)
    }

    pub fn gpt2_large() -> Self {
        Self::gpt2_family(1280, 36, 20)
    }

    pub fn gpt2_xl() -> Self {
        Self::gpt2_family(1600, 48, 25)
    }

    /// Built-in architecture for a model name, if there is one.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "gpt2" => Some(Self::gpt2()),
            "gpt2-medium" => Some(Self::gpt2_medium()),
            "gpt2-large" => Some(Self::gpt2_large()),
            "gpt2-xl" => Some(Self::gpt2_xl()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn candle_dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }

    /// Applies the model-specific keyword arguments understood by the builder.
    ///
    /// Recognised keys are `dtype` and `dropout`; anything else is logged and ignored.
    pub fn apply_kwargs(&mut self, kwargs: &Map<String, Value>) -> Result<()> {
        for (key, value) in kwargs {
            match key.as_str() {
                "dtype" | "torch_dtype" => {
                    let dtype = value
                        .as_str()
                        .ok_or_else(|| Error::config(format!("{key} must be a string")))?;
                    parse_dtype(dtype)?;
                    self.dtype = dtype.to_string();
                }
                "dropout" => {
                    let p = value
                        .as_f64()
                        .ok_or_else(|| Error::config("dropout must be a number"))?;
                    self.dropout = p as f32;
                }
                other => log::warn!("ignoring unsupported model kwarg '{other}'"),
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::config("vocab_size must be greater than zero"));
        }
        if self.n_positions == 0 {
            return Err(Error::config("n_positions must be greater than zero"));
        }
        if self.n_layer == 0 {
            return Err(Error::config("n_layer must be greater than zero"));
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(Error::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.num_labels == 0 {
            return Err(Error::config("num_labels must be greater than zero"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("dropout must be in [0, 1)"));
        }
        parse_dtype(&self.dtype)?;
        Ok(())
    }

    pub fn read_json(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let raw = fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write_json(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "f32" | "float32" => Ok(DType::F32),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f16" | "float16" => Ok(DType::F16),
        other => Err(Error::config(format!(
            "unsupported dtype '{other}', expected f32, bf16 or f16"
        ))),
    }
}
