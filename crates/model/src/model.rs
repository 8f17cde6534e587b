use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Init, LayerNorm, Linear, Module, VarBuilder, VarMap};

use crate::block::{gpt2_linear, Block};
use crate::config::ArchitectureConfig;
use crate::errors::{Error, Result};
use crate::persistence;

/// Prefix under which classification-head parameters are registered.
pub const SCORE_PREFIX: &str = "score";

/// A model mapping a padded `(batch, seq)` batch of token ids to `(batch, num_labels)` logits.
pub trait Classifier {
    fn classify(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;

    /// Switches dropout on (`true`) or off (`false`).
    fn set_training(&mut self, training: bool);

    /// Parameters the optimizer should update, sorted by name.
    fn trainable_parameters(&self) -> Vec<(String, Var)>;

    /// Device on which input batches are expected.
    fn device(&self) -> &Device;
}

/// Options controlling how a [`TransformerWithHead`] is built.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub num_labels: usize,
    pub linear_probe: bool,
    /// Devices the blocks are spread over; the first one hosts the embeddings.
    pub devices: Vec<Device>,
    pub custom_kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            num_labels: 2,
            linear_probe: false,
            devices: vec![Device::Cpu],
            custom_kwargs: serde_json::Map::new(),
        }
    }
}

/// GPT-2 style backbone with a bias-free linear score head on the last real token.
pub struct TransformerWithHead {
    config: ArchitectureConfig,
    varmap: VarMap,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    score: Linear,
    devices: Vec<Device>,
    linear_probe: bool,
    training: bool,
}

impl std::fmt::Debug for TransformerWithHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerWithHead")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .field("linear_probe", &self.linear_probe)
            .field("training", &self.training)
            .finish()
    }
}

/// Splits `n_layer` blocks into contiguous runs, one per device.
pub fn block_device_map(n_layer: usize, n_devices: usize) -> Vec<usize> {
    let n_devices = n_devices.max(1);
    let per_device = n_layer.div_ceil(n_devices).max(1);
    (0..n_layer)
        .map(|layer| (layer / per_device).min(n_devices - 1))
        .collect()
}

impl TransformerWithHead {
    /// Builds a freshly initialised model.
    pub fn new(config: ArchitectureConfig, linear_probe: bool, devices: &[Device]) -> Result<Self> {
        config.validate()?;
        let devices = if devices.is_empty() {
            vec![Device::Cpu]
        } else {
            devices.to_vec()
        };
        let dtype = config.candle_dtype()?;
        let varmap = VarMap::new();

        let first = VarBuilder::from_varmap(&varmap, dtype, &devices[0]);
        let last_device = &devices[devices.len() - 1];
        let last = VarBuilder::from_varmap(&varmap, dtype, last_device);

        let embed_init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let wte = Embedding::new(
            first
                .pp("transformer.wte")
                .get_with_hints((config.vocab_size, config.n_embd), "weight", embed_init)?,
            config.n_embd,
        );
        let wpe = Embedding::new(
            first
                .pp("transformer.wpe")
                .get_with_hints((config.n_positions, config.n_embd), "weight", embed_init)?,
            config.n_embd,
        );

        let placement = block_device_map(config.n_layer, devices.len());
        let mut blocks = Vec::with_capacity(config.n_layer);
        for (layer, device_idx) in placement.iter().enumerate() {
            let vb = VarBuilder::from_varmap(&varmap, dtype, &devices[*device_idx]);
            blocks.push(Block::new(&config, vb.pp(format!("transformer.h.{layer}")))?);
        }

        let ln_f = candle_nn::layer_norm(
            config.n_embd,
            config.layer_norm_epsilon,
            last.pp("transformer.ln_f"),
        )?;
        let score = gpt2_linear(config.n_embd, config.num_labels, false, last.pp(SCORE_PREFIX))?;

        log::debug!(
            "built model: {} layers over {} device(s), linear_probe={}",
            config.n_layer,
            devices.len(),
            linear_probe
        );

        Ok(Self {
            config,
            varmap,
            wte,
            wpe,
            blocks,
            ln_f,
            score,
            devices,
            linear_probe,
            training: false,
        })
    }

    /// Builds a model from a local checkpoint directory or a preset name.
    ///
    /// A directory containing `config.json` is loaded with its weights. A
    /// preset name without local weights yields a freshly initialised model.
    pub fn from_pretrained(name: &str, options: &LoadOptions) -> Result<Self> {
        let dir = Path::new(name);
        let from_dir = persistence::has_config(dir);
        let mut config = if from_dir {
            ArchitectureConfig::read_json(dir)?
        } else {
            ArchitectureConfig::preset(name).ok_or_else(|| Error::UnknownModel(name.to_string()))?
        };
        config.num_labels = options.num_labels;
        config.apply_kwargs(&options.custom_kwargs)?;

        let mut model = Self::new(config, options.linear_probe, &options.devices)?;
        if from_dir {
            model.load_weights(dir)?;
            log::info!("loaded weights from {}", dir.display());
        } else {
            log::warn!("no local weights for '{name}', using a freshly initialised model");
        }
        Ok(model)
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn is_linear_probe(&self) -> bool {
        self.linear_probe
    }

    pub fn dtype(&self) -> DType {
        self.wte.embeddings().dtype()
    }

    /// Activation recomputation is not available on this backend; the flag is accepted and ignored.
    pub fn enable_gradient_checkpointing(&mut self) {
        log::warn!("gradient checkpointing is not supported by the candle backend; ignoring");
    }

    /// Saves `config.json` and the weights into `dir`, returning the weight files written.
    pub fn save_pretrained(&self, dir: &Path, max_shard_bytes: Option<usize>) -> Result<Vec<std::path::PathBuf>> {
        self.config.write_json(dir)?;
        persistence::save_weights(&self.varmap, dir, max_shard_bytes)
    }

    /// Overwrites every parameter with the checkpoint stored in `dir`.
    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        let tensors = persistence::read_weights(dir)?;
        persistence::apply_weights(&self.varmap, &tensors)
    }

    /// Index of the last non-pad token of every row.
    fn last_token_indices(&self, input_ids: &Tensor) -> Result<Vec<u32>> {
        let lengths = input_ids
            .ne(self.config.pad_token_id)?
            .to_dtype(DType::U32)?
            .sum(1)?
            .to_vec1::<u32>()?;
        Ok(lengths.into_iter().map(|len| len.saturating_sub(1)).collect())
    }

    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(Error::config("input batch has zero sequence length"));
        }
        if seq > self.config.n_positions {
            return Err(Error::config(format!(
                "sequence length {} exceeds n_positions {}",
                seq, self.config.n_positions
            )));
        }
        let primary = &self.devices[0];
        let input_ids = input_ids.to_device(primary)?;

        let positions = Tensor::arange(0u32, seq as u32, primary)?;
        let mut hidden = self
            .wte
            .forward(&input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        for block in &self.blocks {
            if !hidden.device().same_device(block.device()) {
                hidden = hidden.to_device(block.device())?;
            }
            hidden = block.forward(&hidden, self.training)?;
        }
        let last_device = &self.devices[self.devices.len() - 1];
        let hidden = self.ln_f.forward(&hidden.to_device(last_device)?)?;

        let index = self.last_token_indices(&input_ids)?;
        let index = Tensor::from_vec(index, (batch, 1, 1), last_device)?
            .broadcast_as((batch, 1, self.config.n_embd))?
            .contiguous()?;
        let mut pooled = hidden.gather(&index, 1)?.squeeze(1)?;
        if self.linear_probe {
            pooled = pooled.detach();
        }

        let logits = self.score.forward(&pooled)?;
        Ok(logits.to_device(primary)?)
    }
}

impl Classifier for TransformerWithHead {
    fn classify(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.forward(input_ids)
            .map_err(|err| candle_core::Error::Msg(err.to_string()))
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut params: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| !self.linear_probe || name.starts_with(SCORE_PREFIX))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn device(&self) -> &Device {
        &self.devices[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_split_contiguously() {
        assert_eq!(block_device_map(4, 1), vec![0, 0, 0, 0]);
        assert_eq!(block_device_map(4, 2), vec![0, 0, 1, 1]);
        assert_eq!(block_device_map(5, 2), vec![0, 0, 0, 1, 1]);
        assert_eq!(block_device_map(2, 4), vec![0, 1]);
    }
}
