use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ArchitectureConfig;

const INIT_STD: f64 = 0.02;

/// Linear layer initialised the way GPT-2 initialises its projections.
pub(crate) fn gpt2_linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Additive causal mask: 0 on and below the diagonal, a large negative value above it.
fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { -1e9 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

/// Multi-head causal self-attention with a fused qkv projection.
#[derive(Debug)]
pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    n_embd: usize,
    dropout: Dropout,
}

impl CausalSelfAttention {
    pub fn new(config: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            c_attn: gpt2_linear(n_embd, 3 * n_embd, true, vb.pp("c_attn"))?,
            c_proj: gpt2_linear(n_embd, n_embd, true, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            n_embd,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        x.reshape((batch, seq, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;
        let q = self.split_heads(&qkv.narrow(2, 0, self.n_embd)?, batch, seq)?;
        let k = self.split_heads(&qkv.narrow(2, self.n_embd, self.n_embd)?, batch, seq)?;
        let v = self.split_heads(&qkv.narrow(2, 2 * self.n_embd, self.n_embd)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let mask = causal_mask(seq, scores.dtype(), x.device())?;
        let scores = scores.broadcast_add(&mask)?;

        let weights = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(v.dtype())?;
        let weights = self.dropout.forward(&weights, train)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.n_embd))?;
        self.dropout.forward(&self.c_proj.forward(&out)?, train)
    }
}

/// Position-wise feed-forward network with a GELU nonlinearity.
#[derive(Debug)]
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let inner = 4 * config.n_embd;
        Ok(Self {
            c_fc: gpt2_linear(config.n_embd, inner, true, vb.pp("c_fc"))?,
            c_proj: gpt2_linear(inner, config.n_embd, true, vb.pp("c_proj"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        self.dropout.forward(&self.c_proj.forward(&hidden)?, train)
    }
}

/// Pre-norm transformer block: `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
#[derive(Debug)]
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
    device: Device,
}

impl Block {
    pub fn new(config: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            device: vb.device().clone(),
        })
    }

    /// Device holding this block's parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, train)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?, train)?)?;
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny() -> ArchitectureConfig {
        ArchitectureConfig {
            vocab_size: 16,
            n_positions: 8,
            n_embd: 8,
            n_layer: 1,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
            dropout: 0.0,
            dtype: "f32".into(),
            num_labels: 2,
            pad_token_id: 0,
        }
    }

    #[test]
    fn block_preserves_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = Block::new(&tiny(), vb.pp("h.0"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
        let y = block.forward(&x, false)?;
        assert_eq!(y.dims(), &[2, 5, 8]);
        Ok(())
    }

    #[test]
    fn attention_is_causal() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = CausalSelfAttention::new(&tiny(), vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu)?;
        let full = attn.forward(&x, false)?;
        let prefix = attn.forward(&x.narrow(1, 0, 2)?, false)?;

        let a = full.narrow(1, 0, 2)?.flatten_all()?.to_vec1::<f32>()?;
        let b = prefix.flatten_all()?.to_vec1::<f32>()?;
        for (lhs, rhs) in a.iter().zip(b.iter()) {
            assert!((lhs - rhs).abs() < 1e-5);
        }
        Ok(())
    }
}
