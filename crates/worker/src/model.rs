//! GPT-2 model loading and forward pass
//!
//! This module loads a pretrained GPT-2 checkpoint (`config.json` plus a
//! memory-mapped `model.safetensors`) and computes next-token logits on the
//! CPU with candle. The weights are only ever read: there is no dropout or any
//! other training-only path, so a loaded model is always in inference mode and
//! can be shared by concurrent generations.

use candle_core::{DType, Device, Tensor, D};
use chatgate_common::error::{ChatGateError, Result};
use memmap2::Mmap;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Causal language model used by the generation loop
pub trait LanguageModel: Send + Sync {
    /// Maximum number of positions the model can attend over
    fn context_length(&self) -> usize;

    /// Vocabulary size (length of a logits vector)
    fn vocab_size(&self) -> usize;

    /// End-of-sequence id declared by the model configuration
    fn eos_token_id(&self) -> Option<u32> {
        None
    }

    /// Logits for the token following `tokens`
    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>>;
}

/// GPT-2 hyperparameters as found in `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,

    #[serde(default)]
    pub n_positions: Option<usize>,

    #[serde(default)]
    pub n_ctx: Option<usize>,

    /// MLP width (None = 4 * n_embd)
    #[serde(default)]
    pub n_inner: Option<usize>,

    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,

    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// Read and validate a `config.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Gpt2Config = serde_json::from_str(&content)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the dimensions are usable
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.n_embd == 0 || self.n_head == 0 || self.n_layer == 0 {
            return Err(ChatGateError::resource_load("model dimensions must be non-zero"));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ChatGateError::resource_load(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.context_length() == 0 {
            return Err(ChatGateError::resource_load("model config defines no context length"));
        }
        Ok(())
    }

    /// Context window (`n_positions`, falling back to `n_ctx`)
    pub fn context_length(&self) -> usize {
        self.n_positions.or(self.n_ctx).unwrap_or(0)
    }

    /// MLP hidden width
    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// Named tensors read from a checkpoint
struct WeightMap {
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    /// Memory-map a safetensors file and convert every tensor to f32
    fn open(path: &Path, device: &Device) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to open weights {}: {}", path.display(), e)))?;

        // SAFETY: the mapping is only read while copying tensors out below and
        // is dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| ChatGateError::resource_load(format!("Failed to map weights {}: {}", path.display(), e)))?;

        let raw = candle_core::safetensors::load_buffer(&mmap, device)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to parse weights {}: {}", path.display(), e)))?;

        let mut tensors = HashMap::with_capacity(raw.len());
        for (name, tensor) in raw {
            let tensor = tensor
                .to_dtype(DType::F32)
                .map_err(|e| ChatGateError::resource_load(format!("Failed to convert {}: {}", name, e)))?;
            // Checkpoints saved from the LM-head wrapper prefix every key
            let name = match name.strip_prefix("transformer.") {
                Some(stripped) => stripped.to_string(),
                None => name,
            };
            tensors.insert(name, tensor);
        }

        debug!("Read {} tensors from {}", tensors.len(), path.display());
        Ok(Self { tensors })
    }

    fn take(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ChatGateError::resource_load(format!("Missing tensor {}", name)))?;

        if tensor.dims() != shape {
            return Err(ChatGateError::resource_load(format!(
                "Tensor {} has shape {:?}, expected {:?}",
                name,
                tensor.dims(),
                shape
            )));
        }
        Ok(tensor)
    }
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(weights: &mut WeightMap, prefix: &str, dim: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: weights.take(&format!("{}.weight", prefix), &[dim])?,
            bias: weights.take(&format!("{}.bias", prefix), &[dim])?,
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&variance.affine(1.0, self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// GPT-2 "Conv1D": a linear layer whose weight is stored as (in, out)
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(weights: &mut WeightMap, prefix: &str, input: usize, output: usize) -> Result<Self> {
        Ok(Self {
            weight: weights.take(&format!("{}.weight", prefix), &[input, output])?,
            bias: weights.take(&format!("{}.bias", prefix), &[output])?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

struct Block {
    ln_1: LayerNorm,
    c_attn: Conv1D,
    attn_proj: Conv1D,
    ln_2: LayerNorm,
    c_fc: Conv1D,
    mlp_proj: Conv1D,
    n_head: usize,
}

impl Block {
    fn load(weights: &mut WeightMap, index: usize, config: &Gpt2Config) -> Result<Self> {
        let prefix = format!("h.{}", index);
        let embd = config.n_embd;
        let inner = config.inner_dim();
        let eps = config.layer_norm_epsilon;

        Ok(Self {
            ln_1: LayerNorm::load(weights, &format!("{}.ln_1", prefix), embd, eps)?,
            c_attn: Conv1D::load(weights, &format!("{}.attn.c_attn", prefix), embd, 3 * embd)?,
            attn_proj: Conv1D::load(weights, &format!("{}.attn.c_proj", prefix), embd, embd)?,
            ln_2: LayerNorm::load(weights, &format!("{}.ln_2", prefix), embd, eps)?,
            c_fc: Conv1D::load(weights, &format!("{}.mlp.c_fc", prefix), embd, inner)?,
            mlp_proj: Conv1D::load(weights, &format!("{}.mlp.c_proj", prefix), inner, embd)?,
            n_head: config.n_head,
        })
    }

    /// x: (seq_len, n_embd), mask: (seq_len, seq_len)
    fn forward(&self, x: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (seq_len, embd) = x.dims2()?;
        let head_dim = embd / self.n_head;

        // 1. Causal self-attention
        let qkv = self.c_attn.forward(&self.ln_1.forward(x)?)?;
        let heads = |part: usize| -> candle_core::Result<Tensor> {
            qkv.narrow(1, part * embd, embd)?
                .reshape((seq_len, self.n_head, head_dim))?
                .transpose(0, 1)?
                .contiguous()
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(1.0 / (head_dim as f64).sqrt(), 0.0)?
            .broadcast_add(mask)?;
        let attention = softmax_last_dim(&scores)?
            .matmul(&v)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, embd))?;

        // 2. Residual connection
        let x = x.add(&self.attn_proj.forward(&attention)?)?;

        // 3. MLP and residual
        let hidden = self.c_fc.forward(&self.ln_2.forward(&x)?)?.gelu()?;
        x.add(&self.mlp_proj.forward(&hidden)?)
    }
}

fn softmax_last_dim(x: &Tensor) -> candle_core::Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum)
}

fn causal_mask(seq_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

/// Pretrained GPT-2 decoder
pub struct Gpt2Model {
    config: Gpt2Config,
    wte: Tensor,
    wpe: Tensor,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    device: Device,
}

impl Gpt2Model {
    /// Load a model from a directory holding `config.json` and `model.safetensors`
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Err(ChatGateError::resource_load(format!(
                "config.json not found in {}",
                dir.display()
            )));
        }
        let weights_path = dir.join("model.safetensors");
        if !weights_path.exists() {
            return Err(ChatGateError::resource_load(format!(
                "model.safetensors not found in {}",
                dir.display()
            )));
        }

        let config = Gpt2Config::from_file(&config_path)?;
        let device = Device::Cpu;
        let mut weights = WeightMap::open(&weights_path, &device)?;
        let model = Self::from_weights(config, &mut weights, device)?;

        info!(
            "GPT-2 model loaded: {} layers, {} heads, n_embd {}, context {}",
            model.config.n_layer,
            model.config.n_head,
            model.config.n_embd,
            model.config.context_length()
        );
        Ok(model)
    }

    fn from_weights(config: Gpt2Config, weights: &mut WeightMap, device: Device) -> Result<Self> {
        let embd = config.n_embd;
        let wte = weights.take("wte.weight", &[config.vocab_size, embd])?;
        let wpe = weights.take("wpe.weight", &[config.context_length(), embd])?;

        let blocks = (0..config.n_layer)
            .map(|index| Block::load(weights, index, &config))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = LayerNorm::load(weights, "ln_f", embd, config.layer_norm_epsilon)?;

        Ok(Self {
            config,
            wte,
            wpe,
            blocks,
            ln_f,
            device,
        })
    }

    fn forward_last(&self, tokens: &[u32]) -> candle_core::Result<Vec<f32>> {
        let seq_len = tokens.len();
        let ids = Tensor::new(tokens, &self.device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;

        let mut x = self
            .wte
            .index_select(&ids, 0)?
            .add(&self.wpe.index_select(&positions, 0)?)?;

        let mask = causal_mask(seq_len, &self.device)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }

        // Layer norm is per position, so only the last row is needed
        let last = self.ln_f.forward(&x.narrow(0, seq_len - 1, 1)?)?;

        // The LM head is tied to the token embedding
        self.wte
            .matmul(&last.t()?.contiguous()?)?
            .squeeze(1)?
            .to_vec1::<f32>()
    }
}

impl LanguageModel for Gpt2Model {
    fn context_length(&self) -> usize {
        self.config.context_length()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.config.eos_token_id
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(ChatGateError::inference("cannot run the model on an empty sequence"));
        }
        if tokens.len() > self.context_length() {
            return Err(ChatGateError::inference(format!(
                "sequence of {} tokens exceeds the context window of {}",
                tokens.len(),
                self.context_length()
            )));
        }
        if let Some(&bad) = tokens.iter().find(|&&id| id as usize >= self.config.vocab_size) {
            return Err(ChatGateError::inference(format!("token id {} is outside the vocabulary", bad)));
        }

        self.forward_last(tokens)
            .map_err(|e| ChatGateError::inference(format!("Forward pass failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 11;
    const EMBD: usize = 8;
    const CTX: usize = 16;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: VOCAB,
            n_embd: EMBD,
            n_head: 2,
            n_layer: 2,
            n_positions: Some(CTX),
            n_ctx: Some(CTX),
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            eos_token_id: Some(0),
        }
    }

    /// Deterministic, non-degenerate weights
    fn patterned(shape: &[usize], salt: f32) -> Tensor {
        let len: usize = shape.iter().product();
        let data: Vec<f32> = (0..len).map(|i| ((i as f32 + salt) * 0.37).sin() * 0.2).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn tiny_weights(prefix: &str) -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        let mut add = |name: String, shape: &[usize]| {
            let salt = map.len() as f32;
            map.insert(format!("{}{}", prefix, name), patterned(shape, salt));
        };

        add("wte.weight".into(), &[VOCAB, EMBD]);
        add("wpe.weight".into(), &[CTX, EMBD]);
        for layer in 0..2 {
            let p = format!("h.{}", layer);
            add(format!("{}.ln_1.weight", p), &[EMBD]);
            add(format!("{}.ln_1.bias", p), &[EMBD]);
            add(format!("{}.attn.c_attn.weight", p), &[EMBD, 3 * EMBD]);
            add(format!("{}.attn.c_attn.bias", p), &[3 * EMBD]);
            add(format!("{}.attn.c_proj.weight", p), &[EMBD, EMBD]);
            add(format!("{}.attn.c_proj.bias", p), &[EMBD]);
            add(format!("{}.ln_2.weight", p), &[EMBD]);
            add(format!("{}.ln_2.bias", p), &[EMBD]);
            add(format!("{}.mlp.c_fc.weight", p), &[EMBD, 4 * EMBD]);
            add(format!("{}.mlp.c_fc.bias", p), &[4 * EMBD]);
            add(format!("{}.mlp.c_proj.weight", p), &[4 * EMBD, EMBD]);
            add(format!("{}.mlp.c_proj.bias", p), &[EMBD]);
        }
        add("ln_f.weight".into(), &[EMBD]);
        add("ln_f.bias".into(), &[EMBD]);
        map
    }

    fn write_checkpoint(dir: &Path, prefix: &str) {
        let config = serde_json::json!({
            "vocab_size": VOCAB,
            "n_embd": EMBD,
            "n_head": 2,
            "n_layer": 2,
            "n_positions": CTX,
            "n_ctx": CTX,
            "n_inner": null,
            "eos_token_id": 0
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        candle_core::safetensors::save(&tiny_weights(prefix), dir.join("model.safetensors")).unwrap();
    }

    #[test]
    fn test_config_parses_both_context_keys() {
        let config: Gpt2Config = serde_json::from_str(
            r#"{"vocab_size": 50257, "n_embd": 768, "n_head": 12, "n_layer": 12, "n_positions": 1024, "n_ctx": 1024}"#,
        )
        .unwrap();

        assert_eq!(config.context_length(), 1024);
        assert_eq!(config.inner_dim(), 3072);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_uneven_heads() {
        let mut config = tiny_config();
        config.n_head = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_forward() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), "");

        let model = Gpt2Model::load(dir.path()).unwrap();
        assert_eq!(model.context_length(), CTX);
        assert_eq!(model.vocab_size(), VOCAB);
        assert_eq!(model.eos_token_id(), Some(0));

        let logits = model.next_token_logits(&[1, 2, 3]).unwrap();
        assert_eq!(logits.len(), VOCAB);
        assert!(logits.iter().all(|v| v.is_finite()));

        // Pure function of the input
        assert_eq!(logits, model.next_token_logits(&[1, 2, 3]).unwrap());
        assert_ne!(logits, model.next_token_logits(&[3, 2, 1]).unwrap());
    }

    #[test]
    fn test_prefixed_checkpoint_keys() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), "transformer.");

        let model = Gpt2Model::load(dir.path()).unwrap();
        assert_eq!(model.next_token_logits(&[4]).unwrap().len(), VOCAB);
    }

    #[test]
    fn test_missing_weights_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();

        let result = Gpt2Model::load(dir.path());
        assert!(matches!(result, Err(ChatGateError::ResourceLoad(msg)) if msg.contains("model.safetensors")));
    }

    #[test]
    fn test_malformed_weights_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), "");
        std::fs::write(dir.path().join("model.safetensors"), b"not a checkpoint").unwrap();

        assert!(matches!(Gpt2Model::load(dir.path()), Err(ChatGateError::ResourceLoad(_))));
    }

    #[test]
    fn test_rejects_out_of_range_input() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), "");
        let model = Gpt2Model::load(dir.path()).unwrap();

        assert!(model.next_token_logits(&[]).is_err());
        assert!(model.next_token_logits(&[VOCAB as u32]).is_err());
        assert!(model.next_token_logits(&vec![1; CTX + 1]).is_err());
        assert!(model.next_token_logits(&vec![1; CTX]).is_ok());
    }
}
