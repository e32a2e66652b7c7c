//! LoRA adapter loading and merging.
//!
//! PEFT stores each adapted linear layer as a pair of low-rank factors
//! `lora_A` (`r x in`) and `lora_B` (`out x r`). Merging folds
//! `scale * B @ A` into the base weight so inference runs on a plain model.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraFactor {
    A,
    B,
}

/// One adapted layer: the base weight it targets and its two factors.
#[derive(Debug)]
struct LoraPair {
    target: String,
    a: Tensor,
    b: Tensor,
}

#[derive(Debug)]
pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: Vec<LoraPair>,
}

/// Map a PEFT tensor name onto the base weight it adapts, e.g.
/// `base_model.model.model.layers.0.self_attn.qkv_proj.lora_A.weight`
/// becomes `model.layers.0.self_attn.qkv_proj.weight`.
fn parse_adapter_key(key: &str) -> Option<(String, LoraFactor)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let key = key.strip_suffix(".weight")?;
    // Older PEFT releases keep the adapter name in the key.
    let key = key.strip_suffix(".default").unwrap_or(key);

    if let Some(module) = key.strip_suffix(".lora_A") {
        Some((format!("{}.weight", module), LoraFactor::A))
    } else if let Some(module) = key.strip_suffix(".lora_B") {
        Some((format!("{}.weight", module), LoraFactor::B))
    } else {
        None
    }
}

impl LoraAdapter {
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        info!("Loading LoRA adapter from: {}", dir.display());

        let config_path = dir.join("adapter_config.json");
        let config_content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: AdapterConfig = serde_json::from_str(&config_content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let weights_path = dir.join("adapter_model.safetensors");
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to load {}", weights_path.display()))?;

        Self::from_tensors(config, tensors)
    }

    pub fn from_tensors(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        if config.r == 0 {
            anyhow::bail!("adapter rank must be positive");
        }

        let mut a_factors = HashMap::new();
        let mut b_factors = HashMap::new();

        for (key, tensor) in tensors {
            match parse_adapter_key(&key) {
                Some((target, LoraFactor::A)) => {
                    a_factors.insert(target, tensor);
                }
                Some((target, LoraFactor::B)) => {
                    b_factors.insert(target, tensor);
                }
                None => warn!(tensor = %key, "Ignoring non-LoRA tensor in adapter"),
            }
        }

        let mut pairs = Vec::with_capacity(a_factors.len());
        for (target, a) in a_factors {
            let b = b_factors
                .remove(&target)
                .ok_or_else(|| anyhow::anyhow!("lora_B missing for {}", target))?;
            pairs.push(LoraPair { target, a, b });
        }
        if let Some(target) = b_factors.keys().next() {
            anyhow::bail!("lora_A missing for {}", target);
        }
        if pairs.is_empty() {
            anyhow::bail!("adapter contains no LoRA layers");
        }

        pairs.sort_by(|x, y| x.target.cmp(&y.target));

        Ok(Self { config, pairs })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.pairs.len()
    }

    /// Fold every adapted layer into `weights` in place. Returns the number
    /// of merged layers.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        let scale = self.config.scaling();

        for pair in &self.pairs {
            let base = weights
                .get(&pair.target)
                .ok_or_else(|| anyhow::anyhow!("base model has no weight {}", pair.target))?;
            let dtype = base.dtype();

            let a = pair.a.to_dtype(DType::F32)?;
            let b = pair.b.to_dtype(DType::F32)?;
            let mut delta = b.matmul(&a)?;
            if self.config.fan_in_fan_out {
                delta = delta.t()?;
            }

            if delta.dims() != base.dims() {
                anyhow::bail!(
                    "LoRA delta for {} has shape {:?}, base weight has {:?}",
                    pair.target,
                    delta.dims(),
                    base.dims()
                );
            }

            let merged = (base.to_dtype(DType::F32)? + delta.affine(scale, 0.0)?)?.to_dtype(dtype)?;
            debug!(layer = %pair.target, "Merged LoRA layer");
            weights.insert(pair.target.clone(), merged);
        }

        info!(
            layers = self.pairs.len(),
            rank = self.config.r,
            scale,
            "✓ LoRA adapter merged into base weights"
        );

        Ok(self.pairs.len())
    }
}
