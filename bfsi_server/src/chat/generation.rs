//! Phi-3 text generation on candle.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::phi3::{Config, Model};
use common::config::ChatConfig;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::lora::LoraAdapter;
use super::prompt::ChatTemplate;
use super::ReplyGenerator;

const STOP_TOKENS: [&str; 2] = ["<|endoftext|>", "<|end|>"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl GenerationSettings {
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        if config.max_new_tokens == 0 {
            anyhow::bail!("chat.max_new_tokens must be positive");
        }
        if !(config.temperature > 0.0) {
            anyhow::bail!("chat.temperature must be positive, got {}", config.temperature);
        }
        if !(config.top_p > 0.0 && config.top_p <= 1.0) {
            anyhow::bail!("chat.top_p must be in (0, 1], got {}", config.top_p);
        }

        Ok(Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            seed: config.seed,
        })
    }
}

/// Keep only what the model produced after the prompt.
///
/// When the sequence is no longer than the prompt, the whole sequence is
/// decoded and the prompt text removed on a best-effort basis.
pub fn extract_reply<F>(prompt: &str, input_len: usize, sequence: &[u32], decode: F) -> Result<String>
where
    F: Fn(&[u32]) -> Result<String>,
{
    if sequence.len() > input_len {
        Ok(decode(&sequence[input_len..])?.trim().to_string())
    } else {
        let decoded = decode(sequence)?;
        Ok(decoded.replace(prompt, "").trim().to_string())
    }
}

/// Everything the chat service gets back from loading the model directory.
pub struct LoadedChatModel {
    pub generator: PhiGenerator,
    pub template: Option<ChatTemplate>,
}

pub struct PhiGenerator {
    // The model owns its KV cache, so each generation needs exclusive access.
    model: Mutex<Model>,
    tokenizer: Tokenizer,
    device: Device,
    stop_ids: HashSet<u32>,
    settings: GenerationSettings,
}

/// Safetensors shards listed in `model.safetensors.index.json`, or the single
/// `model.safetensors` file.
fn weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = model_dir.join("model.safetensors.index.json");
    if !index_path.exists() {
        return Ok(vec![model_dir.join("model.safetensors")]);
    }

    let index_content = std::fs::read_to_string(&index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: serde_json::Value = serde_json::from_str(&index_content)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("{} has no weight_map", index_path.display()))?;

    let mut files: Vec<PathBuf> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .collect::<HashSet<_>>()
        .into_iter()
        .map(|f| model_dir.join(f))
        .collect();
    files.sort();
    Ok(files)
}

/// `eos_token_id` in `config.json` is either a single id or a list of ids.
fn config_eos_ids(value: &serde_json::Value) -> Vec<u32> {
    match value {
        serde_json::Value::Array(ids) => ids
            .iter()
            .filter_map(|id| id.as_u64())
            .map(|id| id as u32)
            .collect(),
        other => other.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
    }
}

fn load_weights(files: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for file in files {
        let shard = candle_core::safetensors::load(file, device)
            .with_context(|| format!("Failed to load weights from {}", file.display()))?;
        for (name, tensor) in shard {
            weights.insert(name, tensor.to_dtype(DType::F32)?);
        }
    }
    Ok(weights)
}

impl PhiGenerator {
    /// Load the base model, merge the adapter into it and build the generator.
    pub fn load(
        config: &ChatConfig,
        settings: GenerationSettings,
        device: &Device,
    ) -> Result<LoadedChatModel> {
        let model_dir = Path::new(&config.base_model_dir);
        let start_time = Instant::now();

        info!("Loading base model {} from {}", config.base_model_id, model_dir.display());

        let config_content = std::fs::read_to_string(model_dir.join("config.json"))
            .context("Failed to read base model config.json")?;
        let model_config: Config = serde_json::from_str(&config_content)?;
        let raw_config: serde_json::Value = serde_json::from_str(&config_content)?;
        info!("✓ Config loaded");

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        info!("✓ Tokenizer loaded");

        let tokenizer_config = model_dir.join("tokenizer_config.json");
        let template = if tokenizer_config.exists() {
            match ChatTemplate::from_tokenizer_config(&tokenizer_config) {
                Ok(template) => template,
                Err(e) => {
                    tracing::warn!(error = %e, "Unusable chat template, falling back to plain prompts");
                    None
                }
            }
        } else {
            None
        };
        info!(native = template.is_some(), "✓ Chat template resolved");

        let mut weights = load_weights(&weight_files(model_dir)?, device)?;
        info!(
            tensors = weights.len(),
            "✓ Base weights loaded in {:.2}ms",
            start_time.elapsed().as_secs_f64() * 1000.0
        );

        let adapter = LoraAdapter::load(&config.adapter_dir, device)?;
        if let Some(base) = &adapter.config().base_model_name_or_path {
            if base != &config.base_model_id {
                tracing::warn!(
                    adapter_base = %base,
                    base_model = %config.base_model_id,
                    "Adapter was trained against a different base model id"
                );
            }
        }
        let merged = adapter.merge_into(&mut weights)?;
        info!(
            layers = adapter.num_layers(),
            merged,
            "✓ LoRA adapter merged (scale {:.4})",
            adapter.config().scaling()
        );

        let vb = VarBuilder::from_tensors(weights, DType::F32, device);
        let model = Model::new(&model_config, vb)?;

        let mut stop_ids: HashSet<u32> = STOP_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        stop_ids.extend(config_eos_ids(&raw_config["eos_token_id"]));

        info!(
            "✓ Chat model ready in {:.2}ms",
            start_time.elapsed().as_secs_f64() * 1000.0
        );

        Ok(LoadedChatModel {
            generator: PhiGenerator {
                model: Mutex::new(model),
                tokenizer,
                device: device.clone(),
                stop_ids,
                settings,
            },
            template,
        })
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Detokenization error: {}", e))
    }
}

impl ReplyGenerator for PhiGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        let start_time = Instant::now();

        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {}", e))?;
        let prompt_ids = encoding.get_ids().to_vec();
        if prompt_ids.is_empty() {
            anyhow::bail!("Prompt produced no tokens");
        }

        let mut sequence = prompt_ids.clone();
        let mut logits_processor = LogitsProcessor::from_sampling(
            self.settings.seed,
            Sampling::TopP {
                p: self.settings.top_p,
                temperature: self.settings.temperature,
            },
        );

        {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("Chat model lock poisoned"))?;
            model.clear_kv_cache();

            for index in 0..self.settings.max_new_tokens {
                // First step feeds the whole prompt, later steps only the newest token.
                let offset = if index == 0 { 0 } else { sequence.len() - 1 };
                let input = Tensor::new(&sequence[offset..], &self.device)?.unsqueeze(0)?;

                let logits = model.forward(&input, offset)?;
                let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;

                let next_token = logits_processor.sample(&logits)?;
                if self.stop_ids.contains(&next_token) {
                    break;
                }
                sequence.push(next_token);
            }

            model.clear_kv_cache();
        }

        debug!(
            prompt_tokens = prompt_ids.len(),
            new_tokens = sequence.len() - prompt_ids.len(),
            "Generated reply in {:.2}ms",
            start_time.elapsed().as_secs_f64() * 1000.0
        );

        extract_reply(prompt, prompt_ids.len(), &sequence, |ids| self.decode(ids))
    }
}
