use serde::{Deserialize, Serialize};
use std::path::Path;
use anyhow::{Context, Result};

/// Top-level configuration for the BFSI inference server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub csv: CsvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    #[serde(default = "default_scaler_path")]
    pub scaler_path: String,
    #[serde(default = "default_classifier_path")]
    pub classifier_path: String,
    /// Canonical feature ordering used to turn a named `features` map into a vector.
    #[serde(default)]
    pub feature_order: Option<Vec<String>>,
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_base_model_id")]
    pub base_model_id: String,
    #[serde(default = "default_base_model_dir")]
    pub base_model_dir: String,
    #[serde(default = "default_adapter_dir")]
    pub adapter_dir: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Provenance tag reported as `meta.source` on chat replies.
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    #[serde(default = "default_csv_path")]
    pub path: String,
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_scaler_path() -> String {
    "models/scaler.json".to_string()
}

fn default_classifier_path() -> String {
    "models/fraud_detector.onnx".to_string()
}

fn default_onnx_threads() -> usize {
    1
}

fn default_base_model_id() -> String {
    "microsoft/Phi-3-mini-4k-instruct".to_string()
}

fn default_base_model_dir() -> String {
    "models/phi3-mini-4k-instruct".to_string()
}

fn default_adapter_dir() -> String {
    "models/phi3-bfsi-finetuned".to_string()
}

fn default_max_new_tokens() -> usize {
    150
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_seed() -> u64 {
    299792458
}

fn default_source_tag() -> String {
    "phi3-bfsi-lora".to_string()
}

fn default_csv_path() -> String {
    "data/finaldata.csv".to_string()
}

fn default_preview_rows() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            scaler_path: default_scaler_path(),
            classifier_path: default_classifier_path(),
            feature_order: None,
            onnx_threads: default_onnx_threads(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_model_id: default_base_model_id(),
            base_model_dir: default_base_model_dir(),
            adapter_dir: default_adapter_dir(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: default_seed(),
            source_tag: default_source_tag(),
        }
    }
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            path: default_csv_path(),
            preview_rows: default_preview_rows(),
        }
    }
}

impl ServiceConfig {
    /// Load from `BFSI_CONFIG` (default `config/service.yaml`), falling back to
    /// built-in defaults when the file is absent, then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("BFSI_CONFIG").unwrap_or_else(|_| "config/service.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().context("Invalid PORT")?;
        }
        if let Some(path) = lookup("SCALER_PATH") {
            self.fraud.scaler_path = path;
        }
        if let Some(path) = lookup("CLASSIFIER_PATH") {
            self.fraud.classifier_path = path;
        }
        if let Some(order) = lookup("FEATURE_ORDER") {
            let names: Vec<String> = order
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            self.fraud.feature_order = if names.is_empty() { None } else { Some(names) };
        }
        if let Some(id) = lookup("BASE_MODEL_ID") {
            self.chat.base_model_id = id;
        }
        if let Some(dir) = lookup("BASE_MODEL_DIR") {
            self.chat.base_model_dir = dir;
        }
        if let Some(dir) = lookup("ADAPTER_DIR") {
            self.chat.adapter_dir = dir;
        }
        if let Some(seed) = lookup("CHAT_SEED") {
            self.chat.seed = seed.parse().context("Invalid CHAT_SEED")?;
        }
        if let Some(path) = lookup("CSV_PATH") {
            self.csv.path = path;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub warmup: WarmupConfig,
    /// Sample fraud feature vectors, cycled through by fraud scenarios.
    #[serde(default)]
    pub fraud_samples: Vec<Vec<f64>>,
    /// Sample chat messages, cycled through by chat scenarios.
    #[serde(default)]
    pub chat_prompts: Vec<String>,
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub num_requests: usize,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeEndpoint {
    Fraud,
    Chat,
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub endpoint: ProbeEndpoint,
    pub concurrency: usize,
    pub num_requests: usize,
    pub description: String,
}

impl ProbeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ProbeConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
