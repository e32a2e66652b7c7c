//! BFSI chat assistant: prompt construction plus a LoRA-tuned Phi-3 model.

pub mod generation;
pub mod lora;
pub mod prompt;

use anyhow::Result;
use candle_core::Device;
use common::{config::ChatConfig, ChatResponse, ChatTurn};
use std::sync::Arc;
use tracing::{error, info};

use generation::{GenerationSettings, PhiGenerator};
use prompt::PromptBuilder;

pub const MODEL_NOT_LOADED_REPLY: &str = "Chatbot model not loaded. Check backend logs.";

/// Produces the assistant's reply text for a fully formatted prompt.
pub trait ReplyGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct Chatbot {
    prompt: PromptBuilder,
    generator: Option<Arc<dyn ReplyGenerator>>,
    source_tag: String,
}

impl Chatbot {
    pub fn new(
        prompt: PromptBuilder,
        generator: Option<Arc<dyn ReplyGenerator>>,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            prompt,
            generator,
            source_tag: source_tag.into(),
        }
    }

    /// Build the chat service. Invalid generation settings are fatal; a model
    /// that fails to load leaves the service up but answering with a notice.
    pub fn load(config: &ChatConfig, device: &Device) -> Result<Self> {
        let settings = GenerationSettings::from_config(config)?;

        info!("Initializing BFSI chatbot on {:?}", device);

        match PhiGenerator::load(config, settings, device) {
            Ok(loaded) => {
                let prompt = PromptBuilder::new(loaded.template);
                info!(
                    native_template = prompt.has_native_template(),
                    "✓ Chatbot initialized successfully"
                );
                Ok(Self::new(
                    prompt,
                    Some(Arc::new(loaded.generator)),
                    config.source_tag.clone(),
                ))
            }
            Err(e) => {
                error!("Error loading chat model: {:#}", e);
                Ok(Self::new(PromptBuilder::default(), None, config.source_tag.clone()))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.generator.is_some()
    }

    pub fn get_reply(&self, message: &str, history: Option<&[ChatTurn]>) -> Result<ChatResponse> {
        let generator = match &self.generator {
            Some(generator) => generator,
            None => {
                return Ok(ChatResponse {
                    reply: MODEL_NOT_LOADED_REPLY.to_string(),
                    meta: Some(serde_json::Map::new()),
                })
            }
        };

        let prompt = self.prompt.build(message, history);
        let reply = generator.generate(&prompt)?;

        let mut meta = serde_json::Map::new();
        meta.insert("source".to_string(), self.source_tag.clone().into());

        Ok(ChatResponse {
            reply,
            meta: Some(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the prompt it was given and answers with a canned reply.
    struct RecordingGenerator {
        seen: Mutex<Vec<String>>,
    }

    impl ReplyGenerator for RecordingGenerator {
        fn generate(&self, prompt: &str) -> Result<String> {
            self.seen.lock().unwrap().push(prompt.to_string());
            Ok("KYC is the customer identity verification banks perform.".to_string())
        }
    }

    struct BrokenGenerator;

    impl ReplyGenerator for BrokenGenerator {
        fn generate(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("shape mismatch in attention")
        }
    }

    #[test]
    fn test_reply_carries_source_tag() {
        let generator = Arc::new(RecordingGenerator {
            seen: Mutex::new(Vec::new()),
        });
        let chatbot = Chatbot::new(PromptBuilder::default(), Some(generator.clone()), "phi3-bfsi-lora");

        let response = chatbot.get_reply("What is KYC?", None).unwrap();
        assert!(!response.reply.is_empty());
        assert_eq!(response.meta.unwrap()["source"], "phi3-bfsi-lora");

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("User: What is KYC?"));
    }

    #[test]
    fn test_unloaded_model_reply() {
        let chatbot = Chatbot::new(PromptBuilder::default(), None, "phi3-bfsi-lora");
        assert!(!chatbot.is_loaded());

        let response = chatbot.get_reply("What is KYC?", None).unwrap();
        assert_eq!(response.reply, MODEL_NOT_LOADED_REPLY);
        assert!(response.meta.unwrap().is_empty());
    }

    #[test]
    fn test_generation_error_propagates() {
        let chatbot = Chatbot::new(PromptBuilder::default(), Some(Arc::new(BrokenGenerator)), "tag");
        let err = chatbot.get_reply("What is KYC?", None).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_load_with_missing_artifacts_degrades() {
        let config = ChatConfig {
            base_model_dir: "/nonexistent/phi3".to_string(),
            adapter_dir: "/nonexistent/adapter".to_string(),
            ..ChatConfig::default()
        };
        let chatbot = Chatbot::load(&config, &Device::Cpu).unwrap();
        assert!(!chatbot.is_loaded());
    }

    #[test]
    fn test_load_rejects_bad_settings() {
        let config = ChatConfig {
            temperature: -1.0,
            ..ChatConfig::default()
        };
        assert!(Chatbot::load(&config, &Device::Cpu).is_err());
    }
}
