//! Chat prompt construction.
//!
//! The model's own Jinja chat template (from `tokenizer_config.json`) is
//! preferred; a fixed plain-text layout is used whenever that template is
//! missing or fails to render.

use anyhow::{Context, Result};
use common::ChatTurn;
use minijinja::{context, Environment, Error, ErrorKind};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

pub const SYSTEM_PERSONA: &str = "You are a BFSI domain expert. Answer concisely and accurately.";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// A model-native chat template plus the special tokens it references.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: String,
    eos_token: String,
}

fn raise_exception(message: String) -> Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    // Hugging Face renders chat templates with both of these enabled.
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_function("raise_exception", raise_exception);
    env
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>, bos_token: impl Into<String>, eos_token: impl Into<String>) -> Result<Self> {
        let source = source.into();
        environment()
            .template_from_str(&source)
            .context("Chat template does not compile")?;

        Ok(Self {
            source,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    /// Read the template from a `tokenizer_config.json`; `Ok(None)` when the
    /// tokenizer does not ship one.
    pub fn from_tokenizer_config<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: serde_json::Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let source = match &config["chat_template"] {
            serde_json::Value::String(s) => s.clone(),
            // Newer tokenizers ship a list of named templates.
            serde_json::Value::Array(named) => match named
                .iter()
                .find(|t| t["name"] == "default")
                .and_then(|t| t["template"].as_str())
            {
                Some(s) => s.to_string(),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        let bos_token = special_token(&config["bos_token"]);
        let eos_token = special_token(&config["eos_token"]);

        Self::new(source, bos_token, eos_token).map(Some)
    }

    pub fn render(&self, messages: &[ChatMessage<'_>]) -> Result<String> {
        let prompt = environment().render_str(
            &self.source,
            context! {
                messages => messages,
                add_generation_prompt => true,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            },
        )?;
        Ok(prompt)
    }
}

/// Special tokens are stored either as a bare string or as `{ "content": ... }`.
fn special_token(value: &serde_json::Value) -> String {
    value
        .as_str()
        .or_else(|| value["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

pub fn fallback_prompt(message: &str) -> String {
    format!("System: {}\nUser: {}\nAssistant:", SYSTEM_PERSONA, message)
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    template: Option<ChatTemplate>,
}

impl PromptBuilder {
    pub fn new(template: Option<ChatTemplate>) -> Self {
        Self { template }
    }

    pub fn has_native_template(&self) -> bool {
        self.template.is_some()
    }

    /// Prior turns are accepted but only the latest message goes into the prompt.
    pub fn build(&self, message: &str, _history: Option<&[ChatTurn]>) -> String {
        let messages = [
            ChatMessage {
                role: "system",
                content: SYSTEM_PERSONA,
            },
            ChatMessage {
                role: "user",
                content: message,
            },
        ];

        match &self.template {
            Some(template) => match template.render(&messages) {
                Ok(prompt) => prompt,
                Err(e) => {
                    warn!(error = %e, "Chat template failed to render, using plain prompt");
                    fallback_prompt(message)
                }
            },
            None => {
                debug!("No native chat template, using plain prompt");
                fallback_prompt(message)
            }
        }
    }
}
