//! LLM access for the advanced planner and the response formatter.
//!
//! The model is treated as an untrusted structured oracle: callers extract
//! JSON from its output and validate it before use; any failure falls back
//! to deterministic behaviour.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::AgentConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// One-shot completion; implementations enforce their own deadline.
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// OpenAI-compatible `/chat/completions` client with a one-shot fallback
/// model on transport or decode failures.
pub struct HttpChatClient {
    client: reqwest::Client,
    base: String,
    api_key: Option<String>,
    model: String,
    fallback_model: Option<String>,
}

impl HttpChatClient {
    pub fn new(
        base: String,
        api_key: Option<String>,
        model: String,
        fallback_model: Option<String>,
        deadline: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key,
            model,
            fallback_model,
        })
    }

    /// Build from configuration; `None` when no `LLM_API_BASE` is set.
    pub fn from_config(cfg: &AgentConfig) -> Option<Self> {
        let base = cfg.llm_api_base.clone()?;
        let (model, fallback) = if cfg.environment == "dev" {
            (cfg.llm_model_dev.clone(), None)
        } else {
            (
                cfg.llm_model_main.clone(),
                Some(cfg.llm_model_fallback.clone()),
            )
        };
        Self::new(base, cfg.llm_api_key.clone(), model, fallback, cfg.llm_deadline).ok()
    }

    async fn complete_with(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base.trim_end_matches('/'));
        let body = json!({
            "model": model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(LlmError::Transport(format!(
                "LLM endpoint returned {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LlmError::Decode("no message content in response".to_string()))
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        match self.complete_with(&self.model, system, user).await {
            Ok(text) => Ok(text),
            Err(LlmError::Timeout) => Err(LlmError::Timeout),
            Err(primary_error) => match &self.fallback_model {
                Some(fallback) => {
                    tracing::warn!("primary model failed ({primary_error}), trying {fallback}");
                    self.complete_with(fallback, system, user).await
                }
                None => Err(primary_error),
            },
        }
    }
}

/// Pull the first JSON object out of model output, tolerating markdown
/// fences and prose around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}
