use crate::config::AppConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// A chat-completion backend. Must accept system, user and assistant turns.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatModel {
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: 0.1,
            max_tokens: 1500,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| QueryError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(
            api_key,
            config.llm_base_url.clone(),
            config.llm_model.clone(),
            config.llm_timeout,
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        });

        debug!("Sending {} messages to {}", messages.len(), self.model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueryError::Timeout(format!("LLM API call timed out: {}", e))
                } else {
                    QueryError::Llm(format!("LLM API call failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueryError::Llm(format!(
                "LLM API returned {}: {}",
                status,
                text.chars().take(500).collect::<String>()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QueryError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        parse_completion(&response_json)
    }
}

/// Pull the first choice's content and the usage block out of a completion.
pub fn parse_completion(response_json: &serde_json::Value) -> Result<ChatResponse> {
    let content = response_json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| QueryError::Llm("No content in LLM response".to_string()))?;

    let usage = response_json
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

    Ok(ChatResponse {
        content: content.to_string(),
        usage,
    })
}
