// src/ai/client.rs
//! Language-model completion contract and an OpenAI-compatible HTTP client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::utils::config::AiConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            input_per_mtok: config.input_price_per_mtok,
            output_per_mtok: config.output_price_per_mtok,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completions client for OpenAI and compatible gateways.
pub struct OpenAiCompatibleClient {
    http: Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("Invalid LLM_API_URL '{}'", config.api_url))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.as_str().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

fn completion_from_response(response: ChatResponse) -> Result<Completion> {
    let usage = response
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    Ok(Completion { text, usage })
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: 0.0,
        };
        debug!("LLM request: model={}, prompt chars={}", self.model, request.user.len());

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.api_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .context("Failed to send request to LLM API")?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM API returned status: {}", response.status()));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse LLM API response")?;
        completion_from_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_uses_per_million_prices() {
        let pricing = Pricing {
            input_per_mtok: 0.15,
            output_per_mtok: 0.60,
        };
        let cost = pricing.cost(&TokenUsage {
            input_tokens: 2_000_000,
            output_tokens: 500_000,
        });
        assert!((cost - 0.60).abs() < 1e-9);
        assert_eq!(pricing.cost(&TokenUsage::default()), 0.0);
    }

    #[test]
    fn test_response_without_usage_counts_zero_tokens() {
        let raw = r#"{"choices":[{"message":{"content":"[]"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let completion = completion_from_response(parsed).unwrap();
        assert_eq!(completion.text, "[]");
        assert_eq!(completion.usage, TokenUsage::default());
    }

    #[test]
    fn test_response_usage_is_read() {
        let raw = r#"{"choices":[{"message":{"content":"ok"}}],
            "usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let completion = completion_from_response(parsed).unwrap();
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 3);
    }
}
