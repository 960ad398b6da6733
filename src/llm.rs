//! OpenAI-compatible chat-completions client.
//!
//! Works with any server exposing `POST {url}/chat/completions` (OpenAI,
//! Azure-style gateways, vLLM, LM Studio, Ollama's OpenAI endpoint).
//! The bearer token comes from `LLM_API_TOKEN`; servers that need no auth
//! are called without the header.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::PortError;
use crate::http;
use crate::traits::{CompletionOptions, LanguageModelPort};

const SERVICE: &str = "llm";

pub struct LlmClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, PortError> {
        Ok(Self {
            client: http::client(SERVICE, config.timeout_secs)?,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    /// Resolve the chat completions endpoint from the configured URL.
    fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

#[async_trait]
impl LanguageModelPort for LlmClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, PortError> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.temperature),
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
        });
        let endpoint = self.endpoint();

        let response = http::send_with_retry(SERVICE, self.max_retries, || {
            let req = self
                .client
                .post(&endpoint)
                .header("Content-Type", "application/json")
                .json(&body);
            match &self.api_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await?;

        let json = http::json_body(SERVICE, response).await?;
        parse_completion(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_completion(json: &Value) -> Result<String, PortError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| PortError::malformed(SERVICE, "missing choices[0].message.content"))
}
