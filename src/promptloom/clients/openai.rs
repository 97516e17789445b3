//! OpenAI-compatible Chat Completions client.
//!
//! Works against any endpoint speaking the Chat Completions wire format
//! (OpenAI, NIM/NGC deployments, vLLM, llama.cpp servers, …). The request
//! body is assembled with `serde_json` directly so that the full
//! per-call [`CompletionConfig`] — `model`, `temperature`, `top_p`,
//! `max_tokens`, `seed`, `stream` — survives the trip. Streaming responses
//! (SSE) are concatenated into one string before returning, as the
//! [`LmClient`] contract requires.
//!
//! # Example
//!
//! ```rust,no_run
//! use promptloom::clients::openai::OpenAiCompatClient;
//! use promptloom::lm_client::{CompletionConfig, LmClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAiCompatClient::new_with_base_url(
//!         &key,
//!         "llama-3.1-70b-instruct",
//!         "http://localhost:8000/v1",
//!     );
//!     let reply = client
//!         .run(None, "Say hello.", &CompletionConfig::deterministic())
//!         .await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::promptloom::clients::common::get_shared_http_client;
use crate::promptloom::error::HarnessError;
use crate::promptloom::lm_client::{CompletionConfig, LmClient, LmMessage, Role};

/// Client wrapper for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    /// Construct a client against the official OpenAI endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Construct a client targeting a custom OpenAI-compatible base URL.
    /// `base_url` should not have a trailing slash (e.g. `"https://api.openai.com/v1"`).
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        OpenAiCompatClient {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// The model identifier sent with each request (unless overridden per call).
    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Serialize messages to the wire format, rewriting `ipython` to
    /// `function` because some providers reject the former.
    fn wire_messages(messages: &[LmMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.wire_name(),
                    "content": msg.content,
                })
            })
            .collect()
    }

    async fn invoke(
        &self,
        wire_messages: Vec<serde_json::Value>,
        config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        let model = config.model.as_deref().unwrap_or(&self.model);
        let stream = config.stream.unwrap_or(false);

        let mut body = serde_json::json!({
            "model": model,
            "messages": wire_messages,
            "stream": stream,
        });
        if let Some(temperature) = config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = config.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(max_tokens) = config.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(seed) = config.seed {
            body["seed"] = serde_json::json!(seed);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| HarnessError::LmUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAiCompatClient::invoke(...): HTTP {} from {}: {}",
                    status,
                    url,
                    text
                );
            }
            return Err(HarnessError::LmUnavailable(format!(
                "HTTP {} — {}",
                status, text
            )));
        }

        if stream {
            self.collect_sse(response).await
        } else {
            let parsed: serde_json::Value = response
                .json()
                .await
                .map_err(|err| HarnessError::LmUnavailable(err.to_string()))?;
            parsed["choices"][0]["message"]["content"]
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    HarnessError::LmUnavailable("no assistant content in response".to_string())
                })
        }
    }

    /// Drain a server-sent-event response, concatenating the content deltas
    /// of every chunk into a single string.
    async fn collect_sse(&self, response: reqwest::Response) -> Result<String, HarnessError> {
        let mut accumulated = String::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|err| HarnessError::LmUnavailable(err.to_string()))?;
            buffer.extend_from_slice(&chunk);

            // SSE events are newline-delimited; process every complete line.
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(event) = serde_json::from_str::<serde_json::Value>(data) {
                        if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                            accumulated.push_str(delta);
                        }
                    }
                }
            }
        }

        Ok(accumulated)
    }
}

#[async_trait]
impl LmClient for OpenAiCompatClient {
    async fn run(
        &self,
        pre_prompt: Option<&str>,
        prompt: &str,
        config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(pre) = pre_prompt {
            messages.push(LmMessage::system(pre));
        }
        messages.push(LmMessage::user(prompt));

        self.invoke(Self::wire_messages(&messages), config).await
    }

    async fn run_messages(
        &self,
        messages: &[LmMessage],
        config: &CompletionConfig,
    ) -> Result<Vec<LmMessage>, HarnessError> {
        let reply = self.invoke(Self::wire_messages(messages), config).await?;

        let mut result = messages.to_vec();
        result.push(LmMessage {
            role: Role::Assistant,
            content: reply,
        });
        Ok(result)
    }
}
