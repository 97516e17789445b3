//! Shared primitives for provider-agnostic LM clients.
//!
//! The harness talks to language models exclusively through the [`LmClient`]
//! trait: one method for the common system-preamble/user-prompt pair and one
//! for a full message list. Implementations must accumulate streamed tokens
//! into a single text result before returning — partial tokens are never
//! exposed to the rest of the system.
//!
//! Two supporting pieces live here as well: [`CompletionConfig`], the
//! per-call sampling options merged over session defaults, and
//! [`TracedClient`], a decorator that writes a trace segment (separator,
//! `<<PRE-PROMPT>>`, `<<PROMPT>>`, `<<RESPONSE>>`) around every call of an
//! inner client.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use promptloom::clients::openai::OpenAiCompatClient;
//! use promptloom::lm_client::{CompletionConfig, LmClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAiCompatClient::new(&key, "gpt-4.1-mini");
//!
//!     let reply = client
//!         .run(
//!             Some("You are a terse assistant."),
//!             "Name one prime number.",
//!             &CompletionConfig::deterministic(),
//!         )
//!         .await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::promptloom::error::HarnessError;
use crate::promptloom::trace::Trace;

/// Represents the possible roles for a message.
///
/// `Ipython` is accepted on input for compatibility with tool-execution
/// transcripts but is rewritten to the `function` wire role before
/// transmission, because some providers reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// A tool/function execution result.
    Function,
    /// Alias role produced by some tool-execution environments; rewritten to
    /// `function` on the wire.
    Ipython,
}

impl Role {
    /// The role name as it appears in this crate's own surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::Ipython => "ipython",
        }
    }

    /// The role name transmitted to providers. `Ipython` maps to `function`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Role::Ipython => "function",
            other => other.as_str(),
        }
    }
}

/// A single chat message exchanged with an LM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmMessage {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
}

impl LmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        LmMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        LmMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        LmMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call completion options, merged over session defaults.
///
/// Every field is optional; [`CompletionConfig::merged_over`] resolves the
/// effective value field by field, the call-site value winning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Model identifier override (e.g. `"gpt-4.1-mini"`).
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Sampling seed. Sessions default this to a stable value so that runs
    /// against a pinned model are reproducible.
    pub seed: Option<u64>,
    /// Whether the provider should stream the response. Streamed chunks are
    /// always concatenated before [`LmClient::run`] returns.
    pub stream: Option<bool>,
}

impl CompletionConfig {
    /// The deterministic session defaults: greedy sampling, a fixed seed,
    /// and a streaming transport.
    pub fn deterministic() -> Self {
        CompletionConfig {
            model: None,
            temperature: Some(0.0),
            top_p: Some(1.0),
            max_tokens: Some(2048),
            seed: Some(42),
            stream: Some(true),
        }
    }

    /// Merge `self` over `defaults`, field by field.
    pub fn merged_over(&self, defaults: &CompletionConfig) -> CompletionConfig {
        CompletionConfig {
            model: self.model.clone().or_else(|| defaults.model.clone()),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            seed: self.seed.or(defaults.seed),
            stream: self.stream.or(defaults.stream),
        }
    }
}

/// Trait defining the interface to interact with LM providers.
///
/// Implementations **must** be thread-safe (`Send + Sync`): the bootstrap
/// `language_model` callable invokes them from the script engine's blocking
/// execution thread.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// Send a system preamble (optional) plus a user prompt and return the
    /// assistant's full text. Streamed chunks are concatenated internally.
    async fn run(
        &self,
        pre_prompt: Option<&str>,
        prompt: &str,
        config: &CompletionConfig,
    ) -> Result<String, HarnessError>;

    /// Send a full message list and return it with the assistant's reply
    /// appended.
    async fn run_messages(
        &self,
        messages: &[LmMessage],
        config: &CompletionConfig,
    ) -> Result<Vec<LmMessage>, HarnessError>;
}

/// Decorator writing a trace segment around every call of an inner client.
///
/// The segment format is fixed: a separator line, `<<PRE-PROMPT>>` and its
/// text, `<<PROMPT>>` and its text, then `<<RESPONSE>>` and the final
/// concatenated reply. For [`LmClient::run_messages`] each input message is
/// traced under a `<<role>>` marker instead.
pub struct TracedClient {
    inner: Arc<dyn LmClient>,
    trace: Trace,
}

impl TracedClient {
    pub fn new(inner: Arc<dyn LmClient>, trace: Trace) -> Self {
        TracedClient { inner, trace }
    }
}

#[async_trait]
impl LmClient for TracedClient {
    async fn run(
        &self,
        pre_prompt: Option<&str>,
        prompt: &str,
        config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        self.trace.write_separator();
        self.trace.write("<<PRE-PROMPT>>");
        self.trace.write(pre_prompt.unwrap_or(""));
        self.trace.write("<<PROMPT>>");
        self.trace.write(prompt);

        let response = self.inner.run(pre_prompt, prompt, config).await?;

        self.trace.write("<<RESPONSE>>");
        self.trace.write(&response);
        Ok(response)
    }

    async fn run_messages(
        &self,
        messages: &[LmMessage],
        config: &CompletionConfig,
    ) -> Result<Vec<LmMessage>, HarnessError> {
        self.trace.write_separator();
        for message in messages {
            self.trace.write(&format!("<<{}>>", message.role.as_str()));
            self.trace.write(&message.content);
        }

        let result = self.inner.run_messages(messages, config).await?;

        if let Some(reply) = result.last() {
            self.trace.write(&format!("<<{}>>", reply.role.as_str()));
            self.trace.write(&reply.content);
        }
        Ok(result)
    }
}
