//! Model Gateway
//!
//! Common interface over language-model providers. The reasoning loop only
//! ever talks to a provider through [`ModelGateway::send`], so any backend can
//! be substituted without touching the loop.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentkit_core::provider::{GenerationOptions, ModelGateway};
//!
//! let response = gateway.send(&messages, &registry.schemas(), &options).await?;
//! if response.requests_tools() {
//!     // hand response.tool_calls to the executor
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::message::Message;
use crate::tool::{ToolCall, ToolSchema};

/// Configuration for model generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "llama3.2", "gpt-4o", "claude-sonnet")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

const fn default_temperature() -> f32 {
    0.7
}

const fn default_max_tokens() -> u32 {
    2048
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stop_sequences: Vec::new(),
        }
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// What the model answered: final text, tool requests, or both
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text (may accompany tool calls)
    #[serde(default)]
    pub text: Option<String>,

    /// Requested tool invocations; empty means `text` is the final answer
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Token usage statistics (if available)
    #[serde(default)]
    pub usage: Option<TokenUsage>,

    /// Model that generated this response
    #[serde(default)]
    pub model: Option<String>,
}

impl ModelResponse {
    /// A final answer
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A request to run tools
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Strategy trait for model providers
///
/// Implement this trait to add support for new model backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send the conversation plus the available tool schemas
    async fn send(
        &self,
        messages: &[Message],
        tool_schemas: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ModelResponse, GatewayError>;
}
