//! Conversation Messages
//!
//! Messages are immutable once appended. [`MessageLog`] is the in-memory view
//! of a session's append-only history and answers the questions the loop asks
//! about its tail when a run starts or resumes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (model) response
    Assistant,
    /// Tool result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Message body: plain text or a structured payload.
///
/// Stored untagged, so a structured JSON string is indistinguishable from
/// text on the wire. Constructors fold it into [`Content::Text`] up front.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// Structured body; a bare JSON string becomes text
    pub fn structured(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Self::Text(text),
            other => Self::Structured(other),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::Structured(value) => Self::structured(value),
            text @ Self::Text(_) => text,
        }
    }

    /// Text rendering of the body
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Structured(value) => value.is_null(),
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Self::structured(value)
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the session log, assigned on append
    #[serde(default)]
    pub seq: u64,

    /// Message role
    pub role: Role,

    pub content: Content,

    /// Tool invocations requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Result carried by a tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Additional message metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Token count (if known)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,

    /// Model that generated this (for assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom key-value pairs
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into().normalized(),
            tool_calls: Vec::new(),
            tool_result: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that requests tool invocations
    pub fn assistant_with_tools(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a tool result message
    pub fn tool(result: ToolResult) -> Self {
        let mut msg = Self::new(Role::Tool, result.render());
        msg.tool_result = Some(result);
        msg
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Assistant turn with no tool requests
    pub fn is_final_answer(&self) -> bool {
        self.role == Role::Assistant && self.tool_calls.is_empty()
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        // ~4 characters per token, +4 for role overhead
        u32::try_from(self.text().len() / 4).unwrap_or(u32::MAX).saturating_add(4)
    }
}

/// Append-only, totally ordered message history of one session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted messages, re-deriving `seq` from order
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut log = Self::new();
        for message in messages {
            log.push(message);
        }
        log
    }

    /// Append a message, stamping its sequence number
    pub fn push(&mut self, mut message: Message) -> u64 {
        let seq = self.messages.len() as u64;
        message.seq = seq;
        self.messages.push(message);
        seq
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Estimate total tokens in conversation
    pub fn estimate_tokens(&self) -> u32 {
        self.messages.iter().map(Message::estimate_tokens).sum()
    }

    /// Trailing window of at most `n` messages.
    ///
    /// The window never opens on a tool message whose requesting assistant
    /// turn was cut off.
    pub fn tail(&self, n: usize) -> &[Message] {
        let mut start = self.messages.len().saturating_sub(n);
        while start < self.messages.len() && self.messages[start].role == Role::Tool {
            start += 1;
        }
        &self.messages[start..]
    }

    fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Text of the most recent user message
    pub fn latest_user_text(&self) -> Option<String> {
        self.last_user_index().map(|i| self.messages[i].text())
    }

    /// Messages after the latest user message
    pub fn current_turn(&self) -> &[Message] {
        match self.last_user_index() {
            Some(i) => &self.messages[i + 1..],
            None => &self.messages,
        }
    }

    /// Model iterations already spent answering the latest user message
    pub fn iterations_in_turn(&self) -> usize {
        self.current_turn()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    /// The final answer, if the log already ends with one for the current turn
    pub fn completed_answer(&self) -> Option<&Message> {
        let last_user = self.last_user_index()?;
        self.messages
            .last()
            .filter(|m| m.seq as usize > last_user && m.is_final_answer())
    }

    /// Tool calls of the trailing assistant turn that have no result yet.
    /// Calls made before the latest user message are never pending.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let turn = self.current_turn();
        let Some(idx) = turn.iter().rposition(|m| m.role == Role::Assistant) else {
            return Vec::new();
        };
        let answered: HashSet<&str> = turn[idx + 1..]
            .iter()
            .filter_map(|m| m.tool_result.as_ref())
            .map(|r| r.call_id.as_str())
            .collect();
        turn[idx]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .cloned()
            .collect()
    }

    /// Latest non-empty assistant text in the current turn
    pub fn best_partial_answer(&self) -> Option<String> {
        self.current_turn()
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(Message::text)
            .next()
    }
}
