//! # agentkit-core
//!
//! Provider-agnostic reasoning loop with concurrent tool execution and
//! resumable, append-only sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Agent                                │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────────────────┐   │
//! │  │  Reasoning  │──│     Tool     │──│     ToolRegistry       │   │
//! │  │    Loop     │  │   Executor   │  │                        │   │
//! │  └─────────────┘  └──────────────┘  └────────────────────────┘   │
//! │        │                                                         │
//! │        ├──────────── ModelGateway (Strategy)                     │
//! │        ├──────────── KnowledgeRetriever (optional)               │
//! │        └──────────── SessionManager ── SessionStore              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ModelGateway` trait lets any backend drive the loop, and a
//! `SessionStore` decides where the append-only message log lives. Every
//! message is stored before the loop moves on, so an interrupted run can be
//! resumed from the log alone.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod memory;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod retriever;
pub mod retry;
pub mod session;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{AgentError, GatewayError, Result, ToolErrorKind};
pub use executor::{ExecutorConfig, ToolExecutor};
pub use memory::{InMemoryMemoryStore, MemoryStore, UserMemories, UserMemory};
pub use message::{Content, Message, MessageLog, Role};
pub use provider::{GenerationOptions, ModelGateway, ModelResponse, TokenUsage};
pub use reasoning::{Agent, AgentBuilder, AgentEvent, EventStream, RunConfig, RunOutcome, RunPhase};
pub use retriever::{KnowledgeRetriever, Snippet};
pub use retry::RetryPolicy;
pub use session::{RunLease, Session, SessionId, SessionManager, SessionMetadata, SessionStore};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};

pub use tokio_util::sync::CancellationToken;
