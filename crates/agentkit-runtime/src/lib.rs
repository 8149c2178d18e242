//! # agentkit-runtime
//!
//! Host-side adapters for the agentkit reasoning loop.
//!
//! - **store**: durable JSON Lines session store with cross-process leases
//! - **settings**: `AGENTKIT_*` environment configuration
//! - **telemetry**: tracing subscriber setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentkit_runtime::{init_tracing, Settings};
//!
//! init_tracing("info");
//! let settings = Settings::from_env()?;
//! let agent = settings
//!     .agent_builder()?
//!     .gateway(Arc::new(my_gateway))
//!     .build()?;
//! let answer = agent.ask("What is 2+2?").await?;
//! ```

pub mod settings;
pub mod store;
pub mod telemetry;

pub use settings::Settings;
pub use store::JsonlSessionStore;
pub use telemetry::init_tracing;

// Re-export core types for convenience
pub use agentkit_core::{
    Agent, AgentError, CancellationToken, Message, ModelGateway, Result, Role, RunConfig, Session,
    SessionId, Tool, ToolRegistry,
};
