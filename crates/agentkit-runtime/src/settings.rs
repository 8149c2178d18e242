//! Environment-driven configuration
//!
//! Reads `AGENTKIT_*` variables (after loading `.env` if present) on top of
//! the library defaults. A variable that is set but unparseable is an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agentkit_core::builtin::{CalculatorTool, DateTimeTool};
use agentkit_core::error::{AgentError, Result};
use agentkit_core::executor::ExecutorConfig;
use agentkit_core::reasoning::{AgentBuilder, RunConfig};
use agentkit_core::session::SessionManager;

use crate::store::JsonlSessionStore;

/// Resolved runtime settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    pub run: RunConfig,
    pub executor: ExecutorConfig,
    /// Directory for the file-backed store; in-memory when unset
    pub session_dir: Option<PathBuf>,
}

impl Settings {
    /// Load `.env`, then read the process environment
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        let run = &mut settings.run;

        if let Some(v) = parse(&lookup, "AGENTKIT_MAX_ITERATIONS")? {
            run.max_iterations = v;
        }
        if let Some(v) = parse(&lookup, "AGENTKIT_HISTORY_WINDOW")? {
            run.history_window = v;
        }
        if let Some(v) = parse(&lookup, "AGENTKIT_RETRIEVAL_TOP_K")? {
            run.retrieval_top_k = v;
        }
        if let Some(v) = parse(&lookup, "AGENTKIT_RETRIEVAL_FALLBACK")? {
            run.retrieval_fallback = v;
        }
        if let Some(ms) = parse(&lookup, "AGENTKIT_RETRIEVAL_TIMEOUT_MS")? {
            run.retrieval_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "AGENTKIT_MODEL_TIMEOUT_MS")? {
            run.model_timeout = Duration::from_millis(ms);
        }
        // Counts the first call, so 1 means no retries
        if let Some(v) = parse(&lookup, "AGENTKIT_MODEL_ATTEMPTS")? {
            if v == 0 {
                return Err(invalid("AGENTKIT_MODEL_ATTEMPTS", "0", "must be at least 1"));
            }
            run.retry.max_attempts = v;
        }
        if let Some(model) = lookup("AGENTKIT_MODEL").filter(|m| !m.trim().is_empty()) {
            run.generation.model = model;
        }
        if let Some(prompt) = lookup("AGENTKIT_SYSTEM_PROMPT") {
            run.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
        }

        if let Some(v) = parse(&lookup, "AGENTKIT_TOOL_CONCURRENCY")? {
            if v == 0 {
                return Err(invalid("AGENTKIT_TOOL_CONCURRENCY", "0", "must be at least 1"));
            }
            settings.executor.max_concurrency = v;
        }
        if let Some(ms) = parse(&lookup, "AGENTKIT_TOOL_TIMEOUT_MS")? {
            settings.executor.call_timeout = Duration::from_millis(ms);
        }

        settings.session_dir = lookup("AGENTKIT_SESSION_DIR")
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        Ok(settings)
    }

    /// Session manager for the configured backend
    pub fn session_manager(&self) -> Result<SessionManager> {
        match &self.session_dir {
            Some(dir) => {
                tracing::info!(dir = %dir.display(), "Using file-backed session store");
                Ok(SessionManager::new(Arc::new(JsonlSessionStore::open(dir)?)))
            }
            None => Ok(SessionManager::in_memory()),
        }
    }

    /// Builder preloaded with these settings and the built-in tools.
    /// The caller still supplies the gateway.
    pub fn agent_builder(&self) -> Result<AgentBuilder> {
        Ok(AgentBuilder::new()
            .config(self.run.clone())
            .executor_config(self.executor.clone())
            .sessions(self.session_manager()?)
            .tool(CalculatorTool)
            .tool(DateTimeTool))
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &str, raw: &str, reason: &str) -> AgentError {
    AgentError::Config(format!("{key}={raw:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.run.max_iterations, 8);
        assert!(settings.session_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("AGENTKIT_MAX_ITERATIONS", "3"),
            ("AGENTKIT_TOOL_CONCURRENCY", "2"),
            ("AGENTKIT_TOOL_TIMEOUT_MS", "1500"),
            ("AGENTKIT_RETRIEVAL_FALLBACK", "true"),
            ("AGENTKIT_MODEL", "qwen2.5"),
            ("AGENTKIT_SYSTEM_PROMPT", ""),
            ("AGENTKIT_SESSION_DIR", "/var/lib/agentkit"),
        ]))
        .unwrap();

        assert_eq!(settings.run.max_iterations, 3);
        assert_eq!(settings.executor.max_concurrency, 2);
        assert_eq!(settings.executor.call_timeout, Duration::from_millis(1500));
        assert!(settings.run.retrieval_fallback);
        assert_eq!(settings.run.generation.model, "qwen2.5");
        assert!(settings.run.system_prompt.is_none());
        assert_eq!(settings.session_dir, Some(PathBuf::from("/var/lib/agentkit")));
    }

    #[test]
    fn test_bad_value_names_the_variable() {
        let err = Settings::from_lookup(lookup(&[("AGENTKIT_MODEL_TIMEOUT_MS", "soon")])).unwrap_err();
        match err {
            AgentError::Config(msg) => assert!(msg.contains("AGENTKIT_MODEL_TIMEOUT_MS")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(Settings::from_lookup(lookup(&[("AGENTKIT_TOOL_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn test_model_attempts_include_the_first_call() {
        let settings = Settings::from_lookup(lookup(&[("AGENTKIT_MODEL_ATTEMPTS", "1")])).unwrap();
        assert_eq!(settings.run.retry.max_attempts, 1);

        let err = Settings::from_lookup(lookup(&[("AGENTKIT_MODEL_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("at least 1")));
    }

    #[test]
    fn test_agent_builder_registers_builtins() {
        let builder = Settings::default().agent_builder().unwrap();
        let agent = builder
            .gateway(Arc::new(agentkit_core::testing::ScriptedGateway::default()))
            .build()
            .unwrap();
        assert_eq!(agent.tools().names(), vec!["calculator", "datetime"]);
        assert_eq!(agent.config().max_iterations, 8);
    }
}
