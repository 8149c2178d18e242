//! Deterministic collaborators for tests.
//!
//! Enabled under `cfg(test)` and with the `testing` feature for downstream
//! crates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{AgentError, GatewayError, Result};
use crate::message::Message;
use crate::provider::{GenerationOptions, ModelGateway, ModelResponse};
use crate::retriever::{KnowledgeRetriever, Snippet};
use crate::session::{
    MemorySessionStore, Session, SessionId, SessionMetadata, SessionStore,
};
use crate::tool::{ParamType, ParameterSchema, Tool, ToolCall, ToolSchema};

/// What a [`ScriptedGateway`] saw on one call
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

/// Gateway that replays queued responses in order.
///
/// Once the queue is empty it keeps returning the `repeat` response, or a
/// malformed-response error if none is set.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<std::result::Result<ModelResponse, GatewayError>>>,
    repeat: Option<ModelResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedGateway {
    pub fn new(script: Vec<std::result::Result<ModelResponse, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Queue of successful responses
    pub fn replies(responses: Vec<ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// Returns the same response forever
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::default()
        }
    }

    /// Sleep before answering
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn send(
        &self,
        messages: &[Message],
        tool_schemas: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> std::result::Result<ModelResponse, GatewayError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                messages: messages.to_vec(),
                tool_names: tool_schemas.iter().map(|s| s.name.clone()).collect(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (next, &self.repeat) {
            (Some(step), _) => step,
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(GatewayError::MalformedResponse("script exhausted".into())),
        }
    }
}

/// Retriever returning a fixed snippet list
pub struct StaticRetriever {
    snippets: Vec<Snippet>,
    queries: Mutex<Vec<String>>,
}

impl StaticRetriever {
    pub fn new(snippets: Vec<Snippet>) -> Self {
        Self {
            snippets,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticRetriever {
    async fn query(&self, text: &str, top_k: usize) -> anyhow::Result<Vec<Snippet>> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        Ok(self.snippets.iter().take(top_k).cloned().collect())
    }
}

/// Retriever whose backend is unreachable
pub struct FailingRetriever;

#[async_trait]
impl KnowledgeRetriever for FailingRetriever {
    async fn query(&self, _text: &str, _top_k: usize) -> anyhow::Result<Vec<Snippet>> {
        anyhow::bail!("index unreachable")
    }
}

/// `echo`: returns its arguments
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("echo", "Echo the input back")
            .param(ParameterSchema::required("text", ParamType::String, "Text to echo"))
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        Ok(arguments.clone())
    }
}

/// `fail`: always errors
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("fail", "Always fails")
    }

    async fn invoke(&self, _arguments: &Value) -> anyhow::Result<Value> {
        anyhow::bail!("deliberate failure")
    }
}

/// `slow`: sleeps, tracking peak concurrency and completed invocations
pub struct SlowTool {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    pub fn completed(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.completed)
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("slow", "Sleeps before answering")
    }

    async fn invoke(&self, _arguments: &Value) -> anyhow::Result<Value> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "slept_ms": u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX) }))
    }
}

/// Tool call helper
pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

/// Memory store that starts failing appends after a number of successes,
/// standing in for a process crash mid-run.
pub struct CrashingStore {
    inner: MemorySessionStore,
    appends_left: AtomicUsize,
}

impl CrashingStore {
    pub fn new(appends_before_crash: usize) -> Self {
        Self {
            inner: MemorySessionStore::new(),
            appends_left: AtomicUsize::new(appends_before_crash),
        }
    }

    /// Stop failing
    pub fn recover(&self) {
        self.appends_left.store(usize::MAX, Ordering::SeqCst);
    }
}

impl SessionStore for CrashingStore {
    fn create(&self, session: &Session) -> Result<()> {
        self.inner.create(session)
    }

    fn append(&self, id: &SessionId, message: &Message) -> Result<u64> {
        let left = self.appends_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(AgentError::Storage("simulated crash".into()));
        }
        self.appends_left.store(left - 1, Ordering::SeqCst);
        self.inner.append(id, message)
    }

    fn read(&self, id: &SessionId) -> Result<Option<Session>> {
        self.inner.read(id)
    }

    fn update_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> Result<()> {
        self.inner.update_metadata(id, metadata)
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        self.inner.delete(id)
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionId>> {
        self.inner.list(limit)
    }

    fn lease(&self, id: &SessionId) -> Result<()> {
        self.inner.lease(id)
    }

    fn release(&self, id: &SessionId) -> Result<()> {
        self.inner.release(id)
    }
}
