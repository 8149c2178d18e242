//! Reasoning Loop
//!
//! Drives one session through
//! `GATHER -> MODEL_CALL -> {ANSWER_READY | TOOLS_REQUESTED -> TOOL_EXEC -> GATHER}`
//! until it reaches `DONE` or `FAILED`.
//!
//! Every message is durably appended before the next phase begins, so the
//! transient [`RunState`] can always be rebuilt from the tail of the session
//! log. A crashed run is recovered with [`Agent::resume`].

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, GatewayError, Result, ToolErrorKind};
use crate::executor::{ExecutorConfig, ToolExecutor};
use crate::message::{Content, Message, MessageLog, MessageMetadata};
use crate::provider::{GenerationOptions, ModelGateway, ModelResponse, TokenUsage};
use crate::retriever::{render_context, KnowledgeRetriever};
use crate::retry::{with_timeout, RetryPolicy};
use crate::session::{RunLease, SessionId, SessionManager, SessionStore};
use crate::tool::{Tool, ToolCall, ToolRegistry, ToolRegistryBuilder, ToolResult};

/// Per-run configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// Hard bound on GATHER -> MODEL_CALL -> TOOL_EXEC cycles per user turn
    pub max_iterations: usize,

    /// Trailing messages sent to the model
    pub history_window: usize,

    /// Snippets requested from the retriever (0 disables retrieval)
    pub retrieval_top_k: usize,

    /// Continue with history-only context when retrieval fails
    pub retrieval_fallback: bool,

    pub retrieval_timeout: Duration,

    /// Budget for a single model call
    pub model_timeout: Duration,

    pub retry: RetryPolicy,

    pub generation: GenerationOptions,

    /// Prepended to every model request; never persisted
    pub system_prompt: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            history_window: 32,
            retrieval_top_k: 4,
            retrieval_fallback: false,
            retrieval_timeout: Duration::from_secs(10),
            model_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            generation: GenerationOptions::default(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.into()),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
Use the available tools when they help; after receiving tool results, \
synthesize them into a concise, accurate answer.";

/// Loop states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Gather,
    ModelCall,
    AnswerReady,
    ToolsRequested,
    ToolExec,
    Done,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Gather => "GATHER",
            Self::ModelCall => "MODEL_CALL",
            Self::AnswerReady => "ANSWER_READY",
            Self::ToolsRequested => "TOOLS_REQUESTED",
            Self::ToolExec => "TOOL_EXEC",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Transient per-invocation record. Rebuilt from the log on every start.
#[derive(Debug)]
pub struct RunState {
    pub session_id: SessionId,
    pub phase: RunPhase,
    /// Model iterations spent on the current user turn
    pub iteration: usize,
    pub usage: TokenUsage,
    pub model_attempts: u32,
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    cancel: CancellationToken,
}

impl RunState {
    /// Rebuild from the tail of the session log
    pub fn reconstruct(session_id: SessionId, log: &MessageLog, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            phase: RunPhase::Gather,
            iteration: log.iterations_in_turn(),
            usage: TokenUsage::default(),
            model_attempts: 0,
            warnings: Vec::new(),
            last_error: None,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Every transition first checks for cancellation
    fn enter(&mut self, phase: RunPhase, events: &EventSink) -> Result<()> {
        if self.is_cancelled() {
            tracing::info!(session_id = %self.session_id, from = %self.phase, to = %phase, "Run cancelled at transition");
            return Err(AgentError::Cancelled);
        }
        tracing::debug!(session_id = %self.session_id, iteration = self.iteration, from = %self.phase, to = %phase, "Transition");
        self.phase = phase;
        events.emit(AgentEvent::PhaseChanged { phase });
        Ok(())
    }
}

/// Successful terminal result
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub answer: String,
    /// Model iterations spent on the user turn, including any before a resume
    pub iterations: usize,
    pub usage: TokenUsage,
    pub model_attempts: u32,
    pub warnings: Vec<String>,
}

/// Incremental run events
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted { session_id: SessionId, resumed: bool, iteration: usize },
    PhaseChanged { phase: RunPhase },
    MessageAppended { message: Message },
    Retrying { attempt: u32, delay_ms: u64, error: String },
    ContextDegraded { reason: String },
    ToolStarted { call: ToolCall },
    ToolFinished { result: ToolResult },
    Finished { outcome: RunOutcome },
    Failed { error: String, user_message: String, partial_answer: Option<String> },
}

/// Stream type for run streaming
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

#[derive(Clone, Default)]
struct EventSink(Option<mpsc::UnboundedSender<AgentEvent>>);

impl EventSink {
    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.0 {
            // Receiver gone means nobody is listening; the run carries on
            let _ = tx.send(event);
        }
    }
}

/// The main Agent struct
#[derive(Clone)]
pub struct Agent {
    gateway: Arc<dyn ModelGateway>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    executor: Arc<ToolExecutor>,
    sessions: SessionManager,
    config: RunConfig,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    /// Default run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run on a new user input
    pub async fn run(
        &self,
        session_id: &SessionId,
        input: impl Into<Content>,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.drive(session_id, Some(input.into()), config, cancel, &EventSink::default())
            .await
    }

    /// Continue an interrupted run from the durable log
    pub async fn resume(
        &self,
        session_id: &SessionId,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.drive(session_id, None, config, cancel, &EventSink::default())
            .await
    }

    /// Streaming variant of [`Agent::run`]. The stream ends with exactly one
    /// `Finished` or `Failed` event.
    pub fn run_stream(
        &self,
        session_id: SessionId,
        input: impl Into<Content>,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = self.clone();
        let input: Content = input.into();

        tokio::spawn(async move {
            let sink = EventSink(Some(tx.clone()));
            let terminal = match agent.drive(&session_id, Some(input), &config, cancel, &sink).await {
                Ok(outcome) => AgentEvent::Finished { outcome },
                Err(e) => AgentEvent::Failed {
                    error: e.to_string(),
                    user_message: e.user_message(),
                    partial_answer: e.partial_answer().map(str::to_string),
                },
            };
            let _ = tx.send(terminal);
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// One-shot question in a fresh session
    pub async fn ask(&self, question: &str) -> Result<String> {
        let session = self.sessions.create()?;
        let outcome = self
            .run(&session.id, question, &self.config, CancellationToken::new())
            .await?;
        Ok(outcome.answer)
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        input: Option<Content>,
        config: &RunConfig,
        cancel: CancellationToken,
        events: &EventSink,
    ) -> Result<RunOutcome> {
        // Exclusivity first: a busy session must not be touched
        let lease = self.sessions.begin_run(session_id)?;
        let mut log = lease.load()?.messages;

        let resumed = input.is_none();
        if let Some(input) = input {
            // A new turn supersedes a batch left open by an interrupted run
            let stale = log.pending_tool_calls();
            if !stale.is_empty() {
                tracing::warn!(
                    session_id = %session_id,
                    calls = stale.len(),
                    "Closing unanswered tool calls before new input"
                );
                for call in &stale {
                    let result = ToolResult::failure(call, ToolErrorKind::Cancelled);
                    append(&lease, &mut log, Message::tool(result), events)?;
                }
            }
            append(&lease, &mut log, Message::user(input), events)?;
        } else if log.latest_user_text().is_none() {
            return Err(AgentError::Other(format!(
                "session {session_id} has no user input to resume"
            )));
        }

        let mut state = RunState::reconstruct(session_id.clone(), &log, cancel);
        tracing::info!(session_id = %session_id, resumed, iteration = state.iteration, "Run started");
        events.emit(AgentEvent::RunStarted {
            session_id: session_id.clone(),
            resumed,
            iteration: state.iteration,
        });

        match self.cycle(&lease, &mut log, &mut state, config, events).await {
            Ok(outcome) => {
                state.phase = RunPhase::Done;
                tracing::info!(
                    session_id = %session_id,
                    iterations = outcome.iterations,
                    total_tokens = outcome.usage.total_tokens,
                    "Run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                state.phase = RunPhase::Failed;
                state.last_error = Some(e.to_string());
                tracing::warn!(session_id = %session_id, iteration = state.iteration, error = %e, "Run failed");
                Err(e)
            }
        }
    }

    async fn cycle(
        &self,
        lease: &RunLease,
        log: &mut MessageLog,
        state: &mut RunState,
        config: &RunConfig,
        events: &EventSink,
    ) -> Result<RunOutcome> {
        loop {
            // A crash after the final answer was stored: nothing left to do
            if let Some(answer) = log.completed_answer() {
                return Ok(outcome(state, answer.text()));
            }

            // A crash inside TOOL_EXEC: close the batch before the next model call
            let pending = log.pending_tool_calls();
            if !pending.is_empty() {
                self.execute_batch(lease, log, &pending, state, events).await?;
                continue;
            }

            if state.iteration >= config.max_iterations {
                tracing::warn!(session_id = %state.session_id, limit = config.max_iterations, "Iteration limit exceeded");
                return Err(AgentError::IterationLimitExceeded {
                    limit: config.max_iterations,
                    partial_answer: log.best_partial_answer(),
                });
            }

            state.enter(RunPhase::Gather, events)?;
            let context = self.gather(log, state, config, events).await?;

            state.enter(RunPhase::ModelCall, events)?;
            state.iteration += 1;
            let response = self.call_model(&context, state, config, events).await?;
            if let Some(usage) = &response.usage {
                state.usage.accumulate(usage);
            }
            let metadata = MessageMetadata {
                tokens: response.usage.map(|u| u.completion_tokens),
                model: response.model.clone(),
                ..MessageMetadata::default()
            };

            if !response.requests_tools() {
                state.enter(RunPhase::AnswerReady, events)?;
                let answer = response.text.unwrap_or_default();
                append(lease, log, Message::assistant(answer.clone()).with_metadata(metadata), events)?;
                return Ok(outcome(state, answer));
            }

            state.enter(RunPhase::ToolsRequested, events)?;
            let calls = normalize_calls(response.tool_calls, state);
            tracing::debug!(
                session_id = %state.session_id,
                iteration = state.iteration,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Model requested tools"
            );
            let turn = Message::assistant_with_tools(response.text.unwrap_or_default(), calls.clone())
                .with_metadata(metadata);
            append(lease, log, turn, events)?;

            self.execute_batch(lease, log, &calls, state, events).await?;
        }
    }

    async fn gather(
        &self,
        log: &MessageLog,
        state: &mut RunState,
        config: &RunConfig,
        events: &EventSink,
    ) -> Result<Vec<Message>> {
        let mut context = Vec::new();
        if let Some(prompt) = &config.system_prompt {
            context.push(Message::system(prompt.as_str()));
        }

        if let Some(retriever) = self.retriever.as_ref().filter(|_| config.retrieval_top_k > 0) {
            let query = log.latest_user_text().unwrap_or_default();
            let failure = match tokio::time::timeout(
                config.retrieval_timeout,
                retriever.query(&query, config.retrieval_top_k),
            )
            .await
            {
                Ok(Ok(snippets)) => {
                    if let Some(block) = render_context(&snippets) {
                        context.push(Message::system(block));
                    }
                    None
                }
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(_) => Some(format!("retrieval timed out after {:?}", config.retrieval_timeout)),
            };

            if let Some(reason) = failure {
                if !config.retrieval_fallback {
                    return Err(AgentError::ContextAssembly(reason));
                }
                tracing::warn!(session_id = %state.session_id, reason = %reason, "Retrieval failed, continuing with history only");
                state.warnings.push(format!("context degraded: {reason}"));
                events.emit(AgentEvent::ContextDegraded { reason });
            }
        }

        context.extend_from_slice(log.tail(config.history_window));
        Ok(context)
    }

    async fn call_model(
        &self,
        context: &[Message],
        state: &mut RunState,
        config: &RunConfig,
        events: &EventSink,
    ) -> Result<ModelResponse> {
        let schemas = self.executor.registry().schemas();
        let gateway = self.gateway.as_ref();
        let schemas = schemas.as_slice();
        let options = &config.generation;
        let timeout = config.model_timeout;
        let mut attempts = 0u32;

        let result = config
            .retry
            .execute(
                &state.cancel,
                |attempt, delay, err| {
                    events.emit(AgentEvent::Retrying {
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error: err.to_string(),
                    });
                },
                || {
                    attempts += 1;
                    async move {
                        let response = with_timeout(timeout, gateway.send(context, schemas, options)).await?;
                        if response.text.is_none() && response.tool_calls.is_empty() {
                            return Err(GatewayError::MalformedResponse(
                                "response has neither text nor tool calls".into(),
                            ));
                        }
                        Ok(response)
                    }
                },
            )
            .await;

        state.model_attempts += attempts;
        result
    }

    /// TOOL_EXEC for one batch. Results are appended only after the whole
    /// batch has completed.
    async fn execute_batch(
        &self,
        lease: &RunLease,
        log: &mut MessageLog,
        calls: &[ToolCall],
        state: &mut RunState,
        events: &EventSink,
    ) -> Result<()> {
        if let Err(e) = state.enter(RunPhase::ToolExec, events) {
            // Close the batch so the log holds no unanswered call
            for call in calls {
                let result = ToolResult::failure(call, ToolErrorKind::Cancelled);
                append(lease, log, Message::tool(result), events)?;
            }
            return Err(e);
        }

        for call in calls {
            events.emit(AgentEvent::ToolStarted { call: call.clone() });
        }
        let results = self.executor.execute(calls).await;

        for result in results {
            events.emit(AgentEvent::ToolFinished { result: result.clone() });
            append(lease, log, Message::tool(result), events)?;
        }
        Ok(())
    }
}

/// Durable append, then mirror locally
fn append(lease: &RunLease, log: &mut MessageLog, message: Message, events: &EventSink) -> Result<()> {
    let stored = lease.append(message)?;
    log.push(stored.clone());
    events.emit(AgentEvent::MessageAppended { message: stored });
    Ok(())
}

/// Call ids must be present and unique within the iteration
fn normalize_calls(calls: Vec<ToolCall>, state: &mut RunState) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                let fresh = uuid::Uuid::new_v4().to_string();
                if !call.id.is_empty() {
                    let warning = format!("duplicate tool call id `{}` reassigned", call.id);
                    tracing::warn!(session_id = %state.session_id, %warning);
                    state.warnings.push(warning);
                }
                seen.insert(fresh.clone());
                call.id = fresh;
            }
            call
        })
        .collect()
}

fn outcome(state: &RunState, answer: String) -> RunOutcome {
    RunOutcome {
        session_id: state.session_id.clone(),
        answer,
        iterations: state.iteration,
        usage: state.usage,
        model_attempts: state.model_attempts,
        warnings: state.warnings.clone(),
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    gateway: Option<Arc<dyn ModelGateway>>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    tools: ToolRegistryBuilder,
    registry: Option<ToolRegistry>,
    sessions: Option<SessionManager>,
    config: RunConfig,
    executor_config: ExecutorConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            gateway: None,
            retriever: None,
            tools: ToolRegistry::builder(),
            registry: None,
            sessions: None,
            config: RunConfig::default(),
            executor_config: ExecutorConfig::default(),
        }
    }

    #[must_use]
    pub fn gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    #[must_use]
    pub fn retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    #[must_use]
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools = self.tools.register(tool);
        self
    }

    /// Use a prebuilt registry instead of individual `tool` calls
    #[must_use]
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(SessionManager::new(store));
        self
    }

    #[must_use]
    pub fn sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let gateway = self
            .gateway
            .ok_or_else(|| AgentError::Config("Model gateway is required".into()))?;

        let individual = self.tools.build()?;
        let registry = match self.registry {
            Some(_) if !individual.is_empty() => {
                return Err(AgentError::Config(
                    "use either a prebuilt registry or individual tools, not both".into(),
                ));
            }
            Some(registry) => registry,
            None => individual,
        };

        Ok(Agent {
            gateway,
            retriever: self.retriever,
            executor: Arc::new(ToolExecutor::new(Arc::new(registry), &self.executor_config)),
            sessions: self.sessions.unwrap_or_else(SessionManager::in_memory),
            config: self.config,
        })
    }
}
