//! End-to-end loop scenarios against deterministic stubs

use std::sync::Arc;
use std::time::Duration;

use agentkit_core::builtin::CalculatorTool;
use agentkit_core::error::{AgentError, ToolErrorKind};
use agentkit_core::memory::{InMemoryMemoryStore, UserMemories};
use agentkit_core::message::Role;
use agentkit_core::provider::{ModelGateway, ModelResponse, TokenUsage};
use agentkit_core::reasoning::{Agent, RunConfig};
use agentkit_core::retriever::KnowledgeRetriever;
use agentkit_core::retry::RetryPolicy;
use agentkit_core::tool::{ToolRegistry, ToolRegistryBuilder};
use agentkit_core::testing::{call, EchoTool, FailingRetriever, ScriptedGateway};
use agentkit_core::CancellationToken;
use serde_json::json;

fn config() -> RunConfig {
    RunConfig {
        retry: RetryPolicy::none(),
        system_prompt: None,
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn scenario_a_direct_answer() {
    let gateway = Arc::new(ScriptedGateway::replies(vec![ModelResponse::text("4")]));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();

    let outcome = agent
        .run(&session.id, "What is 2+2?", &config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.answer, "4");
    assert_eq!(outcome.iterations, 1);
    assert!(gateway.requests()[0].tool_names.is_empty());

    let log = agent.sessions().load(&session.id).unwrap().messages;
    assert_eq!(log.len(), 2);
    assert_eq!(log.messages()[1].role, Role::Assistant);
    assert_eq!(log.messages()[1].text(), "4");
}

#[tokio::test]
async fn scenario_b_calculator_round_trip() {
    let gateway = Arc::new(ScriptedGateway::replies(vec![
        ModelResponse::tool_calls(vec![call("calc-1", "calculator", json!({"expr": "2+2"}))]).with_usage(
            TokenUsage { prompt_tokens: 20, completion_tokens: 5, total_tokens: 25 },
        ),
        ModelResponse::text("4").with_usage(TokenUsage {
            prompt_tokens: 30,
            completion_tokens: 1,
            total_tokens: 31,
        }),
    ]));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .tool(CalculatorTool)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();

    let outcome = agent
        .run(&session.id, "What is 2+2? Use the calculator.", &config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.answer, "4");
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.usage.total_tokens, 56);

    let log = agent.sessions().load(&session.id).unwrap().messages;
    let result = log.messages()[2].tool_result.as_ref().unwrap();
    assert_eq!(result.call_id, "calc-1");
    assert_eq!(result.output, Some(json!({"value": 4})));

    // The second model call saw the tool result
    let second = &gateway.requests()[1].messages;
    assert!(second.iter().any(|m| m.tool_result.is_some()));
}

#[tokio::test]
async fn scenario_c_iteration_limit() {
    let gateway = Arc::new(ScriptedGateway::repeating(ModelResponse::tool_calls(vec![call(
        "loop",
        "echo",
        json!({"text": "again"}),
    )])));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .tool(EchoTool)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();
    let config = RunConfig { max_iterations: 1, ..config() };

    let err = agent
        .run(&session.id, "keep going", &config, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AgentError::IterationLimitExceeded { limit: 1, partial_answer: None }
    ));
    assert_eq!(gateway.call_count(), 1);

    // The one iteration's batch is closed
    let log = agent.sessions().load(&session.id).unwrap().messages;
    assert!(log.pending_tool_calls().is_empty());
    assert_eq!(log.last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn iteration_limit_returns_best_partial_answer() {
    let mut thinking = ModelResponse::tool_calls(vec![call("c", "echo", json!({"text": "x"}))]);
    thinking.text = Some("Probably 4, checking".into());
    let agent = Agent::builder()
        .gateway(Arc::new(ScriptedGateway::repeating(thinking)))
        .tool(EchoTool)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();
    let config = RunConfig { max_iterations: 2, ..config() };

    let err = agent
        .run(&session.id, "2+2?", &config, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.partial_answer(), Some("Probably 4, checking"));
}

#[tokio::test]
async fn scenario_d_retriever_unreachable_without_fallback() {
    let gateway = Arc::new(ScriptedGateway::replies(vec![ModelResponse::text("unused")]));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .retriever(Arc::new(FailingRetriever) as Arc<dyn KnowledgeRetriever>)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();

    let err = agent
        .run(&session.id, "What is 2+2?", &config(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::ContextAssembly(ref reason) if reason.contains("index unreachable")));
    assert_eq!(gateway.call_count(), 0);
    assert_eq!(agent.sessions().load(&session.id).unwrap().message_count(), 1);
}

#[tokio::test]
async fn every_tool_call_gets_exactly_one_result() {
    let calls = vec![
        call("a", "calculator", json!({"expr": "1+1"})),
        call("b", "missing", json!({})),
        call("c", "echo", json!({"text": "hi"})),
        call("d", "calculator", json!({"expr": "1/0"})),
    ];
    let agent = Agent::builder()
        .gateway(Arc::new(ScriptedGateway::replies(vec![
            ModelResponse::tool_calls(calls.clone()),
            ModelResponse::text("done"),
        ])))
        .tool(CalculatorTool)
        .tool(EchoTool)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();

    agent
        .run(&session.id, "do it all", &config(), CancellationToken::new())
        .await
        .unwrap();

    let log = agent.sessions().load(&session.id).unwrap().messages;
    let results: Vec<_> = log
        .messages()
        .iter()
        .filter_map(|m| m.tool_result.as_ref())
        .collect();
    assert_eq!(results.len(), calls.len());
    let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert_eq!(results[1].error, Some(ToolErrorKind::UnknownTool("missing".into())));
    assert!(matches!(results[3].error, Some(ToolErrorKind::Execution(ref e)) if e.contains("Division by zero")));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
    use agentkit_core::error::GatewayError;

    let gateway = Arc::new(ScriptedGateway::new(vec![
        Err(GatewayError::RateLimited { retry_after: Some(Duration::from_secs(2)) }),
        Ok(ModelResponse::text("4")),
    ]));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();
    let config = RunConfig { retry: RetryPolicy::default(), ..config() };

    let started = tokio::time::Instant::now();
    let outcome = agent
        .run(&session.id, "2+2?", &config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.answer, "4");
    assert_eq!(outcome.model_attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn model_records_a_user_memory() {
    let memories = UserMemories::new(Arc::new(InMemoryMemoryStore::new()), "alice");
    let registry = memories
        .tools()
        .into_iter()
        .fold(ToolRegistry::builder(), ToolRegistryBuilder::register_arc)
        .build()
        .unwrap();
    let gateway = Arc::new(ScriptedGateway::replies(vec![
        ModelResponse::tool_calls(vec![call(
            "m1",
            "add_memory",
            json!({"memory": "Vegetarian", "topics": ["diet"]}),
        )]),
        ModelResponse::text("Noted, no meat."),
    ]));
    let agent = Agent::builder()
        .gateway(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
        .tools(registry)
        .build()
        .unwrap();
    let session = agent.sessions().create().unwrap();

    let outcome = agent
        .run(&session.id, "I don't eat meat", &config(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.answer, "Noted, no meat.");
    assert_eq!(
        gateway.requests()[0].tool_names,
        vec!["add_memory", "clear_memories", "delete_memory", "update_memory"]
    );

    let stored = memories.list().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].memory, "Vegetarian");
    assert_eq!(stored[0].topics, vec!["diet"]);

    // The tool result hands the model the id it needs for later edits
    let log = agent.sessions().load(&session.id).unwrap().messages;
    let result = log.messages()[2].tool_result.as_ref().unwrap();
    assert_eq!(result.output, Some(json!({"memory_id": stored[0].memory_id})));
}
