//! Orchestration loop tests with a scripted model and a canned search tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use carbot_agent::{Orchestrator, TurnEnd, TurnEvent};
use carbot_core::config::{AgentConfig, Config};
use carbot_core::protocol::{ErrorKind, FinishReason};
use carbot_core::types::Message;
use carbot_providers::scripted::{self, ScriptedProvider};
use carbot_providers::{Credentials, ModelGateway, ModelSettings, ProviderError};
use carbot_tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Canned `searchWeb` stand-in that records how often it ran.
struct CannedSearch {
    result: Value,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CannedSearch {
    fn name(&self) -> &str {
        "searchWeb"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    fn description(&self) -> &str {
        "Search the web for current car-related information."
    }

    async fn execute(&self, _params: Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput {
            content: self.result.clone(),
            is_error: false,
        })
    }
}

struct Harness {
    orchestrator: Orchestrator,
    provider: Arc<ScriptedProvider>,
    tool_runs: Arc<AtomicUsize>,
}

fn harness_with(provider: ScriptedProvider, config: Config, tool_result: Value) -> Harness {
    let provider = Arc::new(provider);
    let gateway = ModelGateway::new(
        provider.clone(),
        Credentials::None,
        ModelSettings::from_config(&config),
    );
    let tool_runs = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(CannedSearch {
        result: tool_result,
        runs: tool_runs.clone(),
    }));
    Harness {
        orchestrator: Orchestrator::new(gateway, Arc::new(tools), &config),
        provider,
        tool_runs,
    }
}

fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(
        provider,
        Config::default(),
        json!({"success": true, "results": [{"title": "GR86", "snippet": "228 hp"}]}),
    )
}

fn transcript(text: &str) -> Vec<Message> {
    vec![Message::user("u1", text)]
}

async fn run(h: &Harness, text: &str) -> (Vec<TurnEvent>, carbot_agent::TurnOutcome) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = h.orchestrator.run_turn("msg-1", &transcript(text), tx).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (events, outcome)
}

fn streamed_text(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

fn terminal_count(events: &[TurnEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TurnEvent::Finish { .. } | TurnEvent::Error { .. }))
        .count()
}

#[tokio::test]
async fn test_text_only_turn() {
    let h = harness(ScriptedProvider::new(vec![vec![
        scripted::text("The M3 "),
        scripted::text("has the S58."),
        scripted::step_end(FinishReason::Stop),
    ]]));

    let (events, outcome) = run(&h, "Compare BMW M3 vs C63 AMG").await;

    assert_eq!(
        events.first(),
        Some(&TurnEvent::Start {
            message_id: "msg-1".into()
        })
    );
    assert_eq!(events[1], TurnEvent::StartStep { step: 1 });
    assert_eq!(streamed_text(&events), "The M3 has the S58.");
    assert_eq!(
        events.last(),
        Some(&TurnEvent::Finish {
            finish_reason: FinishReason::Stop
        })
    );
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.tool_calls, 0);
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.tool_runs.load(Ordering::SeqCst), 0);

    // The system prompt goes out once, as the system instruction
    let request = &h.provider.requests()[0];
    assert!(request.system.as_deref().unwrap().starts_with("You are CarBot"));
    assert_eq!(request.messages.len(), 1);
}

#[tokio::test]
async fn test_one_tool_call_then_answer() {
    let h = harness(ScriptedProvider::new(vec![
        vec![
            scripted::tool_call_delta("c1", "searchWeb", "{\"query\":"),
            scripted::tool_call_delta("c1", "searchWeb", "\"GR86 price\"}"),
            scripted::tool_call("c1", "searchWeb", json!({"query": "GR86 price"})),
            scripted::step_end(FinishReason::ToolCalls),
        ],
        vec![
            scripted::text("The GR86 starts around $30k."),
            scripted::step_end(FinishReason::Stop),
        ],
    ]));

    let (events, outcome) = run(&h, "How much is a GR86?").await;

    let call_pos = events
        .iter()
        .position(|e| matches!(e, TurnEvent::ToolCall { .. }))
        .unwrap();
    let result_pos = events
        .iter()
        .position(|e| matches!(e, TurnEvent::ToolResult { .. }))
        .unwrap();
    let second_step = events
        .iter()
        .position(|e| *e == TurnEvent::StartStep { step: 2 })
        .unwrap();
    assert!(call_pos < result_pos && result_pos < second_step);
    assert!(events.contains(&TurnEvent::ToolInputDelta {
        tool_call_id: "c1".into(),
        tool_name: "searchWeb".into(),
        delta: "{\"query\":".into(),
    }));
    assert!(events.contains(&TurnEvent::FinishStep {
        step: 1,
        finish_reason: FinishReason::ToolCalls
    }));
    assert_eq!(streamed_text(&events), "The GR86 starts around $30k.");
    assert_eq!(
        outcome.end,
        TurnEnd::Finished {
            finish_reason: FinishReason::Stop
        }
    );
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(h.tool_runs.load(Ordering::SeqCst), 1);

    // Second step sees the call and its result
    let second = &h.provider.requests()[1];
    let types: Vec<&str> = second
        .messages
        .iter()
        .map(|m| m["type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["user", "tool_call", "tool_result"]);
}

#[tokio::test]
async fn test_unnamed_calls_get_turn_unique_ids() {
    let h = harness(ScriptedProvider::new(vec![
        vec![
            scripted::tool_call_delta("", "searchWeb", "{\"query\":\"Evora\"}"),
            scripted::signed_tool_call("", "searchWeb", json!({"query": "Evora"}), "sig-1"),
            scripted::step_end(FinishReason::ToolCalls),
        ],
        vec![
            scripted::signed_tool_call("", "searchWeb", json!({"query": "Emira"}), "sig-2"),
            scripted::step_end(FinishReason::ToolCalls),
        ],
        vec![
            scripted::text("The Emira replaced the Evora."),
            scripted::step_end(FinishReason::Stop),
        ],
    ]));

    let (events, outcome) = run(&h, "Evora or Emira?").await;

    let call_ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(call_ids, vec!["msg-1-1-1", "msg-1-2-1"]);
    let result_ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, call_ids);
    // Deltas without a call id cannot be attributed and are not forwarded
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolInputDelta { .. }))
    );
    assert_eq!(outcome.tool_calls, 2);

    // Signatures travel back with their calls
    let third = &h.provider.requests()[2];
    let calls: Vec<&Value> = third
        .messages
        .iter()
        .filter(|m| m["type"] == "tool_call")
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["id"], "msg-1-1-1");
    assert_eq!(calls[0]["signature"], "sig-1");
    assert_eq!(calls[1]["signature"], "sig-2");
}

#[tokio::test]
async fn test_always_calling_model_stops_at_step_limit() {
    let h = harness(ScriptedProvider::repeating(vec![
        scripted::tool_call("c", "searchWeb", json!({"query": "again"})),
        scripted::step_end(FinishReason::ToolCalls),
    ]));

    let (events, outcome) = run(&h, "Keep searching").await;

    assert_eq!(h.provider.calls(), 3);
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.tool_calls, 3);
    assert_eq!(
        events.last(),
        Some(&TurnEvent::Finish {
            finish_reason: FinishReason::StepLimit
        })
    );
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn test_configured_step_budget() {
    let config = Config {
        agent: Some(AgentConfig {
            max_steps: Some(1),
            max_tool_result_chars: None,
        }),
        ..Config::default()
    };
    let h = harness_with(
        ScriptedProvider::repeating(vec![scripted::tool_call(
            "c",
            "searchWeb",
            json!({"query": "x"}),
        )]),
        config,
        json!({"success": true, "results": []}),
    );

    let (_, outcome) = run(&h, "hi").await;
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(
        outcome.end,
        TurnEnd::Finished {
            finish_reason: FinishReason::StepLimit
        }
    );
}

#[tokio::test]
async fn test_provider_error_keeps_partial_text() {
    let h = harness(ScriptedProvider::new(vec![vec![
        scripted::text("The Supra uses "),
        Err(ProviderError::Network("connection reset".into())),
    ]]));

    let (events, outcome) = run(&h, "What engine is in the Supra?").await;

    assert_eq!(streamed_text(&events), "The Supra uses ");
    assert!(matches!(
        events.last(),
        Some(TurnEvent::Error {
            kind: ErrorKind::Network,
            ..
        })
    ));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(outcome.end, TurnEnd::Failed { .. }));
}

#[tokio::test]
async fn test_stream_open_failure() {
    let h = harness(ScriptedProvider::new(vec![]).then_fail_to_open(ProviderError::Api {
        status: 500,
        body: "internal".into(),
    }));

    let (events, _) = run(&h, "hi").await;
    assert!(matches!(
        events.last(),
        Some(TurnEvent::Error {
            kind: ErrorKind::Provider,
            ..
        })
    ));
}

#[tokio::test]
async fn test_malformed_tool_call_is_schema_error() {
    let h = harness(ScriptedProvider::new(vec![vec![scripted::tool_call(
        "c1",
        "searchWeb",
        json!({"search": "wrong argument name"}),
    )]]));

    let (events, _) = run(&h, "hi").await;

    assert!(matches!(
        events.last(),
        Some(TurnEvent::Error {
            kind: ErrorKind::Schema,
            ..
        })
    ));
    assert_eq!(h.tool_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tool_result_truncated_for_model_only() {
    let long = "V12 ".repeat(2000);
    let h = harness_with(
        ScriptedProvider::new(vec![
            vec![scripted::tool_call("c1", "searchWeb", json!({"query": "V12"}))],
            vec![scripted::text("done")],
        ]),
        Config::default(),
        json!({"success": true, "results": [{"title": "t", "snippet": long}]}),
    );

    let (events, _) = run(&h, "V12 cars").await;

    let client_result = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(client_result["results"][0]["snippet"], long.as_str());

    let second = &h.provider.requests()[1];
    let content = second.messages[2]["content"].as_str().unwrap();
    assert!(content.ends_with("[truncated]"));
    assert!(content.chars().count() < 4100);
}

#[tokio::test]
async fn test_history_is_reduced_to_text() {
    let h = harness(ScriptedProvider::new(vec![vec![scripted::text("ok")]]));
    let transcript = vec![
        Message::user("u1", "First question"),
        Message::assistant("a1"),
        Message::user("u2", "   "),
        Message::user("u3", "Second question"),
    ];
    let (tx, _rx) = mpsc::unbounded_channel();
    h.orchestrator.run_turn("msg-2", &transcript, tx).await;

    let request = &h.provider.requests()[0];
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[1]["text"], "Second question");
}

#[tokio::test]
async fn test_cancellation_stops_the_turn() {
    let provider = ScriptedProvider::new(vec![vec![
        scripted::text("one "),
        scripted::text("two "),
        scripted::text("three "),
        scripted::text("four "),
        scripted::text("five"),
    ]])
    .with_event_delay(Duration::from_millis(50));
    let h = Arc::new(harness(provider));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = {
        let h = h.clone();
        tokio::spawn(async move { h.orchestrator.run_turn("msg-1", &transcript("count"), tx).await })
    };

    let mut deltas = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, TurnEvent::TextDelta { .. }) {
            deltas += 1;
            if deltas == 2 {
                break;
            }
        }
    }
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("turn did not stop after cancellation")
        .unwrap();
    assert_eq!(outcome.end, TurnEnd::Cancelled);
    assert_eq!(h.provider.calls(), 1);
}
