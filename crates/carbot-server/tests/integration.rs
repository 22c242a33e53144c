//! Server integration tests: start a real server with a scripted model and
//! talk to it over HTTP.
//!
//! Run with: `cargo test -p carbot-server --test integration`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use carbot_agent::Orchestrator;
use carbot_core::config::{Config, ServerConfig};
use carbot_core::protocol::{ErrorKind, FinishReason, FrameDecoder, StreamFrame};
use carbot_core::transcript::{Conversation, TurnStatus};
use carbot_core::types::{ContentPart, ToolState};
use carbot_providers::scripted::{self, ScriptedProvider};
use carbot_providers::{Credentials, ModelGateway, ModelSettings};
use carbot_server::AppState;
use carbot_tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct CannedSearch {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CannedSearch {
    fn name(&self) -> &str {
        "searchWeb"
    }

    fn description(&self) -> &str {
        "Search the web for current car-related information."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, _params: Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput {
            content: json!({
                "success": true,
                "results": [{"title": "2025 Toyota GR86", "snippet": "Starts at $29,300"}]
            }),
            is_error: false,
        })
    }
}

struct TestServer {
    base: String,
    provider: Arc<ScriptedProvider>,
    tool_runs: Arc<AtomicUsize>,
}

async fn start_test_server(provider: ScriptedProvider, request_timeout_secs: u64) -> TestServer {
    let port = find_free_port();
    let config = Config {
        server: Some(ServerConfig {
            port,
            bind: Some("127.0.0.1".into()),
            request_timeout_secs,
            ..ServerConfig::default()
        }),
        ..Config::default()
    };

    let provider = Arc::new(provider);
    let gateway = ModelGateway::new(
        provider.clone(),
        Credentials::None,
        ModelSettings::from_config(&config),
    );
    let tool_runs = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(CannedSearch {
        runs: tool_runs.clone(),
    }));
    let orchestrator = Orchestrator::new(gateway, Arc::new(tools), &config);
    let state = Arc::new(AppState::new(config, orchestrator));

    tokio::spawn(async move {
        let _ = carbot_server::start_server(state, port).await;
    });

    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("{base}/api/health"))
            .send()
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    TestServer {
        base,
        provider,
        tool_runs,
    }
}

fn user_turn(text: &str) -> Value {
    json!({
        "messages": [{
            "id": "u1",
            "role": "user",
            "parts": [{"type": "text", "text": text}]
        }]
    })
}

/// POST a transcript and decode the whole response.
async fn chat(server: &TestServer, body: Value) -> Vec<StreamFrame> {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let bytes = resp.bytes().await.unwrap();
    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<StreamFrame> = decoder
        .push(&bytes)
        .into_iter()
        .map(|f| f.unwrap())
        .collect();
    if let Some(last) = decoder.finish() {
        frames.push(last.unwrap());
    }
    assert!(decoder.is_terminated());
    frames
}

fn replay(frames: &[StreamFrame]) -> Conversation {
    let mut conversation = Conversation::new();
    conversation.push_user("u1", "question");
    conversation.replay(frames)
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server(ScriptedProvider::new(Vec::new()), 60).await;

    let resp = reqwest::get(format!("{}/api/health", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model"], carbot_core::config::DEFAULT_MODEL);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_rejects_empty_and_malformed_requests() {
    let server = start_test_server(ScriptedProvider::new(Vec::new()), 60).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", server.base))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = client
        .post(format!("{}/api/chat", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    assert_eq!(server.provider.calls(), 0);
}

#[tokio::test]
async fn test_text_answer_end_to_end() {
    let server = start_test_server(
        ScriptedProvider::new(vec![vec![
            scripted::text("The M3 uses the S58 inline-6, "),
            scripted::text("the C63 now runs a hybrid four-cylinder."),
            scripted::step_end(FinishReason::Stop),
        ]]),
        60,
    )
    .await;

    let frames = chat(&server, user_turn("Compare BMW M3 vs C63 AMG")).await;

    assert!(matches!(frames.first(), Some(StreamFrame::Start { message_id }) if message_id.starts_with("msg-")));
    assert_eq!(
        frames.last(),
        Some(&StreamFrame::Finish {
            finish_reason: FinishReason::Stop
        })
    );
    assert_eq!(server.tool_runs.load(Ordering::SeqCst), 0);

    let conversation = replay(&frames);
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(
        conversation.messages[1].text(),
        "The M3 uses the S58 inline-6, the C63 now runs a hybrid four-cylinder."
    );
    assert_eq!(
        conversation.status,
        TurnStatus::Finished {
            reason: FinishReason::Stop
        }
    );
}

#[tokio::test]
async fn test_search_then_answer_end_to_end() {
    let server = start_test_server(
        ScriptedProvider::new(vec![
            vec![
                scripted::tool_call_delta("call-1", "searchWeb", "{\"query\":"),
                scripted::tool_call_delta("call-1", "searchWeb", "\"2025 GR86 price\"}"),
                scripted::tool_call("call-1", "searchWeb", json!({"query": "2025 GR86 price"})),
                scripted::step_end(FinishReason::ToolCalls),
            ],
            vec![
                scripted::text("The 2025 GR86 starts at $29,300."),
                scripted::step_end(FinishReason::Stop),
            ],
        ]),
        60,
    )
    .await;

    let frames = chat(&server, user_turn("What does a new GR86 cost?")).await;

    assert_eq!(server.tool_runs.load(Ordering::SeqCst), 1);
    assert_eq!(server.provider.calls(), 2);

    let steps: Vec<u32> = frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::StartStep { step } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![1, 2]);

    let conversation = replay(&frames);
    let answer = &conversation.messages[1];
    let invocation = answer.tool_invocations().next().unwrap();
    assert_eq!(invocation.tool_name, "searchWeb");
    assert_eq!(invocation.state, ToolState::Result);
    assert_eq!(
        invocation.result.as_ref().unwrap()["results"][0]["title"],
        "2025 Toyota GR86"
    );
    assert!(matches!(answer.parts.last(), Some(ContentPart::Text { text }) if text.contains("$29,300")));
    assert!(matches!(conversation.status, TurnStatus::Finished { .. }));
}

#[tokio::test]
async fn test_unnamed_calls_in_two_steps_both_kept() {
    let server = start_test_server(
        ScriptedProvider::new(vec![
            vec![
                scripted::tool_call("", "searchWeb", json!({"query": "Cayman GT4 price"})),
                scripted::step_end(FinishReason::ToolCalls),
            ],
            vec![
                scripted::tool_call("", "searchWeb", json!({"query": "Cayman GTS price"})),
                scripted::step_end(FinishReason::ToolCalls),
            ],
            vec![
                scripted::text("The GTS is the better value."),
                scripted::step_end(FinishReason::Stop),
            ],
        ]),
        60,
    )
    .await;

    let frames = chat(&server, user_turn("GT4 or GTS?")).await;
    assert_eq!(server.tool_runs.load(Ordering::SeqCst), 2);

    let conversation = replay(&frames);
    let answer = &conversation.messages[1];
    let invocations: Vec<_> = answer.tool_invocations().collect();
    assert_eq!(invocations.len(), 2);
    assert_ne!(invocations[0].tool_call_id, invocations[1].tool_call_id);
    assert!(invocations.iter().all(|inv| inv.state == ToolState::Result));
    assert_eq!(invocations[1].args["query"], "Cayman GTS price");
    assert_eq!(answer.text(), "The GTS is the better value.");
}

#[tokio::test]
async fn test_content_shaped_messages_accepted() {
    let server = start_test_server(
        ScriptedProvider::new(vec![vec![
            scripted::text("Yes, the Miata is a great first project car."),
            scripted::step_end(FinishReason::Stop),
        ]]),
        60,
    )
    .await;

    let frames = chat(
        &server,
        json!({
            "messages": [
                {"role": "system", "content": "You are a pirate."},
                {"role": "user", "content": "Is a Miata a good project car?"}
            ]
        }),
    )
    .await;
    assert!(frames.last().unwrap().is_terminal());

    // The client's system message never reaches the model
    let request = &server.provider.requests()[0];
    assert!(request.system.as_deref().unwrap().starts_with("You are CarBot"));
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0]["type"], "user");
}

#[tokio::test]
async fn test_client_disconnect_cancels_turn() {
    let server = start_test_server(
        ScriptedProvider::new(vec![vec![
            scripted::text("one "),
            scripted::text("two "),
            scripted::text("three "),
            scripted::text("four "),
            scripted::text("five"),
            scripted::tool_call("call-1", "searchWeb", json!({"query": "never"})),
            scripted::step_end(FinishReason::ToolCalls),
        ]])
        .with_event_delay(Duration::from_millis(150)),
        60,
    )
    .await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", server.base))
        .json(&user_turn("count to five"))
        .send()
        .await
        .unwrap();

    let mut body = resp.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut deltas = 0;
    'read: while let Some(chunk) = body.next().await {
        for frame in decoder.push(&chunk.unwrap()) {
            let frame = frame.unwrap();
            if matches!(frame, StreamFrame::TextDelta { .. }) {
                deltas += 1;
            }
            frames.push(frame);
            if deltas == 2 {
                break 'read;
            }
        }
    }
    drop(body);

    let conversation = replay(&frames).cancel();
    assert_eq!(conversation.status, TurnStatus::Cancelled);
    assert_eq!(conversation.messages[1].text(), "one two ");

    // The remaining deltas and the tool call never complete server-side
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.tool_runs.load(Ordering::SeqCst), 0);
    assert_eq!(server.provider.calls(), 1);
}

#[tokio::test]
async fn test_request_timeout_ends_with_error_frame() {
    let server = start_test_server(
        ScriptedProvider::new(vec![vec![
            scripted::text("one "),
            scripted::text("two "),
            scripted::text("three "),
            scripted::text("four "),
            scripted::text("five"),
            scripted::step_end(FinishReason::Stop),
        ]])
        .with_event_delay(Duration::from_millis(400)),
        1,
    )
    .await;

    let frames = chat(&server, user_turn("slow answer please")).await;

    assert!(matches!(
        frames.last(),
        Some(StreamFrame::Error { kind: ErrorKind::Timeout, .. })
    ));
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Finish { .. })));

    let conversation = replay(&frames);
    assert!(matches!(
        conversation.status,
        TurnStatus::Failed { kind: ErrorKind::Timeout, .. }
    ));
    assert!(conversation.messages[1].text().starts_with("one "));
}
