//! Scripted provider for tests.
//!
//! Replays a fixed sequence of model events per step and records every
//! request it receives.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use carbot_core::context::ContextEntry;
use carbot_core::protocol::FinishReason;

use crate::{
    CompletionRequest, Credentials, LlmProvider, ModelApi, ModelEvent, ModelEventStream,
    ProviderError, ToolDefinition,
};

pub type ScriptedEvent = Result<ModelEvent, ProviderError>;

type Step = Result<Vec<ScriptedEvent>, ProviderError>;

pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Vec<ScriptedEvent>>,
    event_delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// One entry per model step, consumed in order. Once the script runs out
    /// every further step answers with an empty `stop`.
    pub fn new(steps: Vec<Vec<ScriptedEvent>>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().map(Ok).collect()),
            repeat: None,
            event_delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every step with the same events.
    pub fn repeating(step: Vec<ScriptedEvent>) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    /// Fail the next unscripted step before any event is produced.
    pub fn then_fail_to_open(self, error: ProviderError) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(Err(error));
        }
        self
    }

    /// Sleep before each event.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    /// Number of `stream` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

pub fn text(text: &str) -> ScriptedEvent {
    Ok(ModelEvent::TextDelta { text: text.into() })
}

pub fn reasoning(text: &str) -> ScriptedEvent {
    Ok(ModelEvent::ReasoningDelta { text: text.into() })
}

pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ScriptedEvent {
    Ok(ModelEvent::ToolCall {
        id: id.into(),
        name: name.into(),
        args,
        signature: None,
    })
}

/// A tool call carrying a provider signature.
pub fn signed_tool_call(id: &str, name: &str, args: serde_json::Value, signature: &str) -> ScriptedEvent {
    Ok(ModelEvent::ToolCall {
        id: id.into(),
        name: name.into(),
        args,
        signature: Some(signature.into()),
    })
}

pub fn tool_call_delta(id: &str, name: &str, args_delta: &str) -> ScriptedEvent {
    Ok(ModelEvent::ToolCallDelta {
        id: id.into(),
        name: name.into(),
        args_delta: args_delta.into(),
    })
}

pub fn step_end(finish_reason: FinishReason) -> ScriptedEvent {
    Ok(ModelEvent::StepEnd { finish_reason })
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn api(&self) -> ModelApi {
        ModelApi::Scripted
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect()
    }

    fn format_messages(&self, context: &[ContextEntry]) -> Vec<serde_json::Value> {
        context
            .iter()
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> Result<ModelEventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let next = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        let events = match (next, &self.repeat) {
            (Some(step), _) => step?,
            (None, Some(repeat)) => repeat.clone(),
            (None, None) => vec![step_end(FinishReason::Stop)],
        };

        let delay = self.event_delay;
        Ok(Box::pin(futures::stream::iter(events).then(
            move |event| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                event
            },
        )))
    }
}
