//! Agent runtime loop: orchestrates model streaming and tool calling.
//!
//! One turn is an explicit state machine:
//!
//! ```text
//! Requesting{step} -> Streaming{step} -> ExecutingTools{step} -> Requesting{step+1}
//!                                     \-> Finished               \-> Finished(step-limit)
//! ```
//!
//! Every await races the event receiver going away; a dropped receiver
//! cancels the turn and drops the in-flight model stream or tool request.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use carbot_core::config::Config;
use carbot_core::context::{ContextEntry, context_from_transcript};
use carbot_core::protocol::FinishReason;
use carbot_core::types::Message;
use carbot_providers::{ModelEvent, ModelEventStream, ModelGateway, ProviderError, ToolDefinition};
use carbot_tools::{ToolContext, ToolRegistry};

use crate::prompt::build_system_prompt;
use crate::{TurnEnd, TurnEvent, TurnOutcome};

/// Marker appended to tool results cut down for the model context.
const TRUNCATION_MARKER: &str = "\n[truncated]";

pub struct Orchestrator {
    gateway: ModelGateway,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    max_steps: u32,
    max_tool_result_chars: usize,
}

/// A tool call requested during a step, waiting to run.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    args: serde_json::Value,
    signature: Option<String>,
}

enum TurnState {
    Requesting {
        step: u32,
    },
    Streaming {
        step: u32,
        stream: ModelEventStream,
    },
    ExecutingTools {
        step: u32,
        calls: Vec<PendingCall>,
    },
    Finished(TurnEnd),
}

/// Mutable state of one turn.
struct Turn {
    message_id: String,
    context: Vec<ContextEntry>,
    tools: Vec<ToolDefinition>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
    steps: u32,
    tool_calls: u32,
    input_tokens: u64,
    output_tokens: u64,
}

impl Turn {
    /// Send an event; `false` once the receiver is gone.
    fn emit(&self, event: TurnEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }
}

impl Orchestrator {
    pub fn new(gateway: ModelGateway, tools: Arc<ToolRegistry>, config: &Config) -> Self {
        let system_prompt = build_system_prompt(&tools);
        Self {
            gateway,
            tools,
            system_prompt,
            max_steps: config.max_steps().max(1),
            max_tool_result_chars: config.max_tool_result_chars(),
        }
    }

    /// Orchestrator for the configured provider with the built-in tools.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let gateway = ModelGateway::from_config(config)?;
        let tools = Arc::new(ToolRegistry::with_defaults(config));
        Ok(Self::new(gateway, tools, config))
    }

    pub fn model(&self) -> &str {
        self.gateway.model()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Run one assistant turn over `transcript`, streaming events to `event_tx`.
    ///
    /// Unless cancelled, the event sequence starts with `Start` and ends with
    /// exactly one `Finish` or `Error`.
    pub async fn run_turn(
        &self,
        message_id: &str,
        transcript: &[Message],
        event_tx: mpsc::UnboundedSender<TurnEvent>,
    ) -> TurnOutcome {
        let start = Instant::now();
        let mut turn = Turn {
            message_id: message_id.to_string(),
            context: context_from_transcript(transcript),
            tools: self.tools.definitions(),
            event_tx,
            steps: 0,
            tool_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
        };

        info!(
            message_id,
            entries = turn.context.len(),
            model = self.gateway.model(),
            "Turn started"
        );

        let mut state = if turn.emit(TurnEvent::Start {
            message_id: turn.message_id.clone(),
        }) {
            TurnState::Requesting { step: 1 }
        } else {
            TurnState::Finished(TurnEnd::Cancelled)
        };

        let end = loop {
            state = match state {
                TurnState::Requesting { step } => self.request(&mut turn, step).await,
                TurnState::Streaming { step, stream } => {
                    self.stream_step(&mut turn, step, stream).await
                }
                TurnState::ExecutingTools { step, calls } => {
                    self.execute_tools(&mut turn, step, calls).await
                }
                TurnState::Finished(end) => break end,
            };
        };

        match &end {
            TurnEnd::Finished { finish_reason } => {
                turn.emit(TurnEvent::Finish {
                    finish_reason: *finish_reason,
                });
                info!(
                    message_id,
                    steps = turn.steps,
                    tool_calls = turn.tool_calls,
                    ?finish_reason,
                    "Turn finished"
                );
            }
            TurnEnd::Failed { kind, message } => {
                turn.emit(TurnEvent::Error {
                    kind: *kind,
                    message: message.clone(),
                });
                error!(message_id, ?kind, %message, "Turn failed");
            }
            TurnEnd::Cancelled => {
                info!(message_id, steps = turn.steps, "Turn cancelled by client");
            }
        }

        TurnOutcome {
            message_id: turn.message_id,
            steps: turn.steps,
            tool_calls: turn.tool_calls,
            input_tokens: turn.input_tokens,
            output_tokens: turn.output_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
            end,
        }
    }

    /// Requesting: open the model stream for `step`.
    async fn request(&self, turn: &mut Turn, step: u32) -> TurnState {
        turn.steps = step;
        if !turn.emit(TurnEvent::StartStep { step }) {
            return TurnState::Finished(TurnEnd::Cancelled);
        }
        debug!(step, "Requesting model step");

        let opened = tokio::select! {
            biased;
            _ = turn.event_tx.closed() => None,
            result = self.gateway.stream(&self.system_prompt, &turn.context, &turn.tools) => Some(result),
        };

        match opened {
            None => TurnState::Finished(TurnEnd::Cancelled),
            Some(Ok(stream)) => TurnState::Streaming { step, stream },
            Some(Err(e)) => failed(e),
        }
    }

    /// Streaming: forward deltas until the step's stream is exhausted.
    async fn stream_step(
        &self,
        turn: &mut Turn,
        step: u32,
        mut stream: ModelEventStream,
    ) -> TurnState {
        let mut text = String::new();
        let mut calls: Vec<PendingCall> = Vec::new();
        let mut finish_reason = None;
        let mut unnamed_calls = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = turn.event_tx.closed() => return TurnState::Finished(TurnEnd::Cancelled),
                item = stream.next() => item,
            };

            let event = match next {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => return failed(e),
            };

            let delivered = match event {
                ModelEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    turn.emit(TurnEvent::TextDelta { delta })
                }
                ModelEvent::ReasoningDelta { text: delta } => {
                    turn.emit(TurnEvent::ReasoningDelta { delta })
                }
                ModelEvent::ToolCallDelta { id, .. } if id.is_empty() => true,
                ModelEvent::ToolCallDelta {
                    id,
                    name,
                    args_delta,
                } => turn.emit(TurnEvent::ToolInputDelta {
                    tool_call_id: id,
                    tool_name: name,
                    delta: args_delta,
                }),
                ModelEvent::ToolCall {
                    id,
                    name,
                    args,
                    signature,
                } => {
                    // Call ids must stay unique across the whole turn
                    let id = if id.is_empty() {
                        unnamed_calls += 1;
                        format!("{}-{step}-{unnamed_calls}", turn.message_id)
                    } else {
                        id
                    };
                    calls.push(PendingCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: args.clone(),
                        signature,
                    });
                    turn.emit(TurnEvent::ToolCall {
                        tool_call_id: id,
                        tool_name: name,
                        args,
                    })
                }
                ModelEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    turn.input_tokens += input_tokens;
                    turn.output_tokens += output_tokens;
                    turn.emit(TurnEvent::Usage {
                        input_tokens,
                        output_tokens,
                    })
                }
                ModelEvent::StepEnd {
                    finish_reason: reason,
                } => {
                    finish_reason = Some(reason);
                    true
                }
            };

            if !delivered {
                return TurnState::Finished(TurnEnd::Cancelled);
            }
        }

        // Stream exhausted: the step is over
        let finish_reason = match finish_reason {
            Some(reason) => reason,
            None if calls.is_empty() => FinishReason::Stop,
            None => FinishReason::ToolCalls,
        };
        if !turn.emit(TurnEvent::FinishStep {
            step,
            finish_reason,
        }) {
            return TurnState::Finished(TurnEnd::Cancelled);
        }

        if !text.trim().is_empty() {
            turn.context.push(ContextEntry::Assistant { text });
        }

        if calls.is_empty() {
            return TurnState::Finished(TurnEnd::Finished { finish_reason });
        }

        turn.context
            .extend(calls.iter().map(|call| ContextEntry::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                signature: call.signature.clone(),
            }));
        TurnState::ExecutingTools { step, calls }
    }

    /// ExecutingTools: run the step's calls in request order.
    async fn execute_tools(&self, turn: &mut Turn, step: u32, calls: Vec<PendingCall>) -> TurnState {
        let ctx = ToolContext {
            turn_id: turn.message_id.clone(),
        };

        for call in calls {
            turn.tool_calls += 1;
            info!(tool = %call.name, tool_call_id = %call.id, step, "Executing tool");

            let output = tokio::select! {
                biased;
                _ = turn.event_tx.closed() => return TurnState::Finished(TurnEnd::Cancelled),
                output = self.tools.execute(&call.name, call.args.clone(), &ctx) => output,
            };

            if output.is_error {
                warn!(tool = %call.name, "Tool returned an error result");
            }

            turn.context.push(ContextEntry::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                content: truncate_chars(&output.content.to_string(), self.max_tool_result_chars),
            });

            if !turn.emit(TurnEvent::ToolResult {
                tool_call_id: call.id,
                tool_name: call.name,
                result: output.content,
                is_error: output.is_error,
            }) {
                return TurnState::Finished(TurnEnd::Cancelled);
            }
        }

        if step >= self.max_steps {
            warn!(step, max_steps = self.max_steps, "Step limit reached");
            TurnState::Finished(TurnEnd::Finished {
                finish_reason: FinishReason::StepLimit,
            })
        } else {
            TurnState::Requesting { step: step + 1 }
        }
    }
}

fn failed(e: ProviderError) -> TurnState {
    TurnState::Finished(TurnEnd::Failed {
        kind: e.kind(),
        message: e.to_string(),
    })
}

/// Cap `text` at `max` characters, marking the cut.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exactly", 7), "exactly");
        assert_eq!(truncate_chars("Nürburgring", 3), format!("Nür{TRUNCATION_MARKER}"));
    }
}
