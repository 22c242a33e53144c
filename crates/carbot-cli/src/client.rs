//! Terminal chat client.
//!
//! Keeps the conversation in memory, posts the full transcript on every turn,
//! and folds the decoded stream into it frame by frame.

use std::io::Write;

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use carbot_core::protocol::{ErrorKind, FrameDecoder, StreamFrame};
use carbot_core::transcript::{Activity, Conversation, TurnStatus, reduce};
use carbot_tools::web_search::TOOL_NAME as SEARCH_TOOL;

pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    conversation: Conversation,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/api/chat", base_url.trim_end_matches('/')),
            conversation: Conversation::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Send one user message and render the reply to `out` as it streams.
    ///
    /// Resolves when the turn finishes, fails, or `cancel` completes. A
    /// cancelled turn keeps its partial text and shows no error.
    pub async fn send<W, C>(&mut self, text: &str, out: &mut W, cancel: C) -> anyhow::Result<TurnStatus>
    where
        W: Write,
        C: Future<Output = ()>,
    {
        self.conversation
            .push_user(Uuid::new_v4().to_string(), text);

        let sent = self
            .http
            .post(&self.url)
            .json(&json!({ "messages": self.conversation.messages }))
            .send()
            .await;

        // An unanswered user turn is dropped so it is not resent
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                self.conversation.messages.pop();
                return Err(e.into());
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = body["error"].as_str().unwrap_or("request rejected");
            self.conversation.messages.pop();
            anyhow::bail!("server returned {status}: {message}");
        }

        let mut body = resp.bytes_stream();
        let mut decoder = FrameDecoder::new();
        tokio::pin!(cancel);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = &mut cancel => {
                    debug!("Turn cancelled by user");
                    self.conversation = std::mem::take(&mut self.conversation).cancel();
                    writeln!(out)?;
                    break;
                }
                chunk = body.next() => chunk,
            };

            let frames = match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => {
                    self.apply(lost_stream(format!("connection lost: {e}")), out)?;
                    break;
                }
                None => {
                    let tail = decoder.finish().into_iter().collect();
                    self.apply_all(tail, out)?;
                    if self.conversation.is_streaming() {
                        self.apply(lost_stream("stream ended unexpectedly".into()), out)?;
                    }
                    break;
                }
            };
            self.apply_all(frames, out)?;
            if decoder.is_terminated() {
                break;
            }
        }

        out.flush()?;
        Ok(self.conversation.status.clone())
    }

    fn apply_all(
        &mut self,
        frames: Vec<carbot_core::error::Result<StreamFrame>>,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        for frame in frames {
            match frame {
                Ok(frame) => self.apply(frame, out)?,
                Err(e) => warn!(error = %e, "Skipping undecodable frame"),
            }
        }
        Ok(())
    }

    fn apply(&mut self, frame: StreamFrame, out: &mut impl Write) -> anyhow::Result<()> {
        let before = self.conversation.activity();
        self.conversation = reduce(std::mem::take(&mut self.conversation), &frame);
        let after = self.conversation.activity();

        if let Some(rendered) = render(&frame, &before, &after) {
            write!(out, "{rendered}")?;
            out.flush()?;
        }
        Ok(())
    }
}

fn lost_stream(message: String) -> StreamFrame {
    StreamFrame::Error {
        kind: ErrorKind::Network,
        message,
    }
}

/// Terminal output for one frame, given the activity around it.
pub fn render(frame: &StreamFrame, before: &Activity, after: &Activity) -> Option<String> {
    match frame {
        StreamFrame::TextDelta { delta } => Some(delta.clone()),
        StreamFrame::Finish { .. } => Some("\n".into()),
        StreamFrame::Error { message, .. } => Some(format!("\n[error] {message}\n")),
        _ => match after {
            Activity::UsingTool(name) if before != after => {
                Some(format!("\n[{}]\n", activity_label(name)))
            }
            _ => None,
        },
    }
}

pub fn activity_label(tool_name: &str) -> String {
    if tool_name == SEARCH_TOOL {
        "Using web search…".to_string()
    } else {
        format!("Using {tool_name}…")
    }
}
