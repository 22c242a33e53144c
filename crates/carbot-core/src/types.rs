use serde::{Deserialize, Serialize};

/// Who authored a message in the transcript.
///
/// The system prompt is injected by the server on every request and is never
/// part of the client-owned transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
        }
    }

    /// Concatenation of all text parts, in order. Reasoning and tool parts are skipped.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolInvocation(inv) => Some(inv),
            _ => None,
        })
    }
}

/// Content part of a message (text, reasoning, tool invocation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    ToolInvocation(ToolInvocation),
}

/// Lifecycle of one tool call. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    PartialCall,
    Call,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub state: ToolState,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Raw argument text accumulated while the call is still `partial-call`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ToolInvocation {
    pub fn partial(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolState::PartialCall,
            args: serde_json::Value::Null,
            args_text: String::new(),
            result: None,
        }
    }

    pub fn call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            state: ToolState::Call,
            args,
            ..Self::partial(tool_call_id, tool_name)
        }
    }

    /// Append streamed argument text. Returns false once the call is complete.
    pub fn push_args_text(&mut self, delta: &str) -> bool {
        if self.state != ToolState::PartialCall {
            return false;
        }
        self.args_text.push_str(delta);
        true
    }

    /// Advance `partial-call → call`. Any other transition is refused.
    pub fn advance_to_call(&mut self, args: serde_json::Value) -> bool {
        if self.state != ToolState::PartialCall {
            return false;
        }
        self.state = ToolState::Call;
        self.args = args;
        self.args_text.clear();
        true
    }

    /// Advance `call → result`. The result is set at most once.
    pub fn set_result(&mut self, result: serde_json::Value) -> bool {
        if self.state != ToolState::Call || self.result.is_some() {
            return false;
        }
        self.state = ToolState::Result;
        self.result = Some(result);
        true
    }
}

/// One web search hit, as surfaced to the model and the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
