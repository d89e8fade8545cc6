//! Shared identifiers and wire-level message shapes.
//!
//! Every entity in the runtime is addressed by an opaque string name:
//! clients, agents, tools, swarms, completions, storages, states and
//! embeddings. The aliases below exist for signature readability — none of
//! them carries validation on its own; the validation services in
//! [`crate::swarm::validation`] are the single place where names are checked
//! against the registries.
//!
//! The message shapes ([`ModelMessage`], [`ToolCall`], [`ToolFunction`])
//! mirror the OpenAI-compatible chat wire format so that completion
//! providers can translate them with minimal friction.

use serde::{Deserialize, Serialize};

/// Opaque per-client identifier. One connected client maps to one `ClientId`.
pub type ClientId = String;
/// Unique agent schema name.
pub type AgentName = String;
/// Unique tool schema name.
pub type ToolName = String;
/// Unique swarm schema name.
pub type SwarmName = String;
/// Unique completion schema name.
pub type CompletionName = String;
/// Unique storage schema name.
pub type StorageName = String;
/// Unique state schema name.
pub type StateName = String;
/// Unique embedding schema name.
pub type EmbeddingName = String;
/// Identifier correlating a tool invocation with its result message.
pub type ToolCallId = String;
/// Identifier of a single turn execution, generated per `execute` call.
pub type ExecutionId = String;

/// Role of a [`ModelMessage`] in the conversation log.
///
/// Beyond the four chat-standard roles, the runtime records two marker
/// roles of its own: [`Resque`](MessageRole::Resque) annotates the point
/// where the model had to be rescued from malformed output, and
/// [`Flush`](MessageRole::Flush) marks a logical reset of the conversation
/// (the raw log keeps everything; the per-agent projection starts over at
/// the most recent flush marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Assistant,
    System,
    Tool,
    User,
    Resque,
    Flush,
}

/// Distinguishes human input from tool-injected input.
///
/// History filters and callbacks use the mode to tell whether a `user`
/// message came from the connected client or was submitted by a tool while
/// a turn was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    User,
    Tool,
}

/// How a client session was established, recorded per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// `session()` entry — request/response completes.
    Session,
    /// `make_connection()` entry — bidirectional connector.
    MakeConnection,
    /// One-shot `complete()` entry.
    Complete,
    /// Delay-window batching variant of `session()`/`make_connection()`.
    Scheduled,
}

/// A single model-produced request to invoke a named function.
///
/// Providers assign an opaque `id` so that the tool result can be
/// correlated back in a follow-up [`MessageRole::Tool`] message. When a
/// provider omits the id the runtime generates one (see
/// [`ToolCall::ensure_normalized`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned (or runtime-generated) call id.
    #[serde(default)]
    pub id: ToolCallId,
    /// Always `"function"` after normalization.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// The function being requested.
    pub function: FunctionCall,
}

/// Name + parsed JSON arguments of a requested function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: ToolName,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Fill in the fields a lax model response may omit: a missing id is
    /// replaced with a generated UUID and the kind is pinned to
    /// `"function"`. The generated id is used verbatim in history and tool
    /// dispatch; it is never reconciled with the completion backend.
    pub fn ensure_normalized(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.kind.is_empty() {
            self.kind = "function".to_string();
        }
    }
}

/// Wire-level description of a tool, sent to the completion backend.
///
/// This is the stripped projection of a registered
/// [`ToolSchema`](crate::swarm::schema::ToolSchema): only the fields the
/// model needs to select and parameterize the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: ToolName,
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters: serde_json::Value,
}

/// One entry of a per-(client, agent) conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: MessageRole,
    /// Agent that owned the turn which produced this message.
    pub agent_name: AgentName,
    pub mode: ExecutionMode,
    pub content: String,
    /// Non-empty only on assistant messages that request tool invocations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Present only on [`MessageRole::Tool`] result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
}

impl ModelMessage {
    /// A user message in the given mode.
    pub fn user(agent_name: impl Into<AgentName>, content: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            role: MessageRole::User,
            agent_name: agent_name.into(),
            mode,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// An assistant message, optionally carrying tool calls.
    pub fn assistant(agent_name: impl Into<AgentName>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            agent_name: agent_name.into(),
            mode: ExecutionMode::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A system message.
    pub fn system(agent_name: impl Into<AgentName>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            agent_name: agent_name.into(),
            mode: ExecutionMode::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A tool-result message answering the call identified by `tool_call_id`.
    pub fn tool_output(
        agent_name: impl Into<AgentName>,
        tool_call_id: impl Into<ToolCallId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            agent_name: agent_name.into(),
            mode: ExecutionMode::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// A flush marker: logical reset point for the per-agent projection.
    pub fn flush(agent_name: impl Into<AgentName>) -> Self {
        Self {
            role: MessageRole::Flush,
            agent_name: agent_name.into(),
            mode: ExecutionMode::Tool,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A rescue marker recorded immediately before a rescue prompt.
    pub fn resque(agent_name: impl Into<AgentName>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Resque,
            agent_name: agent_name.into(),
            mode: ExecutionMode::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Attach tool calls to an assistant message.
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Everything a completion backend needs to produce the next message.
#[derive(Debug, Clone)]
pub struct CompletionArgs {
    pub client_id: ClientId,
    pub agent_name: AgentName,
    pub mode: ExecutionMode,
    /// Prompt/system preamble followed by the filtered history projection.
    pub messages: Vec<ModelMessage>,
    /// Wire descriptions of the agent's tools, empty when the agent has none.
    pub tools: Vec<ToolFunction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_normalization_generates_id_and_kind() {
        let mut call = ToolCall {
            id: String::new(),
            kind: String::new(),
            function: FunctionCall {
                name: "navigate".to_string(),
                arguments: serde_json::json!({"to": "sales"}),
            },
        };
        call.ensure_normalized();
        assert!(!call.id.is_empty());
        assert_eq!(call.kind, "function");

        let previous = call.id.clone();
        call.ensure_normalized();
        assert_eq!(call.id, previous);
    }

    #[test]
    fn message_roles_serialize_lowercase() {
        let msg = ModelMessage::flush("triage");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "flush");
        assert_eq!(json["mode"], "tool");
        assert!(json.get("tool_calls").is_none());
    }
}
