//! Per-(client, agent) conversation history.
//!
//! The raw log is append-only: nothing is ever deleted, and a
//! [`MessageRole::Flush`] entry only *marks* a logical reset. Completion
//! calls consume the filtered projection built by
//! [`ClientHistory::to_array_for_agent`]:
//!
//! 1. cut everything at or before the most recent flush marker,
//! 2. keep user/assistant messages from any agent plus every message owned
//!    by this agent,
//! 3. truncate to the last N messages (configured, default 25) without
//!    separating an assistant tool-call message from its tool results,
//! 4. prepend the agent's prompt and system lines as the preamble.

use tokio::sync::Mutex;

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::config::HistoryFilter;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::types::{AgentName, ClientId, MessageRole, ModelMessage};

pub struct ClientHistory {
    client_id: ClientId,
    agent_name: AgentName,
    messages: Mutex<Vec<ModelMessage>>,
    bus: EventBus,
    logger: SwarmLogger,
}

impl ClientHistory {
    pub fn new(
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
        bus: EventBus,
        logger: SwarmLogger,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            agent_name: agent_name.into(),
            messages: Mutex::new(Vec::new()),
            bus,
            logger,
        }
    }

    pub fn agent_name(&self) -> &AgentName {
        &self.agent_name
    }

    /// Append one message and notify history listeners.
    pub async fn push(&self, message: ModelMessage) {
        self.logger.debug(
            &self.client_id,
            "history push",
            serde_json::json!({"agent": self.agent_name, "role": message.role}),
        );
        {
            let mut messages = self.messages.lock().await;
            messages.push(message.clone());
        }
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::HistoryBus, self.client_id.clone(), "push")
                    .with_input(serde_json::to_value(&message).unwrap_or_default())
                    .with_context(EventContext {
                        agent_name: Some(self.agent_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }

    /// The entire log, in push order.
    pub async fn to_array_for_raw(&self) -> Vec<ModelMessage> {
        self.messages.lock().await.clone()
    }

    /// The completion projection: preamble + filtered, truncated log.
    /// `filter` replaces the built-in keep predicate when supplied; the
    /// flush cut and pair-preserving truncation apply either way.
    pub async fn to_array_for_agent(
        &self,
        prompt: &str,
        system: &[String],
        keep: usize,
        filter: Option<&HistoryFilter>,
    ) -> Vec<ModelMessage> {
        let log = self.messages.lock().await.clone();

        let cut = log
            .iter()
            .rposition(|msg| msg.role == MessageRole::Flush)
            .map(|idx| idx + 1)
            .unwrap_or(0);

        let filtered: Vec<ModelMessage> = log[cut..]
            .iter()
            .filter(|msg| match filter {
                Some(filter) => filter(msg, &self.agent_name),
                None => {
                    matches!(msg.role, MessageRole::User | MessageRole::Assistant)
                        || msg.agent_name == self.agent_name
                }
            })
            .cloned()
            .collect();

        let mut start = filtered.len().saturating_sub(keep.max(1));
        // never lead with orphaned tool results
        while start > 0 && filtered[start].role == MessageRole::Tool {
            start -= 1;
        }

        let mut result = Vec::with_capacity(filtered.len() - start + system.len() + 1);
        if !prompt.is_empty() {
            result.push(ModelMessage::system(self.agent_name.clone(), prompt));
        }
        for line in system {
            result.push(ModelMessage::system(self.agent_name.clone(), line.clone()));
        }
        result.extend_from_slice(&filtered[start..]);
        result
    }

    pub async fn dispose(&self) {
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::HistoryBus, self.client_id.clone(), "dispose")
                    .with_context(EventContext {
                        agent_name: Some(self.agent_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::config::SwarmConfig;
    use crate::swarm::types::{ExecutionMode, FunctionCall, ToolCall};

    fn history() -> ClientHistory {
        let config = SwarmConfig::default();
        ClientHistory::new("c1", "triage", EventBus::new(), SwarmLogger::new(&config))
    }

    #[tokio::test]
    async fn raw_projection_is_append_only() {
        let history = history();
        history
            .push(ModelMessage::user("triage", "hi", ExecutionMode::User))
            .await;
        let first = history.to_array_for_raw().await;

        history.push(ModelMessage::assistant("triage", "hello")).await;
        let second = history.to_array_for_raw().await;

        assert_eq!(second[..first.len()], first[..]);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn agent_projection_cuts_at_latest_flush() {
        let history = history();
        history
            .push(ModelMessage::user("triage", "old", ExecutionMode::User))
            .await;
        history.push(ModelMessage::flush("triage")).await;
        history
            .push(ModelMessage::user("triage", "new", ExecutionMode::User))
            .await;

        let projected = history.to_array_for_agent("prompt", &[], 25, None).await;
        // preamble + the single post-flush message
        assert_eq!(projected.len(), 2);
        assert_eq!(projected[1].content, "new");

        let raw = history.to_array_for_raw().await;
        assert_eq!(raw.len(), 3);
    }

    #[tokio::test]
    async fn agent_projection_drops_foreign_agent_internal_messages() {
        let history = history();
        history
            .push(ModelMessage::user("sales", "from any agent", ExecutionMode::User))
            .await;
        history
            .push(ModelMessage::system("sales", "sales internal"))
            .await;
        history
            .push(ModelMessage::system("triage", "triage internal"))
            .await;

        let projected = history.to_array_for_agent("", &[], 25, None).await;
        let contents: Vec<&str> = projected.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["from any agent", "triage internal"]);
    }

    #[tokio::test]
    async fn truncation_keeps_tool_results_with_their_call() {
        let history = history();
        for i in 0..4 {
            history
                .push(ModelMessage::user("triage", format!("msg{}", i), ExecutionMode::User))
                .await;
        }
        let call = ToolCall {
            id: "call-1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "navigate".to_string(),
                arguments: serde_json::Value::Null,
            },
        };
        history
            .push(ModelMessage::assistant("triage", "").with_tool_calls(vec![call]))
            .await;
        history
            .push(ModelMessage::tool_output("triage", "call-1", "done"))
            .await;

        // keep=2 would start at the tool result; the window must extend
        // backwards to the assistant message carrying the call
        let projected = history.to_array_for_agent("", &[], 2, None).await;
        assert_eq!(projected.len(), 2);
        assert!(!projected[0].tool_calls.is_empty());
        assert_eq!(projected[1].role, MessageRole::Tool);
    }

    #[tokio::test]
    async fn preamble_contains_prompt_then_system_lines() {
        let history = history();
        history
            .push(ModelMessage::user("triage", "q", ExecutionMode::User))
            .await;

        let projected = history
            .to_array_for_agent("main prompt", &["line one".to_string()], 25, None)
            .await;
        assert_eq!(projected[0].role, MessageRole::System);
        assert_eq!(projected[0].content, "main prompt");
        assert_eq!(projected[1].content, "line one");
        assert_eq!(projected[2].content, "q");
    }
}
