//! The per-(client, agent) turn engine.
//!
//! One [`ClientAgent`] owns everything a single agent needs to run turns
//! for a single client: its schema, its completion backend, its resolved
//! tools, its history and six single-slot signals. A turn is one
//! [`execute`](ClientAgent::execute) cycle:
//!
//! ```text
//! execute(incoming, mode)
//!   ├─ history.push(user)
//!   ├─ completion.get_completion(projection + tool schemas)  → map()
//!   ├─ tool_calls?
//!   │   ├─ yes: normalize ids, truncate to max_tool_calls,
//!   │   │       push assistant message, then per call (in order):
//!   │   │         validate → spawn call (never awaited) →
//!   │   │         race { tool_commit | agent_change | tool_stop
//!   │   │                | rescue | tool_error } + watchdog
//!   │   └─ no:  transform → validate → emit output
//!   └─ any failure inside the turn → rescue → one placeholder output
//! ```
//!
//! The dispatcher deliberately never awaits a tool body: tools may drive
//! `execute` or commits on the same client, which must not deadlock the
//! turn. A spawned monitor converts tool errors and panics into the
//! `tool_error` signal.
//!
//! Rescue (`resurrect`) recovers from unusable model output with one of
//! three configured strategies (flush / recomplete / custom); every rescue
//! path publishes exactly one output for the turn.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::config::{RescueStrategy, SharedConfig};
use crate::swarm::context::{with_execution_context, ExecutionContext};
use crate::swarm::error::SwarmError;
use crate::swarm::history::ClientHistory;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::schema::{AgentSchema, CompletionSchema, ToolRequest, ToolSchema};
use crate::swarm::signal::{Signal, SignalWaiter};
use crate::swarm::types::{
    AgentName, ClientId, CompletionArgs, ExecutionMode, ModelMessage, SwarmName, ToolCall,
    ToolCallId, ToolFunction,
};

/// The six turn-coordination signals of one agent instance.
pub struct AgentSignals {
    /// The swarm switched the active agent away from this one.
    pub agent_change: Signal<()>,
    /// A tool committed its output; the dispatcher may proceed.
    pub tool_commit: Signal<()>,
    /// A tool body returned an error or panicked.
    pub tool_error: Signal<String>,
    /// A tool asked the chain to stop.
    pub tool_stop: Signal<()>,
    /// A rescue pass ran.
    pub rescue: Signal<()>,
    /// The turn's final output.
    pub output: Signal<String>,
}

impl AgentSignals {
    fn new() -> Self {
        Self {
            agent_change: Signal::new(),
            tool_commit: Signal::new(),
            tool_error: Signal::new(),
            tool_stop: Signal::new(),
            rescue: Signal::new(),
            output: Signal::new(),
        }
    }
}

enum ToolOutcome {
    Committed,
    AgentChanged,
    Stopped,
    Rescued,
    Errored(String),
}

pub struct ClientAgent {
    client_id: ClientId,
    swarm_name: SwarmName,
    schema: Arc<AgentSchema>,
    completion: Arc<CompletionSchema>,
    tools: Vec<Arc<ToolSchema>>,
    history: Arc<ClientHistory>,
    bus: EventBus,
    logger: SwarmLogger,
    config: SharedConfig,
    signals: Arc<AgentSignals>,
    turn_lock: Mutex<()>,
    swarm_handle: crate::swarm::facade::WeakSwarmHandle,
}

impl ClientAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        schema: Arc<AgentSchema>,
        completion: Arc<CompletionSchema>,
        tools: Vec<Arc<ToolSchema>>,
        history: Arc<ClientHistory>,
        bus: EventBus,
        logger: SwarmLogger,
        config: SharedConfig,
        swarm_handle: crate::swarm::facade::WeakSwarmHandle,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            swarm_name: swarm_name.into(),
            schema,
            completion,
            tools,
            history,
            bus,
            logger,
            config,
            signals: Arc::new(AgentSignals::new()),
            turn_lock: Mutex::new(()),
            swarm_handle,
        }
    }

    pub fn agent_name(&self) -> &AgentName {
        &self.schema.agent_name
    }

    pub fn history(&self) -> &Arc<ClientHistory> {
        &self.history
    }

    /// Register interest in this agent's next output.
    pub fn output_waiter(&self) -> SignalWaiter<String> {
        self.signals.output.subscribe()
    }

    /// Resolve with the next value published to the output signal.
    pub async fn wait_for_output(&self) -> String {
        self.signals.output.wait().await
    }

    async fn emit_agent_event(&self, kind: &str, input: serde_json::Value) {
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::AgentBus, self.client_id.clone(), kind)
                    .with_input(input)
                    .with_context(EventContext {
                        agent_name: Some(self.schema.agent_name.clone()),
                        swarm_name: Some(self.swarm_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }

    // ── Turn execution ────────────────────────────────────────────────────

    /// Run one turn. Serialized per agent; never returns an error unless
    /// rescue itself failed.
    pub async fn execute(
        self: &Arc<Self>,
        incoming: &str,
        mode: ExecutionMode,
    ) -> Result<(), SwarmError> {
        let _turn = self.turn_lock.lock().await;
        let ctx = ExecutionContext::new(self.client_id.clone());
        with_execution_context(ctx, self.execute_inner(incoming, mode)).await
    }

    async fn execute_inner(
        self: &Arc<Self>,
        incoming: &str,
        mode: ExecutionMode,
    ) -> Result<(), SwarmError> {
        let incoming = incoming.trim();
        if let Some(on_execute) = &self.schema.callbacks.on_execute {
            on_execute(&self.client_id, &self.schema.agent_name, incoming, mode);
        }
        self.logger.debug(
            &self.client_id,
            "agent execute",
            serde_json::json!({"agent": self.schema.agent_name, "mode": mode}),
        );
        self.history
            .push(ModelMessage::user(self.schema.agent_name.clone(), incoming, mode))
            .await;
        self.emit_agent_event("execute", serde_json::json!(incoming)).await;

        let message = match self.get_completion(mode).await {
            Ok(message) => self.apply_map(message),
            Err(error) => {
                self.logger.log(
                    &self.client_id,
                    "completion failed",
                    serde_json::json!({"agent": self.schema.agent_name, "error": error.to_string()}),
                );
                return self.rescue_and_emit(mode, "completion failed").await;
            }
        };

        if message.tool_calls.is_empty() {
            self.emit_output(mode, message.content).await
        } else {
            self.dispatch_tool_calls(message, mode).await
        }
    }

    /// Stateless completion pass: reads history, never writes it. Returns
    /// the validated transformed output, or the empty string when the
    /// model produced tool calls or invalid output.
    pub async fn run(&self, incoming: &str) -> Result<String, SwarmError> {
        self.emit_agent_event("run", serde_json::json!(incoming)).await;

        let mut args = self.completion_args(ExecutionMode::User).await;
        args.messages.push(ModelMessage::user(
            self.schema.agent_name.clone(),
            incoming.trim(),
            ExecutionMode::User,
        ));
        let message = self
            .completion
            .provider
            .get_completion(args)
            .await
            .map_err(|e| SwarmError::ExecutionFailed(format!("completion: {}", e)))?;
        let message = self.apply_map(message);

        if !message.tool_calls.is_empty() {
            return Ok(String::new());
        }
        let candidate = self.apply_transform(message.content);
        match self.validate_output(&candidate) {
            None => Ok(candidate),
            Some(_) => Ok(String::new()),
        }
    }

    async fn completion_args(&self, mode: ExecutionMode) -> CompletionArgs {
        let (keep, default_system, history_filter) = {
            let config = self.config.read().expect("config lock poisoned");
            (
                config.keep_messages,
                config.default_system_prompt.clone(),
                config.history_filter.clone(),
            )
        };
        let mut system = Vec::new();
        if let Some(line) = default_system {
            system.push(line);
        }
        system.extend(self.schema.system.iter().cloned());

        let messages = self
            .history
            .to_array_for_agent(&self.schema.prompt, &system, keep, history_filter.as_ref())
            .await;
        let tools: Vec<ToolFunction> = self
            .tools
            .iter()
            .map(|tool| tool.function.clone())
            .collect();
        CompletionArgs {
            client_id: self.client_id.clone(),
            agent_name: self.schema.agent_name.clone(),
            mode,
            messages,
            tools,
        }
    }

    async fn get_completion(
        &self,
        mode: ExecutionMode,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        let args = self.completion_args(mode).await;
        self.completion.provider.get_completion(args).await
    }

    fn apply_map(&self, message: ModelMessage) -> ModelMessage {
        if let Some(map) = &self.schema.map {
            return map(message);
        }
        let fallback = {
            let config = self.config.read().expect("config lock poisoned");
            config.default_output_map.clone()
        };
        match fallback {
            Some(map) => map(message),
            None => message,
        }
    }

    fn apply_transform(&self, raw: String) -> String {
        if let Some(transform) = &self.schema.transform {
            return transform(raw, &self.client_id, &self.schema.agent_name);
        }
        let fallback = {
            let config = self.config.read().expect("config lock poisoned");
            config.default_output_transform.clone()
        };
        match fallback {
            Some(transform) => transform(raw, &self.client_id, &self.schema.agent_name),
            None => raw.trim().to_string(),
        }
    }

    /// `None` accepts; `Some(reason)` rejects. Without a schema or
    /// configured validator the default rejects empty output and
    /// tool-call remnants.
    fn validate_output(&self, candidate: &str) -> Option<String> {
        if let Some(validate) = &self.schema.validate {
            return validate(candidate);
        }
        let configured = {
            let config = self.config.read().expect("config lock poisoned");
            config.default_validation.clone()
        };
        if let Some(validate) = configured {
            return validate(candidate);
        }
        if candidate.is_empty() {
            return Some("empty output".to_string());
        }
        let (tags, symbols) = {
            let config = self.config.read().expect("config lock poisoned");
            (config.disallowed_tags.clone(), config.disallowed_symbols.clone())
        };
        let lowered = candidate.to_lowercase();
        for tag in &tags {
            if lowered.contains(tag.as_str()) {
                return Some(format!("output contains disallowed tag {}", tag));
            }
        }
        for symbol in &symbols {
            if candidate.contains(symbol.as_str()) {
                return Some(format!("output contains disallowed symbol {}", symbol));
            }
        }
        None
    }

    // ── Tool dispatch ─────────────────────────────────────────────────────

    async fn dispatch_tool_calls(
        self: &Arc<Self>,
        message: ModelMessage,
        mode: ExecutionMode,
    ) -> Result<(), SwarmError> {
        let mut calls: Vec<ToolCall> = message.tool_calls.clone();
        for call in &mut calls {
            call.ensure_normalized();
        }

        // history keeps the full call list; truncation applies to dispatch only
        self.history
            .push(
                ModelMessage::assistant(self.schema.agent_name.clone(), message.content.clone())
                    .with_tool_calls(calls.clone()),
            )
            .await;

        let mut dispatch = calls.clone();
        if let Some(max) = self.schema.max_tool_calls {
            dispatch.truncate(max);
        }

        let total = dispatch.len();
        for (index, call) in dispatch.iter().enumerate() {
            let Some(tool) = self
                .tools
                .iter()
                .find(|tool| tool.function.name == call.function.name)
                .cloned()
            else {
                self.logger.log(
                    &self.client_id,
                    "tool lookup failed",
                    serde_json::json!({"agent": self.schema.agent_name, "tool": call.function.name}),
                );
                return self.rescue_and_emit(mode, "no target function").await;
            };

            let Some(swarm) = self.swarm_handle.upgrade() else {
                return Err(SwarmError::ExecutionFailed(
                    "runtime disposed while dispatching tools".to_string(),
                ));
            };
            let request = ToolRequest {
                tool_id: call.id.clone(),
                client_id: self.client_id.clone(),
                agent_name: self.schema.agent_name.clone(),
                params: call.function.arguments.clone(),
                tool_calls: dispatch.clone(),
                is_last: index + 1 == total,
                swarm,
            };

            let valid = tool.handler.validate(&request).await;
            if let Some(on_validate) = &tool.callbacks.on_validate {
                on_validate(&request, valid);
            }
            if !valid {
                return self.rescue_and_emit(mode, "validation failed").await;
            }

            if let Some(on_before_call) = &tool.callbacks.on_before_call {
                on_before_call(&request);
            }

            let outcome = self.run_tool_race(&tool, &request).await;

            if let Some(on_after_call) = &tool.callbacks.on_after_call {
                on_after_call(&request);
            }

            match outcome {
                ToolOutcome::Committed => continue,
                ToolOutcome::AgentChanged | ToolOutcome::Stopped | ToolOutcome::Rescued => {
                    self.after_tool_calls(&dispatch).await;
                    return Ok(());
                }
                ToolOutcome::Errored(error) => {
                    if let Some(on_tool_error) = &self.schema.callbacks.on_tool_error {
                        on_tool_error(
                            &self.client_id,
                            &self.schema.agent_name,
                            &tool.tool_name,
                            &error,
                        );
                    }
                    self.emit_agent_event("tool-error", serde_json::json!({"tool": tool.tool_name, "error": error}))
                        .await;
                    return self.rescue_and_emit(mode, "function call failed").await;
                }
            }
        }

        self.after_tool_calls(&dispatch).await;
        Ok(())
    }

    async fn after_tool_calls(&self, calls: &[ToolCall]) {
        if let Some(on_after_tool_calls) = &self.schema.callbacks.on_after_tool_calls {
            on_after_tool_calls(&self.client_id, &self.schema.agent_name, calls);
        }
        self.emit_agent_event(
            "tool-calls-done",
            serde_json::json!({"count": calls.len()}),
        )
        .await;
    }

    /// Start `tool.call` detached and race the five turn signals. The
    /// watchdog fires a warning after the configured silence window but
    /// never cancels the tool.
    async fn run_tool_race(self: &Arc<Self>, tool: &Arc<ToolSchema>, request: &ToolRequest) -> ToolOutcome {
        let mut change = self.signals.agent_change.subscribe();
        let mut commit = self.signals.tool_commit.subscribe();
        let mut error = self.signals.tool_error.subscribe();
        let mut stop = self.signals.tool_stop.subscribe();
        let mut rescue = self.signals.rescue.subscribe();

        let signals = Arc::clone(&self.signals);
        let handler = Arc::clone(&tool.handler);
        let on_call_error = tool.callbacks.on_call_error.clone();
        let task_request = request.clone();
        let monitor_request = request.clone();
        tokio::spawn(async move {
            let body = tokio::spawn(async move { handler.call(task_request).await });
            match body.await {
                Ok(Ok(())) => {}
                Ok(Err(call_error)) => {
                    let text = call_error.to_string();
                    if let Some(on_call_error) = &on_call_error {
                        on_call_error(&monitor_request, &text);
                    }
                    signals.tool_error.publish(text);
                }
                Err(join_error) => {
                    let text = if join_error.is_panic() {
                        "tool call panicked".to_string()
                    } else {
                        "tool call aborted".to_string()
                    };
                    if let Some(on_call_error) = &on_call_error {
                        on_call_error(&monitor_request, &text);
                    }
                    signals.tool_error.publish(text);
                }
            }
        });

        let watchdog_secs = {
            let config = self.config.read().expect("config lock poisoned");
            config.tool_watchdog_secs
        };
        let watchdog = std::time::Duration::from_secs(watchdog_secs.max(1));

        loop {
            tokio::select! {
                _ = commit.recv() => return ToolOutcome::Committed,
                _ = change.recv() => return ToolOutcome::AgentChanged,
                _ = stop.recv() => return ToolOutcome::Stopped,
                _ = rescue.recv() => return ToolOutcome::Rescued,
                text = error.recv() => return ToolOutcome::Errored(text),
                _ = tokio::time::sleep(watchdog) => {
                    log::warn!(
                        "tool {} for client {} has produced no signal in {}s",
                        tool.tool_name,
                        self.client_id,
                        watchdog_secs
                    );
                    self.logger.log(
                        &self.client_id,
                        "tool watchdog",
                        serde_json::json!({"tool": tool.tool_name, "seconds": watchdog_secs}),
                    );
                }
            }
        }
    }

    // ── Output emission & rescue ──────────────────────────────────────────

    async fn publish_output(&self, output: &str) {
        if let Some(on_output) = &self.schema.callbacks.on_output {
            on_output(&self.client_id, &self.schema.agent_name, output);
        }
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::AgentBus, self.client_id.clone(), "emit-output")
                    .with_output(serde_json::json!(output))
                    .with_context(EventContext {
                        agent_name: Some(self.schema.agent_name.clone()),
                        swarm_name: Some(self.swarm_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
        self.signals.output.publish(output.to_string());
    }

    /// Transform, validate and publish `raw`. An invalid candidate gets
    /// exactly one rescue pass; a second failure is fatal.
    async fn emit_output(&self, mode: ExecutionMode, raw: String) -> Result<(), SwarmError> {
        let candidate = self.apply_transform(raw);
        match self.validate_output(&candidate) {
            None => {
                self.publish_output(&candidate).await;
                Ok(())
            }
            Some(reason) => {
                self.logger.log(
                    &self.client_id,
                    "invalid model output",
                    serde_json::json!({"agent": self.schema.agent_name, "reason": reason}),
                );
                let rescued = self.resurrect_model(mode, "invalid model output").await?;
                let candidate = self.apply_transform(rescued);
                match self.validate_output(&candidate) {
                    None => {
                        self.publish_output(&candidate).await;
                        Ok(())
                    }
                    Some(validation) => Err(SwarmError::RescueFailed {
                        client_id: self.client_id.clone(),
                        agent_name: self.schema.agent_name.clone(),
                        validation,
                    }),
                }
            }
        }
    }

    /// Rescue the turn for `reason` and publish the rescued output.
    async fn rescue_and_emit(&self, mode: ExecutionMode, reason: &str) -> Result<(), SwarmError> {
        let rescued = self.resurrect_model(mode, reason).await?;
        self.publish_output(&rescued).await;
        Ok(())
    }

    /// The three-strategy model rescue. Fires the rescue signal and the
    /// `on_resurrect` callback, then produces the replacement output.
    async fn resurrect_model(&self, mode: ExecutionMode, reason: &str) -> Result<String, SwarmError> {
        if let Some(on_resurrect) = &self.schema.callbacks.on_resurrect {
            on_resurrect(&self.client_id, &self.schema.agent_name, reason);
        }
        self.emit_agent_event("resurrect", serde_json::json!(reason)).await;
        self.signals.rescue.publish(());

        let (strategy, flush_prompt, recomplete_prompt, custom, placeholder) = {
            let config = self.config.read().expect("config lock poisoned");
            (
                config.rescue_strategy,
                config.rescue_flush_prompt.clone(),
                config.rescue_recomplete_prompt.clone(),
                config.rescue_custom.clone(),
                config.random_placeholder(),
            )
        };

        match strategy {
            RescueStrategy::Flush => {
                self.history
                    .push(ModelMessage::resque(self.schema.agent_name.clone(), reason))
                    .await;
                self.history
                    .push(ModelMessage::user(
                        self.schema.agent_name.clone(),
                        flush_prompt,
                        ExecutionMode::Tool,
                    ))
                    .await;
                Ok(placeholder)
            }
            RescueStrategy::Recomplete => {
                self.history
                    .push(ModelMessage::resque(self.schema.agent_name.clone(), reason))
                    .await;
                self.history
                    .push(ModelMessage::user(
                        self.schema.agent_name.clone(),
                        recomplete_prompt,
                        ExecutionMode::Tool,
                    ))
                    .await;
                let message = self.get_completion(mode).await.map_err(|e| {
                    SwarmError::RescueFailed {
                        client_id: self.client_id.clone(),
                        agent_name: self.schema.agent_name.clone(),
                        validation: format!("recompletion failed: {}", e),
                    }
                })?;
                let message = self.apply_map(message);
                Ok(self.apply_transform(message.content))
            }
            RescueStrategy::Custom => {
                let Some(custom) = custom else {
                    return Err(SwarmError::RescueFailed {
                        client_id: self.client_id.clone(),
                        agent_name: self.schema.agent_name.clone(),
                        validation: "custom rescue strategy configured without a callback"
                            .to_string(),
                    });
                };
                let message = custom(self.client_id.clone(), self.schema.agent_name.clone())
                    .await
                    .map_err(|e| SwarmError::RescueFailed {
                        client_id: self.client_id.clone(),
                        agent_name: self.schema.agent_name.clone(),
                        validation: format!("custom rescue failed: {}", e),
                    })?;
                Ok(message.content)
            }
        }
    }

    // ── Commits ───────────────────────────────────────────────────────────

    /// Append a user message without triggering a completion.
    pub async fn commit_user_message(&self, content: &str, mode: ExecutionMode) {
        if let Some(on_user_message) = &self.schema.callbacks.on_user_message {
            on_user_message(&self.client_id, &self.schema.agent_name, content);
        }
        self.history
            .push(ModelMessage::user(self.schema.agent_name.clone(), content.trim(), mode))
            .await;
        self.emit_agent_event("commit-user-message", serde_json::json!(content)).await;
    }

    /// Append an assistant message without triggering a completion.
    pub async fn commit_assistant_message(&self, content: &str) {
        if let Some(on_assistant_message) = &self.schema.callbacks.on_assistant_message {
            on_assistant_message(&self.client_id, &self.schema.agent_name, content);
        }
        self.history
            .push(ModelMessage::assistant(self.schema.agent_name.clone(), content))
            .await;
        self.emit_agent_event("commit-assistant-message", serde_json::json!(content))
            .await;
    }

    /// Append a system message.
    pub async fn commit_system_message(&self, content: &str) {
        if let Some(on_system_message) = &self.schema.callbacks.on_system_message {
            on_system_message(&self.client_id, &self.schema.agent_name, content);
        }
        self.history
            .push(ModelMessage::system(self.schema.agent_name.clone(), content))
            .await;
        self.emit_agent_event("commit-system-message", serde_json::json!(content)).await;
    }

    /// Append a tool result and release the dispatcher for the next call.
    pub async fn commit_tool_output(&self, tool_id: &ToolCallId, content: &str) {
        self.history
            .push(ModelMessage::tool_output(
                self.schema.agent_name.clone(),
                tool_id.clone(),
                content,
            ))
            .await;
        self.emit_agent_event(
            "commit-tool-output",
            serde_json::json!({"tool_id": tool_id, "content": content}),
        )
        .await;
        self.signals.tool_commit.publish(());
    }

    /// Append a flush marker: the per-agent projection restarts after it.
    pub async fn commit_flush(&self) {
        if let Some(on_flush) = &self.schema.callbacks.on_flush {
            on_flush(&self.client_id, &self.schema.agent_name);
        }
        self.history
            .push(ModelMessage::flush(self.schema.agent_name.clone()))
            .await;
        self.emit_agent_event("commit-flush", serde_json::Value::Null).await;
    }

    /// Signal that the active agent changed; a running tool chain halts.
    pub async fn commit_agent_change(&self) {
        self.emit_agent_event("commit-agent-change", serde_json::Value::Null).await;
        self.signals.agent_change.publish(());
    }

    /// Halt the running tool chain without changing agents.
    pub async fn commit_stop_tools(&self) {
        self.emit_agent_event("commit-stop-tools", serde_json::Value::Null).await;
        self.signals.tool_stop.publish(());
    }

    pub async fn dispose(&self) {
        self.emit_agent_event("dispose", serde_json::Value::Null).await;
        self.history.dispose().await;
    }
}
