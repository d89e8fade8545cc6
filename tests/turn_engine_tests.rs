use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_swarm::{
    listener, AgentSchema, AgentSwarm, CompletionArgs, CompletionProvider, CompletionSchema,
    ConfigUpdate, FunctionCall, MessageRole, ModelMessage, RescueStrategy, SwarmConfig,
    SwarmSchema, ToolCall, ToolFunction, ToolHandler, ToolRequest, ToolSchema,
};
use async_trait::async_trait;

fn tool_call(name: &str) -> ToolCall {
    ToolCall {
        id: String::new(),
        kind: String::new(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: serde_json::Value::Null,
        },
    }
}

fn count_function() -> ToolFunction {
    ToolFunction {
        name: "count".to_string(),
        description: "Counts invocations.".to_string(),
        parameters: serde_json::json!({"type": "object", "properties": {}}),
    }
}

/// Replies with `n` tool calls named `tool` unless the last user message
/// is "done", in which case it answers in plain text.
struct ToolCallCompletion {
    tool: String,
    n: usize,
}

#[async_trait]
impl CompletionProvider for ToolCallCompletion {
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        let last_user = args
            .messages
            .iter()
            .rev()
            .find(|msg| msg.role == MessageRole::User)
            .map(|msg| msg.content.clone())
            .unwrap_or_default();
        if last_user == "done" {
            return Ok(ModelMessage::assistant(args.agent_name, "done reply"));
        }
        let calls = (0..self.n).map(|_| tool_call(&self.tool)).collect();
        Ok(ModelMessage::assistant(args.agent_name, "").with_tool_calls(calls))
    }
}

/// Fixed-content completion.
struct StaticCompletion {
    content: String,
}

#[async_trait]
impl CompletionProvider for StaticCompletion {
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        Ok(ModelMessage::assistant(args.agent_name, self.content.clone()))
    }
}

/// First reply is broken, every later reply is fine — exercises the
/// recomplete rescue strategy.
struct FlakyCompletion {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionProvider for FlakyCompletion {
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = if call == 0 { "{oops}" } else { "all good" };
        Ok(ModelMessage::assistant(args.agent_name, content))
    }
}

/// Counts invocations, commits its output, and drives a follow-up turn
/// from the last call of the chain so the session produces an answer.
struct CountingTool {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for CountingTool {
    async fn call(&self, request: ToolRequest) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        request
            .swarm
            .commit_tool_output(&request.tool_id, "counted", &request.client_id, &request.agent_name)
            .await?;
        if request.is_last {
            request.swarm.execute_force("done", &request.client_id).await?;
        }
        Ok(())
    }
}

struct RejectingTool;

#[async_trait]
impl ToolHandler for RejectingTool {
    async fn call(&self, _request: ToolRequest) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        panic!("a rejected tool must never be dispatched");
    }

    async fn validate(&self, _request: &ToolRequest) -> bool {
        false
    }
}

struct FailingTool;

#[async_trait]
impl ToolHandler for FailingTool {
    async fn call(&self, _request: ToolRequest) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("boom".into())
    }
}

fn placeholders() -> Vec<String> {
    SwarmConfig::default().empty_output_placeholders
}

#[tokio::test]
async fn rescue_flush_appends_markers_and_emits_placeholder() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(StaticCompletion {
            content: "model-output".to_string(),
        }),
    ));
    swarm.add_agent(
        AgentSchema::new("triage", "mock", "route").with_validate(|output| {
            if output == "model-output" {
                Some("bad".to_string())
            } else {
                None
            }
        }),
    );
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let rescues = Arc::new(AtomicUsize::new(0));
    {
        let rescues = Arc::clone(&rescues);
        swarm.listen_agent_event(
            "*",
            listener(move |event| {
                let rescues = Arc::clone(&rescues);
                async move {
                    if event.kind == "resurrect" {
                        rescues.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
    }

    let output = swarm.complete("hello", "c1", "support").await.unwrap();
    assert!(placeholders().contains(&output));
    assert_eq!(rescues.load(Ordering::SeqCst), 1);

    let raw = swarm.get_raw_history("c1").await.unwrap();
    assert!(raw.iter().any(|msg| msg.role == MessageRole::Resque));
    let flush_prompt = SwarmConfig::default().rescue_flush_prompt;
    assert!(raw
        .iter()
        .any(|msg| msg.role == MessageRole::User && msg.content == flush_prompt));
}

#[tokio::test]
async fn rescue_recomplete_asks_the_model_again() {
    let swarm = AgentSwarm::new();
    swarm.set_config(ConfigUpdate::new().rescue_strategy(RescueStrategy::Recomplete));
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(FlakyCompletion {
            calls: AtomicUsize::new(0),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route"));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    // "{oops}" trips the default output validation, recompletion heals it
    let output = swarm.complete("hello", "c1", "support").await.unwrap();
    assert_eq!(output, "all good");

    let raw = swarm.get_raw_history("c1").await.unwrap();
    assert!(raw.iter().any(|msg| msg.role == MessageRole::Resque));
    let recomplete_prompt = SwarmConfig::default().rescue_recomplete_prompt;
    assert!(raw
        .iter()
        .any(|msg| msg.role == MessageRole::User && msg.content == recomplete_prompt));
}

#[tokio::test]
async fn tool_calls_are_truncated_to_max_tool_calls() {
    let count = Arc::new(AtomicUsize::new(0));

    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(ToolCallCompletion {
            tool: "count".to_string(),
            n: 5,
        }),
    ));
    swarm.add_tool(ToolSchema::new(
        "count",
        count_function(),
        Arc::new(CountingTool {
            count: Arc::clone(&count),
        }),
    ));
    swarm.add_agent(
        AgentSchema::new("triage", "mock", "route")
            .with_tools(["count"])
            .with_max_tool_calls(2),
    );
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert_eq!(output, "done reply");
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // the assistant message keeps the full, untruncated call list
    let raw = swarm.get_raw_history("c1").await.unwrap();
    let assistant = raw
        .iter()
        .find(|msg| msg.role == MessageRole::Assistant && !msg.tool_calls.is_empty())
        .unwrap();
    assert_eq!(assistant.tool_calls.len(), 5);
    for call in &assistant.tool_calls {
        assert!(!call.id.is_empty());
        assert_eq!(call.kind, "function");
    }
}

#[tokio::test]
async fn missing_tool_rescues_without_dispatching_later_calls() {
    let count = Arc::new(AtomicUsize::new(0));

    let swarm = AgentSwarm::new();
    // first call targets a function nobody registered
    struct MixedCompletion;
    #[async_trait]
    impl CompletionProvider for MixedCompletion {
        async fn get_completion(
            &self,
            args: CompletionArgs,
        ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
            Ok(ModelMessage::assistant(args.agent_name, "").with_tool_calls(vec![
                tool_call("missing"),
                tool_call("count"),
                tool_call("count"),
            ]))
        }
    }
    swarm.add_completion(CompletionSchema::new("mock", Arc::new(MixedCompletion)));
    swarm.add_tool(ToolSchema::new(
        "count",
        count_function(),
        Arc::new(CountingTool {
            count: Arc::clone(&count),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route").with_tools(["count"]));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let emitted = Arc::new(AtomicUsize::new(0));
    {
        let emitted = Arc::clone(&emitted);
        swarm.listen_agent_event(
            "c1",
            listener(move |event| {
                let emitted = Arc::clone(&emitted);
                async move {
                    if event.kind == "emit-output" {
                        emitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
    }

    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert!(placeholders().contains(&output));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(emitted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tool_validation_failure_rescues_the_turn() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(ToolCallCompletion {
            tool: "reject".to_string(),
            n: 1,
        }),
    ));
    swarm.add_tool(ToolSchema::new(
        "reject",
        ToolFunction {
            name: "reject".to_string(),
            description: "Always rejects.".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        },
        Arc::new(RejectingTool),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route").with_tools(["reject"]));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert!(placeholders().contains(&output));
}

#[tokio::test]
async fn tool_error_rescues_the_turn() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(ToolCallCompletion {
            tool: "fail".to_string(),
            n: 1,
        }),
    ));
    swarm.add_tool(ToolSchema::new(
        "fail",
        ToolFunction {
            name: "fail".to_string(),
            description: "Always fails.".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        },
        Arc::new(FailingTool),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route").with_tools(["fail"]));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert!(placeholders().contains(&output));
}

#[tokio::test]
async fn successful_turn_emits_exactly_one_output() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(StaticCompletion {
            content: "plain answer".to_string(),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route"));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let emitted = Arc::new(AtomicUsize::new(0));
    {
        let emitted = Arc::clone(&emitted);
        swarm.listen_agent_event(
            "c1",
            listener(move |event| {
                let emitted = Arc::clone(&emitted);
                async move {
                    if event.kind == "emit-output" {
                        emitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
    }

    let output = swarm.complete("hello", "c1", "support").await.unwrap();
    assert_eq!(output, "plain answer");
    assert_eq!(emitted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_returns_empty_string_when_model_wants_tools() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(ToolCallCompletion {
            tool: "count".to_string(),
            n: 1,
        }),
    ));
    swarm.add_tool(ToolSchema::new(
        "count",
        count_function(),
        Arc::new(CountingTool {
            count: Arc::new(AtomicUsize::new(0)),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route").with_tools(["count"]));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let _session = swarm.session("c1", "support").await.unwrap();
    assert_eq!(swarm.run("probe", "c1", "triage").await.unwrap(), "");

    // run never touches history
    assert!(swarm.get_raw_history("c1").await.unwrap().is_empty());
}

#[tokio::test]
async fn run_returns_validated_output_without_history_writes() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(StaticCompletion {
            content: "direct answer".to_string(),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route"));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let _session = swarm.session("c1", "support").await.unwrap();
    assert_eq!(swarm.run("probe", "c1", "triage").await.unwrap(), "direct answer");
    assert!(swarm.get_raw_history("c1").await.unwrap().is_empty());
}

#[tokio::test]
async fn agent_transform_shapes_the_emitted_output() {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new(
        "mock",
        Arc::new(StaticCompletion {
            content: "  shouty answer  ".to_string(),
        }),
    ));
    swarm.add_agent(
        AgentSchema::new("triage", "mock", "route")
            .with_transform(|raw, _client, _agent| raw.trim().to_uppercase()),
    );
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let output = swarm.complete("hello", "c1", "support").await.unwrap();
    assert_eq!(output, "SHOUTY ANSWER");
}

#[tokio::test]
async fn agent_map_normalizes_the_raw_completion() {
    // the model encodes its tool request as JSON prose; map() lifts it
    // into the canonical tool_calls shape
    let count = Arc::new(AtomicUsize::new(0));

    struct ProseToolCompletion;
    #[async_trait]
    impl CompletionProvider for ProseToolCompletion {
        async fn get_completion(
            &self,
            args: CompletionArgs,
        ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
            let last_user = args
                .messages
                .iter()
                .rev()
                .find(|msg| msg.role == MessageRole::User)
                .map(|msg| msg.content.clone())
                .unwrap_or_default();
            let content = if last_user == "done" { "done reply" } else { "CALL:count" };
            Ok(ModelMessage::assistant(args.agent_name, content))
        }
    }

    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new("mock", Arc::new(ProseToolCompletion)));
    swarm.add_tool(ToolSchema::new(
        "count",
        count_function(),
        Arc::new(CountingTool {
            count: Arc::clone(&count),
        }),
    ));
    swarm.add_agent(
        AgentSchema::new("triage", "mock", "route")
            .with_tools(["count"])
            .with_map(|mut message| {
                if let Some(name) = message.content.strip_prefix("CALL:") {
                    let name = name.to_string();
                    message.content.clear();
                    message.tool_calls = vec![ToolCall {
                        id: String::new(),
                        kind: String::new(),
                        function: FunctionCall {
                            name,
                            arguments: serde_json::Value::Null,
                        },
                    }];
                }
                message
            }),
    );
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    // the mapped message carries one tool call; "done" ends the follow-up
    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(output, "done reply");
}
