use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use agent_swarm::{
    AgentSchema, AgentSwarm, CompletionArgs, CompletionProvider, CompletionSchema, FunctionCall,
    MessageRole, ModelMessage, SwarmCallbacks, SwarmError, SwarmSchema, ToolCall, ToolFunction,
    ToolHandler, ToolRequest, ToolSchema,
};
use async_trait::async_trait;

/// Shared support-desk completion: routing keywords become `navigate`
/// tool calls, everything else is answered in plain text.
struct RoutingCompletion;

#[async_trait]
impl CompletionProvider for RoutingCompletion {
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
        if last_user == "sales" || last_user == "refund" {
            let call = ToolCall {
                id: String::new(),
                kind: String::new(),
                function: FunctionCall {
                    name: "navigate".to_string(),
                    arguments: serde_json::json!({"to": last_user}),
                },
            };
            return Ok(ModelMessage::assistant(args.agent_name, "").with_tool_calls(vec![call]));
        }
        Ok(ModelMessage::assistant(
            args.agent_name.clone(),
            format!("{} says: {}", args.agent_name, last_user),
        ))
    }
}

/// Switches the active agent and drives the welcome turn on the target.
struct NavigateTool;

#[async_trait]
impl ToolHandler for NavigateTool {
    async fn call(&self, request: ToolRequest) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let target = request.params["to"].as_str().unwrap_or_default().to_string();
        request.swarm.change_agent(&target, &request.client_id).await?;
        request
            .swarm
            .execute("Navigation complete", &request.client_id, &target)
            .await?;
        Ok(())
    }
}

/// Halts the tool chain, then produces the turn's answer itself.
struct StoppingTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for StoppingTool {
    async fn call(&self, request: ToolRequest) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        request
            .swarm
            .commit_stop_tools(&request.client_id, &request.agent_name)
            .await?;
        request.swarm.execute_force("stopped", &request.client_id).await?;
        Ok(())
    }
}

fn navigate_function() -> ToolFunction {
    ToolFunction {
        name: "navigate".to_string(),
        description: "Transfers the conversation to another agent.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {"to": {"type": "string"}},
            "required": ["to"]
        }),
    }
}

fn support_desk(on_agent_changed: Option<Arc<AtomicBool>>) -> AgentSwarm {
    let _ = env_logger::builder().is_test(true).try_init();
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new("mock", Arc::new(RoutingCompletion)));
    swarm.add_tool(ToolSchema::new("navigate", navigate_function(), Arc::new(NavigateTool)));
    for agent in ["triage", "sales", "refund"] {
        swarm.add_agent(
            AgentSchema::new(agent, "mock", "You handle the desk.").with_tools(["navigate"]),
        );
    }
    let mut schema = SwarmSchema::new("support", "triage", ["triage", "sales", "refund"]);
    if let Some(flag) = on_agent_changed {
        schema = schema.with_callbacks(SwarmCallbacks {
            on_agent_changed: Some(Arc::new(move |_client, _agent, _swarm| {
                flag.store(true, Ordering::SeqCst);
            })),
        });
    }
    swarm.add_swarm(schema);
    swarm
}

#[tokio::test]
async fn tool_driven_navigation_switches_agent_and_answers_from_target() {
    let swarm = support_desk(None);

    let session = swarm.session("c1", "support").await.unwrap();
    let output = session.complete("sales").await.unwrap();

    assert_eq!(swarm.get_agent_name("c1").await.unwrap(), "sales");
    assert_eq!(output, "sales says: Navigation complete");
}

#[tokio::test]
async fn change_to_prev_agent_pops_to_default_on_empty_stack() {
    let changed = Arc::new(AtomicBool::new(false));
    let swarm = support_desk(Some(Arc::clone(&changed)));

    let _session = swarm.session("c1", "support").await.unwrap();
    let agent = swarm.change_to_prev_agent("c1").await.unwrap();

    assert_eq!(agent, "triage");
    assert_eq!(swarm.get_agent_name("c1").await.unwrap(), "triage");
    assert!(changed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn navigation_stack_round_trips() {
    let swarm = support_desk(None);
    let _session = swarm.session("c1", "support").await.unwrap();

    swarm.change_agent("sales", "c1").await.unwrap();
    assert_eq!(swarm.get_agent_name("c1").await.unwrap(), "sales");

    swarm.change_agent("refund", "c1").await.unwrap();
    assert_eq!(swarm.get_agent_name("c1").await.unwrap(), "refund");

    let popped = swarm.change_to_prev_agent("c1").await.unwrap();
    assert_eq!(popped, "sales");
    assert_eq!(swarm.get_agent_name("c1").await.unwrap(), "sales");

    let popped = swarm.change_to_prev_agent("c1").await.unwrap();
    assert_eq!(popped, "triage");
}

#[tokio::test]
async fn change_agent_rejects_agents_outside_the_swarm() {
    let swarm = support_desk(None);
    swarm.add_agent(AgentSchema::new("intruder", "mock", "not listed"));

    let _session = swarm.session("c1", "support").await.unwrap();
    let error = swarm.change_agent("intruder", "c1").await.unwrap_err();
    assert!(matches!(error, SwarmError::AgentNotInSwarm { .. }));
}

#[tokio::test]
async fn commit_stop_tools_halts_remaining_dispatches() {
    struct TripleToolCompletion;
    #[async_trait]
    impl CompletionProvider for TripleToolCompletion {
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
            if last_user == "stopped" {
                return Ok(ModelMessage::assistant(args.agent_name, "chain stopped"));
            }
            let calls = (0..3)
                .map(|_| ToolCall {
                    id: String::new(),
                    kind: String::new(),
                    function: FunctionCall {
                        name: "stopper".to_string(),
                        arguments: serde_json::Value::Null,
                    },
                })
                .collect();
            Ok(ModelMessage::assistant(args.agent_name, "").with_tool_calls(calls))
        }
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new("mock", Arc::new(TripleToolCompletion)));
    swarm.add_tool(ToolSchema::new(
        "stopper",
        ToolFunction {
            name: "stopper".to_string(),
            description: "Stops the chain.".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        },
        Arc::new(StoppingTool {
            invocations: Arc::clone(&invocations),
        }),
    ));
    swarm.add_agent(AgentSchema::new("triage", "mock", "route").with_tools(["stopper"]));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));

    let output = swarm.complete("go", "c1", "support").await.unwrap();
    assert_eq!(output, "chain stopped");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_agent_guard_turns_commits_into_noops() {
    let swarm = support_desk(None);
    let _session = swarm.session("c1", "support").await.unwrap();

    swarm.change_agent("sales", "c1").await.unwrap();

    // a commit on behalf of the superseded agent is silently dropped
    swarm
        .commit_user_message("stale", agent_swarm::ExecutionMode::Tool, "c1", "triage")
        .await
        .unwrap();
    assert!(swarm.get_raw_history("c1").await.unwrap().is_empty());

    // the force variant lands on the now-active agent
    swarm
        .commit_user_message_force("fresh", agent_swarm::ExecutionMode::Tool, "c1")
        .await
        .unwrap();
    let raw = swarm.get_raw_history("c1").await.unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].content, "fresh");
}
