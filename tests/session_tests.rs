use std::sync::Arc;
use std::time::Duration;

use agent_swarm::{
    AgentSchema, AgentSwarm, CompletionArgs, CompletionProvider, CompletionSchema, MessageRole,
    ModelMessage, SessionMode, SwarmSchema,
};
use async_trait::async_trait;

/// Echoes the last user message back with an `echo ` prefix.
struct EchoCompletion;

#[async_trait]
impl CompletionProvider for EchoCompletion {
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
        Ok(ModelMessage::assistant(args.agent_name, format!("echo {}", last_user)))
    }
}

/// Returns `last_user + 1` after a small delay, mimicking a model that
/// counts. Used to prove per-client turn serialization.
struct IncrementCompletion;

#[async_trait]
impl CompletionProvider for IncrementCompletion {
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let last_user = args
            .messages
            .iter()
            .rev()
            .find(|msg| msg.role == MessageRole::User)
            .and_then(|msg| msg.content.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(ModelMessage::assistant(args.agent_name, (last_user + 1).to_string()))
    }
}

/// Echo with a long model latency, for cancellation tests.
struct SlowEchoCompletion;

#[async_trait]
impl CompletionProvider for SlowEchoCompletion {
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn std::error::Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(ModelMessage::assistant(args.agent_name, "late reply"))
    }
}

fn runtime(provider: Arc<dyn CompletionProvider>) -> AgentSwarm {
    let _ = env_logger::builder().is_test(true).try_init();
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new("mock", provider));
    swarm.add_agent(AgentSchema::new("triage", "mock", "You are the triage agent."));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));
    swarm
}

#[tokio::test]
async fn parallel_completes_on_one_client_serialize() {
    let swarm = runtime(Arc::new(IncrementCompletion));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let swarm = swarm.clone();
        handles.push(tokio::spawn(async move {
            swarm.complete("0", "c1", "support").await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "1");
    }

    // each turn's user/assistant pair is contiguous in the raw log
    let raw = swarm.get_raw_history("c1").await.unwrap();
    assert_eq!(raw.len(), 100);
    for pair in raw.chunks(2) {
        assert_eq!(pair[0].role, MessageRole::User);
        assert_eq!(pair[1].role, MessageRole::Assistant);
    }
}

#[tokio::test]
async fn queued_messages_preserve_order() {
    let swarm = runtime(Arc::new(EchoCompletion));

    let mut handles = Vec::new();
    for message in ["foo", "bar", "baz"] {
        let swarm = swarm.clone();
        handles.push(tokio::spawn(async move {
            swarm.complete(message, "c1", "support").await.unwrap()
        }));
        // stagger starts so queue order is deterministic
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let assistant: Vec<String> = swarm
        .get_assistant_history("c1")
        .await
        .unwrap()
        .into_iter()
        .map(|msg| msg.content)
        .collect();
    assert_eq!(assistant, ["echo foo", "echo bar", "echo baz"]);
}

#[tokio::test]
async fn cancel_output_short_circuits_wait() {
    let swarm = runtime(Arc::new(SlowEchoCompletion));

    let pending = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.complete("hello", "c1", "support").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    swarm.cancel_output("c1", "triage").await.unwrap();

    assert_eq!(pending.await.unwrap(), "");
}

#[tokio::test]
async fn raw_history_grows_monotonically() {
    let swarm = runtime(Arc::new(EchoCompletion));

    swarm.complete("first", "c1", "support").await.unwrap();
    let earlier = swarm.get_raw_history("c1").await.unwrap();

    swarm.complete("second", "c1", "support").await.unwrap();
    let later = swarm.get_raw_history("c1").await.unwrap();

    assert!(later.len() > earlier.len());
    assert_eq!(later[..earlier.len()], earlier[..]);
}

#[tokio::test]
async fn dispose_connection_evicts_memoized_instances() {
    let swarm = runtime(Arc::new(EchoCompletion));

    let session = swarm.session("c1", "support").await.unwrap();
    session.complete("hello").await.unwrap();
    assert!(!swarm.get_raw_history("c1").await.unwrap().is_empty());

    session.dispose().await.unwrap();
    assert!(swarm.get_raw_history("c1").await.is_err());

    // a fresh attach builds new instances with empty history
    let _session = swarm.session("c1", "support").await.unwrap();
    assert!(swarm.get_raw_history("c1").await.unwrap().is_empty());
}

#[tokio::test]
async fn session_mode_is_recorded_per_client() {
    let swarm = runtime(Arc::new(EchoCompletion));

    let _session = swarm.session("c1", "support").await.unwrap();
    assert_eq!(swarm.get_session_mode("c1").unwrap(), SessionMode::Session);

    swarm.complete("hi", "c2", "support").await.unwrap();
    assert_eq!(swarm.get_session_mode("c2").unwrap(), SessionMode::Complete);

    assert!(swarm.get_session_mode("c3").is_err());
}

#[tokio::test]
async fn second_session_for_other_swarm_is_rejected() {
    let swarm = runtime(Arc::new(EchoCompletion));
    swarm.add_agent(AgentSchema::new("seller", "mock", "You sell."));
    swarm.add_swarm(SwarmSchema::new("sales-floor", "seller", ["seller"]));

    let _session = swarm.session("c1", "support").await.unwrap();
    assert!(swarm.session("c1", "sales-floor").await.is_err());
    // re-attaching to the same swarm is idempotent
    assert!(swarm.session("c1", "support").await.is_ok());
}

#[tokio::test]
async fn scheduled_session_batches_messages_in_window() {
    let swarm = runtime(Arc::new(EchoCompletion));
    let session = Arc::new(
        swarm
            .session_scheduled("c1", "support", Duration::from_millis(80))
            .await
            .unwrap(),
    );

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.complete("foo").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.complete("bar").await.unwrap() })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first, "echo foo\nbar");
    assert_eq!(second, first);

    // one turn ran for the whole window
    let raw = swarm.get_raw_history("c1").await.unwrap();
    let users: Vec<&ModelMessage> = raw.iter().filter(|m| m.role == MessageRole::User).collect();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].content, "foo\nbar");
}

#[tokio::test]
async fn different_clients_run_independently() {
    let swarm = runtime(Arc::new(EchoCompletion));

    let (a, b) = tokio::join!(
        swarm.complete("alpha", "c1", "support"),
        swarm.complete("beta", "c2", "support"),
    );
    assert_eq!(a.unwrap(), "echo alpha");
    assert_eq!(b.unwrap(), "echo beta");

    assert_eq!(swarm.get_raw_history("c1").await.unwrap().len(), 2);
    assert_eq!(swarm.get_raw_history("c2").await.unwrap().len(), 2);
}

#[tokio::test]
async fn last_message_getters_reflect_roles() {
    let swarm = runtime(Arc::new(EchoCompletion));
    swarm.complete("question", "c1", "support").await.unwrap();
    swarm
        .commit_system_message("be brief", "c1", "triage")
        .await
        .unwrap();

    assert_eq!(
        swarm.get_last_user_message("c1").await.unwrap().as_deref(),
        Some("question")
    );
    assert_eq!(
        swarm.get_last_assistant_message("c1").await.unwrap().as_deref(),
        Some("echo question")
    );
    assert_eq!(
        swarm.get_last_system_message("c1").await.unwrap().as_deref(),
        Some("be brief")
    );
}
