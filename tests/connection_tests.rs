use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_swarm::{
    outgoing, AgentSchema, AgentSwarm, CompletionArgs, CompletionProvider, CompletionSchema,
    MessageRole, ModelMessage, SwarmSchema,
};
use async_trait::async_trait;

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

fn runtime() -> AgentSwarm {
    let swarm = AgentSwarm::new();
    swarm.add_completion(CompletionSchema::new("mock", Arc::new(EchoCompletion)));
    swarm.add_agent(AgentSchema::new("triage", "mock", "You are the triage agent."));
    swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));
    swarm
}

#[tokio::test]
async fn connection_forwards_turn_outputs_to_the_connector() {
    let swarm = runtime();
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let received = Arc::clone(&received);
        outgoing(move |message| {
            let received = Arc::clone(&received);
            async move {
                received.lock().unwrap().push(message.data);
            }
        })
    };

    let connection = swarm.make_connection(sink, "c1", "support").await.unwrap();
    connection.send("hello").await.unwrap();

    // the forwarding loop runs in a background task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().unwrap().as_slice(), ["echo hello"]);

    connection.dispose().await.unwrap();
}

#[tokio::test]
async fn connection_emit_pushes_without_running_a_turn() {
    let swarm = runtime();
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let received = Arc::clone(&received);
        outgoing(move |message| {
            let received = Arc::clone(&received);
            async move {
                received.lock().unwrap().push(message.data);
            }
        })
    };

    let connection = swarm.make_connection(sink, "c1", "support").await.unwrap();
    connection.emit("server notice").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().unwrap().as_slice(), ["server notice"]);
    assert!(swarm.get_raw_history("c1").await.unwrap().is_empty());

    connection.dispose().await.unwrap();
}

#[tokio::test]
async fn scheduled_connection_batches_sends() {
    let swarm = runtime();
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let received = Arc::clone(&received);
        outgoing(move |message| {
            let received = Arc::clone(&received);
            async move {
                received.lock().unwrap().push(message.data);
            }
        })
    };

    let connection = Arc::new(
        swarm
            .make_connection_scheduled(sink, "c1", "support", Duration::from_millis(80))
            .await
            .unwrap(),
    );

    let first = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.send("foo").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.send("bar").await.unwrap() })
    };
    first.await.unwrap();
    second.await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().unwrap().as_slice(), ["echo foo\nbar"]);
}

#[tokio::test]
async fn auto_dispose_tears_down_idle_sessions() {
    let swarm = runtime();
    swarm.complete("warm up", "c1", "support").await.unwrap();

    let destroyed = Arc::new(AtomicBool::new(false));
    let on_destroy = {
        let destroyed = Arc::clone(&destroyed);
        Arc::new(move |_client: &String, _swarm: &String| {
            destroyed.store(true, Ordering::SeqCst);
        }) as Arc<dyn Fn(&String, &String) + Send + Sync>
    };

    let guard = swarm.make_auto_dispose("c1", "support", Duration::from_millis(100), Some(on_destroy));

    // activity postpones the deadline
    tokio::time::sleep(Duration::from_millis(60)).await;
    guard.tick();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!guard.is_destroyed());

    // silence crosses it
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(guard.is_destroyed());
    assert!(destroyed.load(Ordering::SeqCst));
    assert!(swarm.get_session_mode("c1").is_err());
}

#[tokio::test]
async fn wildcard_listener_observes_all_clients() {
    let swarm = runtime();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        swarm.listen_session_event(
            "*",
            agent_swarm::listener(move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    if event.kind == "execute" {
                        seen.lock().unwrap().push(event.client_id);
                    }
                }
            }),
        );
    }

    swarm.complete("one", "c1", "support").await.unwrap();
    swarm.complete("two", "c2", "support").await.unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), ["c1", "c2"]);
}

#[tokio::test]
async fn once_listener_fires_for_first_matching_event_only() {
    let swarm = runtime();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        swarm.listen_agent_event_once(
            "c1",
            Arc::new(|event: &agent_swarm::BusEvent| event.kind == "emit-output"),
            agent_swarm::listener(move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(event.output.as_str().unwrap_or_default().to_string());
                }
            }),
        );
    }

    swarm.complete("one", "c1", "support").await.unwrap();
    swarm.complete("two", "c1", "support").await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
}
