//! Ambient method and execution context.
//!
//! Every public facade entry opens a [`MethodContext`] scope before
//! delegating inward, and every turn runs under an [`ExecutionContext`]
//! scope. Code beneath the scope — including every awaited continuation —
//! reads the innermost active value through [`method_context`] /
//! [`execution_context`] without threading parameters through call chains.
//! Connection-layer memoization keys and logger records are the main
//! consumers.
//!
//! Scopes nest: an inner scope hides the outer one for its duration.
//! Public entries that may run *inside* a tool that is itself executing
//! inside a turn (`change_to_prev_agent`, `get_session_context` and
//! friends) use [`begin_scope`], which suppresses both ambient contexts so
//! the re-entrant call does not inherit the outer turn's identity.
//!
//! Values do not cross `tokio::spawn` boundaries; spawned tool bodies
//! re-enter scopes through the facade calls they make.

use std::future::Future;

use crate::swarm::types::{
    AgentName, ClientId, ExecutionId, StateName, StorageName, SwarmName,
};

/// Identity of the public method currently executing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodContext {
    pub client_id: ClientId,
    pub method_name: String,
    pub agent_name: AgentName,
    pub swarm_name: SwarmName,
    pub storage_name: StorageName,
    pub state_name: StateName,
}

impl MethodContext {
    /// Context carrying only the calling method and client.
    pub fn for_method(method_name: &str, client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            method_name: method_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<AgentName>) -> Self {
        self.agent_name = agent_name.into();
        self
    }

    pub fn with_swarm(mut self, swarm_name: impl Into<SwarmName>) -> Self {
        self.swarm_name = swarm_name.into();
        self
    }

    pub fn with_storage(mut self, storage_name: impl Into<StorageName>) -> Self {
        self.storage_name = storage_name.into();
        self
    }

    pub fn with_state(mut self, state_name: impl Into<StateName>) -> Self {
        self.state_name = state_name.into();
        self
    }
}

/// Identity of the turn currently executing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub client_id: ClientId,
    pub execution_id: ExecutionId,
}

impl ExecutionContext {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

tokio::task_local! {
    static METHOD_SCOPE: Option<MethodContext>;
    static EXECUTION_SCOPE: Option<ExecutionContext>;
}

/// Run `fut` under a method context scope.
pub async fn with_method_context<F>(ctx: MethodContext, fut: F) -> F::Output
where
    F: Future,
{
    METHOD_SCOPE.scope(Some(ctx), fut).await
}

/// Run `fut` under an execution context scope.
pub async fn with_execution_context<F>(ctx: ExecutionContext, fut: F) -> F::Output
where
    F: Future,
{
    EXECUTION_SCOPE.scope(Some(ctx), fut).await
}

/// Run `fut` with both ambient contexts suppressed.
pub async fn begin_scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    METHOD_SCOPE.scope(None, EXECUTION_SCOPE.scope(None, fut)).await
}

/// The innermost active method context, if any.
pub fn method_context() -> Option<MethodContext> {
    METHOD_SCOPE.try_with(|ctx| ctx.clone()).ok().flatten()
}

/// The innermost active execution context, if any.
pub fn execution_context() -> Option<ExecutionContext> {
    EXECUTION_SCOPE.try_with(|ctx| ctx.clone()).ok().flatten()
}

pub fn has_method_context() -> bool {
    method_context().is_some()
}

pub fn has_execution_context() -> bool {
    execution_context().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scopes_nest_and_restore() {
        assert!(!has_method_context());

        let outer = MethodContext::for_method("outer", "c1");
        let inner = MethodContext::for_method("inner", "c1");

        with_method_context(outer.clone(), async {
            assert_eq!(method_context().unwrap().method_name, "outer");

            with_method_context(inner, async {
                assert_eq!(method_context().unwrap().method_name, "inner");
            })
            .await;

            assert_eq!(method_context().unwrap().method_name, "outer");
        })
        .await;

        assert!(!has_method_context());
    }

    #[tokio::test]
    async fn begin_scope_suppresses_ambient_contexts() {
        let ctx = MethodContext::for_method("execute", "c1");
        let exec = ExecutionContext::new("c1");

        with_method_context(ctx, with_execution_context(exec, async {
            assert!(has_method_context());
            assert!(has_execution_context());

            begin_scope(async {
                assert!(!has_method_context());
                assert!(!has_execution_context());
            })
            .await;

            assert!(has_method_context());
        }))
        .await;
    }

    #[tokio::test]
    async fn context_survives_await_points() {
        let ctx = MethodContext::for_method("complete", "c2");
        with_method_context(ctx, async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            assert_eq!(method_context().unwrap().client_id, "c2");
        })
        .await;
    }
}
