//! Crate error type.

use std::error::Error;
use std::fmt;

use crate::swarm::types::{AgentName, ClientId, SwarmName};

/// Errors surfaced by the runtime's public operations.
///
/// Recoverable conditions inside a turn (missing tool, invalid model
/// output, a tool body that threw) are handled by the rescue machinery and
/// never reach the caller; the variants here are the ones that escape.
///
/// # Example
///
/// ```rust
/// use agent_swarm::SwarmError;
///
/// let err = SwarmError::SessionNotFound("client-1".into());
/// assert!(err.to_string().contains("client-1"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmError {
    /// A registry lookup failed. `kind` names the registry (`"agent"`,
    /// `"tool"`, ...), `source` names the operation that required it.
    SchemaNotFound {
        kind: &'static str,
        name: String,
        source: String,
    },
    /// A public entry referenced a client with no live session.
    SessionNotFound(ClientId),
    /// A session for the client already exists with a different swarm.
    SessionExists(ClientId),
    /// `change_agent` targeted an agent outside the session's swarm.
    AgentNotInSwarm {
        agent_name: AgentName,
        swarm_name: SwarmName,
    },
    /// A swarm schema's default agent is missing from its agent list.
    DefaultAgentNotInList {
        swarm_name: SwarmName,
        default_agent: AgentName,
    },
    /// A storage/state operation named a resource the agent never declared.
    ResourceNotDeclared {
        agent_name: AgentName,
        kind: &'static str,
        name: String,
    },
    /// The rescue pass itself produced output that failed validation.
    RescueFailed {
        client_id: ClientId,
        agent_name: AgentName,
        validation: String,
    },
    /// A persistence adapter write failed.
    PersistenceFailed(String),
    /// A completion or turn failed in a way rescue could not absorb.
    ExecutionFailed(String),
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::SchemaNotFound { kind, name, source } => {
                write!(f, "{} schema not found: {} (required by {})", kind, name, source)
            }
            SwarmError::SessionNotFound(client_id) => {
                write!(f, "session not found for client {}", client_id)
            }
            SwarmError::SessionExists(client_id) => {
                write!(f, "session already exists for client {}", client_id)
            }
            SwarmError::AgentNotInSwarm { agent_name, swarm_name } => {
                write!(f, "agent {} is not part of swarm {}", agent_name, swarm_name)
            }
            SwarmError::DefaultAgentNotInList { swarm_name, default_agent } => {
                write!(
                    f,
                    "swarm {} lists default agent {} outside its agent list",
                    swarm_name, default_agent
                )
            }
            SwarmError::ResourceNotDeclared { agent_name, kind, name } => {
                write!(f, "agent {} does not declare {} {}", agent_name, kind, name)
            }
            SwarmError::RescueFailed { client_id, agent_name, validation } => {
                write!(
                    f,
                    "rescue failed for agent {} (client {}): {}",
                    agent_name, client_id, validation
                )
            }
            SwarmError::PersistenceFailed(msg) => write!(f, "persistence failed: {}", msg),
            SwarmError::ExecutionFailed(msg) => write!(f, "execution failed: {}", msg),
        }
    }
}

impl Error for SwarmError {}
