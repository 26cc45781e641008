//! Error types for the agent messenger.

use std::time::Duration;

use thiserror::Error;

use crate::types::AgentId;

/// Errors raised while exchanging messages with an agent.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AgentError {
    /// Raised when no reply arrives before the deadline.
    #[error("timed out after {timeout:?} waiting for {method} reply from agent {agent_id}")]
    Timeout {
        /// Agent that was addressed.
        agent_id: AgentId,
        /// Method that was sent.
        method: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Raised when the agent answers with a failure.
    #[error("agent {agent_id} rejected {method}: {message}")]
    Rejected {
        /// Agent that was addressed.
        agent_id: AgentId,
        /// Method that was sent.
        method: String,
        /// Failure reported by the agent.
        message: String,
    },
    /// Raised when the messaging channel cannot deliver the request.
    #[error("failed to deliver {method} to agent {agent_id}: {message}")]
    Transport {
        /// Agent that was addressed.
        agent_id: AgentId,
        /// Method that was sent.
        method: String,
        /// Channel failure.
        message: String,
    },
    /// Raised when a positive reply carries an unusable value.
    #[error("unexpected {method} reply from agent {agent_id}: {message}")]
    UnexpectedReply {
        /// Agent that was addressed.
        agent_id: AgentId,
        /// Method that was sent.
        method: String,
        /// Description of the problem.
        message: String,
    },
}

impl AgentError {
    /// Whether resending the same command may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}
