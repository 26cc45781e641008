//! Asynchronous request/reply messaging with the agents running on VMs.
//!
//! Requests are keyed by agent address. Requests to different agents run
//! concurrently, while at most one request per (agent, command class) is
//! outstanding so commands of one class reach an agent in send order.

mod error;
mod log;
mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::BackendFuture;
use crate::model::ProcessState;
use crate::types::AgentId;

pub use error::AgentError;
pub use log::{MessageLog, RecordedMessage, RecordedMessages};
pub use protocol::{AgentCommand, AgentException, CommandClass, Envelope, PROTOCOL_VERSION, Reply};

/// Transport that delivers an envelope to an agent and yields its reply.
pub trait AgentTransport: Send + Sync {
    /// Publishes `envelope` to `agent_id` and resolves with the reply.
    fn request<'a>(
        &'a self,
        agent_id: &'a AgentId,
        envelope: &'a Envelope,
    ) -> BackendFuture<'a, Reply, AgentError>;
}

/// Positive acknowledgement of a command.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    /// Value returned by the agent.
    pub value: Value,
}

/// How long to wait for replies and how often to resend on timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AgentTimeouts {
    /// Deadline for a single reply.
    pub reply: Duration,
    /// Total attempts for retryable failures.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            reply: Duration::from_secs(45),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

type Lane = Arc<tokio::sync::Mutex<()>>;

/// Sends commands to agents and awaits their replies.
#[derive(Debug)]
pub struct AgentMessenger<T> {
    transport: Arc<T>,
    log: MessageLog,
    lanes: Arc<Mutex<HashMap<(AgentId, CommandClass), Lane>>>,
    timeouts: AgentTimeouts,
}

impl<T> Clone for AgentMessenger<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            log: self.log.clone(),
            lanes: Arc::clone(&self.lanes),
            timeouts: self.timeouts,
        }
    }
}

impl<T: AgentTransport> AgentMessenger<T> {
    /// Creates a messenger over `transport` with default timeouts.
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            log: MessageLog::new(),
            lanes: Arc::default(),
            timeouts: AgentTimeouts::default(),
        }
    }

    /// Overrides reply deadlines and retry counts.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: AgentTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Configured timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> AgentTimeouts {
        self.timeouts
    }

    /// Recorder of the outgoing message stream.
    #[must_use]
    pub const fn log(&self) -> &MessageLog {
        &self.log
    }

    fn lane(&self, agent_id: &AgentId, class: CommandClass) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry((agent_id.clone(), class)).or_default())
    }

    /// Drops ordering state for an agent whose VM is gone.
    pub fn forget(&self, agent_id: &AgentId) {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(agent, _), _| agent != agent_id);
    }

    /// Sends one command and waits up to `deadline` for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Timeout`] when no reply arrives in time,
    /// [`AgentError::Rejected`] when the agent reports a failure, and
    /// [`AgentError::Transport`] when the channel cannot deliver.
    pub async fn send(
        &self,
        agent_id: &AgentId,
        command: &AgentCommand,
        deadline: Duration,
    ) -> Result<Ack, AgentError> {
        let lane = self.lane(agent_id, command.class());
        let _outstanding = lane.lock().await;

        let envelope = Envelope::new(command, format!("director.{}", Uuid::new_v4().simple()));
        self.log.record(agent_id, &envelope);
        debug!(agent = %agent_id, method = command.method(), "sending agent request");

        let reply = timeout(deadline, self.transport.request(agent_id, &envelope))
            .await
            .map_err(|_| AgentError::Timeout {
                agent_id: agent_id.clone(),
                method: command.method().to_owned(),
                timeout: deadline,
            })??;

        reply
            .into_result()
            .map(|value| Ack { value })
            .map_err(|message| AgentError::Rejected {
                agent_id: agent_id.clone(),
                method: command.method().to_owned(),
                message,
            })
    }

    /// Sends a command, resending on retryable failures within the configured
    /// attempt budget.
    ///
    /// # Errors
    ///
    /// Returns the last [`AgentError`] once the budget is exhausted, or the
    /// first non-retryable error.
    pub async fn send_with_retry(
        &self,
        agent_id: &AgentId,
        command: &AgentCommand,
    ) -> Result<Ack, AgentError> {
        let mut attempt = 1;
        loop {
            match self.send(agent_id, command, self.timeouts.reply).await {
                Ok(ack) => return Ok(ack),
                Err(err) if err.is_retryable() && attempt < self.timeouts.attempts => {
                    warn!(agent = %agent_id, method = command.method(), attempt, error = %err, "retrying agent request");
                    attempt += 1;
                    sleep(self.timeouts.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Queries the aggregate process state of the agent's jobs.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnexpectedReply`] when the reply carries no
    /// recognisable `job_state`, or any error from [`Self::send`].
    pub async fn get_state(&self, agent_id: &AgentId) -> Result<ProcessState, AgentError> {
        let ack = self
            .send(agent_id, &AgentCommand::GetState, self.timeouts.reply)
            .await?;
        let raw = ack
            .value
            .get("job_state")
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::from_value(raw).map_err(|err| AgentError::UnexpectedReply {
            agent_id: agent_id.clone(),
            method: String::from("get_state"),
            message: err.to_string(),
        })
    }
}
