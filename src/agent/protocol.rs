//! Wire types for the agent request/reply channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DiskCid;

/// Protocol revision stamped on every envelope.
pub const PROTOCOL_VERSION: u8 = 3;

/// Commands the orchestrator sends to agents.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentCommand {
    /// Mount a persistent disk that the provider has attached.
    MountDisk(DiskCid),
    /// Unmount a persistent disk before the provider detaches it.
    UnmountDisk(DiskCid),
    /// Stop all jobs.
    Stop,
    /// Run job drain scripts.
    Drain,
    /// Start all jobs.
    Start,
    /// Report the aggregate process state.
    GetState,
    /// Download packages referenced by the rendered spec.
    Prepare(Value),
    /// Apply the rendered spec.
    Apply(Value),
}

/// Groups of commands that must not overlap on one agent.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommandClass {
    /// `mount_disk`, `unmount_disk`
    Disk,
    /// `stop`, `drain`, `start`
    Lifecycle,
    /// `prepare`, `apply`
    Config,
    /// `get_state`
    Query,
}

impl AgentCommand {
    /// Wire method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::MountDisk(_) => "mount_disk",
            Self::UnmountDisk(_) => "unmount_disk",
            Self::Stop => "stop",
            Self::Drain => "drain",
            Self::Start => "start",
            Self::GetState => "get_state",
            Self::Prepare(_) => "prepare",
            Self::Apply(_) => "apply",
        }
    }

    /// Ordering class of the command.
    #[must_use]
    pub const fn class(&self) -> CommandClass {
        match self {
            Self::MountDisk(_) | Self::UnmountDisk(_) => CommandClass::Disk,
            Self::Stop | Self::Drain | Self::Start => CommandClass::Lifecycle,
            Self::Prepare(_) | Self::Apply(_) => CommandClass::Config,
            Self::GetState => CommandClass::Query,
        }
    }

    fn arguments(&self) -> Vec<Value> {
        match self {
            Self::MountDisk(cid) | Self::UnmountDisk(cid) => {
                vec![Value::String(cid.to_string())]
            }
            Self::Drain => vec![Value::String(String::from("update"))],
            Self::Prepare(spec) | Self::Apply(spec) => vec![spec.clone()],
            Self::Stop | Self::Start | Self::GetState => Vec::new(),
        }
    }
}

/// Request envelope published to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol revision.
    pub protocol: u8,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Subject the agent replies on.
    pub reply_to: String,
}

impl Envelope {
    /// Wraps `command` for delivery, replying on `reply_to`.
    #[must_use]
    pub fn new(command: &AgentCommand, reply_to: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            method: command.method().to_owned(),
            arguments: command.arguments(),
            reply_to: reply_to.into(),
        }
    }
}

/// Failure description carried by a negative reply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentException {
    /// Message produced by the agent.
    pub message: String,
}

/// Reply published by an agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Value of a positive reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Failure of a negative reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<AgentException>,
}

impl Reply {
    /// Positive reply carrying `value`.
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            exception: None,
        }
    }

    /// Negative reply carrying `message`.
    #[must_use]
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            value: None,
            exception: Some(AgentException {
                message: message.into(),
            }),
        }
    }

    /// Splits the reply into its value or the agent's failure message.
    ///
    /// # Errors
    ///
    /// Returns the exception message when the agent reported a failure.
    pub fn into_result(self) -> Result<Value, String> {
        match (self.exception, self.value) {
            (Some(exception), _) => Err(exception.message),
            (None, value) => Ok(value.unwrap_or(Value::Null)),
        }
    }
}
