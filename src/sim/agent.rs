//! Simulated agents answering requests over the in-memory transport.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tokio::time::sleep;

use crate::agent::{AgentError, AgentTransport, Envelope, Reply};
use crate::backend::BackendFuture;
use crate::model::ProcessState;
use crate::types::{AgentId, DiskCid};

use super::{CloudState, SimEvent, SimulatedCloud};

/// How a simulated agent reacts to requests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AgentBehaviour {
    /// Methods answered with an exception, mapped to the message.
    pub rejected: HashMap<String, String>,
    /// Methods that never get a reply.
    pub silent: HashSet<String>,
    /// Jobs fail right after `start`.
    pub fails_after_start: bool,
    /// Jobs never leave `starting`.
    pub stays_starting: bool,
    /// `get_state` polls answered with `starting` before jobs report
    /// `running`.
    pub polls_until_running: u32,
}

impl AgentBehaviour {
    /// Answers `method` with an exception carrying `message`.
    #[must_use]
    pub fn reject(mut self, method: &str, message: &str) -> Self {
        self.rejected.insert(method.to_owned(), message.to_owned());
        self
    }

    /// Never answers `method`.
    #[must_use]
    pub fn silence(mut self, method: &str) -> Self {
        self.silent.insert(method.to_owned());
        self
    }

    /// Reports `failing` once started.
    #[must_use]
    pub const fn failing_after_start(mut self) -> Self {
        self.fails_after_start = true;
        self
    }

    /// Keeps reporting `starting` forever.
    #[must_use]
    pub const fn never_running(mut self) -> Self {
        self.stays_starting = true;
        self
    }

    /// Reports `starting` for `polls` queries before `running`.
    #[must_use]
    pub const fn running_after_polls(mut self, polls: u32) -> Self {
        self.polls_until_running = polls;
        self
    }
}

enum Handled {
    Reply(Reply),
    Silent,
    Unreachable,
}

fn first_disk_argument(envelope: &Envelope) -> Option<DiskCid> {
    envelope
        .arguments
        .first()
        .and_then(Value::as_str)
        .map(DiskCid::from)
}

impl CloudState {
    fn handle_agent_request(&mut self, agent_id: &AgentId, envelope: &Envelope) -> Handled {
        let Some(agent) = self.agents.get(agent_id) else {
            return Handled::Unreachable;
        };
        let vm = agent.vm.clone();
        if !self.vms.contains_key(&vm) {
            return Handled::Unreachable;
        }
        let behaviour = agent.behaviour.clone();
        self.log(SimEvent::AgentRequest {
            vm: vm.clone(),
            method: envelope.method.clone(),
        });
        if behaviour.silent.contains(&envelope.method) {
            return Handled::Silent;
        }
        if let Some(message) = behaviour.rejected.get(&envelope.method) {
            return Handled::Reply(Reply::exception(message.clone()));
        }

        let attached = first_disk_argument(envelope).is_some_and(|disk| {
            self.attachments
                .get(&disk)
                .is_some_and(|holders| holders.contains(&vm))
        });
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return Handled::Unreachable;
        };

        let reply = match envelope.method.as_str() {
            "mount_disk" => match first_disk_argument(envelope) {
                Some(disk) if attached => {
                    agent.mounted.insert(disk);
                    Reply::value(json!({}))
                }
                Some(disk) => Reply::exception(format!("disk {disk} is not attached to vm {vm}")),
                None => Reply::exception("mount_disk requires a disk cid"),
            },
            "unmount_disk" => {
                if let Some(disk) = first_disk_argument(envelope) {
                    agent.mounted.remove(&disk);
                }
                Reply::value(json!({}))
            }
            "stop" => {
                agent.job_state = ProcessState::Stopped;
                Reply::value(json!("stopped"))
            }
            "drain" => Reply::value(json!(0)),
            "start" => {
                agent.job_state = if behaviour.fails_after_start {
                    ProcessState::Failing
                } else if behaviour.stays_starting || agent.polls_while_starting > 0 {
                    ProcessState::Starting
                } else {
                    ProcessState::Running
                };
                Reply::value(json!("started"))
            }
            "get_state" => {
                if agent.job_state == ProcessState::Starting && !behaviour.stays_starting {
                    if agent.polls_while_starting == 0 {
                        agent.job_state = ProcessState::Running;
                    } else {
                        agent.polls_while_starting -= 1;
                    }
                }
                let state = agent.job_state;
                self.log(SimEvent::StateReported {
                    vm: vm.clone(),
                    state,
                });
                Reply::value(json!({ "job_state": state, "vm": { "name": vm } }))
            }
            "prepare" => Reply::value(json!({})),
            "apply" => {
                agent.applied = envelope.arguments.first().cloned();
                Reply::value(json!({}))
            }
            other => Reply::exception(format!("unknown message {other}")),
        };
        Handled::Reply(reply)
    }
}

impl AgentTransport for SimulatedCloud {
    fn request<'a>(
        &'a self,
        agent_id: &'a AgentId,
        envelope: &'a Envelope,
    ) -> BackendFuture<'a, Reply, AgentError> {
        Box::pin(async move {
            let latency = self.latency();
            if !latency.is_zero() {
                sleep(latency).await;
            }
            let handled = self.lock().handle_agent_request(agent_id, envelope);
            match handled {
                Handled::Reply(reply) => Ok(reply),
                Handled::Silent => std::future::pending().await,
                Handled::Unreachable => Err(AgentError::Transport {
                    agent_id: agent_id.clone(),
                    method: envelope.method.clone(),
                    message: String::from("agent is not connected"),
                }),
            }
        })
    }
}
