//! Recorder for the agent message stream.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::AgentId;

use super::protocol::Envelope;

/// A message captured while recording was active.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedMessage {
    /// Agent the message was addressed to.
    pub agent_id: AgentId,
    /// The envelope as sent.
    pub envelope: Envelope,
}

/// Messages captured between [`MessageLog::start_recording`] and
/// [`MessageLog::finish_recording`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordedMessages(Vec<RecordedMessage>);

impl RecordedMessages {
    /// Method names sent to `agent_id`, in send order.
    #[must_use]
    pub fn methods_for(&self, agent_id: &AgentId) -> Vec<String> {
        self.0
            .iter()
            .filter(|message| &message.agent_id == agent_id)
            .map(|message| message.envelope.method.clone())
            .collect()
    }

    /// Every captured message.
    #[must_use]
    pub fn messages(&self) -> &[RecordedMessage] {
        &self.0
    }

    /// Number of captured messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Default)]
struct LogState {
    recording: bool,
    captured: Vec<RecordedMessage>,
}

/// Shared recorder; clones observe the same capture.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    state: Arc<Mutex<LogState>>,
}

impl MessageLog {
    /// Creates an idle recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts capturing, discarding anything captured before.
    pub fn start_recording(&self) {
        let mut state = self.lock();
        state.recording = true;
        state.captured.clear();
    }

    /// Stops capturing and returns what was captured.
    #[must_use]
    pub fn finish_recording(&self) -> RecordedMessages {
        let mut state = self.lock();
        state.recording = false;
        RecordedMessages(std::mem::take(&mut state.captured))
    }

    pub(super) fn record(&self, agent_id: &AgentId, envelope: &Envelope) {
        let mut state = self.lock();
        if state.recording {
            state.captured.push(RecordedMessage {
                agent_id: agent_id.clone(),
                envelope: envelope.clone(),
            });
        }
    }
}
