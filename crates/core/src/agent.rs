//! The remote-agent seam: events a conversational agent emits and the live
//! link a session holds while connected.

use crate::{error::SessionError, media::AudioFrame};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::warn;

/// How long `end_session` waits for the link task to close gracefully.
const END_SESSION_GRACE: Duration = Duration::from_secs(2);

/// Connection status of a remote agent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    User,
    Agent,
}

/// A transcript line from the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMessage {
    pub source: MessageSource,
    pub text: String,
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The agent ended the conversation normally.
    Ended,
    /// The connection dropped unexpectedly.
    Lost(String),
}

/// Events a remote agent link emits, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The conversation is live.
    Connect { conversation_id: String },
    /// The link is gone.
    Disconnect(DisconnectReason),
    /// A transcript line.
    Message(AgentMessage),
    /// The agent started or stopped speaking.
    ModeChange { speaking: bool },
    /// The user talked over the agent; speech not yet played is stale.
    Interruption,
    /// Agent speech as PCM16 mono.
    Audio {
        samples: AudioFrame,
        sample_rate: u32,
    },
    /// A failure reported by or about the remote side.
    Error(SessionError),
}

/// A live session with a remote agent.
///
/// Dropping the link aborts its background task without a close handshake;
/// [`AgentLink::end_session`] closes it gracefully.
#[derive(Debug)]
pub struct AgentLink {
    events: Option<mpsc::Receiver<AgentEvent>>,
    audio: mpsc::Sender<AudioFrame>,
    status: watch::Receiver<AgentStatus>,
    speaking: watch::Receiver<bool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AgentLink {
    pub fn new(
        events: mpsc::Receiver<AgentEvent>,
        audio: mpsc::Sender<AudioFrame>,
        status: watch::Receiver<AgentStatus>,
        speaking: watch::Receiver<bool>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events: Some(events),
            audio,
            status,
            speaking,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Takes the inbound event stream. Returns `None` once it has been taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events.take()
    }

    /// A sender for microphone audio bound for the agent.
    pub fn audio_sender(&self) -> mpsc::Sender<AudioFrame> {
        self.audio.clone()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    /// Closes the session, waiting briefly for the remote close handshake.
    pub async fn end_session(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(END_SESSION_GRACE, &mut task)
                .await
                .is_err()
            {
                warn!("Agent link did not close in time; aborting.");
                task.abort();
            }
        }
    }
}

impl Drop for AgentLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens sessions with a remote conversational agent.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Opens a session with the agent identified by `agent_id`.
    ///
    /// Connectivity failures are reported as [`SessionError::Transport`];
    /// rejections by the service as [`SessionError::Remote`].
    async fn start_session(&self, agent_id: &str) -> Result<AgentLink, SessionError>;
}
