//! Voice session lifecycle.
//!
//! [`SessionManager`] is a pure state machine. It never performs I/O: each
//! call to [`SessionManager::handle`] consumes one [`SessionEvent`] and
//! returns the [`Command`]s the runtime must execute. The runtime reports the
//! outcome of those commands back as further events, one at a time, so a
//! reconnect can only begin after the event that caused it has been fully
//! processed.
//!
//! ```text
//! Idle --Start--> Connecting --Connected--> Connected
//! Connected --Disconnected(Lost), under limit--> Connecting
//! Connected --Disconnected(Lost), at limit-----> Error
//! Connected --Disconnected(Ended)--------------> Disconnected
//! any --Stop--> Idle
//! ```

use crate::{
    agent::{AgentMessage, DisconnectReason},
    error::{MICROPHONE_ERROR_MESSAGE, SessionError},
    media::AudioConstraints,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Automatic reconnects attempted before a dropped session is reported.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Inputs to the state machine: user intents and collaborator outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The user asked to start a voice chat.
    Start,
    /// The user asked to end the voice chat.
    Stop,
    /// The microphone requested by [`Command::AcquireMicrophone`] is open.
    MicrophoneReady,
    /// The microphone could not be opened.
    MicrophoneFailed(SessionError),
    /// [`Command::OpenSession`] failed before the agent connected.
    SessionOpenFailed(SessionError),
    /// The agent accepted the conversation.
    Connected { conversation_id: String },
    /// The agent link went away.
    Disconnected(DisconnectReason),
    /// A transcript line arrived.
    Message(AgentMessage),
    /// The agent started or stopped speaking.
    ModeChange { speaking: bool },
    /// The agent link reported a failure.
    Error(SessionError),
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the microphone, then report `MicrophoneReady` or `MicrophoneFailed`.
    AcquireMicrophone(AudioConstraints),
    /// Open a session with the agent, then report link events or `SessionOpenFailed`.
    OpenSession { agent_id: String },
    /// Close the agent session and release the microphone.
    Release,
}

/// Read-only view of a session, published to the UI after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub error_message: Option<String>,
    pub is_speaking: bool,
    pub conversation_id: Option<String>,
    pub last_message: Option<AgentMessage>,
}

/// Fixed parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub agent_id: String,
    pub constraints: AudioConstraints,
    pub max_reconnect_attempts: u32,
}

impl SessionSettings {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            constraints: AudioConstraints::default(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }

    pub fn with_constraints(mut self, constraints: AudioConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }
}

/// Connect/disconnect/reconnect decisions for one voice chat.
#[derive(Debug, Clone)]
pub struct SessionManager {
    settings: SessionSettings,
    state: SessionState,
    /// The user wants a session: set by `Start`, cleared by `Stop` and by
    /// every terminal failure.
    active: bool,
    reconnect_attempts: u32,
    error_message: Option<String>,
    is_speaking: bool,
    conversation_id: Option<String>,
    last_message: Option<AgentMessage>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: SessionState::Idle,
            active: false,
            reconnect_attempts: 0,
            error_message: None,
            is_speaking: false,
            conversation_id: None,
            last_message: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.settings.max_reconnect_attempts,
            error_message: self.error_message.clone(),
            is_speaking: self.is_speaking,
            conversation_id: self.conversation_id.clone(),
            last_message: self.last_message.clone(),
        }
    }

    /// Applies one event and returns the commands to execute, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::Start => self.start(),
            SessionEvent::Stop => self.stop(),
            SessionEvent::MicrophoneReady => self.on_microphone_ready(),
            SessionEvent::MicrophoneFailed(err) => self.on_microphone_failed(err),
            SessionEvent::SessionOpenFailed(err) | SessionEvent::Error(err) => self.on_error(err),
            SessionEvent::Connected { conversation_id } => self.on_connect(conversation_id),
            SessionEvent::Disconnected(reason) => self.on_disconnect(reason),
            SessionEvent::Message(message) => {
                if self.active {
                    debug!(source = ?message.source, text = %message.text, "Transcript");
                    self.last_message = Some(message);
                }
                Vec::new()
            }
            SessionEvent::ModeChange { speaking } => {
                if self.state == SessionState::Connected {
                    self.is_speaking = speaking;
                }
                Vec::new()
            }
        }
    }

    fn start(&mut self) -> Vec<Command> {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected
        ) {
            debug!(state = ?self.state, "Start ignored; session already running.");
            return Vec::new();
        }
        info!(agent_id = %self.settings.agent_id, "Starting voice session.");
        self.active = true;
        self.reconnect_attempts = 0;
        self.error_message = None;
        self.conversation_id = None;
        self.last_message = None;
        self.is_speaking = false;
        self.state = SessionState::Connecting;
        vec![Command::AcquireMicrophone(self.settings.constraints.clone())]
    }

    fn stop(&mut self) -> Vec<Command> {
        info!(from = ?self.state, "Stopping voice session.");
        self.active = false;
        self.reconnect_attempts = 0;
        self.error_message = None;
        self.conversation_id = None;
        self.is_speaking = false;
        self.state = SessionState::Idle;
        vec![Command::Release]
    }

    fn on_microphone_ready(&mut self) -> Vec<Command> {
        if !self.active || self.state != SessionState::Connecting {
            warn!(state = ?self.state, "Microphone became ready outside of a connection attempt.");
            return Vec::new();
        }
        vec![Command::OpenSession {
            agent_id: self.settings.agent_id.clone(),
        }]
    }

    fn on_microphone_failed(&mut self, err: SessionError) -> Vec<Command> {
        if !self.active {
            return Vec::new();
        }
        warn!(error = %err, "Microphone access failed; not retrying.");
        self.fail(MICROPHONE_ERROR_MESSAGE.to_string())
    }

    fn on_connect(&mut self, conversation_id: String) -> Vec<Command> {
        if !self.active {
            debug!(%conversation_id, "Connect ignored; session not active.");
            return Vec::new();
        }
        info!(
            %conversation_id,
            reconnects_used = self.reconnect_attempts,
            "Connected to agent."
        );
        self.state = SessionState::Connected;
        self.reconnect_attempts = 0;
        self.error_message = None;
        self.conversation_id = Some(conversation_id);
        Vec::new()
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) -> Vec<Command> {
        if !self.active {
            debug!(?reason, "Disconnect ignored; session not active.");
            return Vec::new();
        }
        match reason {
            DisconnectReason::Ended => {
                info!("Agent ended the conversation.");
                self.active = false;
                self.reconnect_attempts = 0;
                self.is_speaking = false;
                self.state = SessionState::Disconnected;
                vec![Command::Release]
            }
            DisconnectReason::Lost(detail) => {
                warn!(%detail, "Connection to agent lost.");
                self.reconnect_or_fail("Connection lost")
            }
        }
    }

    fn on_error(&mut self, err: SessionError) -> Vec<Command> {
        if !self.active {
            debug!(error = %err, "Error ignored; session not active.");
            return Vec::new();
        }
        if err.is_retryable() {
            warn!(error = %err, "Agent connection failed.");
            self.reconnect_or_fail(&err.user_message())
        } else {
            error!(error = %err, "Agent session failed; not retrying.");
            self.fail(err.user_message())
        }
    }

    fn reconnect_or_fail(&mut self, cause: &str) -> Vec<Command> {
        let max = self.settings.max_reconnect_attempts;
        if self.reconnect_attempts < max {
            self.reconnect_attempts += 1;
            info!(attempt = self.reconnect_attempts, max, "Reconnecting to agent.");
            self.error_message = Some(format!(
                "{cause}. Attempting to reconnect ({}/{max})...",
                self.reconnect_attempts
            ));
            self.conversation_id = None;
            self.is_speaking = false;
            self.state = SessionState::Connecting;
            vec![
                Command::Release,
                Command::AcquireMicrophone(self.settings.constraints.clone()),
            ]
        } else {
            self.fail(format!(
                "{cause}. Unable to reconnect after {}/{max} attempts. Please try again.",
                self.reconnect_attempts
            ))
        }
    }

    fn fail(&mut self, message: String) -> Vec<Command> {
        self.active = false;
        self.is_speaking = false;
        self.conversation_id = None;
        self.error_message = Some(message);
        self.state = SessionState::Error;
        vec![Command::Release]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessageSource;

    fn manager() -> SessionManager {
        SessionManager::new(SessionSettings::new("agent-kappa"))
    }

    fn lost() -> SessionEvent {
        SessionEvent::Disconnected(DisconnectReason::Lost("socket reset".into()))
    }

    fn connected(id: &str) -> SessionEvent {
        SessionEvent::Connected {
            conversation_id: id.into(),
        }
    }

    fn is_reconnect(commands: &[Command]) -> bool {
        matches!(
            commands,
            [Command::Release, Command::AcquireMicrophone(_)]
        )
    }

    /// Drives a fresh manager through start, microphone and connect.
    fn connected_manager() -> SessionManager {
        let mut m = manager();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::MicrophoneReady);
        m.handle(connected("conv-1"));
        m
    }

    #[test]
    fn start_requests_the_microphone_with_configured_constraints() {
        let mut m = manager();
        let commands = m.handle(SessionEvent::Start);
        assert_eq!(
            commands,
            vec![Command::AcquireMicrophone(AudioConstraints::default())]
        );
        assert_eq!(m.state(), SessionState::Connecting);
        assert!(m.is_active());
    }

    #[test]
    fn microphone_ready_opens_the_agent_session() {
        let mut m = manager();
        m.handle(SessionEvent::Start);
        let commands = m.handle(SessionEvent::MicrophoneReady);
        assert_eq!(
            commands,
            vec![Command::OpenSession {
                agent_id: "agent-kappa".into()
            }]
        );
    }

    #[test]
    fn successful_start_then_connect_is_connected_without_error() {
        let m = connected_manager();
        assert_eq!(m.state(), SessionState::Connected);
        assert_eq!(m.error_message(), None);
        assert_eq!(m.snapshot().conversation_id.as_deref(), Some("conv-1"));
    }

    #[test]
    fn permission_error_is_terminal_and_not_retried() {
        let mut m = manager();
        m.handle(SessionEvent::Start);
        let commands = m.handle(SessionEvent::MicrophoneFailed(SessionError::MediaAccess(
            "permission denied".into(),
        )));
        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
        assert!(
            m.error_message()
                .unwrap()
                .starts_with("Could not access microphone")
        );
        assert!(!m.is_active());

        // A later drop from a stale link must not revive the attempt.
        assert!(m.handle(lost()).is_empty());
        assert_eq!(m.state(), SessionState::Error);
    }

    #[test]
    fn microphone_lost_while_connected_ends_the_session() {
        let mut m = connected_manager();
        let commands = m.handle(SessionEvent::MicrophoneFailed(SessionError::MediaAccess(
            "microphone stream ended".into(),
        )));
        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
        assert_eq!(m.error_message(), Some(MICROPHONE_ERROR_MESSAGE));
        assert_eq!(m.reconnect_attempts(), 0);
    }

    #[test]
    fn start_is_ignored_while_connecting_or_connected() {
        let mut m = manager();
        m.handle(SessionEvent::Start);
        assert!(m.handle(SessionEvent::Start).is_empty());
        let mut m = connected_manager();
        assert!(m.handle(SessionEvent::Start).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn three_drops_use_three_attempts_and_the_fourth_settles_into_error() {
        let mut m = connected_manager();

        for attempt in 1..=3 {
            let commands = m.handle(lost());
            assert!(is_reconnect(&commands), "attempt {attempt}: {commands:?}");
            assert_eq!(m.state(), SessionState::Connecting);
            assert_eq!(m.reconnect_attempts(), attempt);
            // The new attempt gets its microphone but never connects.
            m.handle(SessionEvent::MicrophoneReady);
        }
        assert!(m.error_message().unwrap().contains("(3/3)"));

        let commands = m.handle(lost());
        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
        assert!(m.error_message().unwrap().contains("3/3"));
        assert!(!m.is_active());

        // Nothing further is attempted.
        assert!(m.handle(lost()).is_empty());
        assert_eq!(m.reconnect_attempts(), 3);
    }

    #[test]
    fn reconnects_are_bounded_for_every_drop_and_connect_interleaving() {
        // Each bit of `pattern` decides whether the link reconnects before
        // the next drop. Between two connects at most three attempts happen.
        for pattern in 0u32..256 {
            let mut m = connected_manager();
            let mut since_connect = 0;
            for step in 0..8 {
                if pattern & (1 << step) != 0 && m.is_active() {
                    m.handle(connected("again"));
                    since_connect = 0;
                }
                let commands = m.handle(lost());
                if is_reconnect(&commands) {
                    since_connect += 1;
                }
                assert!(since_connect <= MAX_RECONNECT_ATTEMPTS, "pattern {pattern:08b}");
                assert!(m.reconnect_attempts() <= MAX_RECONNECT_ATTEMPTS);
            }
        }
    }

    #[test]
    fn connect_resets_attempts_and_clears_the_message() {
        let mut m = connected_manager();
        m.handle(lost());
        m.handle(lost());
        assert_eq!(m.reconnect_attempts(), 2);
        assert!(m.error_message().is_some());

        m.handle(SessionEvent::MicrophoneReady);
        m.handle(connected("conv-2"));
        assert_eq!(m.state(), SessionState::Connected);
        assert_eq!(m.reconnect_attempts(), 0);
        assert_eq!(m.error_message(), None);

        // A full budget is available again.
        for _ in 0..3 {
            assert!(is_reconnect(&m.handle(lost())));
        }
    }

    #[test]
    fn stop_from_every_state_returns_to_a_clean_idle() {
        let mut mic_denied = manager();
        mic_denied.handle(SessionEvent::Start);
        mic_denied.handle(SessionEvent::MicrophoneFailed(SessionError::MediaAccess(
            "denied".into(),
        )));

        let mut reconnecting = connected_manager();
        reconnecting.handle(lost());

        let mut exhausted = connected_manager();
        for _ in 0..4 {
            exhausted.handle(lost());
        }

        let mut ended = connected_manager();
        ended.handle(SessionEvent::Disconnected(DisconnectReason::Ended));

        let mut connecting = manager();
        connecting.handle(SessionEvent::Start);

        let cases = [
            ("idle", manager()),
            ("connecting", connecting),
            ("connected", connected_manager()),
            ("reconnecting", reconnecting),
            ("disconnected", ended),
            ("mic denied", mic_denied),
            ("exhausted", exhausted),
        ];
        for (name, mut m) in cases {
            let commands = m.handle(SessionEvent::Stop);
            assert_eq!(commands, vec![Command::Release], "{name}");
            assert_eq!(m.state(), SessionState::Idle, "{name}");
            assert_eq!(m.reconnect_attempts(), 0, "{name}");
            assert_eq!(m.error_message(), None, "{name}");
            assert!(!m.is_active(), "{name}");
        }
    }

    #[test]
    fn disconnect_after_stop_is_ignored() {
        let mut m = connected_manager();
        m.handle(SessionEvent::Stop);
        assert!(m.handle(lost()).is_empty());
        assert!(m.handle(connected("late")).is_empty());
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn agent_ending_the_conversation_is_not_retried() {
        let mut m = connected_manager();
        let commands = m.handle(SessionEvent::Disconnected(DisconnectReason::Ended));
        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Disconnected);
        assert_eq!(m.reconnect_attempts(), 0);

        // The session is reusable.
        assert_eq!(m.handle(SessionEvent::Start).len(), 1);
        assert_eq!(m.state(), SessionState::Connecting);
    }

    #[test]
    fn transport_errors_follow_the_reconnect_path() {
        let mut m = connected_manager();
        let commands = m.handle(SessionEvent::Error(SessionError::Transport(
            "tls handshake eof".into(),
        )));
        assert!(is_reconnect(&commands));
        assert_eq!(m.reconnect_attempts(), 1);
        let message = m.error_message().unwrap();
        assert!(message.contains("tls handshake eof"));
        assert!(message.contains("(1/3)"));
    }

    #[test]
    fn transport_error_at_the_limit_settles_into_error() {
        let mut m = connected_manager();
        for _ in 1..=3 {
            m.handle(lost());
            m.handle(SessionEvent::MicrophoneReady);
        }
        assert_eq!(m.reconnect_attempts(), 3);

        let commands = m.handle(SessionEvent::Error(SessionError::Transport("eof".into())));

        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
        assert!(!m.is_active());
        let message = m.error_message().unwrap();
        assert!(message.starts_with("Connection problem: eof."), "{message}");
        assert!(message.contains("Unable to reconnect after 3/3 attempts"), "{message}");
        assert_eq!(m.reconnect_attempts(), 3);
    }

    #[test]
    fn failing_to_open_the_session_counts_as_an_attempt() {
        let mut m = manager();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::MicrophoneReady);
        let commands = m.handle(SessionEvent::SessionOpenFailed(SessionError::Transport(
            "connection refused".into(),
        )));
        assert!(is_reconnect(&commands));
        assert_eq!(m.reconnect_attempts(), 1);
    }

    #[test]
    fn remote_errors_are_surfaced_without_retry() {
        let mut m = connected_manager();
        let commands = m.handle(SessionEvent::Error(SessionError::Remote(
            "Agent not found".into(),
        )));
        assert_eq!(commands, vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
        assert_eq!(m.error_message(), Some("Agent not found"));
        assert_eq!(m.reconnect_attempts(), 0);
    }

    #[test]
    fn manual_start_after_error_gets_a_fresh_budget() {
        let mut m = connected_manager();
        for _ in 0..4 {
            m.handle(lost());
        }
        assert_eq!(m.state(), SessionState::Error);
        m.handle(SessionEvent::Start);
        assert_eq!(m.state(), SessionState::Connecting);
        assert_eq!(m.reconnect_attempts(), 0);
        assert_eq!(m.error_message(), None);
    }

    #[test]
    fn zero_reconnect_budget_fails_on_the_first_drop() {
        let mut m =
            SessionManager::new(SessionSettings::new("agent").with_max_reconnect_attempts(0));
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::MicrophoneReady);
        m.handle(connected("conv"));
        assert_eq!(m.handle(lost()), vec![Command::Release]);
        assert_eq!(m.state(), SessionState::Error);
    }

    #[test]
    fn snapshot_tracks_speaking_and_transcript() {
        let mut m = connected_manager();
        m.handle(SessionEvent::ModeChange { speaking: true });
        m.handle(SessionEvent::Message(AgentMessage {
            source: MessageSource::Agent,
            text: "Welcome to KappaTron.".into(),
        }));
        let snapshot = m.snapshot();
        assert!(snapshot.is_speaking);
        assert_eq!(
            snapshot.last_message.map(|msg| msg.text),
            Some("Welcome to KappaTron.".to_string())
        );
        assert_eq!(snapshot.max_reconnect_attempts, MAX_RECONNECT_ATTEMPTS);

        m.handle(lost());
        assert!(!m.snapshot().is_speaking);
    }
}
