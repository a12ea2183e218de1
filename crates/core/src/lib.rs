//! Core of the KappaTron voice client.
//!
//! This crate decides *what* a voice session does; it never touches a device
//! or a socket. The runtime feeds [`SessionEvent`]s into a [`SessionManager`]
//! and executes the [`Command`]s it returns through the [`MediaAccess`] and
//! [`AgentConnector`] seams.

pub mod agent;
pub mod error;
pub mod level;
pub mod media;
pub mod session;

pub use agent::{
    AgentConnector, AgentEvent, AgentLink, AgentMessage, AgentStatus, DisconnectReason,
    MessageSource,
};
pub use error::{MICROPHONE_ERROR_MESSAGE, SessionError};
pub use media::{AudioConstraints, AudioFrame, CaptureHandle, MediaAccess};
pub use session::{
    Command, MAX_RECONNECT_ATTEMPTS, SessionEvent, SessionManager, SessionSettings,
    SessionSnapshot, SessionState,
};
