//! Error taxonomy for a voice session.
//!
//! Every failure reaching the session manager is one of three kinds, and the
//! kind alone decides the recovery policy. Producers classify at the point
//! where they still know what failed; nothing downstream inspects message text.

use thiserror::Error;

/// A failure observed while starting or running a voice session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The microphone could not be opened (permission denied, no device,
    /// unsupported configuration). Terminal for the attempt.
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),
    /// The connection to the remote agent failed or dropped.
    /// Retried automatically while under the reconnect bound.
    #[error("connection problem: {0}")]
    Transport(String),
    /// Any other failure reported by the remote agent. Surfaced, never retried.
    #[error("{0}")]
    Remote(String),
}

impl SessionError {
    /// Whether the reconnect policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }

    /// The text shown to the user for this error.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::MediaAccess(_) => MICROPHONE_ERROR_MESSAGE.to_string(),
            SessionError::Transport(detail) => format!("Connection problem: {detail}"),
            SessionError::Remote(detail) => detail.clone(),
        }
    }
}

/// Shown whenever microphone access fails, whatever the underlying cause.
pub const MICROPHONE_ERROR_MESSAGE: &str = "Could not access microphone. Please check permissions.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(SessionError::Transport("reset".into()).is_retryable());
        assert!(!SessionError::Remote("invalid agent".into()).is_retryable());
        assert!(!SessionError::MediaAccess("denied".into()).is_retryable());
    }

    #[test]
    fn media_errors_hide_device_detail_from_the_user() {
        let err = SessionError::MediaAccess("ALSA: device busy".into());
        assert_eq!(err.user_message(), MICROPHONE_ERROR_MESSAGE);
        assert_eq!(err.to_string(), "microphone unavailable: ALSA: device busy");
    }

    #[test]
    fn remote_errors_are_shown_verbatim() {
        let err = SessionError::Remote("Agent quota exceeded".into());
        assert_eq!(err.user_message(), "Agent quota exceeded");
    }
}
