use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures while opening or running a conversation.
#[derive(Debug, Error)]
pub enum Error {
    /// The service answered the handshake or signed-URL request with an
    /// HTTP error status.
    #[error("agent service rejected the request with HTTP {status}")]
    Rejected { status: u16 },
    #[error("websocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),
    #[error("signed URL request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid conversation URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("conversation is closed")]
    Closed,
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Error::Rejected {
                status: response.status().as_u16(),
            },
            other => Error::WebSocket(other),
        }
    }
}

impl Error {
    /// Whether the failure is a connectivity problem worth retrying.
    ///
    /// Client errors (4xx) mean the request itself is wrong, so retrying
    /// cannot help; server errors and network failures may clear up.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Rejected { status } => *status >= 500,
            Error::WebSocket(_) | Error::Closed => true,
            Error::Http(err) => err
                .status()
                .map(|status| status.is_server_error())
                .unwrap_or(true),
            Error::Url(_) | Error::Json(_) => false,
        }
    }
}
