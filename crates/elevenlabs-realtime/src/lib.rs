//! Client for the ElevenLabs Conversational AI websocket.
//!
//! [`RealtimeClient::connect`] resolves the conversation URL (signed when an
//! API key is configured), performs the handshake and spawns a task that owns
//! the socket. The returned [`Conversation`] streams [`RealtimeEvent`]s and
//! accepts microphone audio; keep-alive pings are answered internally.

mod client;
mod error;
pub mod types;

pub use client::{
    CloseKind, ConnectionStatus, Conversation, DEFAULT_API_URL, DEFAULT_WS_URL, RealtimeClient,
    RealtimeConfig, RealtimeEvent,
};
pub use error::Error;
