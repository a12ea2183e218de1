//! Conversation client: URL resolution, handshake and the connection task.

use crate::{
    error::Error,
    types::{ClientMessage, ServerMessage, SignedUrlResponse, decode_pcm16},
};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage},
};
use tracing::{Instrument, debug, info, info_span, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

pub const DEFAULT_WS_URL: &str = "wss://api.elevenlabs.io";
pub const DEFAULT_API_URL: &str = "https://api.elevenlabs.io";

const CONVERSATION_PATH: &str = "/v1/convai/conversation";
const SIGNED_URL_PATH: &str = "/v1/convai/conversation/get_signed_url";
const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// Where and how to reach the conversational agent service.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub ws_url: String,
    pub api_url: String,
    /// Required for private agents; public agents connect without one.
    pub api_key: Option<SecretString>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
        }
    }
}

/// Connection status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// How a close frame should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The agent ended the conversation (1000).
    Normal,
    /// The service refused to continue: policy violation, unsupported data,
    /// or an application-defined 4xxx code.
    Rejected,
    /// Anything else, including a missing close frame.
    Abnormal,
}

impl CloseKind {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(1000) => CloseKind::Normal,
            Some(1003) | Some(1008) | Some(4000..=4999) => CloseKind::Rejected,
            _ => CloseKind::Abnormal,
        }
    }
}

/// Events produced by a running conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// The agent accepted the conversation.
    Started {
        conversation_id: String,
        output_sample_rate: u32,
        /// Rate the agent expects for microphone audio.
        input_sample_rate: u32,
    },
    /// Agent speech, PCM16 mono.
    Audio(Vec<i16>),
    UserTranscript(String),
    AgentResponse(String),
    /// The user talked over the agent; queued agent audio is stale.
    Interruption,
    VadScore(f32),
    /// The server closed the connection.
    Closed {
        code: Option<u16>,
        reason: String,
    },
    /// The connection failed underneath the conversation.
    TransportFailed(String),
}

#[derive(Debug)]
enum Outbound {
    Audio(Vec<i16>),
    Close,
}

/// Opens conversations with ElevenLabs agents.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    config: RealtimeConfig,
    http: reqwest::Client,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// The public conversation URL for an agent.
    pub fn public_url(&self, agent_id: &str) -> Result<Url, Error> {
        let mut url = Url::parse(&self.config.ws_url)?.join(CONVERSATION_PATH)?;
        url.query_pairs_mut().append_pair("agent_id", agent_id);
        Ok(url)
    }

    /// Resolves the URL to connect to: a signed URL when an API key is
    /// configured, the public URL otherwise.
    pub async fn conversation_url(&self, agent_id: &str) -> Result<Url, Error> {
        let Some(api_key) = &self.config.api_key else {
            return self.public_url(agent_id);
        };
        let mut endpoint = Url::parse(&self.config.api_url)?.join(SIGNED_URL_PATH)?;
        endpoint.query_pairs_mut().append_pair("agent_id", agent_id);

        let response = self
            .http
            .get(endpoint)
            .header("xi-api-key", api_key.expose_secret())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rejected {
                status: status.as_u16(),
            });
        }
        let signed: SignedUrlResponse = response.json().await?;
        debug!("Obtained signed conversation URL.");
        Ok(Url::parse(&signed.signed_url)?)
    }

    /// Connects to the agent and starts the connection task.
    pub async fn connect(&self, agent_id: &str) -> Result<Conversation, Error> {
        let url = self.conversation_url(agent_id).await?;
        let (mut ws_stream, _) = connect_async(url.as_str()).await?;
        info!(%agent_id, "Connected to conversation websocket.");

        let init = serde_json::to_string(&ClientMessage::initiation(HashMap::new()))?;
        ws_stream.send(WsMessage::Text(init.into())).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let span = info_span!("conversation", agent_id = %agent_id);
        let task = tokio::spawn(
            run_connection(ws_stream, outbound_rx, events_tx, status_tx).instrument(span),
        );

        Ok(Conversation {
            events: events_rx,
            outbound: outbound_tx,
            status: status_rx,
            task: Some(task),
        })
    }
}

/// A live conversation. Dropping it aborts the connection without a close
/// handshake; use [`Conversation::close`] to end it cleanly.
#[derive(Debug)]
pub struct Conversation {
    events: mpsc::Receiver<RealtimeEvent>,
    outbound: mpsc::Sender<Outbound>,
    status: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl Conversation {
    /// Next event; `None` once the connection task has finished.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }

    /// Queues microphone audio for the agent.
    pub async fn send_audio(&self, samples: Vec<i16>) -> Result<(), Error> {
        self.outbound
            .send(Outbound::Audio(samples))
            .await
            .map_err(|_| Error::Closed)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Sends a close frame and waits for the connection task to finish.
    pub async fn close(mut self) {
        let _ = self.outbound.send(Outbound::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    events_tx: mpsc::Sender<RealtimeEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Audio(samples)) => {
                    if let Err(e) = send_json(&mut ws_tx, &ClientMessage::audio(&samples)).await {
                        let _ = events_tx.send(RealtimeEvent::TransportFailed(e.to_string())).await;
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Closing conversation.");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    let _ = ws_tx.close().await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if !handle_text(&text, &mut ws_tx, &events_tx, &status_tx).await {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = close_details(frame);
                    info!(?code, %reason, "Conversation closed by server.");
                    let _ = events_tx.send(RealtimeEvent::Closed { code, reason }).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading from conversation websocket.");
                    let _ = events_tx.send(RealtimeEvent::TransportFailed(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = events_tx
                        .send(RealtimeEvent::Closed { code: None, reason: "stream ended".into() })
                        .await;
                    break;
                }
            },
        }
    }

    status_tx.send_replace(ConnectionStatus::Disconnected);
}

/// Handles one text frame. Returns `false` when the connection should stop.
async fn handle_text(
    text: &str,
    ws_tx: &mut WsSink,
    events_tx: &mpsc::Sender<RealtimeEvent>,
    status_tx: &watch::Sender<ConnectionStatus>,
) -> bool {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable server message.");
            trace!(raw = %text);
            return true;
        }
    };

    let event = match message {
        ServerMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: meta,
        } => {
            status_tx.send_replace(ConnectionStatus::Connected);
            RealtimeEvent::Started {
                output_sample_rate: meta.output_sample_rate(),
                input_sample_rate: meta.input_sample_rate(),
                conversation_id: meta.conversation_id,
            }
        }
        ServerMessage::Audio { audio_event } => match decode_pcm16(&audio_event.audio_base_64) {
            Ok(samples) => RealtimeEvent::Audio(samples),
            Err(e) => {
                warn!(error = %e, event_id = audio_event.event_id, "Dropping undecodable audio.");
                return true;
            }
        },
        ServerMessage::UserTranscript {
            user_transcription_event,
        } => RealtimeEvent::UserTranscript(user_transcription_event.user_transcript),
        ServerMessage::AgentResponse {
            agent_response_event,
        } => RealtimeEvent::AgentResponse(agent_response_event.agent_response),
        ServerMessage::Interruption { .. } => RealtimeEvent::Interruption,
        ServerMessage::VadScore { vad_score_event } => {
            RealtimeEvent::VadScore(vad_score_event.vad_score)
        }
        ServerMessage::Ping { ping_event } => {
            trace!(event_id = ping_event.event_id, "Answering ping.");
            if let Err(e) = send_json(ws_tx, &ClientMessage::pong(ping_event.event_id)).await {
                let _ = events_tx
                    .send(RealtimeEvent::TransportFailed(e.to_string()))
                    .await;
                return false;
            }
            return true;
        }
        ServerMessage::InternalTentativeAgentResponse { .. } | ServerMessage::Unknown => {
            return true;
        }
    };

    // The consumer went away; nobody is listening to this conversation.
    events_tx.send(event).await.is_ok()
}

async fn send_json(ws_tx: &mut WsSink, message: &ClientMessage) -> Result<(), Error> {
    let payload = serde_json::to_string(message)?;
    ws_tx.send(WsMessage::Text(payload.into())).await?;
    Ok(())
}

fn close_details(frame: Option<CloseFrame>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
        None => (None, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn public_url_carries_the_agent_id() {
        let client = RealtimeClient::new(RealtimeConfig::default());
        let url = client.public_url("agent 42").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent+42"
        );
    }

    #[tokio::test]
    async fn without_an_api_key_the_public_url_is_used() {
        let client = RealtimeClient::new(RealtimeConfig {
            ws_url: "ws://127.0.0.1:9".into(),
            ..RealtimeConfig::default()
        });
        let url = client.conversation_url("abc").await.unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9/v1/convai/conversation?agent_id=abc");
    }

    #[tokio::test]
    async fn signed_url_lookup_failures_surface_as_errors() {
        // Nothing listens on the discard port, so the lookup fails to connect.
        let client = RealtimeClient::new(RealtimeConfig {
            api_url: "http://127.0.0.1:9".into(),
            api_key: Some(SecretString::from("xi-test".to_string())),
            ..RealtimeConfig::default()
        });
        let err = client.conversation_url("abc").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn close_codes_are_classified() {
        assert_eq!(CloseKind::from_code(Some(1000)), CloseKind::Normal);
        assert_eq!(CloseKind::from_code(Some(1008)), CloseKind::Rejected);
        assert_eq!(CloseKind::from_code(Some(4001)), CloseKind::Rejected);
        assert_eq!(CloseKind::from_code(Some(1006)), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_code(Some(1011)), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_code(None), CloseKind::Abnormal);
    }
}
