//! Wire format of the ElevenLabs Conversational AI websocket.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sample rate used when the agent does not announce its output format.
pub const DEFAULT_PCM_SAMPLE_RATE: u32 = 16_000;

// --- Client -> server ---

/// Messages sent to the agent.
///
/// Audio chunks are the only untagged message on this protocol, so the
/// enum is untagged and the remaining messages carry their own `type`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ClientMessage {
    UserAudioChunk { user_audio_chunk: String },
    Tagged(TaggedClientMessage),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaggedClientMessage {
    /// Optional first message; lets the client pass dynamic variables.
    ConversationInitiationClientData {
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        dynamic_variables: HashMap<String, String>,
    },
    /// Keep-alive answer to a server `ping`.
    Pong { event_id: u64 },
}

impl ClientMessage {
    /// Wraps PCM16 mono samples as a base64 audio chunk.
    pub fn audio(samples: &[i16]) -> Self {
        ClientMessage::UserAudioChunk {
            user_audio_chunk: encode_pcm16(samples),
        }
    }

    pub fn pong(event_id: u64) -> Self {
        ClientMessage::Tagged(TaggedClientMessage::Pong { event_id })
    }

    pub fn initiation(dynamic_variables: HashMap<String, String>) -> Self {
        ClientMessage::Tagged(TaggedClientMessage::ConversationInitiationClientData {
            dynamic_variables,
        })
    }
}

// --- Server -> client ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    Audio {
        audio_event: AudioEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscription,
    },
    AgentResponse {
        agent_response_event: AgentResponse,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Option<Interruption>,
    },
    Ping {
        ping_event: PingEvent,
    },
    VadScore {
        vad_score_event: VadScore,
    },
    InternalTentativeAgentResponse {
        tentative_agent_response_internal_event: TentativeAgentResponse,
    },
    /// Any message type this client does not act on.
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
    #[serde(default)]
    pub user_input_audio_format: Option<String>,
}

impl InitiationMetadata {
    /// Sample rate of the agent's audio, from a format such as `pcm_16000`.
    pub fn output_sample_rate(&self) -> u32 {
        self.agent_output_audio_format
            .as_deref()
            .and_then(pcm_sample_rate)
            .unwrap_or(DEFAULT_PCM_SAMPLE_RATE)
    }

    /// Sample rate the agent expects for user audio.
    pub fn input_sample_rate(&self) -> u32 {
        self.user_input_audio_format
            .as_deref()
            .and_then(pcm_sample_rate)
            .unwrap_or(DEFAULT_PCM_SAMPLE_RATE)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UserTranscription {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub agent_response: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Interruption {
    #[serde(default)]
    pub event_id: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct VadScore {
    pub vad_score: f32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TentativeAgentResponse {
    pub tentative_agent_response: String,
}

/// Response of the signed-URL endpoint used for private agents.
#[derive(Deserialize, Debug, Clone)]
pub struct SignedUrlResponse {
    pub signed_url: String,
}

/// Parses `pcm_<rate>` audio format names.
pub fn pcm_sample_rate(format: &str) -> Option<u32> {
    format.strip_prefix("pcm_")?.parse().ok()
}

/// Encodes PCM16 samples as little-endian bytes in base64.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decodes base64 little-endian PCM16. A trailing odd byte is dropped.
pub fn decode_pcm16(data: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunks_are_untagged_base64_pcm() {
        let json = serde_json::to_value(ClientMessage::audio(&[1, -1])).unwrap();
        // 1 -> 01 00, -1 -> ff ff
        assert_eq!(json, serde_json::json!({ "user_audio_chunk": "AQD//w==" }));
    }

    #[test]
    fn pong_and_initiation_carry_their_type() {
        let pong = serde_json::to_value(ClientMessage::pong(7)).unwrap();
        assert_eq!(pong, serde_json::json!({ "type": "pong", "event_id": 7 }));

        let init = serde_json::to_value(ClientMessage::initiation(HashMap::new())).unwrap();
        assert_eq!(
            init,
            serde_json::json!({ "type": "conversation_initiation_client_data" })
        );
    }

    #[test]
    fn parses_initiation_metadata_and_output_rate() {
        let raw = r#"{
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": {
                "conversation_id": "conv_123",
                "agent_output_audio_format": "pcm_22050",
                "user_input_audio_format": "pcm_16000"
            }
        }"#;
        let ServerMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: meta,
        } = serde_json::from_str(raw).unwrap()
        else {
            panic!("expected initiation metadata");
        };
        assert_eq!(meta.conversation_id, "conv_123");
        assert_eq!(meta.output_sample_rate(), 22_050);
        assert_eq!(meta.input_sample_rate(), 16_000);
    }

    #[test]
    fn missing_or_odd_formats_fall_back_to_default_rate() {
        let meta = InitiationMetadata {
            conversation_id: "c".into(),
            agent_output_audio_format: Some("ulaw_8000".into()),
            user_input_audio_format: None,
        };
        assert_eq!(meta.output_sample_rate(), DEFAULT_PCM_SAMPLE_RATE);
        assert_eq!(meta.input_sample_rate(), DEFAULT_PCM_SAMPLE_RATE);
        assert_eq!(pcm_sample_rate("pcm_44100"), Some(44_100));
        assert_eq!(pcm_sample_rate("pcm_fast"), None);
    }

    #[test]
    fn parses_ping_transcripts_and_interruptions() {
        let ping: ServerMessage =
            serde_json::from_str(r#"{"type":"ping","ping_event":{"event_id":3,"ping_ms":40}}"#)
                .unwrap();
        assert_eq!(
            ping,
            ServerMessage::Ping {
                ping_event: PingEvent {
                    event_id: 3,
                    ping_ms: Some(40)
                }
            }
        );

        let transcript: ServerMessage = serde_json::from_str(
            r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hi there"}}"#,
        )
        .unwrap();
        assert!(matches!(
            transcript,
            ServerMessage::UserTranscript { user_transcription_event } if user_transcription_event.user_transcript == "hi there"
        ));

        let bare: ServerMessage = serde_json::from_str(r#"{"type":"interruption"}"#).unwrap();
        assert_eq!(
            bare,
            ServerMessage::Interruption {
                interruption_event: None
            }
        );
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"client_tool_call","client_tool_call":{}}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn decodes_agent_audio() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"audio","audio_event":{"audio_base_64":"AQD//w==","event_id":1}}"#,
        )
        .unwrap();
        let ServerMessage::Audio { audio_event } = msg else {
            panic!("expected audio");
        };
        assert_eq!(decode_pcm16(&audio_event.audio_base_64).unwrap(), vec![1, -1]);
        assert!(decode_pcm16("not base64!").is_err());
    }
}
