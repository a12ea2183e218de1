//! [`AgentConnector`] backed by an ElevenLabs conversation.

use crate::audio::{StreamResampler, convert_f32_to_i16, convert_i16_to_f32};
use async_trait::async_trait;
use elevenlabs_realtime::{
    CloseKind, Conversation, Error as RealtimeError, RealtimeClient, RealtimeConfig,
    RealtimeEvent, types::DEFAULT_PCM_SAMPLE_RATE,
};
use kappatron_core::{
    AgentConnector, AgentEvent, AgentLink, AgentMessage, AgentStatus, AudioFrame,
    DisconnectReason, MessageSource, SessionError,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, trace, warn};

const EVENT_BUFFER: usize = 256;
const AUDIO_BUFFER: usize = 64;

/// Opens sessions with ElevenLabs conversational agents.
#[derive(Debug, Clone)]
pub struct ElevenLabsConnector {
    client: RealtimeClient,
    capture_rate: u32,
}

impl ElevenLabsConnector {
    /// `capture_rate` is the rate of the microphone frames the session
    /// sends; they are resampled when the agent asks for another rate.
    pub fn new(config: RealtimeConfig, capture_rate: u32) -> Self {
        Self {
            client: RealtimeClient::new(config),
            capture_rate,
        }
    }
}

/// Connectivity failures are retryable; everything else comes from the
/// service refusing us.
fn classify(err: RealtimeError) -> SessionError {
    if err.is_transport() {
        SessionError::Transport(err.to_string())
    } else {
        SessionError::Remote(err.to_string())
    }
}

#[async_trait]
impl AgentConnector for ElevenLabsConnector {
    async fn start_session(&self, agent_id: &str) -> Result<AgentLink, SessionError> {
        let conversation = self.client.connect(agent_id).await.map_err(classify)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BUFFER);
        let (status_tx, status_rx) = watch::channel(AgentStatus::Connecting);
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let bridge = Bridge::new(events_tx, status_tx, speaking_tx, self.capture_rate);
        let span = info_span!("agent_link", agent_id = %agent_id);
        let task = tokio::spawn(
            bridge
                .run(conversation, audio_rx, shutdown_rx)
                .instrument(span),
        );

        Ok(AgentLink::new(
            events_rx,
            audio_tx,
            status_rx,
            speaking_rx,
            shutdown_tx,
            task,
        ))
    }
}

/// Translates conversation events into [`AgentEvent`]s and feeds
/// microphone audio the other way.
struct Bridge {
    events: mpsc::Sender<AgentEvent>,
    status: watch::Sender<AgentStatus>,
    speaking: watch::Sender<bool>,
    output_rate: u32,
    capture_rate: u32,
    /// Set when the agent wants microphone audio at another rate.
    upstream: Option<StreamResampler>,
    started: bool,
    /// When the agent's queued speech should finish playing.
    speech_ends: Option<Instant>,
}

enum Flow {
    Continue,
    Stop,
}

impl Bridge {
    fn new(
        events: mpsc::Sender<AgentEvent>,
        status: watch::Sender<AgentStatus>,
        speaking: watch::Sender<bool>,
        capture_rate: u32,
    ) -> Self {
        Self {
            events,
            status,
            speaking,
            output_rate: DEFAULT_PCM_SAMPLE_RATE,
            capture_rate,
            upstream: None,
            started: false,
            speech_ends: None,
        }
    }

    async fn run(
        mut self,
        mut conversation: Conversation,
        mut audio_rx: mpsc::Receiver<AudioFrame>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut close_gracefully = false;
        loop {
            let speech_deadline = self.speech_ends;
            tokio::select! {
                _ = &mut shutdown_rx => {
                    close_gracefully = true;
                    break;
                }
                frame = audio_rx.recv() => match frame {
                    Some(samples) => {
                        let Some(samples) = self.prepare_upstream(samples) else {
                            continue;
                        };
                        if let Err(e) = conversation.send_audio(samples).await {
                            self.emit(AgentEvent::Disconnect(DisconnectReason::Lost(e.to_string()))).await;
                            break;
                        }
                    }
                    None => {
                        close_gracefully = true;
                        break;
                    }
                },
                event = conversation.recv() => {
                    let flow = match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            self.emit(AgentEvent::Disconnect(DisconnectReason::Lost(
                                "connection task ended".to_string(),
                            )))
                            .await;
                            Flow::Stop
                        }
                    };
                    if matches!(flow, Flow::Stop) {
                        break;
                    }
                }
                _ = sleep_until(speech_deadline), if speech_deadline.is_some() => {
                    self.speech_ends = None;
                    self.set_speaking(false).await;
                }
            }
        }

        if close_gracefully {
            debug!(status = ?conversation.status(), "Closing conversation.");
            conversation.close().await;
        }
        self.status.send_replace(AgentStatus::Disconnected);
        self.speaking.send_replace(false);
    }

    async fn on_event(&mut self, event: RealtimeEvent) -> Flow {
        match event {
            RealtimeEvent::Started {
                conversation_id,
                output_sample_rate,
                input_sample_rate,
            } => {
                info!(
                    %conversation_id,
                    output_sample_rate,
                    input_sample_rate,
                    "Agent conversation started."
                );
                self.output_rate = output_sample_rate;
                if input_sample_rate != self.capture_rate {
                    match StreamResampler::new(self.capture_rate, input_sample_rate) {
                        Ok(resampler) => {
                            info!(
                                capture_rate = self.capture_rate,
                                input_sample_rate, "Resampling microphone audio for the agent."
                            );
                            self.upstream = Some(resampler);
                        }
                        Err(e) => {
                            self.emit(AgentEvent::Error(SessionError::Remote(format!(
                                "Agent expects {input_sample_rate} Hz audio, which cannot be produced from {} Hz: {e}",
                                self.capture_rate
                            ))))
                            .await;
                            return Flow::Stop;
                        }
                    }
                }
                self.started = true;
                self.status.send_replace(AgentStatus::Connected);
                self.emit(AgentEvent::Connect { conversation_id }).await
            }
            RealtimeEvent::Audio(samples) => {
                self.extend_speech(samples.len());
                self.set_speaking(true).await;
                self.emit(AgentEvent::Audio {
                    samples,
                    sample_rate: self.output_rate,
                })
                .await
            }
            RealtimeEvent::Interruption => {
                self.speech_ends = None;
                self.speaking.send_replace(false);
                self.emit(AgentEvent::Interruption).await
            }
            RealtimeEvent::UserTranscript(text) => {
                self.emit(AgentEvent::Message(AgentMessage {
                    source: MessageSource::User,
                    text,
                }))
                .await
            }
            RealtimeEvent::AgentResponse(text) => {
                self.emit(AgentEvent::Message(AgentMessage {
                    source: MessageSource::Agent,
                    text,
                }))
                .await
            }
            RealtimeEvent::VadScore(score) => {
                trace!(score, "VAD score.");
                Flow::Continue
            }
            RealtimeEvent::Closed { code, reason } => {
                let event = match CloseKind::from_code(code) {
                    CloseKind::Normal => AgentEvent::Disconnect(DisconnectReason::Ended),
                    CloseKind::Rejected => {
                        warn!(?code, %reason, "Agent rejected the conversation.");
                        AgentEvent::Error(SessionError::Remote(if reason.is_empty() {
                            format!("Agent closed the conversation (code {})", code.unwrap_or(0))
                        } else {
                            reason
                        }))
                    }
                    CloseKind::Abnormal => AgentEvent::Disconnect(DisconnectReason::Lost(
                        if reason.is_empty() {
                            format!("connection closed (code {code:?})")
                        } else {
                            reason
                        },
                    )),
                };
                self.emit(event).await;
                Flow::Stop
            }
            RealtimeEvent::TransportFailed(detail) => {
                self.emit(AgentEvent::Error(SessionError::Transport(detail)))
                    .await;
                Flow::Stop
            }
        }
    }

    /// Converts a microphone frame to the agent's input rate. Frames sent
    /// before the agent announced its format are held back.
    fn prepare_upstream(&mut self, samples: AudioFrame) -> Option<AudioFrame> {
        if !self.started {
            trace!("Dropping microphone audio before the conversation started.");
            return None;
        }
        let Some(resampler) = self.upstream.as_mut() else {
            return Some(samples);
        };
        let resampled = resampler.process(&convert_i16_to_f32(&samples));
        if resampled.is_empty() {
            return None;
        }
        Some(convert_f32_to_i16(&resampled))
    }

    /// Agent audio arrives faster than real time, so speaking lasts until
    /// the queued samples would have finished playing.
    fn extend_speech(&mut self, samples: usize) {
        let rate = self.output_rate.max(1) as f64;
        let duration = Duration::from_secs_f64(samples as f64 / rate);
        let now = Instant::now();
        let start = self.speech_ends.filter(|end| *end > now).unwrap_or(now);
        self.speech_ends = Some(start + duration);
    }

    async fn set_speaking(&mut self, speaking: bool) {
        if *self.speaking.borrow() == speaking {
            return;
        }
        self.speaking.send_replace(speaking);
        self.emit(AgentEvent::ModeChange { speaking }).await;
    }

    async fn emit(&self, event: AgentEvent) -> Flow {
        if self.events.send(event).await.is_err() {
            debug!("Agent event receiver dropped.");
            return Flow::Stop;
        }
        Flow::Continue
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
