//! Runs a [`SessionManager`] against real resources.
//!
//! Every input, whether a user command, a microphone result, a connection
//! result or an agent event, goes through one queue and is applied to the
//! manager in order. The commands the manager returns are carried out
//! here. Asynchronous work is tagged with the generation current when it
//! started; results from an older generation are dropped, which releases
//! whatever they carried.

use crate::playback::PlaybackSink;
use kappatron_core::{
    AgentConnector, AgentEvent, AgentLink, AudioFrame, CaptureHandle, Command, MediaAccess,
    SessionError, SessionEvent, SessionManager, SessionSettings, SessionSnapshot,
    level::LevelMeter,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

const CONTROL_BUFFER: usize = 16;
const INTERNAL_BUFFER: usize = 256;

/// Requests from the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    Stop,
    Shutdown,
}

/// Results of work the controller started.
#[derive(Debug)]
enum Internal {
    Microphone {
        generation: u64,
        result: Result<CaptureHandle, SessionError>,
    },
    Opened {
        generation: u64,
        result: Result<AgentLink, SessionError>,
    },
    Agent {
        generation: u64,
        event: AgentEvent,
    },
    /// The microphone stopped producing frames mid-session.
    CaptureEnded { generation: u64 },
}

/// The controller is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("session controller has shut down")]
pub struct ControllerClosed;

/// Handle for driving and observing a running [`SessionController`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    control: mpsc::Sender<Control>,
    snapshot: watch::Receiver<SessionSnapshot>,
    level: watch::Receiver<f32>,
}

impl SessionHandle {
    pub async fn start(&self) -> Result<(), ControllerClosed> {
        self.send(Control::Start).await
    }

    pub async fn stop(&self) -> Result<(), ControllerClosed> {
        self.send(Control::Stop).await
    }

    /// Stops the session, releases everything and ends the controller.
    pub async fn shutdown(&self) -> Result<(), ControllerClosed> {
        self.send(Control::Shutdown).await
    }

    async fn send(&self, control: Control) -> Result<(), ControllerClosed> {
        self.control.send(control).await.map_err(|_| ControllerClosed)
    }

    /// The latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observes every published state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Smoothed microphone level in `0.0..=1.0`.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }
}

/// What a session holds while it runs.
///
/// Dropping the bundle releases all of it; [`SessionResources::release`]
/// additionally lets the agent link close gracefully.
#[derive(Debug, Default)]
struct SessionResources {
    capture: Option<CaptureHandle>,
    link: Option<AgentLink>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionResources {
    fn is_empty(&self) -> bool {
        self.capture.is_none() && self.link.is_none() && self.tasks.is_empty()
    }

    async fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            debug!(
                status = ?link.status(),
                speaking = link.is_speaking(),
                "Ending agent session."
            );
            link.end_session().await;
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct SessionController {
    manager: SessionManager,
    media: Arc<dyn MediaAccess>,
    connector: Arc<dyn AgentConnector>,
    playback: Option<PlaybackSink>,
    resources: SessionResources,
    generation: u64,
    control_rx: mpsc::Receiver<Control>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    level_tx: Arc<watch::Sender<f32>>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        media: Arc<dyn MediaAccess>,
        connector: Arc<dyn AgentConnector>,
        playback: Option<PlaybackSink>,
    ) -> (Self, SessionHandle) {
        let manager = SessionManager::new(settings);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(manager.snapshot());
        let (level_tx, level_rx) = watch::channel(0.0);

        let handle = SessionHandle {
            control: control_tx,
            snapshot: snapshot_rx,
            level: level_rx,
        };
        let controller = Self {
            manager,
            media,
            connector,
            playback,
            resources: SessionResources::default(),
            generation: 0,
            control_rx,
            internal_tx,
            internal_rx,
            snapshot_tx,
            level_tx: Arc::new(level_tx),
        };
        (controller, handle)
    }

    /// Runs the controller on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("session", agent_id = %self.manager.settings().agent_id);
        tokio::spawn(self.run().instrument(span))
    }

    /// Processes events until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!("Session controller running.");
        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Start) => self.apply(SessionEvent::Start).await,
                    Some(Control::Stop) => self.apply(SessionEvent::Stop).await,
                    Some(Control::Shutdown) | None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
            }
        }

        // Stop always ends in Release, so nothing outlives the controller.
        self.apply(SessionEvent::Stop).await;
        debug_assert!(self.resources.is_empty());
        info!("Session controller stopped.");
    }

    #[instrument(level = "debug", skip(self), fields(generation = self.generation))]
    async fn apply(&mut self, event: SessionEvent) {
        let commands = self.manager.handle(event);
        for command in commands {
            self.execute(command).await;
        }
        self.publish();
    }

    fn publish(&self) {
        let next = self.manager.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.state != next.state {
                info!(from = ?current.state, to = ?next.state, "Session state changed.");
            }
            *current = next;
            true
        });
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::AcquireMicrophone(constraints) => {
                self.generation += 1;
                let generation = self.generation;
                let media = self.media.clone();
                let tx = self.internal_tx.clone();
                debug!(generation, "Requesting microphone.");
                tokio::spawn(async move {
                    let result = media.request_capture(&constraints).await;
                    let _ = tx.send(Internal::Microphone { generation, result }).await;
                });
            }
            Command::OpenSession { agent_id } => {
                let generation = self.generation;
                let connector = self.connector.clone();
                let tx = self.internal_tx.clone();
                debug!(generation, %agent_id, "Opening agent session.");
                tokio::spawn(async move {
                    let result = connector.start_session(&agent_id).await;
                    let _ = tx.send(Internal::Opened { generation, result }).await;
                });
            }
            Command::Release => {
                self.generation += 1;
                self.resources.release().await;
                if let Some(playback) = &self.playback {
                    playback.clear();
                }
                self.level_tx.send_replace(0.0);
            }
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Microphone { generation, result } => {
                if generation != self.generation {
                    debug!(generation, "Dropping stale microphone result.");
                    return;
                }
                match result {
                    Ok(capture) => {
                        self.resources.capture = Some(capture);
                        self.apply(SessionEvent::MicrophoneReady).await;
                    }
                    Err(e) => self.apply(SessionEvent::MicrophoneFailed(e)).await,
                }
            }
            Internal::Opened { generation, result } => {
                if generation != self.generation {
                    debug!(generation, "Dropping stale agent session.");
                    return;
                }
                match result {
                    Ok(link) => self.attach(link, generation),
                    Err(e) => self.apply(SessionEvent::SessionOpenFailed(e)).await,
                }
            }
            Internal::Agent { generation, event } => {
                if generation != self.generation {
                    return;
                }
                let event = match event {
                    AgentEvent::Connect { conversation_id } => {
                        SessionEvent::Connected { conversation_id }
                    }
                    AgentEvent::Disconnect(reason) => SessionEvent::Disconnected(reason),
                    AgentEvent::Message(message) => SessionEvent::Message(message),
                    AgentEvent::ModeChange { speaking } => SessionEvent::ModeChange { speaking },
                    AgentEvent::Interruption => {
                        if let Some(playback) = &self.playback {
                            playback.clear();
                        }
                        SessionEvent::ModeChange { speaking: false }
                    }
                    AgentEvent::Error(e) => SessionEvent::Error(e),
                    // Routed straight to playback by the forwarder.
                    AgentEvent::Audio { .. } => return,
                };
                self.apply(event).await;
            }
            Internal::CaptureEnded { generation } => {
                if generation != self.generation {
                    return;
                }
                warn!("Microphone stream ended during the session.");
                self.apply(SessionEvent::MicrophoneFailed(SessionError::MediaAccess(
                    "microphone stream ended".into(),
                )))
                .await;
            }
        }
    }

    /// Wires a freshly opened link to the microphone and the event queue.
    fn attach(&mut self, mut link: AgentLink, generation: u64) {
        match self.resources.capture.as_mut().and_then(|c| c.take_frames()) {
            Some(frames) => self.resources.tasks.push(tokio::spawn(pump_microphone(
                frames,
                link.audio_sender(),
                self.level_tx.clone(),
                generation,
                self.internal_tx.clone(),
            ))),
            None => warn!("No microphone frames for the agent session."),
        }
        if let Some(events) = link.take_events() {
            self.resources.tasks.push(tokio::spawn(forward_agent_events(
                events,
                generation,
                self.internal_tx.clone(),
                self.playback.clone(),
            )));
        }
        self.resources.link = Some(link);
    }
}

/// Streams microphone frames to the agent and updates the level meter.
///
/// Reports [`Internal::CaptureEnded`] when the device side closes; a closed
/// agent side is left to the link's own events.
async fn pump_microphone(
    mut frames: mpsc::Receiver<AudioFrame>,
    audio_tx: mpsc::Sender<AudioFrame>,
    level_tx: Arc<watch::Sender<f32>>,
    generation: u64,
    internal_tx: mpsc::Sender<Internal>,
) {
    let mut meter = LevelMeter::default();
    loop {
        let Some(frame) = frames.recv().await else {
            level_tx.send_replace(0.0);
            let _ = internal_tx.send(Internal::CaptureEnded { generation }).await;
            return;
        };
        level_tx.send_replace(meter.update(&frame));
        if audio_tx.send(frame).await.is_err() {
            break;
        }
    }
    level_tx.send_replace(0.0);
}

async fn forward_agent_events(
    mut events: mpsc::Receiver<AgentEvent>,
    generation: u64,
    internal_tx: mpsc::Sender<Internal>,
    playback: Option<PlaybackSink>,
) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Audio {
                samples,
                sample_rate,
            } => {
                if let Some(playback) = &playback {
                    playback.play(samples, sample_rate);
                }
            }
            event => {
                if internal_tx
                    .send(Internal::Agent { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
