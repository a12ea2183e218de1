//! Microphone capture through cpal.
//!
//! cpal streams are not `Send`, so each capture owns a dedicated thread that
//! builds the stream, reports whether that worked, and then parks until the
//! [`CaptureHandle`] is released or dropped.

use crate::audio::{StreamResampler, convert_f32_to_i16, downmix_to_mono};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use kappatron_core::{AudioConstraints, AudioFrame, CaptureHandle, MediaAccess, SessionError};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Frames buffered between the audio callback and the session.
const FRAME_BUFFER: usize = 64;

/// Opens the system microphone for a session.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures from a named input device instead of the default one.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

fn media_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::MediaAccess(err.to_string())
}

#[async_trait]
impl MediaAccess for CpalMicrophone {
    async fn request_capture(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<CaptureHandle, SessionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let sample_rate = constraints.sample_rate;
        let thread_constraints = constraints.clone();
        let device_name = self.device_name.clone();
        let fatal_tx = stop_tx.clone();

        thread::Builder::new()
            .name("kappatron-mic".to_string())
            .spawn(move || {
                let stream =
                    match open_input(
                        device_name.as_deref(),
                        &thread_constraints,
                        frames_tx,
                        fatal_tx,
                    ) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(media_error(e)));
                    return;
                }
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                // An explicit release, the handle being dropped or a fatal
                // stream error wakes us. Dropping the stream closes the frame
                // channel, which the session sees as the capture ending.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream closed.");
            })
            .map_err(|e| media_error(format!("failed to start capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(sample_rate, "Microphone capture started.");
                Ok(CaptureHandle::new(frames_rx, sample_rate, move || {
                    let _ = stop_tx.send(());
                }))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Microphone unavailable.");
                Err(e)
            }
            Err(_) => Err(media_error("capture thread exited unexpectedly")),
        }
    }
}

fn open_input(
    device_name: Option<&str>,
    constraints: &AudioConstraints,
    frames_tx: mpsc::Sender<AudioFrame>,
    stop_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, SessionError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(media_error)?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| media_error(format!("input device '{name}' not found")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| media_error("no input device available"))?,
    };

    let supported = device.default_input_config().map_err(media_error)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    debug!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "Opening input stream."
    );

    if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control
    {
        debug!("Echo cancellation, noise suppression and gain control are left to the OS.");
    }
    if constraints.channel_count != 1 || constraints.sample_size != 16 {
        warn!(
            channel_count = constraints.channel_count,
            sample_size = constraints.sample_size,
            "Capture is always delivered as 16-bit mono."
        );
    }

    let pipeline = CapturePipeline::new(
        config.channels as usize,
        config.sample_rate.0,
        constraints.sample_rate,
        frames_tx,
    )?;

    match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, pipeline, stop_tx),
        SampleFormat::I16 => build_input::<i16>(&device, &config, pipeline, stop_tx),
        SampleFormat::U16 => build_input::<u16>(&device, &config, pipeline, stop_tx),
        other => Err(media_error(format!("unsupported sample format {other:?}"))),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut pipeline: CapturePipeline,
    stop_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, SessionError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                pipeline.push(&samples);
            },
            move |err| {
                error!(error = %err, "Microphone stream error.");
                if is_fatal(&err) {
                    let _ = stop_tx.send(());
                }
            },
            None,
        )
        .map_err(media_error)
}

/// Errors after which the stream will never deliver audio again.
fn is_fatal(err: &cpal::StreamError) -> bool {
    matches!(err, cpal::StreamError::DeviceNotAvailable)
}

/// Turns device callbacks into session frames: mono, at the requested
/// rate, PCM16.
struct CapturePipeline {
    channels: usize,
    resampler: StreamResampler,
    frames_tx: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

impl CapturePipeline {
    fn new(
        channels: usize,
        device_rate: u32,
        target_rate: u32,
        frames_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            channels,
            resampler: StreamResampler::new(device_rate, target_rate).map_err(media_error)?,
            frames_tx,
            dropped: 0,
        })
    }

    fn push(&mut self, interleaved: &[f32]) {
        let mono = downmix_to_mono(interleaved, self.channels);
        let resampled = self.resampler.process(&mono);
        if resampled.is_empty() {
            return;
        }
        match self.frames_tx.try_send(convert_f32_to_i16(&resampled)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    warn!(dropped = self.dropped, "Session is behind; dropping microphone frames.");
                }
            }
            // The session let go of the capture; the thread is about to stop.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_downmixes_and_converts() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut pipeline = CapturePipeline::new(2, 16_000, 16_000, tx).unwrap();

        pipeline.push(&[0.5, 0.5, -0.5, -0.5, 1.0, 0.0]);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, vec![16383, -16383, 16383]);
    }

    #[test]
    fn pipeline_resamples_to_the_requested_rate() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut pipeline = CapturePipeline::new(1, 48_000, 16_000, tx).unwrap();

        for _ in 0..10 {
            pipeline.push(&[0.0; 480]);
        }

        let mut total = 0;
        while let Ok(frame) = rx.try_recv() {
            total += frame.len();
        }
        // 4800 samples at 48 kHz is 100 ms, i.e. about 1600 samples at 16 kHz.
        assert!((1100..=1610).contains(&total), "got {total}");
    }

    #[test]
    fn pipeline_drops_frames_when_the_session_is_behind() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut pipeline = CapturePipeline::new(1, 16_000, 16_000, tx).unwrap();

        pipeline.push(&[0.1; 10]);
        pipeline.push(&[0.2; 10]);
        pipeline.push(&[0.3; 10]);

        assert_eq!(pipeline.dropped, 2);
        assert_eq!(rx.try_recv().unwrap().len(), 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unplugged_device_stops_the_capture() {
        assert!(is_fatal(&cpal::StreamError::DeviceNotAvailable));
        assert!(!is_fatal(&cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "buffer overrun".into(),
            },
        }));
    }

    #[test]
    fn pipeline_ignores_a_closed_session() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut pipeline = CapturePipeline::new(1, 16_000, 16_000, tx).unwrap();
        pipeline.push(&[0.1; 10]);
        assert_eq!(pipeline.dropped, 0);
    }
}
