//! The media-access seam: how a session obtains microphone audio.

use crate::error::SessionError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// A block of mono PCM16 samples at the capture sample rate.
pub type AudioFrame = Vec<i16>;

/// Capture constraints requested when opening the microphone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    /// Samples per second delivered to the session.
    pub sample_rate: u32,
    /// Bits per sample delivered to the session.
    pub sample_size: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 1,
            sample_rate: 16_000,
            sample_size: 16,
        }
    }
}

/// A live, revocable microphone stream.
///
/// The device stays open until [`CaptureHandle::release`] is called or the
/// handle is dropped, whichever comes first.
pub struct CaptureHandle {
    frames: Option<mpsc::Receiver<AudioFrame>>,
    sample_rate: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    /// Wraps a frame channel together with the action that closes the device.
    pub fn new(
        frames: mpsc::Receiver<AudioFrame>,
        sample_rate: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames: Some(frames),
            sample_rate,
            release: Some(Box::new(release)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Takes the frame receiver. Returns `None` once it has been taken.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Closes the device. Idempotent.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.frames = None;
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("sample_rate", &self.sample_rate)
            .field("frames_taken", &self.frames.is_none())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Permission-gated access to an audio input device.
#[async_trait]
pub trait MediaAccess: Send + Sync {
    /// Opens the microphone with the given constraints.
    ///
    /// Fails with [`SessionError::MediaAccess`] when permission is denied or
    /// no usable device exists.
    async fn request_capture(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<CaptureHandle, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_handle(counter: &Arc<AtomicUsize>) -> CaptureHandle {
        let (_tx, rx) = mpsc::channel(1);
        let counter = counter.clone();
        CaptureHandle::new(rx, 16_000, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn release_runs_once_even_when_dropped_afterwards() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut handle = counted_handle(&releases);
        handle.release();
        handle.release();
        assert!(handle.is_released());
        drop(handle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_unreleased_handle_closes_the_device() {
        let releases = Arc::new(AtomicUsize::new(0));
        {
            let mut handle = counted_handle(&releases);
            assert!(handle.take_frames().is_some());
            assert!(handle.take_frames().is_none());
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_constraints_request_processed_mono_pcm16() {
        let c = AudioConstraints::default();
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);
        assert_eq!((c.channel_count, c.sample_rate, c.sample_size), (1, 16_000, 16));
    }
}
