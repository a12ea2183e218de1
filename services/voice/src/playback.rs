//! Speaker output for agent speech.
//!
//! A dedicated thread owns the cpal output stream. Audio reaches it through
//! a [`PlaybackSink`], is resampled to the device rate and queued in a ring
//! buffer that the device callback drains.

use crate::audio::{StreamResampler, convert_i16_to_f32};
use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
    mpsc as std_mpsc,
};
use std::thread;
use tracing::{debug, error, info, warn};

/// Seconds of agent speech the ring buffer can hold.
const BUFFER_SECONDS: usize = 30;

#[derive(Debug)]
enum PlaybackCommand {
    Audio { samples: Vec<i16>, sample_rate: u32 },
    Clear,
}

/// Cheap handle for queueing agent audio.
///
/// The playback thread keeps running while any sink is alive.
#[derive(Debug, Clone)]
pub struct PlaybackSink {
    tx: std_mpsc::Sender<PlaybackCommand>,
}

impl PlaybackSink {
    /// Queues PCM16 mono speech recorded at `sample_rate`.
    pub fn play(&self, samples: Vec<i16>, sample_rate: u32) {
        if self
            .tx
            .send(PlaybackCommand::Audio {
                samples,
                sample_rate,
            })
            .is_err()
        {
            debug!("Playback thread is gone; dropping agent audio.");
        }
    }

    /// Drops everything queued but not yet played.
    pub fn clear(&self) {
        let _ = self.tx.send(PlaybackCommand::Clear);
    }
}

/// Starts the playback thread on the default output device.
pub fn start() -> anyhow::Result<PlaybackSink> {
    let (tx, rx) = std_mpsc::channel();
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

    thread::Builder::new()
        .name("kappatron-playback".to_string())
        .spawn(move || {
            let (stream, mut queue) = match open_output() {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(anyhow!(e).context("failed to start output stream")));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while let Ok(command) = rx.recv() {
                match command {
                    PlaybackCommand::Audio {
                        samples,
                        sample_rate,
                    } => queue.push(&samples, sample_rate),
                    PlaybackCommand::Clear => queue.clear(),
                }
            }
            drop(stream);
            debug!("Playback stopped.");
        })
        .context("failed to start playback thread")?;

    ready_rx
        .recv()
        .map_err(|_| anyhow!("playback thread exited unexpectedly"))??;
    info!("Playback ready.");
    Ok(PlaybackSink { tx })
}

fn open_output() -> anyhow::Result<(cpal::Stream, PlaybackQueue)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no output device available"))?;
    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    debug!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "Opening output stream."
    );

    let (queue, source) =
        playback_buffer(config.sample_rate.0 as usize * BUFFER_SECONDS, config.sample_rate.0);

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, source)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, source)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, source)?,
        other => return Err(anyhow!("unsupported sample format {other:?}")),
    };
    Ok((stream, queue))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut source: PlaybackSource,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            source.drop_stale();
            for frame in out.chunks_mut(channels) {
                let sample = source.next_sample();
                for slot in frame.iter_mut() {
                    *slot = T::from_sample(sample);
                }
            }
        },
        |err| error!(error = %err, "Playback stream error."),
        None,
    )?;
    Ok(stream)
}

/// Splits a ring buffer of `capacity` samples into the two playback halves.
///
/// Both sides count every sample that passes through. A clear publishes the
/// producer's count, and the consumer skips up to it on its next callback,
/// so audio queued after the clear survives.
fn playback_buffer(capacity: usize, device_rate: u32) -> (PlaybackQueue, PlaybackSource) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
    let clear_until = Arc::new(AtomicU64::new(0));
    (
        PlaybackQueue {
            producer,
            clear_until: clear_until.clone(),
            pushed: 0,
            device_rate,
            resampler: None,
        },
        PlaybackSource {
            consumer,
            clear_until,
            popped: 0,
        },
    )
}

/// Producer side of the ring buffer, owned by the playback thread.
struct PlaybackQueue {
    producer: HeapProd<f32>,
    clear_until: Arc<AtomicU64>,
    pushed: u64,
    device_rate: u32,
    resampler: Option<(u32, StreamResampler)>,
}

impl PlaybackQueue {
    fn push(&mut self, samples: &[i16], sample_rate: u32) {
        if !matches!(&self.resampler, Some((rate, _)) if *rate == sample_rate) {
            match StreamResampler::new(sample_rate, self.device_rate) {
                Ok(resampler) => self.resampler = Some((sample_rate, resampler)),
                Err(e) => {
                    warn!(error = %e, sample_rate, "Cannot resample agent audio.");
                    return;
                }
            }
        }
        let Some((_, resampler)) = self.resampler.as_mut() else {
            return;
        };
        let resampled = resampler.process(&convert_i16_to_f32(samples));
        let written = self.producer.push_slice(&resampled);
        self.pushed += written as u64;
        if written < resampled.len() {
            warn!(
                dropped = resampled.len() - written,
                queued = self.producer.occupied_len(),
                "Playback buffer full; dropping agent audio."
            );
        }
    }

    /// Marks everything pushed so far as stale.
    fn clear(&mut self) {
        self.clear_until.store(self.pushed, Ordering::Release);
        if let Some((_, resampler)) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Consumer side of the ring buffer, owned by the device callback.
struct PlaybackSource {
    consumer: HeapCons<f32>,
    clear_until: Arc<AtomicU64>,
    popped: u64,
}

impl PlaybackSource {
    /// Skips samples that were queued before the latest clear.
    fn drop_stale(&mut self) {
        let until = self.clear_until.load(Ordering::Acquire);
        if until > self.popped {
            let skipped = self.consumer.skip((until - self.popped) as usize);
            self.popped += skipped as u64;
        }
    }

    /// The next queued sample, or silence.
    fn next_sample(&mut self) -> f32 {
        match self.consumer.try_pop() {
            Some(sample) => {
                self.popped += 1;
                sample
            }
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut PlaybackSource) -> Vec<f32> {
        source.drop_stale();
        std::iter::from_fn(|| source.consumer.try_pop()).collect()
    }

    #[test]
    fn agent_audio_is_resampled_to_the_device_rate() {
        let (mut queue, source) = playback_buffer(48_000, 48_000);
        queue.push(&[1_000; 1_600], 16_000);

        // 100 ms of 16 kHz speech is about 4800 samples at 48 kHz.
        let queued = source.consumer.occupied_len();
        assert!((4_000..=4_800).contains(&queued), "queued {queued}");
    }

    #[test]
    fn clear_drops_queued_audio_but_keeps_what_follows() {
        let (mut queue, mut source) = playback_buffer(1_000, 16_000);
        queue.push(&[8_192; 100], 16_000);
        for _ in 0..50 {
            source.next_sample();
        }

        queue.clear();
        queue.push(&[-8_192; 20], 16_000);

        let remaining = drain(&mut source);
        assert_eq!(remaining.len(), 20);
        assert!(remaining.iter().all(|s| *s < 0.0));
    }

    #[test]
    fn clear_with_nothing_played_empties_the_queue() {
        let (mut queue, mut source) = playback_buffer(1_000, 16_000);
        queue.push(&[8_192; 100], 16_000);
        queue.clear();

        source.drop_stale();
        assert_eq!(source.next_sample(), 0.0);
        assert_eq!(source.popped, 100);
    }

    #[test]
    fn full_buffer_drops_the_overflow() {
        let (mut queue, source) = playback_buffer(100, 16_000);
        queue.push(&[1_000; 160], 16_000);

        assert_eq!(source.consumer.occupied_len(), 100);
        assert_eq!(queue.pushed, 100);
    }
}
