//! Input level metering for the voice activity indicator.

/// Weight of the previous level when a new frame arrives.
pub const DEFAULT_SMOOTHING: f32 = 0.8;

/// Normalised loudness of one PCM16 frame in `0.0..=1.0`.
///
/// The mean absolute amplitude is scaled so that a half-scale signal reads
/// as full volume.
pub fn normalized_volume(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64).abs()).sum();
    let mean = sum / frame.len() as f64;
    (mean / 16_384.0).clamp(0.0, 1.0) as f32
}

/// Exponentially smoothed input level.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    smoothing: f32,
    level: f32,
}

impl LevelMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            level: 0.0,
        }
    }

    /// Feeds one frame and returns the updated level.
    pub fn update(&mut self, frame: &[i16]) -> f32 {
        let current = normalized_volume(frame);
        self.level = self.smoothing * self.level + (1.0 - self.smoothing) * current;
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING)
    }
}
