//! Audio source capability.
//!
//! The core consumes audio through this trait and never touches devices
//! directly. Capture produces PCM16 mono frames at 16 kHz in ~100 ms chunks;
//! playback accepts PCM16 mono at 24 kHz and completes in FIFO order.

pub mod ambient;
pub mod local;

pub use ambient::AmbientAudioController;
pub use local::LocalAudioSource;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Capture sample rate expected by the speech model.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback sample rate produced by the speech model.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Capture chunk duration.
pub const CAPTURE_CHUNK_MS: u32 = 100;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio source not started")]
    NotStarted,
}

pub type AudioResult<T> = Result<T, AudioError>;

/// A capability for capturing and playing voice audio.
///
/// Exactly one source is active per session. When playback is in progress,
/// the source may suppress or buffer captured input to avoid echo; the core
/// treats the source as the authority on that.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire capture/playback resources. Idempotent.
    async fn start(&self) -> AudioResult<()>;

    /// Release resources. Idempotent.
    async fn stop(&self);

    /// Next captured frame: raw PCM16LE mono bytes at 16 kHz, ~100 ms.
    /// Returns `None` after `stop`.
    async fn next_frame(&self) -> Option<Vec<u8>>;

    /// Enqueue a PCM16LE mono frame at 24 kHz for FIFO playback.
    fn play(&self, pcm: Vec<u8>);

    /// Immediately drop queued playback (used on model interruption).
    fn stop_playback(&self);

    /// True when nothing is queued or playing.
    fn is_playback_complete(&self) -> bool;

    /// Wait until playback drains or the timeout elapses. Returns true if
    /// playback completed.
    async fn wait_for_playback_complete(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_playback_complete() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.is_playback_complete()
    }
}

/// Root-mean-square level of a PCM16LE frame, for speech detection.
pub fn frame_rms(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    ((sum / count as f64).sqrt()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_silence_is_zero() {
        let silence = vec![0u8; 320];
        assert_eq!(frame_rms(&silence), 0.0);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        let mut frame = Vec::new();
        for _ in 0..160 {
            frame.extend_from_slice(&1000i16.to_le_bytes());
        }
        let rms = frame_rms(&frame);
        assert!((rms - 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_rms_handles_odd_lengths() {
        assert_eq!(frame_rms(&[0x01]), 0.0);
        assert_eq!(frame_rms(&[]), 0.0);
    }
}
