//! Local microphone/speaker source backed by cpal.
//!
//! cpal streams are `!Send` on most platforms, so both streams live on a
//! dedicated audio thread that owns them until stop. The capture callback
//! runs on an OS audio thread and must not allocate, block, or do I/O; it
//! only pushes samples through lock-free channels.
//!
//! Echo handling: frames captured while playback is draining are discarded.
//! Without hardware echo cancellation they contain the assistant's own
//! voice, which would feed back into speech detection.

use super::{AudioError, AudioResult, AudioSource};
#[cfg(feature = "audio-cpal")]
use super::{CAPTURE_CHUNK_MS, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use async_trait::async_trait;
#[cfg(feature = "audio-cpal")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

enum Control {
    Stop,
}

struct Shared {
    running: AtomicBool,
    /// Samples currently queued or buffered for playback.
    queued_samples: AtomicUsize,
    /// Bumped by `stop_playback`; the output callback flushes its local
    /// buffer when it observes a new generation.
    flush_generation: AtomicUsize,
}

pub struct LocalAudioSource {
    shared: Arc<Shared>,
    frame_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    frame_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    playback_tx: crossbeam_channel::Sender<Vec<i16>>,
    playback_rx: crossbeam_channel::Receiver<Vec<i16>>,
    control_tx: Mutex<Option<crossbeam_channel::Sender<Control>>>,
}

impl Default for LocalAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAudioSource {
    pub fn new() -> Self {
        let (playback_tx, playback_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                queued_samples: AtomicUsize::new(0),
                flush_generation: AtomicUsize::new(0),
            }),
            frame_rx: Mutex::new(None),
            frame_tx: Mutex::new(None),
            playback_tx,
            playback_rx,
            control_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AudioSource for LocalAudioSource {
    #[cfg(not(feature = "audio-cpal"))]
    async fn start(&self) -> AudioResult<()> {
        Err(AudioError::Device(
            "built without the audio-cpal feature; no device backend available".to_string(),
        ))
    }

    #[cfg(feature = "audio-cpal")]
    async fn start(&self) -> AudioResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        *self.frame_rx.lock().await = Some(frame_rx);
        *self.frame_tx.lock().await = Some(frame_tx.clone());

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        *self.control_tx.lock().await = Some(control_tx);

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let shared = self.shared.clone();
        let playback_rx = self.playback_rx.clone();

        std::thread::Builder::new()
            .name("parley-audio".to_string())
            .spawn(move || {
                audio_thread(shared, frame_tx, playback_rx, control_rx, ready_tx);
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::info!(
                    capture_hz = CAPTURE_SAMPLE_RATE,
                    playback_hz = PLAYBACK_SAMPLE_RATE,
                    "Audio started"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(AudioError::Device("audio thread exited during startup".to_string()))
            }
        }
    }

    async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.control_tx.lock().await.take() {
            let _ = tx.send(Control::Stop);
        }
        *self.frame_tx.lock().await = None;
        self.stop_playback();
    }

    async fn next_frame(&self) -> Option<Vec<u8>> {
        let mut guard = self.frame_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn play(&self, pcm: Vec<u8>) {
        if pcm.is_empty() {
            return;
        }
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.shared.queued_samples.fetch_add(samples.len(), Ordering::SeqCst);
        let _ = self.playback_tx.send(samples);
    }

    fn stop_playback(&self) {
        // Drain everything still queued, then tell the output callback to
        // flush whatever it already pulled.
        let mut drained = 0usize;
        while let Ok(chunk) = self.playback_rx.try_recv() {
            drained += chunk.len();
        }
        if drained > 0 {
            let _ = self
                .shared
                .queued_samples
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(drained)));
        }
        self.shared.flush_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playback_complete(&self) -> bool {
        self.shared.queued_samples.load(Ordering::SeqCst) == 0
    }
}

/// Owns the cpal streams for the lifetime of the session.
#[cfg(feature = "audio-cpal")]
fn audio_thread(
    shared: Arc<Shared>,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    playback_rx: crossbeam_channel::Receiver<Vec<i16>>,
    control_rx: crossbeam_channel::Receiver<Control>,
    ready_tx: tokio::sync::oneshot::Sender<AudioResult<()>>,
) {
    let host = cpal::default_host();

    let input_device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(AudioError::NoInputDevice));
            return;
        }
    };
    let output_device = match host.default_output_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(AudioError::NoOutputDevice));
            return;
        }
    };

    let input_rate = input_device
        .default_input_config()
        .map(|c| c.sample_rate().0)
        .unwrap_or(CAPTURE_SAMPLE_RATE);

    let input_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(input_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(PLAYBACK_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_samples = (CAPTURE_SAMPLE_RATE * CAPTURE_CHUNK_MS / 1000) as usize;

    // Capture state local to the callback: device-rate staging plus the
    // 16 kHz chunk under construction.
    let capture_shared = shared.clone();
    let mut staging: Vec<f32> = Vec::with_capacity(4096);
    let mut chunk: Vec<i16> = Vec::with_capacity(chunk_samples);
    let mut discarded_frames = 0usize;

    let input_stream = input_device.build_input_stream(
        &input_config,
        move |data: &[f32], _| {
            if !capture_shared.running.load(Ordering::Relaxed) {
                return;
            }
            staging.extend_from_slice(data);
            let resampled = resample_linear(&staging, input_rate, CAPTURE_SAMPLE_RATE);
            staging.clear();

            for sample in resampled {
                chunk.push((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
                if chunk.len() >= chunk_samples {
                    let playback_active = capture_shared.queued_samples.load(Ordering::Relaxed) > 0;
                    if playback_active {
                        // Echo of our own playback; drop it.
                        discarded_frames += 1;
                    } else {
                        if discarded_frames > 0 {
                            discarded_frames = 0;
                        }
                        let mut bytes = Vec::with_capacity(chunk.len() * 2);
                        for s in &chunk {
                            bytes.extend_from_slice(&s.to_le_bytes());
                        }
                        let _ = frame_tx.send(bytes);
                    }
                    chunk.clear();
                }
            }
        },
        |e| tracing::warn!(error = %e, "Audio input stream error"),
        None,
    );

    let input_stream = match input_stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(AudioError::Device(e.to_string())));
            return;
        }
    };

    // Output callback pulls queued chunks into a local buffer; a flush
    // generation bump empties it immediately.
    let output_shared = shared.clone();
    let mut out_buffer: std::collections::VecDeque<i16> = std::collections::VecDeque::new();
    let mut seen_generation = shared.flush_generation.load(Ordering::SeqCst);

    let output_stream = output_device.build_output_stream(
        &output_config,
        move |data: &mut [f32], _| {
            let generation = output_shared.flush_generation.load(Ordering::Relaxed);
            if generation != seen_generation {
                seen_generation = generation;
                if !out_buffer.is_empty() {
                    let len = out_buffer.len();
                    out_buffer.clear();
                    let _ = output_shared
                        .queued_samples
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(len)));
                }
            }

            for slot in data.iter_mut() {
                if out_buffer.is_empty() {
                    if let Ok(next) = playback_rx.try_recv() {
                        out_buffer.extend(next);
                    }
                }
                match out_buffer.pop_front() {
                    Some(sample) => {
                        let _ = output_shared
                            .queued_samples
                            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
                        *slot = sample as f32 / 32767.0;
                    }
                    None => *slot = 0.0,
                }
            }
        },
        |e| tracing::warn!(error = %e, "Audio output stream error"),
        None,
    );

    let output_stream = match output_stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(AudioError::Device(e.to_string())));
            return;
        }
    };

    if let Err(e) = input_stream.play() {
        let _ = ready_tx.send(Err(AudioError::Device(e.to_string())));
        return;
    }
    if let Err(e) = output_stream.play() {
        let _ = ready_tx.send(Err(AudioError::Device(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Park until told to stop; dropping the streams tears them down.
    let _ = control_rx.recv();
    drop(input_stream);
    drop(output_stream);
    tracing::info!("Audio stopped");
}

/// Linear-interpolation resampler. Speech to a VAD doesn't need better.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = ((input.len() as f64) * ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
    }

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..1000).map(|i| (i as f32) / 1000.0).collect();
        let out = resample_linear(&input, 32_000, 16_000);
        assert_eq!(out.len(), 500);
        // Monotone input stays monotone.
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample_linear(&[], 48_000, 16_000).is_empty());
    }
}
