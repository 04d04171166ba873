//! Ambient-music controller, at its on/off contract.
//!
//! The actual decoding/output of background music is a collaborator concern;
//! the orchestrator only needs the on/off switch and the `is_playing` flag
//! that the waiting-music policy reads. Start/stop are idempotent and safe
//! to call from any task.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct AmbientAudioController {
    playing: AtomicBool,
    stop_in_progress: AtomicBool,
}

impl AmbientAudioController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn background audio on. No-op when already playing.
    pub fn start_work_music(&self) {
        if self.playing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_in_progress.store(false, Ordering::SeqCst);
        tracing::debug!("Ambient work music on");
    }

    /// Turn background audio off. No-op when already stopped or when a stop
    /// is already in flight.
    pub fn stop_work_music(&self) {
        if !self.playing.load(Ordering::SeqCst) {
            return;
        }
        if self.stop_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        self.playing.store(false, Ordering::SeqCst);
        tracing::debug!("Ambient work music off");
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_off_contract() {
        let ambient = AmbientAudioController::new();
        assert!(!ambient.is_playing());

        ambient.start_work_music();
        assert!(ambient.is_playing());
        // Idempotent
        ambient.start_work_music();
        assert!(ambient.is_playing());

        ambient.stop_work_music();
        assert!(!ambient.is_playing());
        ambient.stop_work_music();
        assert!(!ambient.is_playing());

        ambient.start_work_music();
        assert!(ambient.is_playing());
    }
}
