//! Audio playback scheduling
//!
//! Decodes base64 PCM chunks and schedules them on the output device. Live
//! session chunks are queued back-to-back behind a monotonic cursor so
//! consecutive chunks play gaplessly; one-shot utterances interrupt whatever
//! is playing. Every scheduled buffer is tracked in a registry so playback can
//! be cancelled en masse on interruption or teardown.

use crate::codec::{self, CodecError};
use thiserror::Error;
use tracing::{debug, warn};

/// Sample rate of model audio (Gemini TTS and live output are 24 kHz mono).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Identifier of one buffer scheduled on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// Error type for playback operations
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("audio output unavailable: {0}")]
    OutputUnavailable(String),

    #[error("source already finished")]
    SourceFinished,
}

/// Seam over the platform output device. The production implementation is
/// [`crate::audio::PulseOutput`]; tests drive the scheduler with a manual
/// clock.
pub trait AudioOut: Send {
    /// Seconds elapsed on the output clock.
    fn now(&self) -> f64;

    /// Schedule mono samples to begin at `start` seconds on the output clock.
    fn schedule(&mut self, samples: Vec<f32>, start: f64) -> SourceId;

    /// Halt a scheduled source. `Err(SourceFinished)` if it already completed
    /// naturally.
    fn stop(&mut self, id: SourceId) -> Result<(), PlaybackError>;

    /// Whether the source is still scheduled or playing.
    fn is_active(&self, id: SourceId) -> bool;

    /// Release the device.
    fn close(&mut self);
}

pub type OutFactory = Box<dyn Fn() -> Result<Box<dyn AudioOut>, PlaybackError> + Send>;

/// Schedules decoded PCM on a lazily created output device.
pub struct PlaybackScheduler {
    open: OutFactory,
    out: Option<Box<dyn AudioOut>>,
    registry: Vec<SourceId>,
    next_start: f64,
}

impl PlaybackScheduler {
    pub fn new(open: OutFactory) -> Self {
        Self {
            open,
            out: None,
            registry: Vec::new(),
            next_start: 0.0,
        }
    }

    /// Decode a base64 chunk, cancel everything currently scheduled, and play
    /// the new buffer from now. A new one-shot utterance always interrupts the
    /// prior one.
    pub fn play_immediate(&mut self, base64_audio: &str) -> Result<(), PlaybackError> {
        let samples = decode_mono(base64_audio)?;
        self.stop_all();
        let out = self.ensure_out()?;
        let id = out.schedule(samples, out.now());
        self.registry.push(id);
        Ok(())
    }

    /// Decode a base64 chunk and queue it behind the last streamed chunk.
    pub fn enqueue_streaming(&mut self, base64_audio: &str) -> Result<(), PlaybackError> {
        let samples = decode_mono(base64_audio)?;
        self.enqueue_samples(samples)
    }

    /// Queue raw S16LE PCM already decoded from the wire.
    pub fn enqueue_streaming_pcm(&mut self, pcm: &[u8]) -> Result<(), PlaybackError> {
        let mut channels = codec::pcm_to_float(pcm, 1)?;
        self.enqueue_samples(channels.remove(0))
    }

    fn enqueue_samples(&mut self, samples: Vec<f32>) -> Result<(), PlaybackError> {
        let duration = codec::frames_to_seconds(samples.len(), OUTPUT_SAMPLE_RATE);
        let cursor = self.next_start;
        let out = self.ensure_out()?;

        // Chunks may arrive faster than real time; start where the previous
        // one ends, never in the past.
        let start = cursor.max(out.now());
        let id = out.schedule(samples, start);
        self.next_start = start + duration;
        self.registry.push(id);
        self.prune_finished();
        Ok(())
    }

    /// Stop every registered source, clear the registry and reset the cursor.
    /// Sources that already finished naturally are expected and ignored.
    pub fn stop_all(&mut self) {
        if let Some(out) = self.out.as_mut() {
            for id in self.registry.drain(..) {
                if let Err(e) = out.stop(id) {
                    debug!(?id, "stop ignored: {e}");
                }
            }
        }
        self.next_start = 0.0;
    }

    /// Stop playback and release the output device. The next play call opens
    /// a fresh one.
    pub fn close(&mut self) {
        self.stop_all();
        if let Some(mut out) = self.out.take() {
            out.close();
        }
    }

    /// Number of sources currently registered.
    pub fn active_sources(&self) -> usize {
        self.registry.len()
    }

    fn ensure_out(&mut self) -> Result<&mut Box<dyn AudioOut>, PlaybackError> {
        if self.out.is_none() {
            match (self.open)() {
                Ok(out) => self.out = Some(out),
                Err(e) => {
                    warn!("failed to open audio output: {e}");
                    return Err(e);
                }
            }
        }
        Ok(self.out.as_mut().expect("output just created"))
    }

    /// Drop registry entries for sources that completed naturally; a handle
    /// that already finished must never linger or be stopped later.
    fn prune_finished(&mut self) {
        if let Some(out) = self.out.as_ref() {
            self.registry.retain(|id| out.is_active(*id));
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_mono(base64_audio: &str) -> Result<Vec<f32>, PlaybackError> {
    let bytes = codec::decode(base64_audio)?;
    let mut channels = codec::pcm_to_float(&bytes, 1)?;
    Ok(channels.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        clock: f64,
        next_id: u64,
        active: Vec<(SourceId, f64, f64)>, // id, start, duration
        opened: usize,
        closed: usize,
    }

    impl FakeState {
        /// Move the clock and let sources whose window passed finish
        /// naturally.
        fn advance(&mut self, seconds: f64) {
            self.clock += seconds;
            let now = self.clock;
            self.active.retain(|(_, start, dur)| start + dur > now);
        }
    }

    struct FakeOut(Arc<Mutex<FakeState>>);

    impl AudioOut for FakeOut {
        fn now(&self) -> f64 {
            self.0.lock().unwrap().clock
        }

        fn schedule(&mut self, samples: Vec<f32>, start: f64) -> SourceId {
            let mut state = self.0.lock().unwrap();
            state.next_id += 1;
            let id = SourceId(state.next_id);
            let duration = samples.len() as f64 / OUTPUT_SAMPLE_RATE as f64;
            state.active.push((id, start, duration));
            id
        }

        fn stop(&mut self, id: SourceId) -> Result<(), PlaybackError> {
            let mut state = self.0.lock().unwrap();
            let before = state.active.len();
            state.active.retain(|(sid, _, _)| *sid != id);
            if state.active.len() == before {
                Err(PlaybackError::SourceFinished)
            } else {
                Ok(())
            }
        }

        fn is_active(&self, id: SourceId) -> bool {
            self.0.lock().unwrap().active.iter().any(|(sid, _, _)| *sid == id)
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let shared = state.clone();
        let scheduler = PlaybackScheduler::new(Box::new(move || {
            shared.lock().unwrap().opened += 1;
            Ok(Box::new(FakeOut(shared.clone())) as Box<dyn AudioOut>)
        }));
        (scheduler, state)
    }

    /// 1024 frames of silence as base64 S16LE.
    fn chunk(frames: usize) -> String {
        codec::encode(&vec![0u8; frames * 2])
    }

    #[test]
    fn streamed_chunks_are_gapless_and_non_overlapping() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap(); // 0.1 s
        scheduler.enqueue_streaming(&chunk(4800)).unwrap(); // 0.2 s

        let state = state.lock().unwrap();
        let (_, start_a, dur_a) = state.active[0];
        let (_, start_b, _) = state.active[1];
        assert!(start_b >= start_a + dur_a - 1e-9);
        assert!(start_b - (start_a + dur_a) < 1e-9, "gap between chunks");
    }

    #[test]
    fn enqueue_after_idle_starts_at_the_clock() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        state.lock().unwrap().advance(5.0);

        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        let state = state.lock().unwrap();
        let (_, start, _) = *state.active.last().unwrap();
        assert_eq!(start, 5.0);
    }

    #[test]
    fn stop_all_clears_registry_and_resets_cursor() {
        let (mut scheduler, state) = scheduler();
        for _ in 0..3 {
            scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        }
        assert_eq!(scheduler.active_sources(), 3);

        scheduler.stop_all();
        assert_eq!(scheduler.active_sources(), 0);
        assert!(state.lock().unwrap().active.is_empty());

        // The next streamed chunk recomputes its start from the clock.
        state.lock().unwrap().advance(2.0);
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        let state = state.lock().unwrap();
        let (_, start, _) = *state.active.last().unwrap();
        assert_eq!(start, 2.0);
    }

    #[test]
    fn stop_all_tolerates_naturally_finished_sources() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        // Let the source run out before stopping; FakeOut then reports
        // SourceFinished, which must be swallowed.
        state.lock().unwrap().advance(1.0);
        scheduler.stop_all();
        assert_eq!(scheduler.active_sources(), 0);
    }

    #[test]
    fn finished_sources_are_never_reregistered() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        state.lock().unwrap().advance(1.0);
        // The follow-up enqueue prunes the finished handle instead of keeping
        // it alongside the new one.
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        assert_eq!(scheduler.active_sources(), 1);
    }

    #[test]
    fn play_immediate_interrupts_prior_playback() {
        let (mut scheduler, state) = scheduler();
        scheduler.play_immediate(&chunk(24_000)).unwrap();
        scheduler.play_immediate(&chunk(24_000)).unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.active.len(), 1, "old utterance must be cancelled");
        assert_eq!(scheduler.active_sources(), 1);
    }

    #[test]
    fn output_is_opened_once_and_reopened_after_close() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        scheduler.enqueue_streaming(&chunk(2400)).unwrap();
        assert_eq!(state.lock().unwrap().opened, 1);

        scheduler.close();
        assert_eq!(state.lock().unwrap().closed, 1);

        scheduler.play_immediate(&chunk(2400)).unwrap();
        assert_eq!(state.lock().unwrap().opened, 2);
    }

    #[test]
    fn bad_base64_is_an_error_not_a_panic() {
        let (mut scheduler, _) = scheduler();
        assert!(scheduler.enqueue_streaming("@@@").is_err());
        assert!(scheduler.play_immediate("@@@").is_err());
    }
}
