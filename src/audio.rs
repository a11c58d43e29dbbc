//! PulseAudio device plumbing
//!
//! Two device endpoints, each owned by a dedicated OS thread so blocking
//! PulseAudio I/O never touches the async runtime:
//!
//! - [`MicCapture`] reads fixed-size microphone blocks, converts them to
//!   base64 S16 PCM and forwards them to the live session.
//! - [`PulseOutput`] implements [`AudioOut`] by mixing scheduled buffers from
//!   a shared timeline and blocking-writing the rendered frames to the
//!   default sink.

use crate::codec;
use crate::playback::{AudioOut, PlaybackError, SourceId, OUTPUT_SAMPLE_RATE};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Capture rate expected by the live endpoint for realtime input.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per capture block. Each block becomes one realtime-input event.
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

/// Frames rendered per playback write (~43 ms at 24 kHz).
const RENDER_BLOCK_FRAMES: usize = 1024;

const APP_NAME: &str = "toralive";

/// Error type for audio device operations
#[derive(Debug, Error)]
pub enum AudioError {
    /// The capture device refused to open: access denied or no device.
    #[error("microphone unavailable (access denied or no capture device): {0}")]
    PermissionDenied(String),

    #[error("playback device unavailable: {0}")]
    OutputUnavailable(String),

    #[error("audio worker thread ended before reporting device state")]
    WorkerGone,
}

/// Streams microphone blocks into the live session.
///
/// The PulseAudio handle lives entirely on the worker thread; `start` only
/// returns once the device opened (or refused to).
pub struct MicCapture {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MicCapture {
    /// Open the default capture source and start forwarding base64-encoded
    /// S16 PCM blocks into `blocks`. Fails with `PermissionDenied` when the
    /// source cannot be opened.
    pub fn start(blocks: mpsc::Sender<String>) -> Result<Self, AudioError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);

        let worker = std::thread::spawn(move || {
            let spec = Spec {
                format: Format::F32le,
                channels: 1,
                rate: CAPTURE_SAMPLE_RATE,
            };
            let simple = match Simple::new(
                None,
                APP_NAME,
                Direction::Record,
                None,
                "mic",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => simple,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::PermissionDenied(format!("{e}"))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            info!("microphone capture started ({CAPTURE_SAMPLE_RATE} Hz mono)");
            capture_loop(simple, blocks, flag);
            debug!("microphone capture thread exited");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shutdown,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(AudioError::WorkerGone),
        }
    }

    /// Stop capturing and release the device. Safe to call repeatedly and
    /// after the worker already exited on its own.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(simple: Simple, blocks: mpsc::Sender<String>, shutdown: Arc<AtomicBool>) {
    let mut raw = vec![0u8; CAPTURE_BLOCK_SAMPLES * 4];
    let mut frame = vec![0f32; CAPTURE_BLOCK_SAMPLES];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = simple.read(&mut raw) {
            error!("microphone read failed: {e}");
            break;
        }
        for (sample, bytes) in frame.iter_mut().zip(raw.chunks_exact(4)) {
            *sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        let block = codec::encode(&codec::float_to_pcm(&frame));
        // A closed receiver means the session hung up while this block was
        // being read; drop it and stop.
        if blocks.blocking_send(block).is_err() {
            break;
        }
    }
}

struct Source {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

#[derive(Default)]
struct Timeline {
    clock_frames: u64,
    next_id: u64,
    sources: Vec<Source>,
}

impl Timeline {
    /// Mix every due source into `block` and advance the clock past it.
    /// Sources drained by the block are dropped; they finished naturally.
    fn mix_block(&mut self, block: &mut [f32]) {
        block.fill(0.0);
        let clock = self.clock_frames;
        let end = clock + block.len() as u64;
        self.sources.retain_mut(|source| {
            let s_start = source.start_frame;
            let s_end = s_start + source.samples.len() as u64;
            if s_end <= clock {
                return false;
            }
            if s_start < end {
                for t in s_start.max(clock)..s_end.min(end) {
                    block[(t - clock) as usize] += source.samples[(t - s_start) as usize];
                }
            }
            s_end > end
        });
        for sample in block.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.clock_frames = end;
    }
}

/// Default-sink playback device backing [`crate::playback::PlaybackScheduler`].
///
/// Scheduled buffers sit on a shared timeline keyed by start frame; a render
/// thread mixes them into fixed blocks and blocking-writes the result, which
/// paces the mix loop to real time and drives the output clock.
pub struct PulseOutput {
    timeline: Arc<Mutex<Timeline>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PulseOutput {
    pub fn open() -> Result<Self, AudioError> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = timeline.clone();
        let flag = shutdown.clone();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);

        let worker = std::thread::spawn(move || {
            let spec = Spec {
                format: Format::F32le,
                channels: 1,
                rate: OUTPUT_SAMPLE_RATE,
            };
            let simple = match Simple::new(
                None,
                APP_NAME,
                Direction::Playback,
                None,
                "voice",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => simple,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::OutputUnavailable(format!("{e}"))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            info!("audio output opened ({OUTPUT_SAMPLE_RATE} Hz mono)");
            render_loop(simple, shared, flag);
            debug!("audio output thread exited");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                timeline,
                shutdown,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(AudioError::WorkerGone),
        }
    }
}

fn render_loop(simple: Simple, timeline: Arc<Mutex<Timeline>>, shutdown: Arc<AtomicBool>) {
    let mut block = vec![0f32; RENDER_BLOCK_FRAMES];
    let mut bytes = vec![0u8; RENDER_BLOCK_FRAMES * 4];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        {
            let mut timeline = timeline.lock().expect("timeline poisoned");
            timeline.mix_block(&mut block);
        }
        for (out, sample) in bytes.chunks_exact_mut(4).zip(&block) {
            out.copy_from_slice(&sample.to_le_bytes());
        }
        // The blocking write keeps this loop at the device's pace.
        if let Err(e) = simple.write(&bytes) {
            error!("playback write failed: {e}");
            break;
        }
    }
    let _ = simple.flush();
}

impl AudioOut for PulseOutput {
    fn now(&self) -> f64 {
        let timeline = self.timeline.lock().expect("timeline poisoned");
        timeline.clock_frames as f64 / OUTPUT_SAMPLE_RATE as f64
    }

    fn schedule(&mut self, samples: Vec<f32>, start: f64) -> SourceId {
        let mut timeline = self.timeline.lock().expect("timeline poisoned");
        timeline.next_id += 1;
        let id = SourceId(timeline.next_id);
        let start_frame = (start.max(0.0) * OUTPUT_SAMPLE_RATE as f64).round() as u64;
        // Keep the timeline ordered by non-decreasing start offset.
        let at = timeline
            .sources
            .partition_point(|s| s.start_frame <= start_frame);
        timeline.sources.insert(
            at,
            Source {
                id,
                start_frame,
                samples,
            },
        );
        id
    }

    fn stop(&mut self, id: SourceId) -> Result<(), PlaybackError> {
        let mut timeline = self.timeline.lock().expect("timeline poisoned");
        let before = timeline.sources.len();
        timeline.sources.retain(|s| s.id != id);
        if timeline.sources.len() == before {
            Err(PlaybackError::SourceFinished)
        } else {
            Ok(())
        }
    }

    fn is_active(&self, id: SourceId) -> bool {
        let timeline = self.timeline.lock().expect("timeline poisoned");
        timeline.sources.iter().any(|s| s.id == id)
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: u64, start_frame: u64, frames: usize, value: f32) -> Source {
        Source {
            id: SourceId(id),
            start_frame,
            samples: vec![value; frames],
        }
    }

    #[test]
    fn mix_block_plays_due_sources_and_advances_clock() {
        let mut timeline = Timeline {
            clock_frames: 0,
            next_id: 2,
            sources: vec![source(1, 0, 4, 0.5), source(2, 8, 4, 0.25)],
        };
        let mut block = vec![0f32; 8];
        timeline.mix_block(&mut block);

        assert_eq!(&block[..4], &[0.5; 4]);
        assert_eq!(&block[4..], &[0.0; 4]);
        assert_eq!(timeline.clock_frames, 8);
        // First source fully consumed, second still pending.
        assert_eq!(timeline.sources.len(), 1);
        assert_eq!(timeline.sources[0].id, SourceId(2));
    }

    #[test]
    fn mix_block_handles_sources_straddling_the_block() {
        let mut timeline = Timeline {
            clock_frames: 0,
            next_id: 1,
            sources: vec![source(1, 6, 8, 1.0)],
        };
        let mut block = vec![0f32; 8];
        timeline.mix_block(&mut block);
        assert_eq!(&block[..6], &[0.0; 6]);
        assert_eq!(&block[6..], &[1.0; 2]);
        assert_eq!(timeline.sources.len(), 1, "tail still owed");

        timeline.mix_block(&mut block);
        assert_eq!(&block[..6], &[1.0; 6]);
        assert_eq!(&block[6..], &[0.0; 2]);
        assert!(timeline.sources.is_empty());
    }

    #[test]
    fn mix_block_sums_overlap_and_clamps() {
        let mut timeline = Timeline {
            clock_frames: 0,
            next_id: 2,
            sources: vec![source(1, 0, 4, 0.8), source(2, 0, 4, 0.8)],
        };
        let mut block = vec![0f32; 4];
        timeline.mix_block(&mut block);
        assert_eq!(block, vec![1.0; 4]);
    }

    #[test]
    fn capture_block_size_matches_wire_framing() {
        // 4096 f32 samples in, 4096 S16 samples (8192 bytes) out.
        let frame = vec![0f32; CAPTURE_BLOCK_SAMPLES];
        assert_eq!(codec::float_to_pcm(&frame).len(), CAPTURE_BLOCK_SAMPLES * 2);
    }
}
