//! Live voice session lifecycle
//!
//! Wires the microphone, the websocket client and the playback scheduler into
//! one session: capture blocks flow out as realtime input, inbound events are
//! routed to playback and the transcript. One session at a time; there is no
//! automatic reconnect, a dropped connection ends the session and the user
//! starts a new one.

use crate::audio::{AudioError, MicCapture};
use crate::gemini::{GeminiError, LiveConfig, ServerEvent};
use crate::live_client::LiveClient;
use crate::message::Transcript;
use crate::persona;
use crate::playback::PlaybackScheduler;

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for session bring-up
#[derive(Debug, Error)]
pub enum LiveError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Gemini(#[from] GeminiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Whether the session keeps running after an event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Routes inbound events to playback and the transcript, accumulating
/// transcription fragments until the turn completes.
struct EventRouter {
    playback: Arc<Mutex<PlaybackScheduler>>,
    transcript: Arc<Mutex<Transcript>>,
    pending: String,
}

impl EventRouter {
    fn new(playback: Arc<Mutex<PlaybackScheduler>>, transcript: Arc<Mutex<Transcript>>) -> Self {
        Self {
            playback,
            transcript,
            pending: String::new(),
        }
    }

    fn apply(&mut self, event: ServerEvent) -> Flow {
        match event {
            ServerEvent::Audio(pcm) => {
                let mut playback = self.playback.lock().expect("playback poisoned");
                if let Err(e) = playback.enqueue_streaming_pcm(&pcm) {
                    warn!("dropping audio chunk: {e}");
                }
                Flow::Continue
            }
            ServerEvent::Transcript(fragment) => {
                self.pending.push_str(&fragment);
                Flow::Continue
            }
            ServerEvent::TurnComplete => {
                self.commit_turn();
                Flow::Continue
            }
            ServerEvent::Interrupted => {
                // The user barged in; whatever is queued is stale.
                info!("model turn interrupted, cancelling playback");
                let mut playback = self.playback.lock().expect("playback poisoned");
                playback.stop_all();
                Flow::Continue
            }
            ServerEvent::GoAway => {
                info!("server is going away, ending session");
                Flow::Shutdown
            }
            ServerEvent::Closed => Flow::Shutdown,
            ServerEvent::SetupComplete => Flow::Continue,
        }
    }

    /// Commit the accumulated fragments as one assistant turn. Empty turns
    /// (audio-only with no transcription) are not recorded; an identical
    /// consecutive turn is dropped by the transcript.
    fn commit_turn(&mut self) {
        let text = std::mem::take(&mut self.pending);
        if text.trim().is_empty() {
            return;
        }
        let mut transcript = self.transcript.lock().expect("transcript poisoned");
        if !transcript.push_assistant_deduped(text) {
            debug!("duplicate assistant turn skipped");
        }
    }
}

/// Seam over the capture side of bring-up so failure handling does not need
/// a real device.
trait CaptureSource {
    fn stop(&mut self);
}

impl CaptureSource for MicCapture {
    fn stop(&mut self) {
        MicCapture::stop(self);
    }
}

/// Seam over the connection side of bring-up.
trait LiveLink {
    async fn close(&mut self);
}

impl LiveLink for LiveClient {
    async fn close(&mut self) {
        LiveClient::close(self).await;
    }
}

/// Pair up the results of the concurrent microphone and websocket bring-up.
/// If either side failed, the side that succeeded is released before the
/// error is returned; a failed start leaves no device or socket behind.
async fn resolve_bring_up<C: CaptureSource, W: LiveLink>(
    mic: Result<C, AudioError>,
    connection: Result<W, GeminiError>,
) -> Result<(C, W), LiveError> {
    match (mic, connection) {
        (Ok(capture), Ok(client)) => Ok((capture, client)),
        (Ok(mut capture), Err(e)) => {
            capture.stop();
            Err(e.into())
        }
        (Err(e), Ok(mut client)) => {
            client.close().await;
            Err(e.into())
        }
        (Err(e), Err(ws_err)) => {
            // The microphone error is the one the user can act on.
            warn!("connect also failed: {ws_err}");
            Err(e.into())
        }
    }
}

/// One open voice session. Created by [`LiveSession::spawn`] and driven on a
/// background task until stopped or the server hangs up.
struct LiveSession {
    state: SessionState,
    client: LiveClient,
    capture: MicCapture,
    forward: JoinHandle<()>,
    router: EventRouter,
}

/// Handle to a running session task.
pub struct LiveHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl LiveHandle {
    /// Whether the session ended on its own (server hangup, socket error).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request teardown and wait for it to complete.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!("session task panicked: {e}");
        }
    }
}

impl LiveSession {
    /// Bring up a session and run it on a background task.
    pub async fn spawn(
        api_key: &str,
        playback: Arc<Mutex<PlaybackScheduler>>,
        transcript: Arc<Mutex<Transcript>>,
    ) -> Result<LiveHandle, LiveError> {
        let session = Self::start(api_key, playback, transcript).await?;
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(session.run(stop_rx));
        Ok(LiveHandle { stop_tx, task })
    }

    /// Open the microphone and the websocket concurrently. If either side
    /// fails the other is torn down before the error is returned, leaving no
    /// device or socket behind.
    async fn start(
        api_key: &str,
        playback: Arc<Mutex<PlaybackScheduler>>,
        transcript: Arc<Mutex<Transcript>>,
    ) -> Result<Self, LiveError> {
        info!("starting live session");
        let config = LiveConfig {
            system_instruction: Some(persona::voice_instruction()),
            ..Default::default()
        };

        let (block_tx, mut block_rx) = mpsc::channel::<String>(32);
        let mic_task = tokio::task::spawn_blocking(move || MicCapture::start(block_tx));
        let (mic, client) = tokio::join!(mic_task, LiveClient::connect(&config, api_key));
        let mic = mic.unwrap_or(Err(AudioError::WorkerGone));

        let (capture, client) = resolve_bring_up(mic, client).await?;

        let sender = client.sender();
        let forward = tokio::spawn(async move {
            while let Some(block) = block_rx.recv().await {
                if let Err(e) = sender.send_realtime_audio(block).await {
                    warn!("realtime input send failed: {e}");
                    break;
                }
            }
            debug!("capture forwarder finished");
        });

        info!("live session open");
        Ok(Self {
            state: SessionState::Open,
            client,
            capture,
            forward,
            router: EventRouter::new(playback, transcript),
        })
    }

    async fn run(mut self, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("stop requested");
                    break;
                }
                event = self.client.next_event() => match event {
                    Some(Ok(event)) => {
                        if self.router.apply(event) == Flow::Shutdown {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("live session error: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Ordered teardown: stop capture first so no audio flows to a dying
    /// socket, then the socket, then playback. Every step tolerates the
    /// resource being gone already.
    async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        self.capture.stop();
        self.forward.abort();
        self.client.close().await;
        {
            let mut playback = self.router.playback.lock().expect("playback poisoned");
            playback.stop_all();
        }
        self.router.pending.clear();

        self.state = SessionState::Closed;
        info!("live session closed");
    }
}

/// Bring up a live session; the returned handle stops it.
pub async fn start_session(
    api_key: &str,
    playback: Arc<Mutex<PlaybackScheduler>>,
    transcript: Arc<Mutex<Transcript>>,
) -> Result<LiveHandle, LiveError> {
    LiveSession::spawn(api_key, playback, transcript).await
}
