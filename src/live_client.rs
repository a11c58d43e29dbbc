//! WebSocket client for the Gemini Live endpoint
//!
//! Splits the socket into sink and stream halves so capture blocks can be
//! written while server frames are read concurrently. Inbound frames are
//! flattened into [`ServerEvent`]s on a channel; the write half is shared
//! behind a mutex so the capture forwarder task can clone it.

use crate::gemini::{
    self, BidiGenerateContentSetup, GeminiError, LiveConfig, RealtimeAudio, Result, ServerEvent,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use std::sync::Arc;
use std::time::Duration;

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shareable write half of a live session. Cheap to clone; each clone sends
/// through the same socket.
#[derive(Clone)]
pub struct LiveSender {
    sink: WsSink,
}

impl LiveSender {
    /// Send one base64 capture block as realtime audio input.
    pub async fn send_realtime_audio(&self, base64_block: String) -> Result<()> {
        let payload = serde_json::json!({
            "realtimeInput": { "audio": RealtimeAudio::pcm_block(base64_block) }
        });
        self.send_json(&payload).await
    }

    async fn send_json(&self, payload: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(GeminiError::WebSocket)
    }
}

/// Connected live session: the shared write half, the inbound event channel,
/// and the reader task pumping it.
pub struct LiveClient {
    sender: LiveSender,
    events: mpsc::Receiver<Result<ServerEvent>>,
    _rx_task: JoinHandle<()>,
}

impl LiveClient {
    /// Open the websocket, spawn the reader task, send the setup message and
    /// wait for the server to acknowledge it.
    pub async fn connect(config: &LiveConfig, api_key: &str) -> Result<Self> {
        let url = LiveConfig::endpoint_url(api_key);
        info!(model = %config.model, "connecting live session");

        let (ws_stream, _resp) = connect_async(url.as_str())
            .await
            .map_err(GeminiError::WebSocket)?;
        let (sink, mut stream) = ws_stream.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        let (event_tx, events) = mpsc::channel::<Result<ServerEvent>>(100);

        let rx_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if forward_frame(&text, &event_tx).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        // The endpoint sometimes delivers JSON frames as
                        // binary.
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if forward_frame(&text, &event_tx).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => debug!("ignoring non-UTF8 binary frame"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("live socket closed: {frame:?}");
                        let _ = event_tx.send(Ok(ServerEvent::Closed)).await;
                        break;
                    }
                    Ok(_) => {} // ping/pong
                    Err(e) => {
                        error!("live socket error: {e}");
                        let _ = event_tx.send(Err(GeminiError::WebSocket(e))).await;
                        break;
                    }
                }
            }
            debug!("live reader task terminated");
        });

        let mut client = Self {
            sender: LiveSender { sink },
            events,
            _rx_task: rx_task,
        };

        let setup = BidiGenerateContentSetup::from_config(config);
        client
            .sender
            .send_json(&serde_json::json!({ "setup": setup }))
            .await?;

        tokio::time::timeout(SETUP_TIMEOUT, client.wait_for_setup_complete())
            .await
            .map_err(|_| {
                error!("timed out waiting for setup acknowledgment");
                GeminiError::Timeout
            })??;

        info!("live session setup complete");
        Ok(client)
    }

    async fn wait_for_setup_complete(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Some(Ok(ServerEvent::SetupComplete)) => return Ok(()),
                Some(Ok(ServerEvent::Closed)) => return Err(GeminiError::ConnectionClosed),
                Some(Ok(other)) => {
                    // Content before the acknowledgment would be out of
                    // protocol; drop it.
                    warn!("unexpected pre-setup event: {other:?}");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(GeminiError::ChannelClosed),
            }
        }
    }

    /// Clone the write half for the capture forwarder.
    pub fn sender(&self) -> LiveSender {
        self.sender.clone()
    }

    /// Next inbound event, or `None` once the reader task has finished.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        self.events.recv().await
    }

    /// Send a close frame. Errors are logged, not propagated; the socket may
    /// already be gone and teardown must continue regardless.
    pub async fn close(&mut self) {
        let mut sink = self.sender.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("close frame not sent: {e}");
        }
    }
}

async fn forward_frame(
    text: &str,
    event_tx: &mpsc::Sender<Result<ServerEvent>>,
) -> std::result::Result<(), ()> {
    match gemini::parse_server_frame(text) {
        Ok(events) => {
            for event in events {
                if event_tx.send(Ok(event)).await.is_err() {
                    return Err(());
                }
            }
        }
        Err(e) => {
            warn!("unparseable server frame: {e}");
        }
    }
    Ok(())
}
