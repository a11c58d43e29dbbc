//! Gemini Live API wire types
//!
//! Serde structs for the websocket setup/realtime-input messages, the inbound
//! server message envelope, and the flattened [`ServerEvent`] union the
//! session state machine consumes.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

/// Error type for live-endpoint operations
#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Configuration for a live voice session.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Charon".to_string(),
            system_instruction: None,
            temperature: Some(0.8),
        }
    }
}

impl LiveConfig {
    pub fn endpoint_url(api_key: &str) -> String {
        format!(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={api_key}"
        )
    }
}

/// Generation configuration inside the setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

impl BidiGenerateContentSetup {
    /// Build the setup payload for an audio-out persona session.
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: config.temperature,
                speech_config: Some(serde_json::json!({
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice_name }
                    }
                })),
            }),
            system_instruction: config
                .system_instruction
                .as_ref()
                .map(|text| serde_json::json!({ "parts": [{ "text": text }] })),
            // Ask for text of the model's speech so turns land in the
            // transcript.
            output_audio_transcription: Some(serde_json::json!({})),
        }
    }
}

/// One realtime audio block (already base64-encoded by the capture pipeline).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

impl RealtimeAudio {
    pub fn pcm_block(base64_data: String) -> Self {
        Self {
            data: base64_data,
            mime_type: format!("audio/pcm;rate={}", crate::audio::CAPTURE_SAMPLE_RATE),
        }
    }
}

/// Inbound server messages we care about. Everything else is ignored.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

/// Flattened inbound event union consumed by the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Setup handshake acknowledged.
    SetupComplete,
    /// Raw S16 PCM decoded from an inline audio part.
    Audio(Vec<u8>),
    /// Output transcription fragment of the model's speech.
    Transcript(String),
    /// The model finished its turn.
    TurnComplete,
    /// The user barged in; current playback should be cancelled.
    Interrupted,
    /// Server will disconnect soon.
    GoAway,
    /// The websocket closed.
    Closed,
}

/// Parse one inbound text frame into zero or more events.
pub fn parse_server_frame(text: &str) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    Ok(match message {
        ServerMessage::SetupComplete { .. } => vec![ServerEvent::SetupComplete],
        ServerMessage::ServerContent { server_content } => server_content_events(&server_content),
        ServerMessage::GoAway { .. } => vec![ServerEvent::GoAway],
    })
}

/// Flatten a `serverContent` payload: interruption first, then transcript
/// fragments and audio parts in part order, turn completion last.
fn server_content_events(content: &serde_json::Value) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    if content
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(text) = content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(ServerEvent::Transcript(text.to_string()));
        }
    }

    if let Some(parts) = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(|parts| parts.as_array())
    {
        for part in parts {
            if let Some(data) = part
                .get("inlineData")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
            {
                match general_purpose::STANDARD.decode(data) {
                    Ok(pcm) if !pcm.is_empty() => events.push(ServerEvent::Audio(pcm)),
                    Ok(_) => {}
                    Err(e) => warn!("undecodable inline audio part: {e}"),
                }
            } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    events.push(ServerEvent::Transcript(text.to_string()));
                }
            }
        }
    }

    if content
        .get("turnComplete")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(ServerEvent::TurnComplete);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_serializes_camel_case_and_skips_none() {
        let config = LiveConfig {
            system_instruction: Some("尼崎弁で喋ること".to_string()),
            ..Default::default()
        };
        let setup = BidiGenerateContentSetup::from_config(&config);
        let value = serde_json::to_value(&setup).unwrap();

        assert_eq!(value["model"], config.model);
        assert_eq!(value["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            value["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Charon"
        );
        assert_eq!(
            value["systemInstruction"]["parts"][0]["text"],
            "尼崎弁で喋ること"
        );
        assert!(value.get("outputAudioTranscription").is_some());
    }

    #[test]
    fn setup_without_instruction_omits_the_field() {
        let setup = BidiGenerateContentSetup::from_config(&LiveConfig::default());
        let json = serde_json::to_string(&setup).unwrap();
        assert!(!json.contains("systemInstruction"));
    }

    #[test]
    fn realtime_audio_carries_capture_rate() {
        let block = RealtimeAudio::pcm_block("AAAA".to_string());
        assert_eq!(block.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_frame(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn parse_audio_and_transcript_parts() {
        let data = general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let frame = serde_json::json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm", "data": data } }] },
                "outputTranscription": { "text": "阪神" }
            }
        });
        let events = parse_server_frame(&frame.to_string()).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::Transcript("阪神".to_string()),
                ServerEvent::Audio(vec![1, 2, 3, 4]),
            ]
        );
    }

    #[test]
    fn parse_turn_complete_comes_last() {
        let frame = serde_json::json!({
            "serverContent": {
                "outputTranscription": { "text": "や" },
                "turnComplete": true
            }
        });
        let events = parse_server_frame(&frame.to_string()).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::Transcript("や".to_string()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn parse_interruption() {
        let frame = serde_json::json!({ "serverContent": { "interrupted": true } });
        let events = parse_server_frame(&frame.to_string()).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn parse_go_away() {
        let events = parse_server_frame(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::GoAway]);
    }

    #[test]
    fn empty_audio_parts_are_dropped() {
        let frame = serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [{ "inlineData": { "data": "" } }] } }
        });
        let events = parse_server_frame(&frame.to_string()).unwrap();
        assert!(events.is_empty());
    }
}
