//! One-shot Gemini HTTP requests
//!
//! The REST side of the companion: streamed chat completions over SSE,
//! speech synthesis and image generation. All three go through the
//! `generativelanguage` v1beta endpoint with the API key in a header.

use crate::message::{ChatMessage, Role};
use crate::persona;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Text chat model.
pub const CHAT_MODEL: &str = "gemini-3-flash-preview";
/// Speech synthesis model.
pub const TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
/// Image generation model.
pub const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Persona voice used for both synthesis and the live session.
pub const VOICE_NAME: &str = "Charon";

/// Error type for HTTP provider requests
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Gemini REST client. Cheap to clone; reuses one connection pool.
#[derive(Clone)]
pub struct GeminiHttp {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiHttp {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Stream a persona chat reply as text fragments. The request carries the
    /// full transcript so far; the system instruction is rebuilt per call so
    /// the persona sees the current clock.
    pub async fn chat_stream(
        &self,
        history: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String, RequestError>>, RequestError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, CHAT_MODEL
        );
        let body = serde_json::json!({
            "contents": history.iter().map(turn_json).collect::<Vec<_>>(),
            "systemInstruction": { "parts": [{ "text": persona::system_instruction() }] },
            "generationConfig": { "temperature": 0.8 },
        });

        let response = self.post_json(&url, &body).await?;
        let stream = response
            .bytes_stream()
            .scan(String::new(), |buffer, chunk| {
                let out: Vec<Result<String, RequestError>> = match chunk {
                    Ok(bytes) => sse_fragments(buffer, &String::from_utf8_lossy(&bytes))
                        .into_iter()
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(RequestError::Http(e))],
                };
                futures_util::future::ready(Some(out))
            })
            .flat_map(futures_util::stream::iter)
            .boxed();
        Ok(stream)
    }

    /// Synthesize a reply into base64 S16 PCM (24 kHz mono). `None` when the
    /// model returned no audio part; callers treat that like any other
    /// synthesis failure and keep the text-only reply.
    pub async fn synthesize_voice(&self, text: &str) -> Result<Option<String>, RequestError> {
        let cleaned = persona::clean_for_speech(text);
        let url = format!("{}/models/{}:generateContent", self.base_url, TTS_MODEL);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": persona::speech_prompt(&cleaned) }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": VOICE_NAME } }
                },
            },
        });

        let response = self.post_json(&url, &body).await?;
        let envelope: GenerateContentResponse = response.json().await?;
        Ok(envelope.first_inline_data())
    }

    /// Generate a square persona-flavored illustration; returns a `data:` URL
    /// ready for display. `None` when the model returned no image part.
    pub async fn generate_image(&self, prompt: &str) -> Result<Option<String>, RequestError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, IMAGE_MODEL);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": persona::image_prompt(prompt) }] }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": "1:1" },
            },
        });

        let response = self.post_json(&url, &body).await?;
        let envelope: GenerateContentResponse = response.json().await?;
        Ok(envelope
            .first_inline_data()
            .map(|data| format!("data:image/png;base64,{data}")))
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, RequestError> {
        debug!(%url, "provider request");
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn turn_json(message: &ChatMessage) -> serde_json::Value {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    serde_json::json!({ "role": role, "parts": [{ "text": message.content }] })
}

/// Append a chunk of SSE bytes to `buffer` and drain the text fragments from
/// every complete `data:` line. Incomplete trailing lines stay buffered for
/// the next chunk.
fn sse_fragments(buffer: &mut String, chunk: &str) -> Vec<String> {
    buffer.push_str(chunk);
    let mut fragments = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim_end();
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        match serde_json::from_str::<GenerateContentResponse>(data) {
            Ok(envelope) => fragments.extend(envelope.text_fragments()),
            Err(e) => warn!("skipping malformed SSE line: {e}"),
        }
    }
    fragments
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

impl GenerateContentResponse {
    fn text_fragments(self) -> Vec<String> {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .filter(|t| !t.is_empty())
            .collect()
    }

    fn first_inline_data(self) -> Option<String> {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data.map(|d| d.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> GenerateContentResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn sse_lines_yield_fragments_in_order() {
        let mut buffer = String::new();
        let fragments = sse_fragments(
            &mut buffer,
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"阪神\"}]}}]}\n\
             data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"優勝や\"}]}}]}\n",
        );
        assert_eq!(fragments, vec!["阪神", "優勝や"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_lines_stay_buffered_across_chunks() {
        let mut buffer = String::new();
        let first = sse_fragments(
            &mut buffer,
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"te",
        );
        assert!(first.is_empty());
        assert!(!buffer.is_empty());

        let second = sse_fragments(&mut buffer, "xt\":\"知らんけど\"}]}}]}\n");
        assert_eq!(second, vec!["知らんけど"]);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut buffer = String::new();
        let fragments = sse_fragments(&mut buffer, "\n: keepalive\nevent: ping\n");
        assert!(fragments.is_empty());
    }

    #[test]
    fn malformed_data_lines_are_skipped() {
        let mut buffer = String::new();
        let fragments = sse_fragments(&mut buffer, "data: not json\n");
        assert!(fragments.is_empty());
    }

    #[test]
    fn inline_data_is_extracted_from_the_first_part() {
        let envelope = envelope(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"ここや"},
                {"inlineData":{"mimeType":"audio/pcm","data":"QUJD"}}
            ]}}]}"#,
        );
        assert_eq!(envelope.first_inline_data().as_deref(), Some("QUJD"));
    }

    #[test]
    fn missing_candidates_mean_no_data() {
        assert!(envelope(r#"{}"#).first_inline_data().is_none());
        assert!(envelope(r#"{"candidates":[]}"#).text_fragments().is_empty());
    }

    #[test]
    fn history_roles_map_to_wire_roles() {
        let user = turn_json(&ChatMessage::user("調子どうや"));
        let assistant = turn_json(&ChatMessage::assistant("絶好調や"));
        assert_eq!(user["role"], "user");
        assert_eq!(assistant["role"], "model");
        assert_eq!(user["parts"][0]["text"], "調子どうや");
    }
}
