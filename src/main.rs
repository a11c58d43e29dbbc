//! toralive - terminal driver for the Tora-ossan companion
//!
//! Reads lines from stdin and routes them: `/call` and `/stop` manage the
//! realtime voice session, `/image` (or an image-flavored message) generates
//! an illustration, anything else is a streamed chat turn with the reply
//! spoken through the default sink.

#![forbid(unsafe_code)]

use anyhow::Context;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use toralive::audio::PulseOutput;
use toralive::live::{self, LiveHandle};
use toralive::message::{ChatMessage, Transcript};
use toralive::playback::{AudioOut, PlaybackError, PlaybackScheduler};
use toralive::requests::GeminiHttp;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY environment variable is required")?;

    let http = GeminiHttp::new(api_key.clone());
    let playback = Arc::new(Mutex::new(PlaybackScheduler::new(Box::new(|| {
        PulseOutput::open()
            .map(|out| Box::new(out) as Box<dyn AudioOut>)
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))
    }))));
    let transcript = Arc::new(Mutex::new(Transcript::new()));
    let mut session: Option<LiveHandle> = None;

    println!("虎おっさんやで。なんでも聞いてや。 (/call /stop /image <お題> /quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" => break,
            "/call" => {
                // A session that ended on its own still holds the handle
                // slot; reap it first.
                if session.as_ref().is_some_and(|s| s.is_finished()) {
                    session = None;
                }
                if session.is_some() {
                    println!("もう電話中やで。/stop で切ってからにしてや。");
                    continue;
                }
                match live::start_session(&api_key, playback.clone(), transcript.clone()).await {
                    Ok(handle) => {
                        session = Some(handle);
                        println!("もしもし、虎おっさんやで！");
                    }
                    Err(e) => {
                        error!("could not start voice session: {e}");
                        println!("すまん、電話がつながらへんわ。({e})");
                    }
                }
            }
            "/stop" => {
                match session.take() {
                    Some(handle) => {
                        handle.stop().await;
                        println!("ほな、また電話してや。");
                    }
                    None => println!("電話してへんで。"),
                }
            }
            _ => {
                let result = if let Some(prompt) = image_prompt_for(input) {
                    image_turn(&http, &transcript, prompt).await
                } else {
                    chat_turn(&http, &playback, &transcript, input).await
                };
                // A failed turn leaves the transcript consistent; the user
                // just tries again.
                if let Err(e) = result {
                    error!("turn failed: {e}");
                    println!("すまん、調子悪いわ。もっぺん言うてくれるか。");
                }
            }
        }
    }

    if let Some(handle) = session.take() {
        handle.stop().await;
    }
    playback.lock().expect("playback poisoned").close();
    info!("bye");
    Ok(())
}

/// `/image <prompt>` always generates; a plain message does too when it asks
/// for a picture.
fn image_prompt_for(input: &str) -> Option<&str> {
    if let Some(prompt) = input.strip_prefix("/image ") {
        let prompt = prompt.trim();
        return (!prompt.is_empty()).then_some(prompt);
    }
    (input.contains("画像") || input.contains("描いて")).then_some(input)
}

async fn chat_turn(
    http: &GeminiHttp,
    playback: &Arc<Mutex<PlaybackScheduler>>,
    transcript: &Arc<Mutex<Transcript>>,
    input: &str,
) -> anyhow::Result<()> {
    let history = {
        let mut transcript = transcript.lock().expect("transcript poisoned");
        transcript.push(ChatMessage::user(input));
        transcript.entries().to_vec()
    };

    let mut stream = http.chat_stream(&history).await?;
    let mut reply = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        print!("{fragment}");
        std::io::stdout().flush()?;
        reply.push_str(&fragment);
    }
    println!();

    if reply.trim().is_empty() {
        warn!("empty reply from chat model");
        return Ok(());
    }

    let mut message = ChatMessage::assistant(reply.clone());
    // Synthesis is best-effort; the text reply stands on its own.
    match http.synthesize_voice(&reply).await {
        Ok(Some(audio)) => {
            let mut playback = playback.lock().expect("playback poisoned");
            if let Err(e) = playback.play_immediate(&audio) {
                warn!("could not play reply: {e}");
            }
            message.audio_data = Some(audio);
        }
        Ok(None) => warn!("synthesis response had no audio"),
        Err(e) => warn!("speech synthesis failed: {e}"),
    }

    transcript
        .lock()
        .expect("transcript poisoned")
        .push(message);
    Ok(())
}

async fn image_turn(
    http: &GeminiHttp,
    transcript: &Arc<Mutex<Transcript>>,
    prompt: &str,
) -> anyhow::Result<()> {
    {
        let mut transcript = transcript.lock().expect("transcript poisoned");
        transcript.push(ChatMessage::user(prompt));
    }

    match http.generate_image(prompt).await? {
        Some(image_url) => {
            println!("ほい、描いたったで！ (data URL, {} bytes)", image_url.len());
            let mut message = ChatMessage::assistant("ほい、描いたったで！");
            message.image_url = Some(image_url);
            transcript
                .lock()
                .expect("transcript poisoned")
                .push(message);
        }
        None => println!("すまん、ええ絵が浮かばんかったわ。"),
    }
    Ok(())
}
