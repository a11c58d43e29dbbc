//! toralive - Amagasaki-dialect Tigers-fan companion over the Gemini API
//!
//! A chat companion with a fixed persona: streamed text chat, speech
//! synthesis, image generation and a realtime bidirectional voice session,
//! all against Google's `generativelanguage` endpoints with local PulseAudio
//! capture and playback.

#![forbid(unsafe_code)]

/// PulseAudio capture and playback devices
pub mod audio;
/// Base64/PCM conversions shared by every audio path
pub mod codec;
/// Gemini Live wire types and frame parsing
pub mod gemini;
/// Live voice session lifecycle
pub mod live;
/// Live endpoint websocket client
pub mod live_client;
/// Chat transcript types
pub mod message;
/// The Tora-ossan persona assets
pub mod persona;
/// Playback scheduling over the output device
pub mod playback;
/// One-shot HTTP requests (chat, speech, image)
pub mod requests;
