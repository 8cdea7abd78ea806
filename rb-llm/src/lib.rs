//! Upstream AI clients for Relaybot: OpenAI streaming chat and audio
//! transcription, ElevenLabs text-to-speech.
//!
//! Pure HTTP clients; no knowledge of users, channels or history.

mod client;
mod elevenlabs;
mod error;
mod openai;
mod types;

pub use client::LlmClient;
pub use elevenlabs::SpeechClient;
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ResponseFormat, Role, StreamChunk, Usage};
