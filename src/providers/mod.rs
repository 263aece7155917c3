//! Provider seams: language model, speech synthesis, transcription.
//!
//! The engine and the telephony layer only ever talk to these traits. One
//! blocking HTTP reference implementation against OpenAI-compatible
//! endpoints lives in [`openai`]; tests use the scripted fakes in
//! `crate::test_utils`.

pub mod openai;

use crate::error::Result;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// The caller.
    User,
    /// The system's own utterances.
    Assistant,
}

/// One entry of the per-call chat history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    /// A caller message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An own utterance.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text-in/text-out prompt execution.
///
/// Implementations compose the request in this order: the system prompts,
/// then `user_input` (when given) as a user message, then the chat history.
/// Provider failures surface as `CallError::Llm` and are fatal to the
/// engine step that issued them.
pub trait LanguageModel: Send + Sync {
    /// Run one prompt and return the model's text.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Llm` when the provider call fails.
    fn run(
        &self,
        system_prompts: &[String],
        history: &[ChatMessage],
        user_input: Option<&str>,
    ) -> Result<String>;
}

/// Streaming text-to-speech synthesis.
pub trait SpeechSynthesizer: Send + Sync {
    /// Open a raw PCM stream (16-bit little-endian mono at the configured
    /// sample rate) for the given text.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Speech` when the provider call fails.
    fn stream_pcm(&self, text: &str) -> Result<Box<dyn Read + Send>>;
}

/// Speech-to-text transcription of a finished recording.
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV file and return the text.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Speech` when the provider call fails.
    fn transcribe(&self, wav_path: &Path) -> Result<String>;
}

/// The three providers a call needs, bundled for construction.
#[derive(Clone)]
pub struct ProviderStack {
    pub llm: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
}
