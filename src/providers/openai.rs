//! OpenAI-compatible provider: chat completions, PCM speech streaming,
//! and audio transcription over blocking HTTP.

use crate::error::{CallError, Result};
use crate::providers::{ChatMessage, ChatRole, LanguageModel, SpeechSynthesizer, Transcriber};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default public API base.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Request timeout. Speech synthesis of long utterances is the slow path.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider handle; cheap to clone per worker.
#[derive(Clone)]
pub struct OpenAiProvider {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    chat_model: String,
    tts_model: String,
    tts_voice: String,
    stt_model: String,
}

impl OpenAiProvider {
    /// Create a provider against the public OpenAI API.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Create a provider against any OpenAI-compatible base URL.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            chat_model: "gpt-4-turbo".to_owned(),
            tts_model: "tts-1".to_owned(),
            tts_voice: "alloy".to_owned(),
            stt_model: "whisper-1".to_owned(),
        }
    }

    /// Override the chat model.
    #[must_use]
    pub fn chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    /// Override the synthesis voice.
    #[must_use]
    pub fn tts_voice(mut self, voice: impl Into<String>) -> Self {
        self.tts_voice = voice.into();
        self
    }

    fn post(&self, path: &str) -> ureq::Request {
        self.agent
            .post(&format!("{}{path}", self.base_url))
            .set("Authorization", &format!("Bearer {}", self.api_key))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl LanguageModel for OpenAiProvider {
    fn run(
        &self,
        system_prompts: &[String],
        history: &[ChatMessage],
        user_input: Option<&str>,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(system_prompts.len() + history.len() + 1);
        for prompt in system_prompts {
            messages.push(serde_json::json!({"role": "system", "content": prompt}));
        }
        if let Some(input) = user_input {
            messages.push(serde_json::json!({"role": "user", "content": input}));
        }
        for msg in history {
            let role = match msg.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": msg.content}));
        }

        debug!("chat request with {} messages", messages.len());
        let response = self
            .post("/chat/completions")
            .send_json(serde_json::json!({
                "model": self.chat_model,
                "messages": messages,
            }))
            .map_err(|e| CallError::Llm(format!("chat request failed: {e}")))?;

        let parsed: ChatResponse = response
            .into_json()
            .map_err(|e| CallError::Llm(format!("malformed chat response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallError::Llm("chat response contained no content".into()))
    }
}

impl SpeechSynthesizer for OpenAiProvider {
    fn stream_pcm(&self, text: &str) -> Result<Box<dyn Read + Send>> {
        let response = self
            .post("/audio/speech")
            .send_json(serde_json::json!({
                "model": self.tts_model,
                "voice": self.tts_voice,
                "input": text,
                "response_format": "pcm",
            }))
            .map_err(|e| CallError::Speech(format!("speech request failed: {e}")))?;
        Ok(Box::new(response.into_reader()))
    }
}

impl Transcriber for OpenAiProvider {
    fn transcribe(&self, wav_path: &Path) -> Result<String> {
        let audio = std::fs::read(wav_path)?;
        let boundary = format!("ringdown-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &self.stt_model, &audio);

        let response = self
            .post("/audio/transcriptions")
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body)
            .map_err(|e| CallError::Speech(format!("transcription request failed: {e}")))?;

        let parsed: TranscriptionResponse = response
            .into_json()
            .map_err(|e| CallError::Speech(format!("malformed transcription response: {e}")))?;
        Ok(parsed.text)
    }
}

/// Assemble a two-part multipart/form-data body: the model name and the
/// WAV payload.
fn multipart_body(boundary: &str, model: &str, audio: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(audio.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\n{model}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"audio.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(audio);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn multipart_body_is_well_formed() {
        let body = multipart_body("b0", "whisper-1", b"RIFF");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--b0\r\n"));
        assert!(text.contains("name=\"model\"\r\n\r\nwhisper-1"));
        assert!(text.contains("filename=\"audio.wav\""));
        assert!(text.ends_with("--b0--\r\n"));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let provider = OpenAiProvider::with_base_url("k", "http://localhost:9999/v1/");
        assert_eq!(provider.base_url, "http://localhost:9999/v1");
    }
}
