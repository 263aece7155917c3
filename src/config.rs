//! Configuration types for the softphone and its providers.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Audio and capture settings for a softphone session.
///
/// Loaded from a YAML document. All fields have defaults so a partial
/// config (or none at all) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftphoneConfig {
    /// TTS output channel count (1 = mono).
    pub tts_channels: u16,
    /// TTS sample width in bytes (2 = 16-bit PCM).
    pub tts_sample_width: u16,
    /// TTS sample rate in Hz.
    pub tts_sample_rate: u32,
    /// Bytes per streamed TTS chunk.
    pub tts_chunk_size: usize,
    /// dBFS threshold below which a capture slice counts as silence.
    pub silence_threshold: f32,
    /// Capture slice length in seconds while waiting for speech.
    pub silence_sample_interval: f32,
    /// Capture slice length in seconds while collecting speech.
    pub speaking_sample_interval: f32,
    /// How long to retry (in seconds) when call media is inactive, e.g.
    /// because the peer put us on hold, before a capture gives up.
    pub unavailable_media_timeout: u64,
}

impl Default for SoftphoneConfig {
    fn default() -> Self {
        Self {
            tts_channels: 1,
            tts_sample_width: 2,
            tts_sample_rate: 24_000,
            tts_chunk_size: 24_000,
            silence_threshold: -40.0,
            silence_sample_interval: 1.5,
            speaking_sample_interval: 2.5,
            unavailable_media_timeout: 60,
        }
    }
}

impl SoftphoneConfig {
    /// Load a softphone config from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| CallError::Config(format!("invalid softphone config: {e}")))
    }

    /// Length in seconds of one streamed TTS chunk at the configured format.
    pub fn chunk_seconds(&self, chunk_len: usize) -> f32 {
        let bytes_per_second = self.tts_sample_rate as usize
            * self.tts_sample_width as usize
            * self.tts_channels as usize;
        chunk_len as f32 / bytes_per_second as f32
    }
}

/// SIP account credentials.
///
/// The JSON wire format uses the field names the registrar tooling emits
/// (`idUri`, `registrarUri`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipCredentials {
    /// Account URI, e.g. `sip:operator@pbx.example.com`.
    #[serde(rename = "idUri")]
    pub id_uri: String,
    /// Registrar URI, e.g. `sip:pbx.example.com`.
    #[serde(rename = "registrarUri")]
    pub registrar_uri: String,
    /// Auth username.
    pub username: String,
    /// Auth password.
    pub password: String,
}

impl SipCredentials {
    /// Load credentials from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CallError::Config(format!("invalid SIP credentials: {e}")))
    }

    /// The registrar host, with the URI scheme stripped.
    ///
    /// Used to construct dial targets: `sip:<number>@<host>`.
    pub fn registrar_host(&self) -> &str {
        self.registrar_uri
            .split_once(':')
            .map_or(self.registrar_uri.as_str(), |(_, host)| host)
    }
}

/// On-disk layout for the crate's working files.
#[derive(Debug, Clone)]
pub struct DataDirs {
    /// Transient per-session scratch WAVs, deleted on hangup.
    pub artifacts: PathBuf,
    /// Persistent TTS cache keyed by utterance hash.
    pub cache: PathBuf,
    /// Per-call conversation transcripts.
    pub logs: PathBuf,
}

impl DataDirs {
    /// Standard layout under a single data root.
    pub fn at(root: &Path) -> Self {
        Self {
            artifacts: root.join("artifacts"),
            cache: root.join("cache"),
            logs: root.join("logs"),
        }
    }

    /// Create all directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.artifacts)?;
        std::fs::create_dir_all(&self.cache)?;
        std::fs::create_dir_all(&self.logs)?;
        Ok(())
    }
}
