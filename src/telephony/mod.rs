//! Telephony: SIP driver seam, per-call sessions, media streaming, and the
//! shared softphone pool.

pub mod asr;
pub mod audio;
pub mod driver;
pub mod pool;
pub mod session;
pub mod tts;

pub use pool::SoftphonePool;
pub use session::TelephonySession;

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-session scratch file locations, namespaced by the session UUID so
/// concurrent sessions never contend on files.
#[derive(Debug, Clone)]
pub struct SessionScratch {
    /// Latest capture slice.
    pub incoming: PathBuf,
    /// Accumulated utterance handed to the transcriber.
    pub combined: PathBuf,
    /// The two outgoing TTS buffers.
    pub outgoing: [PathBuf; 2],
}

impl SessionScratch {
    /// Scratch layout for one session under the artifacts directory.
    pub fn new(artifacts: &Path, id: Uuid) -> Self {
        Self {
            incoming: artifacts.join(format!("{id}_incoming.wav")),
            combined: artifacts.join(format!("{id}_incoming_combined.wav")),
            outgoing: [
                artifacts.join(format!("{id}_outgoing_buffer_0.wav")),
                artifacts.join(format!("{id}_outgoing_buffer_1.wav")),
            ],
        }
    }
}
