//! Error types for the ringdown call pipeline.

/// Top-level error type for the telephony dialogue system.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// SIP endpoint or signalling error from the driver.
    #[error("SIP error: {0}")]
    Sip(String),

    /// Audio media not (yet) active on a call leg.
    ///
    /// Transient: callers retry within a bounded window before giving up.
    #[error("media unavailable: {0}")]
    Media(String),

    /// The call leg disconnected while an operation was in flight.
    #[error("call lost: {0}")]
    CallLost(String),

    /// Language model provider error (classification or generation).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech provider error (synthesis or transcription).
    #[error("speech provider error: {0}")]
    Speech(String),

    /// Configuration error (malformed YAML, missing reserved paths).
    #[error("config error: {0}")]
    Config(String),

    /// Contact store error.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Call forwarding failed (paired leg never picked up).
    #[error("forwarding error: {0}")]
    Forwarding(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CallError>;
