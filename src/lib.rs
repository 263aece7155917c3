//! Ringdown: LLM-driven voice telephony dialogues.
//!
//! For each answered call the crate walks a scripted conversation defined
//! in a declarative YAML document, streams synthesized speech to the
//! caller, records and transcribes caller speech, and progressively
//! extracts typed fields that are persisted to an embedded SQLite store.
//!
//! # Architecture
//!
//! The call pipeline is built from independent subsystems:
//! - **Conversation scripts** (`conversation`): the typed item graph and
//!   its YAML form
//! - **Engine** (`engine`): a deterministic walker over the graph with a
//!   two-stage LLM extraction chain per item
//! - **Telephony** (`telephony`): the SIP driver seam, per-call sessions,
//!   double-buffered TTS playback, voice-activity-gated capture, and the
//!   shared softphone pool
//! - **Providers** (`providers`): language model, speech synthesis, and
//!   transcription seams with one OpenAI-compatible HTTP implementation
//! - **Store** (`store`): contacts, per-conversation results, and attempt
//!   statuses in SQLite
//! - **Orchestrator** (`orchestrator`): outbound campaigns and inbound
//!   listening over the same dialogue loop

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod providers;
pub mod store;
pub mod telephony;
pub mod test_utils;

pub use config::{DataDirs, SipCredentials, SoftphoneConfig};
pub use conversation::{ConversationConfig, ConversationItem};
pub use engine::{
    ConversationEngine, ExtractionStatus, Fragment, FragmentKind, FunctionRegistry,
};
pub use error::{CallError, Result};
pub use orchestrator::Orchestrator;
pub use providers::{
    ChatMessage, ChatRole, LanguageModel, ProviderStack, SpeechSynthesizer, Transcriber,
};
pub use store::{ContactOutcome, ContactRecord, ContactStatus, ContactStore};
pub use telephony::{SoftphonePool, TelephonySession};
