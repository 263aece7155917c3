//! The SIP driver seam.
//!
//! The crate does not implement SIP or RTP. It drives a user agent through
//! this trait family, shaped after the classic softphone object model:
//! an endpoint with one registered account, call legs with an invite state,
//! and per-leg audio media that file players and recorders attach to.
//! Embedders bind these traits to a real stack; the test suite ships a
//! loopback driver.
//!
//! Native stacks run their own event threads and require every calling OS
//! thread to be registered before its first library call; workers must go
//! through [`SipEndpoint::register_thread`] once at startup.

use crate::config::SipCredentials;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Invite state of one call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    /// Outbound INVITE sent, no response yet.
    Calling,
    /// Provisional response received (ringing).
    Early,
    /// Call established.
    Confirmed,
    /// Call torn down or failed.
    Disconnected,
}

/// Callback invoked when a leg reaches [`LegState::Disconnected`].
pub type DisconnectHook = Box<dyn Fn() + Send + Sync>;

/// Handler for calls arriving at the registered account.
pub type IncomingHandler = Box<dyn Fn(Box<dyn IncomingCall>) + Send + Sync>;

/// A stopped-on-drop transmitter playing a file toward a leg.
pub trait PlayerHandle: Send {
    /// Stop transmitting.
    fn stop(&mut self);
}

/// An in-progress recording of a leg's received audio.
pub trait RecorderHandle: Send {
    /// Stop recording and flush the file.
    ///
    /// # Errors
    ///
    /// Returns `CallError::CallLost` when the media vanished mid-recording.
    fn stop(&mut self) -> Result<()>;
}

/// The active audio media of a confirmed leg.
pub trait AudioChannel: Send + Sync {
    /// Start transmitting a WAV file toward the leg.
    ///
    /// # Errors
    ///
    /// Returns an error when the media is no longer attached.
    fn play_file(&self, path: &Path, looping: bool) -> Result<Box<dyn PlayerHandle>>;

    /// Start recording the leg's received audio into a WAV file.
    ///
    /// # Errors
    ///
    /// Returns an error when the media is no longer attached.
    fn record_to_file(&self, path: &Path) -> Result<Box<dyn RecorderHandle>>;

    /// Transmit this leg's received audio into another leg (one direction).
    ///
    /// # Errors
    ///
    /// Returns an error when either media is no longer attached.
    fn bridge_into(&self, other: &Arc<dyn AudioChannel>) -> Result<()>;
}

/// One call leg (inbound or outbound).
pub trait CallLeg: Send + Sync {
    /// Current invite state.
    fn state(&self) -> LegState;

    /// The leg's audio media, present only while a stream is active.
    fn audio(&self) -> Option<Arc<dyn AudioChannel>>;

    /// Install the disconnect callback. At most one per leg.
    fn set_disconnect_hook(&self, hook: DisconnectHook);

    /// Tear the leg down.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Sip` when the stack rejects the teardown.
    fn hangup(&self) -> Result<()>;
}

/// An unanswered inbound call offered to the incoming handler.
pub trait IncomingCall: Send {
    /// Answer with 200 OK and return the established leg.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Sip` when the answer fails.
    fn answer(self: Box<Self>) -> Result<Arc<dyn CallLeg>>;

    /// Reject with 486 Busy Here.
    fn reject_busy(self: Box<Self>);
}

/// The process-wide user agent with one registered account.
pub trait SipEndpoint: Send + Sync {
    /// Register the calling OS thread with the native stack. Idempotent.
    fn register_thread(&self, name: &str);

    /// Place an outbound call to a `sip:` URI.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Sip` when the INVITE cannot be sent.
    fn place_call(&self, uri: &str) -> Result<Arc<dyn CallLeg>>;

    /// Install the handler for inbound calls. At most one per endpoint.
    fn set_incoming_handler(&self, handler: IncomingHandler);

    /// Unregister the account and destroy the user agent.
    fn shutdown(&self);
}

/// Factory binding credentials to a live endpoint.
pub trait SipDriver: Send + Sync {
    /// Create and start an endpoint registered with the given account.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Sip` when registration fails.
    fn create_endpoint(&self, credentials: &SipCredentials) -> Result<Arc<dyn SipEndpoint>>;
}
