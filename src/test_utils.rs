//! Shared test utilities: scripted providers and a loopback SIP driver.
//!
//! The loopback driver implements the full `telephony::driver` seam in
//! memory so call flows (dialing, inbound routing, forwarding, playback,
//! capture) can be exercised without a SIP stack or network. Embedders can
//! reuse it to test their own conversation scripts.

use crate::config::SoftphoneConfig;
use crate::error::{CallError, Result};
use crate::providers::{ChatMessage, LanguageModel, SpeechSynthesizer, Transcriber};
use crate::telephony::audio;
use crate::telephony::driver::{
    AudioChannel, CallLeg, DisconnectHook, IncomingCall, IncomingHandler, LegState, PlayerHandle,
    RecorderHandle, SipDriver, SipEndpoint,
};
use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Nanosecond wall-clock timestamp for unique test directories.
pub fn now_epoch_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Create a unique temporary directory for test isolation.
///
/// The directory name includes `prefix`, the process ID, and a nanosecond
/// timestamp so parallel tests never collide.
pub fn temp_test_root(prefix: &str, name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "ringdown-{prefix}-{name}-{}-{}",
        std::process::id(),
        now_epoch_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("create temp test dir");
    dir
}

/// A softphone config with millisecond-scale pacing so tests run fast.
pub fn fast_softphone_config() -> SoftphoneConfig {
    SoftphoneConfig {
        tts_chunk_size: 512,
        silence_sample_interval: 0.01,
        speaking_sample_interval: 0.01,
        unavailable_media_timeout: 1,
        ..SoftphoneConfig::default()
    }
}

// ── Scripted providers ────────────────────────────────────────

/// One recorded LLM invocation, for prompt assertions.
#[derive(Debug, Clone)]
pub struct RecordedPrompt {
    pub system_prompts: Vec<String>,
    pub user_input: Option<String>,
    pub history_len: usize,
}

/// Language model that replays scripted responses.
///
/// Responses are queued per prompt category (classifier verdicts, filter
/// extractions, generated utterances) because the engine's filter task
/// runs on its own thread: routing by category keeps scripted dialogues
/// deterministic under any interleaving.
#[derive(Default)]
pub struct ScriptedLlm {
    verdict_queue: Mutex<VecDeque<String>>,
    filter_responses: Mutex<Vec<(String, String)>>,
    utterance_queue: Mutex<VecDeque<String>>,
    recorded: Mutex<Vec<RecordedPrompt>>,
}

impl ScriptedLlm {
    /// An empty script; every category starts exhausted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue classifier verdicts (YES/NO/ABORT, option keys, sentinels).
    #[must_use]
    pub fn verdicts<const N: usize>(self, responses: [&str; N]) -> Self {
        {
            let mut queue = self
                .verdict_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for response in responses {
                queue.push_back(response.to_owned());
            }
        }
        self
    }

    /// Register filter-extraction outputs (values or `##FAILED##`), keyed
    /// by a substring of the information description. Filter tasks run on
    /// their own threads, so keying (rather than queueing) keeps them
    /// deterministic.
    #[must_use]
    pub fn filters<const N: usize>(self, responses: [(&str, &str); N]) -> Self {
        {
            let mut table = self
                .filter_responses
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (description, response) in responses {
                table.push((description.to_owned(), response.to_owned()));
            }
        }
        self
    }

    /// Queue generated utterances (elicitations and `prompt` items).
    #[must_use]
    pub fn utterances<const N: usize>(self, responses: [&str; N]) -> Self {
        {
            let mut queue = self
                .utterance_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for response in responses {
                queue.push_back(response.to_owned());
            }
        }
        self
    }

    /// Every invocation seen so far.
    pub fn recorded(&self) -> Vec<RecordedPrompt> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn pop_filter(&self, system_prompts: &[String]) -> Option<String> {
        let context = system_prompts.join("\n");
        let mut table = self
            .filter_responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let index = table
            .iter()
            .position(|(description, _)| context.contains(description.as_str()))?;
        Some(table.remove(index).1)
    }
}

impl LanguageModel for ScriptedLlm {
    fn run(
        &self,
        system_prompts: &[String],
        history: &[ChatMessage],
        user_input: Option<&str>,
    ) -> Result<String> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedPrompt {
                system_prompts: system_prompts.to_vec(),
                user_input: user_input.map(str::to_owned),
                history_len: history.len(),
            });

        let response = match system_prompts.first().map(String::as_str) {
            Some(crate::engine::prompts::VERIFY_INFORMATION)
            | Some(crate::engine::prompts::VERIFY_CHOICE) => self
                .verdict_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front(),
            Some(crate::engine::prompts::FILTER_INFORMATION) => self.pop_filter(system_prompts),
            _ => self
                .utterance_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front(),
        };
        response.ok_or_else(|| CallError::Llm("scripted responses exhausted".into()))
    }
}

/// Synthesizer producing a deterministic PCM pattern per text, so cache
/// files for the same text are byte-identical.
pub struct TonePcmSynthesizer {
    bytes_per_utterance: usize,
}

impl TonePcmSynthesizer {
    /// Emit `bytes_per_utterance` bytes of PCM per synthesized text.
    pub fn new(bytes_per_utterance: usize) -> Self {
        Self {
            bytes_per_utterance,
        }
    }
}

impl SpeechSynthesizer for TonePcmSynthesizer {
    fn stream_pcm(&self, text: &str) -> Result<Box<dyn Read + Send>> {
        let seed: u32 = text.bytes().map(u32::from).sum();
        let samples = self.bytes_per_utterance / 2;
        let mut pcm = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let value = (((seed as i64 + i as i64 * 37) % 2_000) - 1_000) * 10;
            pcm.extend_from_slice(&(value as i16).to_le_bytes());
        }
        Ok(Box::new(Cursor::new(pcm)))
    }
}

/// Transcriber replaying queued transcripts, falling back to a fixed one.
#[derive(Default)]
pub struct ScriptedTranscriber {
    queued: Mutex<VecDeque<String>>,
    fallback: String,
}

impl ScriptedTranscriber {
    /// Always return the same transcript.
    pub fn fixed(text: &str) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: text.to_owned(),
        }
    }

    /// Queue a transcript for the next capture.
    pub fn push(&self, text: &str) {
        self.queued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(text.to_owned());
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, _wav_path: &Path) -> Result<String> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback.clone()))
    }
}

// ── Loopback SIP driver ───────────────────────────────────────

/// Capture slices shared by every leg a driver creates, so tests can
/// script caller audio before the call (and its legs) exist.
type CapturePlan = Arc<Mutex<VecDeque<Vec<i16>>>>;

/// In-memory SIP driver. Outbound legs confirm immediately unless the
/// driver was created with [`LoopbackDriver::ringing`].
pub struct LoopbackDriver {
    auto_confirm: bool,
    endpoints: Mutex<Vec<Arc<LoopbackEndpoint>>>,
    capture_plan: CapturePlan,
}

impl LoopbackDriver {
    /// Driver whose outbound legs pick up immediately.
    pub fn new() -> Self {
        Self {
            auto_confirm: true,
            endpoints: Mutex::new(Vec::new()),
            capture_plan: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Driver whose outbound legs stay ringing until confirmed by the
    /// test.
    pub fn ringing() -> Self {
        Self {
            auto_confirm: false,
            ..Self::new()
        }
    }

    /// The most recently created endpoint.
    pub fn endpoint(&self) -> Arc<LoopbackEndpoint> {
        self.try_endpoint().expect("no endpoint created yet")
    }

    /// The most recently created endpoint, if any exists yet.
    pub fn try_endpoint(&self) -> Option<Arc<LoopbackEndpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Queue the samples the next recorder slice (on any leg) captures.
    /// When the queue runs dry, slices are silent.
    pub fn push_capture(&self, samples: Vec<i16>) {
        self.capture_plan
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(samples);
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SipDriver for LoopbackDriver {
    fn create_endpoint(
        &self,
        _credentials: &crate::config::SipCredentials,
    ) -> Result<Arc<dyn SipEndpoint>> {
        let endpoint = Arc::new(LoopbackEndpoint {
            auto_confirm: self.auto_confirm,
            handler: Mutex::new(None),
            placed: Mutex::new(Vec::new()),
            registered_threads: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            capture_plan: self.capture_plan.clone(),
        });
        self.endpoints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(endpoint.clone());
        Ok(endpoint)
    }
}

/// Result of injecting an inbound call.
#[derive(Clone)]
pub enum IncomingOutcome {
    Answered(Arc<LoopbackLeg>),
    Rejected,
}

impl IncomingOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered(_))
    }
}

/// In-memory endpoint: tracks placed legs, thread registrations, and the
/// inbound handler.
pub struct LoopbackEndpoint {
    auto_confirm: bool,
    handler: Mutex<Option<IncomingHandler>>,
    placed: Mutex<Vec<Arc<LoopbackLeg>>>,
    registered_threads: Mutex<Vec<String>>,
    shut_down: AtomicBool,
    capture_plan: CapturePlan,
}

impl LoopbackEndpoint {
    /// Simulate an inbound call and report how it was routed.
    pub fn dial_in(&self) -> IncomingOutcome {
        let leg = LoopbackLeg::new("sip:caller@loopback", self.capture_plan.clone());
        let probe = Arc::new(AtomicBool::new(false));
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(handler) = handler.as_ref() else {
            return IncomingOutcome::Rejected;
        };
        handler(Box::new(LoopbackIncoming {
            leg: leg.clone(),
            answered: probe.clone(),
        }));
        if probe.load(Ordering::SeqCst) {
            IncomingOutcome::Answered(leg)
        } else {
            IncomingOutcome::Rejected
        }
    }

    /// All outbound legs placed through this endpoint.
    pub fn placed_legs(&self) -> Vec<Arc<LoopbackLeg>> {
        self.placed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Names of threads registered with the stack.
    pub fn registered_threads(&self) -> Vec<String> {
        self.registered_threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl SipEndpoint for LoopbackEndpoint {
    fn register_thread(&self, name: &str) {
        self.registered_threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(name.to_owned());
    }

    fn place_call(&self, uri: &str) -> Result<Arc<dyn CallLeg>> {
        if self.is_shut_down() {
            return Err(CallError::Sip("endpoint is shut down".into()));
        }
        let leg = LoopbackLeg::new(uri, self.capture_plan.clone());
        if self.auto_confirm {
            leg.confirm();
        }
        self.placed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(leg.clone());
        Ok(leg)
    }

    fn set_incoming_handler(&self, handler: IncomingHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

struct LoopbackIncoming {
    leg: Arc<LoopbackLeg>,
    answered: Arc<AtomicBool>,
}

impl IncomingCall for LoopbackIncoming {
    fn answer(self: Box<Self>) -> Result<Arc<dyn CallLeg>> {
        self.leg.confirm();
        self.answered.store(true, Ordering::SeqCst);
        Ok(self.leg.clone())
    }

    fn reject_busy(self: Box<Self>) {
        self.leg.drop_call(false);
    }
}

/// In-memory call leg with a scriptable state machine.
pub struct LoopbackLeg {
    uri: String,
    state: Mutex<LegState>,
    media_active: AtomicBool,
    call_audio: Arc<LoopbackAudio>,
    hook: Mutex<Option<DisconnectHook>>,
}

impl LoopbackLeg {
    fn new(uri: &str, capture_plan: CapturePlan) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_owned(),
            state: Mutex::new(LegState::Calling),
            media_active: AtomicBool::new(false),
            call_audio: Arc::new(LoopbackAudio::new(capture_plan)),
            hook: Mutex::new(None),
        })
    }

    /// The dialed URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Establish the call: confirmed with live media.
    pub fn confirm(&self) {
        *self.lock_state() = LegState::Confirmed;
        self.media_active.store(true, Ordering::SeqCst);
    }

    /// Toggle media without changing the invite state (peer hold).
    pub fn set_media_active(&self, active: bool) {
        self.media_active.store(active, Ordering::SeqCst);
    }

    /// The peer hung up: disconnect and fire the session's hook.
    pub fn peer_hangup(&self) {
        self.drop_call(true);
    }

    /// The leg's audio double, for capture scripting and play assertions.
    pub fn audio_handle(&self) -> Arc<LoopbackAudio> {
        self.call_audio.clone()
    }

    fn drop_call(&self, fire_hook: bool) {
        *self.lock_state() = LegState::Disconnected;
        self.media_active.store(false, Ordering::SeqCst);
        self.call_audio.detach();
        if fire_hook {
            let hook = self
                .hook
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LegState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CallLeg for LoopbackLeg {
    fn state(&self) -> LegState {
        *self.lock_state()
    }

    fn audio(&self) -> Option<Arc<dyn AudioChannel>> {
        if self.state() == LegState::Confirmed && self.media_active.load(Ordering::SeqCst) {
            Some(self.call_audio.clone())
        } else {
            None
        }
    }

    fn set_disconnect_hook(&self, hook: DisconnectHook) {
        *self
            .hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    fn hangup(&self) -> Result<()> {
        self.drop_call(false);
        Ok(())
    }
}

struct PlayerStats {
    active: usize,
    max_concurrent: usize,
}

/// Audio media double: counts players, records played paths, scripts
/// capture slices, and counts bridges.
pub struct LoopbackAudio {
    attached: Arc<AtomicBool>,
    spec: hound::WavSpec,
    plays: Mutex<Vec<PathBuf>>,
    stats: Arc<Mutex<PlayerStats>>,
    capture: CapturePlan,
    bridges: AtomicUsize,
}

impl LoopbackAudio {
    fn new(capture: CapturePlan) -> Self {
        Self {
            attached: Arc::new(AtomicBool::new(true)),
            spec: audio::wav_spec(&fast_softphone_config()),
            plays: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(PlayerStats {
                active: 0,
                max_concurrent: 0,
            })),
            capture,
            bridges: AtomicUsize::new(0),
        }
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    /// Queue the samples the next recorder slice will capture. When the
    /// queue runs dry, slices are silent.
    pub fn push_capture(&self, samples: Vec<i16>) {
        self.capture
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(samples);
    }

    /// Paths of every file played toward this media.
    pub fn plays(&self) -> Vec<PathBuf> {
        self.plays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The largest number of players that ever transmitted at once.
    pub fn max_concurrent_players(&self) -> usize {
        self.stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .max_concurrent
    }

    /// How many one-directional bridges were established.
    pub fn bridge_count(&self) -> usize {
        self.bridges.load(Ordering::SeqCst)
    }
}

impl AudioChannel for LoopbackAudio {
    fn play_file(&self, path: &Path, _looping: bool) -> Result<Box<dyn PlayerHandle>> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(CallError::CallLost("media detached".into()));
        }
        self.plays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(path.to_path_buf());
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stats.active += 1;
            stats.max_concurrent = stats.max_concurrent.max(stats.active);
        }
        Ok(Box::new(LoopbackPlayer {
            stats: self.stats.clone(),
            released: false,
        }))
    }

    fn record_to_file(&self, path: &Path) -> Result<Box<dyn RecorderHandle>> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(CallError::CallLost("media detached".into()));
        }
        let slice = self
            .capture
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| vec![0; 240]);
        audio::write_samples_wav(path, self.spec, &slice)?;
        Ok(Box::new(LoopbackRecorder {
            attached: self.attached.clone(),
        }))
    }

    fn bridge_into(&self, _other: &Arc<dyn AudioChannel>) -> Result<()> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(CallError::CallLost("media detached".into()));
        }
        self.bridges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct LoopbackPlayer {
    stats: Arc<Mutex<PlayerStats>>,
    released: bool,
}

impl LoopbackPlayer {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stats.active = stats.active.saturating_sub(1);
        }
    }
}

impl PlayerHandle for LoopbackPlayer {
    fn stop(&mut self) {
        self.release();
    }
}

impl Drop for LoopbackPlayer {
    fn drop(&mut self) {
        self.release();
    }
}

struct LoopbackRecorder {
    attached: Arc<AtomicBool>,
}

impl RecorderHandle for LoopbackRecorder {
    fn stop(&mut self) -> Result<()> {
        if self.attached.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CallError::CallLost("media detached".into()))
        }
    }
}

/// Loopback credentials for tests.
pub fn loopback_credentials() -> crate::config::SipCredentials {
    crate::config::SipCredentials {
        id_uri: "sip:tester@loopback".to_owned(),
        registrar_uri: "sip:loopback".to_owned(),
        username: "tester".to_owned(),
        password: "secret".to_owned(),
    }
}
