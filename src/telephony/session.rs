//! Per-call session: the state machine over one active leg and an
//! optional paired (forwarded) leg, with speech playback and capture.

use crate::config::SoftphoneConfig;
use crate::error::{CallError, Result};
use crate::providers::{SpeechSynthesizer, Transcriber};
use crate::telephony::SessionScratch;
use crate::telephony::asr::{Capturer, CaptureSource, MediaLookup};
use crate::telephony::driver::{AudioChannel, CallLeg, LegState, RecorderHandle, SipEndpoint};
use crate::telephony::tts::{PlayerPair, TtsStreamer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Poll period while waiting for a leg to leave the ringing states.
const RING_POLL: Duration = Duration::from_millis(200);

/// One logical call with its media, players, recorder, and a UUID
/// namespacing its scratch files. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TelephonySession {
    inner: Arc<SessionInner>,
}

struct LegPair {
    active: Option<Arc<dyn CallLeg>>,
    paired: Option<Arc<dyn CallLeg>>,
}

pub(crate) struct SessionInner {
    id: uuid::Uuid,
    endpoint: Arc<dyn SipEndpoint>,
    registrar_host: String,
    artifacts_dir: PathBuf,
    scratch: SessionScratch,
    tts: TtsStreamer,
    capturer: Capturer,
    legs: Mutex<LegPair>,
    players: Mutex<PlayerPair>,
    recorder: Mutex<Option<Box<dyn RecorderHandle>>>,
}

impl TelephonySession {
    /// Create a session bound to a shared endpoint. Sessions are created
    /// and released through the pool.
    pub(crate) fn new(
        endpoint: Arc<dyn SipEndpoint>,
        registrar_host: String,
        config: SoftphoneConfig,
        artifacts_dir: PathBuf,
        cache_dir: PathBuf,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        let id = uuid::Uuid::new_v4();
        let scratch = SessionScratch::new(&artifacts_dir, id);
        Self {
            inner: Arc::new(SessionInner {
                id,
                endpoint,
                registrar_host,
                artifacts_dir,
                scratch,
                tts: TtsStreamer::new(synthesizer, config.clone(), cache_dir),
                capturer: Capturer::new(config, transcriber),
                legs: Mutex::new(LegPair {
                    active: None,
                    paired: None,
                }),
                players: Mutex::new(PlayerPair::default()),
                recorder: Mutex::new(None),
            }),
        }
    }

    /// The session UUID (scratch-file namespace).
    pub fn id(&self) -> uuid::Uuid {
        self.inner.id
    }

    /// Place an outbound call to `sip:<number>@<registrar>`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Sip` when a call is already in progress or the
    /// INVITE cannot be sent.
    pub fn call(&self, number: &str) -> Result<()> {
        let mut legs = self.inner.lock_legs();
        if legs.active.is_some() {
            return Err(CallError::Sip("a call is already in progress".into()));
        }
        let uri = format!("sip:{number}@{}", self.inner.registrar_host);
        info!("calling {uri}");
        let leg = self.inner.endpoint.place_call(&uri)?;
        self.install_disconnect_hook(&leg, false);
        legs.active = Some(leg);
        Ok(())
    }

    /// Bind an answered inbound leg as the active call.
    pub(crate) fn bind_incoming(&self, leg: Arc<dyn CallLeg>) {
        let mut legs = self.inner.lock_legs();
        self.install_disconnect_hook(&leg, false);
        legs.active = Some(leg);
    }

    /// Whether this session has no call and may accept an inbound leg.
    pub fn is_idle(&self) -> bool {
        self.inner.lock_legs().active.is_none()
    }

    /// True iff the active leg is confirmed with live audio media.
    pub fn has_picked_up_call(&self) -> bool {
        let legs = self.inner.lock_legs();
        legs.active
            .as_ref()
            .is_some_and(|leg| leg.state() == LegState::Confirmed && leg.audio().is_some())
    }

    /// Block while the active leg is still ringing (CALLING or EARLY),
    /// up to `timeout` when given.
    pub fn wait_for_stop_calling(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ringing = {
                let legs = self.inner.lock_legs();
                legs.active.as_ref().is_some_and(|leg| {
                    matches!(leg.state(), LegState::Calling | LegState::Early)
                })
            };
            if !ringing {
                return;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return;
            }
            std::thread::sleep(RING_POLL);
        }
    }

    /// Whether a paired leg exists (the call is bridged).
    pub fn is_forwarded(&self) -> bool {
        self.inner.lock_legs().paired.is_some()
    }

    /// Bridge the active call to a second outbound leg.
    ///
    /// Requires a confirmed active leg and no existing pair. On pickup the
    /// audio medias of both legs are cross-connected and local playback
    /// stops; `say`/`play_audio` are rejected until the pair ends.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Forwarding` when preconditions fail or the
    /// paired leg never picks up (the paired leg is torn down again; the
    /// active leg survives).
    pub fn forward(&self, number: &str, timeout: Option<Duration>) -> Result<()> {
        {
            let legs = self.inner.lock_legs();
            let Some(active) = legs.active.as_ref() else {
                return Err(CallError::Forwarding("no call in progress".into()));
            };
            if active.state() != LegState::Confirmed {
                return Err(CallError::Forwarding("active call not confirmed".into()));
            }
            if legs.paired.is_some() {
                return Err(CallError::Forwarding(
                    "already in forwarding session".into(),
                ));
            }
        }

        let uri = format!("sip:{number}@{}", self.inner.registrar_host);
        info!("forwarding call to {uri}");
        let paired = self.inner.endpoint.place_call(&uri)?;
        self.install_disconnect_hook(&paired, true);
        self.inner.lock_legs().paired = Some(paired.clone());

        // Wait for the paired leg to pick up.
        let deadline = timeout.map(|t| Instant::now() + t);
        while matches!(paired.state(), LegState::Calling | LegState::Early) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            std::thread::sleep(RING_POLL);
        }
        if paired.state() != LegState::Confirmed {
            self.hangup(true);
            return Err(CallError::Forwarding(
                "forwarded call was not picked up".into(),
            ));
        }

        let (active_audio, paired_audio) = {
            let legs = self.inner.lock_legs();
            let active_audio = legs.active.as_ref().and_then(|leg| leg.audio());
            (active_audio, paired.audio())
        };
        let (Some(active_audio), Some(paired_audio)) = (active_audio, paired_audio) else {
            self.hangup(true);
            return Err(CallError::Media("no audio media on one leg".into()));
        };

        self.inner.lock_players().stop_all();
        let bridged = active_audio
            .bridge_into(&paired_audio)
            .and_then(|()| paired_audio.bridge_into(&active_audio));
        if let Err(e) = bridged {
            self.hangup(true);
            return Err(e);
        }
        info!("call bridged");
        Ok(())
    }

    /// Speak `text` toward the caller.
    ///
    /// Playback errors never propagate; a dead call makes this a no-op.
    pub fn say(&self, text: &str, cache: bool) {
        let Some(call_audio) = self.speakable_audio("say") else {
            return;
        };
        let mut players = self.inner.lock_players();
        self.inner
            .tts
            .say(&call_audio, &mut players, &self.inner.scratch, text, cache);
    }

    /// Play a WAV file toward the caller.
    pub fn play_audio(&self, path: &Path, looping: bool) {
        let Some(call_audio) = self.speakable_audio("play audio") else {
            return;
        };
        let mut players = self.inner.lock_players();
        players.stop_all();
        match call_audio.play_file(path, looping) {
            Ok(player) => players.install(0, player),
            Err(e) => warn!("can't play audio: {e}"),
        }
    }

    /// Record one caller utterance and return the transcript.
    ///
    /// Returns `"##INTERRUPTED##"` when recording failed (media lost) and
    /// `""` when the call disappeared or was forwarded while listening.
    pub fn listen(&self) -> String {
        self.inner.capturer.listen(
            self.inner.as_ref(),
            &self.inner.recorder,
            &self.inner.scratch,
        )
    }

    /// Tear the call down.
    ///
    /// With `paired_only` set, only the forwarded leg is dropped (used from
    /// the paired leg's disconnect callback); the active call survives.
    /// Otherwise both legs are hung up, players and recorder stop, and the
    /// session's scratch files are deleted.
    pub fn hangup(&self, paired_only: bool) {
        if paired_only {
            let paired = self.inner.lock_legs().paired.take();
            if let Some(leg) = paired {
                if let Err(e) = leg.hangup() {
                    warn!("paired hangup failed: {e}");
                }
                info!("forwarding session ended");
            }
            return;
        }

        let (active, paired) = {
            let mut legs = self.inner.lock_legs();
            (legs.active.take(), legs.paired.take())
        };
        self.inner.lock_players().stop_all();
        {
            let mut recorder = self
                .inner
                .recorder
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(mut handle) = recorder.take() {
                let _ = handle.stop();
            }
        }
        for leg in [active, paired].into_iter().flatten() {
            if let Err(e) = leg.hangup() {
                warn!("hangup failed: {e}");
            }
        }
        self.remove_artifacts();
    }

    /// The active leg's audio, unless the call is bridged or gone.
    fn speakable_audio(&self, op: &str) -> Option<Arc<dyn AudioChannel>> {
        let legs = self.inner.lock_legs();
        if legs.paired.is_some() {
            info!("can't {op}: in forwarding session");
            return None;
        }
        let Some(active) = legs.active.as_ref() else {
            info!("can't {op}: no call in progress");
            return None;
        };
        let audio = active.audio();
        if audio.is_none() {
            warn!("can't {op}: no available audio media");
        }
        audio
    }

    fn install_disconnect_hook(&self, leg: &Arc<dyn CallLeg>, is_paired: bool) {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        leg.set_disconnect_hook(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                TelephonySession { inner }.hangup(is_paired);
            }
        }));
    }

    fn remove_artifacts(&self) {
        let prefix = self.inner.id.to_string();
        let Ok(entries) = std::fs::read_dir(&self.inner.artifacts_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

impl SessionInner {
    fn lock_legs(&self) -> MutexGuard<'_, LegPair> {
        self.legs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_players(&self) -> MutexGuard<'_, PlayerPair> {
        self.players
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CaptureSource for SessionInner {
    fn media(&self) -> MediaLookup {
        let legs = self.lock_legs();
        let Some(active) = legs.active.as_ref() else {
            return MediaLookup::Gone;
        };
        match active.state() {
            LegState::Disconnected => MediaLookup::Gone,
            _ => match active.audio() {
                Some(audio) => MediaLookup::Active(audio),
                None => MediaLookup::Inactive,
            },
        }
    }

    fn is_forwarded(&self) -> bool {
        self.lock_legs().paired.is_some()
    }
}
