//! Voice-activity-gated capture and transcription.
//!
//! Capture runs in two phases over short recorded slices: skip slices
//! quieter than the configured silence threshold, then collect slices
//! while the caller keeps talking, with the stop threshold trailing 5 dB
//! below the loudest recent slice so trailing-off speech still ends the
//! turn.

use crate::config::SoftphoneConfig;
use crate::providers::Transcriber;
use crate::telephony::SessionScratch;
use crate::telephony::audio;
use crate::telephony::driver::{AudioChannel, RecorderHandle};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Returned when recording failed mid-slice (media lost).
pub const INTERRUPTED: &str = "##INTERRUPTED##";

/// Margin below the last loud slice at which collection stops.
const ADAPTIVE_MARGIN_DB: f32 = 5.0;

/// How the capturer sees the call while recording.
pub(crate) enum MediaLookup {
    /// Audio is live.
    Active(Arc<dyn AudioChannel>),
    /// The leg exists but its media is not active (e.g. peer hold).
    Inactive,
    /// The call is gone.
    Gone,
}

/// The session-side view the capturer records through.
pub(crate) trait CaptureSource {
    fn media(&self) -> MediaLookup;
    fn is_forwarded(&self) -> bool;
}

enum SliceOutcome {
    Recorded,
    CallGone,
    Interrupted,
}

/// One capture pipeline: record slices, gate on loudness, transcribe.
pub(crate) struct Capturer {
    config: SoftphoneConfig,
    transcriber: Arc<dyn Transcriber>,
}

impl Capturer {
    pub(crate) fn new(config: SoftphoneConfig, transcriber: Arc<dyn Transcriber>) -> Self {
        Self { config, transcriber }
    }

    /// Record one caller utterance and return its transcript.
    ///
    /// Returns [`INTERRUPTED`] when recording fails mid-slice, and `""`
    /// when the call disappeared or was forwarded while listening (or the
    /// transcription provider failed, which the engine treats as an empty
    /// turn).
    pub(crate) fn listen(
        &self,
        source: &dyn CaptureSource,
        recorder_slot: &Mutex<Option<Box<dyn RecorderHandle>>>,
        scratch: &SessionScratch,
    ) -> String {
        // Silence-skip: wait for a slice that clears the threshold.
        let mut last = loop {
            if source.is_forwarded() {
                return String::new();
            }
            match self.record_slice(
                source,
                recorder_slot,
                scratch,
                self.config.silence_sample_interval,
            ) {
                SliceOutcome::Recorded => {}
                SliceOutcome::CallGone => return String::new(),
                SliceOutcome::Interrupted => return INTERRUPTED.to_owned(),
            }
            let Ok(samples) = audio::read_samples(&scratch.incoming) else {
                return INTERRUPTED.to_owned();
            };
            let level = audio::dbfs(&samples);
            if level >= self.config.silence_threshold {
                debug!("speech started at {level:.1} dBFS");
                break samples;
            }
        };

        // Speech-collect: keep recording while the caller stays above the
        // trailing threshold.
        let mut combined = last.clone();
        let mut active_threshold = self.config.silence_threshold;
        loop {
            let level = audio::dbfs(&last);
            if level < active_threshold {
                debug!("speech ended at {level:.1} dBFS (threshold {active_threshold:.1})");
                break;
            }
            active_threshold = level - ADAPTIVE_MARGIN_DB;

            if source.is_forwarded() {
                return String::new();
            }
            match self.record_slice(
                source,
                recorder_slot,
                scratch,
                self.config.speaking_sample_interval,
            ) {
                SliceOutcome::Recorded => {}
                SliceOutcome::CallGone => return String::new(),
                SliceOutcome::Interrupted => return INTERRUPTED.to_owned(),
            }
            let Ok(samples) = audio::read_samples(&scratch.incoming) else {
                return INTERRUPTED.to_owned();
            };
            combined.extend_from_slice(&samples);
            last = samples;
        }

        let spec = audio::wav_spec(&self.config);
        if let Err(e) = audio::write_samples_wav(&scratch.combined, spec, &combined) {
            warn!("failed to export captured utterance: {e}");
            return INTERRUPTED.to_owned();
        }

        match self.transcriber.transcribe(&scratch.combined) {
            Ok(text) => text,
            Err(e) => {
                error!("transcription failed: {e}");
                String::new()
            }
        }
    }

    /// Record one slice into the incoming scratch file.
    ///
    /// Inactive media (peer hold) is retried at 1 Hz up to the configured
    /// timeout before giving up.
    fn record_slice(
        &self,
        source: &dyn CaptureSource,
        recorder_slot: &Mutex<Option<Box<dyn RecorderHandle>>>,
        scratch: &SessionScratch,
        seconds: f32,
    ) -> SliceOutcome {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.unavailable_media_timeout);
        let call_audio = loop {
            match source.media() {
                MediaLookup::Active(audio) => break audio,
                MediaLookup::Gone => return SliceOutcome::CallGone,
                MediaLookup::Inactive => {
                    if Instant::now() >= deadline {
                        warn!("call media stayed inactive past the timeout");
                        return SliceOutcome::Interrupted;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        };

        let recorder = match call_audio.record_to_file(&scratch.incoming) {
            Ok(recorder) => recorder,
            Err(e) => {
                warn!("could not start recorder: {e}");
                return SliceOutcome::Interrupted;
            }
        };
        {
            let mut slot = recorder_slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(recorder);
        }

        std::thread::sleep(Duration::from_secs_f32(seconds));

        let recorder = {
            let mut slot = recorder_slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.take()
        };
        // A hangup mid-slice empties the slot.
        let Some(mut recorder) = recorder else {
            return SliceOutcome::Interrupted;
        };
        match recorder.stop() {
            Ok(()) => SliceOutcome::Recorded,
            Err(e) => {
                warn!("recorder stop failed: {e}");
                SliceOutcome::Interrupted
            }
        }
    }
}
