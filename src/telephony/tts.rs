//! Streaming speech playback with double buffering and a content cache.
//!
//! The SIP media layer consumes files, not memory, so streamed PCM is
//! interleaved through two on-disk WAV buffers: while the player transmits
//! buffer N, the synthesizer's next chunk lands in buffer N+1. Chunk-length
//! sleeps approximate real-time pacing. Finished utterances are optionally
//! cached under `cache/{sha256(text)}.wav` and replayed from disk on the
//! next request.

use crate::config::SoftphoneConfig;
use crate::error::Result;
use crate::providers::SpeechSynthesizer;
use crate::telephony::SessionScratch;
use crate::telephony::audio;
use crate::telephony::driver::{AudioChannel, PlayerHandle};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Chunks shorter than this are dropped rather than played.
const MIN_CHUNK_BYTES: usize = 512;

/// Silent preamble written into a fresh buffer file (1024 zero samples).
const PREAMBLE_BYTES: usize = 2048;

/// The two player slots of one session.
///
/// At most one transmits toward the call at any instant; installing into a
/// slot stops whatever that slot held before.
#[derive(Default)]
pub struct PlayerPair {
    slots: [Option<Box<dyn PlayerHandle>>; 2],
}

impl PlayerPair {
    /// Stop and drop the player in `slot`.
    pub fn stop(&mut self, slot: usize) {
        if let Some(mut player) = self.slots[slot].take() {
            player.stop();
        }
    }

    /// Stop both players.
    pub fn stop_all(&mut self) {
        self.stop(0);
        self.stop(1);
    }

    /// Install a player into `slot`, stopping the previous occupant first.
    pub fn install(&mut self, slot: usize, player: Box<dyn PlayerHandle>) {
        self.stop(slot);
        self.slots[slot] = Some(player);
    }
}

/// Cache key of an utterance: lowercase hex SHA-256 of its UTF-8 bytes.
pub fn utterance_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Double-buffered speech streamer bound to one synthesizer and cache dir.
pub struct TtsStreamer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: SoftphoneConfig,
    cache_dir: PathBuf,
}

impl TtsStreamer {
    /// Create a streamer.
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: SoftphoneConfig,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            synthesizer,
            config,
            cache_dir,
        }
    }

    /// Cache file path for an utterance.
    pub fn cache_path(&self, text: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.wav", utterance_hash(text)))
    }

    /// Speak `text` toward the call.
    ///
    /// Errors (typically the media detaching because the peer hung up)
    /// terminate playback and are logged; they never propagate past `say`.
    pub fn say(
        &self,
        call_audio: &Arc<dyn AudioChannel>,
        players: &mut PlayerPair,
        scratch: &SessionScratch,
        text: &str,
        cache: bool,
    ) {
        if let Err(e) = self.stream(call_audio, players, scratch, text, cache) {
            warn!("speech playback ended early: {e}");
        }
    }

    fn stream(
        &self,
        call_audio: &Arc<dyn AudioChannel>,
        players: &mut PlayerPair,
        scratch: &SessionScratch,
        text: &str,
        cache: bool,
    ) -> Result<()> {
        let cache_path = self.cache_path(text);
        if cache_path.exists() {
            debug!("cache hit for utterance ({})", cache_path.display());
            return self.play_file_to_completion(call_audio, players, &cache_path);
        }

        let spec = audio::wav_spec(&self.config);
        let preamble = vec![0_u8; PREAMBLE_BYTES];
        audio::write_pcm_wav(&scratch.outgoing[0], spec, &preamble)?;
        audio::write_pcm_wav(&scratch.outgoing[1], spec, &preamble)?;

        let mut stream = self.synthesizer.stream_pcm(text)?;
        let mut played: Vec<u8> = Vec::new();
        let mut last_chunk_len = 0_usize;

        // Alternates buffers: the player always transmits the previously
        // written buffer while the fresh chunk lands in the other one.
        let mut front = 0_usize;
        loop {
            let chunk = read_chunk(stream.as_mut(), self.config.tts_chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            if chunk.len() < MIN_CHUNK_BYTES {
                continue;
            }

            let back = 1 - front;
            players.stop(back);
            players.install(front, call_audio.play_file(&scratch.outgoing[front], false)?);
            audio::write_pcm_wav(&scratch.outgoing[back], spec, &chunk)?;

            std::thread::sleep(Duration::from_secs_f32(
                self.config.chunk_seconds(chunk.len()),
            ));
            played.extend_from_slice(&chunk);
            last_chunk_len = chunk.len();
            front = back;
        }

        if played.is_empty() {
            return Ok(());
        }

        // Residue: the final chunk is still sitting unplayed in the front
        // buffer.
        let back = 1 - front;
        players.stop(back);
        players.install(front, call_audio.play_file(&scratch.outgoing[front], false)?);
        std::thread::sleep(Duration::from_secs_f32(
            self.config.chunk_seconds(last_chunk_len),
        ));

        if cache {
            std::fs::create_dir_all(&self.cache_dir)?;
            audio::write_pcm_wav(&cache_path, spec, &played)?;
            debug!("cached utterance to {}", cache_path.display());
        }
        Ok(())
    }

    fn play_file_to_completion(
        &self,
        call_audio: &Arc<dyn AudioChannel>,
        players: &mut PlayerPair,
        path: &std::path::Path,
    ) -> Result<()> {
        let seconds = audio::duration_seconds(path)?;
        players.stop_all();
        players.install(0, call_audio.play_file(path, false)?);
        std::thread::sleep(Duration::from_secs_f32(seconds));
        players.stop(0);
        Ok(())
    }
}

/// Read up to `size` bytes from the stream. Short only at end of stream.
fn read_chunk(reader: &mut (dyn Read + Send), size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; size];
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn utterance_hash_is_sha256_hex() {
        // Known digest of the empty string.
        assert_eq!(
            utterance_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(utterance_hash("hello"), utterance_hash("hello"));
        assert_ne!(utterance_hash("hello"), utterance_hash("hello "));
    }

    #[test]
    fn read_chunk_fills_across_partial_reads() {
        struct Dribble(Vec<u8>, usize);
        impl Read for Dribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                // One byte at a time.
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }
        let mut source = Dribble((0..100_u8).collect(), 0);
        let chunk = read_chunk(&mut source, 64).unwrap();
        assert_eq!(chunk.len(), 64);
        let rest = read_chunk(&mut source, 64).unwrap();
        assert_eq!(rest.len(), 36);
        assert!(read_chunk(&mut source, 64).unwrap().is_empty());
    }
}
