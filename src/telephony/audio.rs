//! WAV scratch-file helpers shared by the TTS streamer and the capturer.

use crate::config::SoftphoneConfig;
use crate::error::{CallError, Result};
use std::path::Path;

/// The WAV format of all scratch files for a given softphone config.
pub fn wav_spec(config: &SoftphoneConfig) -> hound::WavSpec {
    hound::WavSpec {
        channels: config.tts_channels,
        sample_rate: config.tts_sample_rate,
        bits_per_sample: config.tts_sample_width * 8,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write raw little-endian 16-bit PCM bytes as a WAV file, replacing any
/// previous content. A trailing odd byte is dropped.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn write_pcm_wav(path: &Path, spec: hound::WavSpec, pcm: &[u8]) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        writer
            .write_sample(sample)
            .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    }
    writer
        .finalize()
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    Ok(())
}

/// Write 16-bit samples as a WAV file.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn write_samples_wav(path: &Path, spec: hound::WavSpec, samples: &[i16]) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    }
    writer
        .finalize()
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    Ok(())
}

/// Read all samples of a 16-bit WAV file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or is not 16-bit PCM.
pub fn read_samples(path: &Path) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CallError::Io(std::io::Error::other(e)))
}

/// Playback length of a WAV file in seconds.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn duration_seconds(path: &Path) -> Result<f32> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| CallError::Io(std::io::Error::other(e)))?;
    let spec = reader.spec();
    Ok(reader.duration() as f32 / spec.sample_rate as f32)
}

/// Loudness of a slice of samples in dBFS.
///
/// Returns negative infinity for empty or all-zero slices, so silence
/// always compares below any finite threshold.
pub fn dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s);
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    if rms <= 0.0 {
        return f32::NEG_INFINITY;
    }
    (20.0 * (rms / f64::from(i16::MAX)).log10()) as f32
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::SoftphoneConfig;

    #[test]
    fn dbfs_of_silence_is_negative_infinity() {
        assert_eq!(dbfs(&[]), f32::NEG_INFINITY);
        assert_eq!(dbfs(&[0; 512]), f32::NEG_INFINITY);
    }

    #[test]
    fn dbfs_of_full_scale_is_zero() {
        let full = vec![i16::MAX; 512];
        assert!(dbfs(&full).abs() < 0.01);
    }

    #[test]
    fn dbfs_orders_by_amplitude() {
        let quiet = vec![100_i16; 512];
        let loud = vec![10_000_i16; 512];
        assert!(dbfs(&quiet) < dbfs(&loud));
        assert!(dbfs(&loud) < 0.0);
    }

    #[test]
    fn pcm_round_trips_through_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let spec = wav_spec(&SoftphoneConfig::default());

        let samples: Vec<i16> = (0..2400).map(|i| (i % 256) as i16).collect();
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        write_pcm_wav(&path, spec, &pcm).unwrap();

        assert_eq!(read_samples(&path).unwrap(), samples);
        let secs = duration_seconds(&path).unwrap();
        assert!((secs - 0.1).abs() < 0.001);
    }
}
