// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Decoding sounds into memory.
//!
//! Sounds are decoded entirely into memory and transcoded to the mixer's sample rate up front,
//! so triggering one is a pointer copy.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer as DecodeBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info};

use super::SampleError;

/// A decoded sound. The data is stored in an Arc for sharing between voices.
#[derive(Clone, Debug)]
pub struct LoadedSample {
    /// The sample data as f32 samples (interleaved if multi-channel).
    data: Arc<Vec<f32>>,
    /// Number of channels in the sample.
    channel_count: u16,
    /// Sample rate of the audio data.
    sample_rate: u32,
}

impl LoadedSample {
    pub fn new(data: Vec<f32>, channel_count: u16, sample_rate: u32) -> LoadedSample {
        LoadedSample {
            data: Arc::new(data),
            channel_count: channel_count.max(1),
            sample_rate,
        }
    }

    /// Interleaved sample data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the number of channels.
    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.data.len() / self.channel_count as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Turns a sound locator into decoded audio at the output sample rate.
pub trait Decoder: Send + Sync {
    fn decode(&self, locator: &str) -> Result<LoadedSample, SampleError>;
}

/// Decodes audio files from disk with symphonia.
pub struct FileDecoder {
    /// Directory locators are resolved against.
    sounds_dir: PathBuf,
    /// Target sample rate for transcoding (matches audio output).
    target_sample_rate: u32,
}

impl FileDecoder {
    pub fn new(sounds_dir: PathBuf, target_sample_rate: u32) -> FileDecoder {
        FileDecoder {
            sounds_dir,
            target_sample_rate,
        }
    }

    /// Resolves a locator such as `/sounds/drums/kick.mp3` or `drums/kick.wav` against the
    /// sounds directory.
    pub fn resolve(&self, locator: &str) -> PathBuf {
        let relative = locator.trim_start_matches('/');
        let relative = relative.strip_prefix("sounds/").unwrap_or(relative);
        self.sounds_dir.join(relative)
    }
}

impl Decoder for FileDecoder {
    fn decode(&self, locator: &str) -> Result<LoadedSample, SampleError> {
        let path = self.resolve(locator);
        debug!(path = ?path, "Decoding sample");

        let failed = |message: String| SampleError::DecodeFailed {
            locator: locator.to_string(),
            message,
        };

        let (samples, channel_count, source_rate) =
            decode_file(&path).map_err(|e| failed(format!("{}: {}", path.display(), e)))?;

        let samples = if source_rate != self.target_sample_rate {
            info!(
                source_rate,
                target_rate = self.target_sample_rate,
                "Transcoding sample"
            );
            transcode_samples(&samples, channel_count, source_rate, self.target_sample_rate)
        } else {
            samples
        };

        let loaded = LoadedSample::new(samples, channel_count, self.target_sample_rate);
        debug!(
            path = ?path,
            channels = channel_count,
            duration_ms = loaded.duration().as_millis(),
            memory_kb = loaded.memory_size() / 1024,
            "Sample decoded"
        );
        Ok(loaded)
    }
}

/// Decodes the first audio track of a file to interleaved f32.
fn decode_file(path: &Path) -> Result<(Vec<f32>, u16, u32), SymphoniaError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(SymphoniaError::Unsupported("no audio track found"))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(SymphoniaError::Unsupported("sample rate not specified"))?;
    let mut channel_count = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
    let mut samples = Vec::new();
    let mut buffer: Option<DecodeBuffer<f32>> = None;

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Some decoders report a corrupt trailing packet; keep what decoded cleanly.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e),
        };
        if decoded.frames() == 0 {
            continue;
        }
        if channel_count == 0 {
            channel_count = decoded.spec().channels.count() as u16;
        }

        let needs_new = buffer
            .as_ref()
            .map_or(true, |b| b.capacity() < decoded.capacity());
        if needs_new {
            buffer = Some(DecodeBuffer::new(decoded.capacity() as u64, *decoded.spec()));
        }
        if let Some(buffer) = buffer.as_mut() {
            buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buffer.samples());
        }
    }

    if channel_count == 0 {
        return Err(SymphoniaError::Unsupported("channels not specified"));
    }
    Ok((samples, channel_count, sample_rate))
}

/// Transcodes samples from one sample rate to another using linear interpolation. Drum hits
/// and one-shots don't need anything better.
pub(crate) fn transcode_samples(
    samples: &[f32],
    channel_count: u16,
    source_rate: u32,
    target_rate: u32,
) -> Vec<f32> {
    let channels = channel_count.max(1) as usize;
    if source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }
    let ratio = target_rate as f64 / source_rate as f64;
    let source_frames = samples.len() / channels;
    let target_frames = (source_frames as f64 * ratio).ceil() as usize;

    let mut output = Vec::with_capacity(target_frames * channels);
    for target_frame in 0..target_frames {
        let source_pos = target_frame as f64 / ratio;
        let source_frame = source_pos.floor() as usize;
        let frac = source_pos.fract() as f32;

        for channel in 0..channels {
            let s0 = samples
                .get(source_frame * channels + channel)
                .copied()
                .unwrap_or(0.0);
            let s1 = samples
                .get((source_frame + 1) * channels + channel)
                .copied()
                .unwrap_or(s0);
            output.push(s0 + (s1 - s0) * frac);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn test_transcode_samples() {
        let source_rate = 44100;
        let target_rate = 48000;
        let source_samples: Vec<f32> = (0..4410)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / source_rate as f32).sin())
            .collect();

        let result = transcode_samples(&source_samples, 1, source_rate, target_rate);

        let expected_len = (4410.0_f64 * (48000.0 / 44100.0)).ceil() as usize;
        assert_eq!(result.len(), expected_len);
    }

    #[test]
    fn test_transcode_stereo_keeps_channels_apart() {
        let source_samples = vec![1.0f32, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];

        let result = transcode_samples(&source_samples, 2, 44100, 48000);

        assert!(result.len() >= 8);
        assert_eq!(result.len() % 2, 0);
        for frame in result.chunks_exact(2) {
            assert!((frame[0] - 1.0).abs() < 1e-6);
            assert!((frame[1] + 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_resolve_locators() {
        let decoder = FileDecoder::new(PathBuf::from("/data/sounds"), 48000);
        assert_eq!(
            decoder.resolve("/sounds/drums/kick-deep.mp3"),
            PathBuf::from("/data/sounds/drums/kick-deep.mp3")
        );
        assert_eq!(
            decoder.resolve("fx/zap.wav"),
            PathBuf::from("/data/sounds/fx/zap.wav")
        );
    }

    #[test]
    fn test_decode_wav_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_wav(
            dir.path().join("click.wav"),
            vec![vec![0.5f32; 480]],
            48000,
        )
        .expect("write wav");

        let decoder = FileDecoder::new(dir.path().to_path_buf(), 48000);
        let sample = decoder.decode("/sounds/click.wav").expect("decodes");
        assert_eq!(sample.channel_count(), 1);
        assert_eq!(sample.frames(), 480);
        assert!((sample.duration().as_secs_f64() - 0.01).abs() < 1e-6);
        assert!((sample.data()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decode_transcodes_to_target_rate() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_wav(dir.path().join("tone.wav"), vec![vec![0.25f32; 441]], 44100)
            .expect("write wav");

        let decoder = FileDecoder::new(dir.path().to_path_buf(), 48000);
        let sample = decoder.decode("tone.wav").expect("decodes");
        assert_eq!(sample.sample_rate(), 48000);
        assert!((480..=481).contains(&sample.frames()));
    }

    #[test]
    fn test_decode_missing_file_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let decoder = FileDecoder::new(dir.path().to_path_buf(), 48000);
        match decoder.decode("missing.wav") {
            Err(SampleError::DecodeFailed { locator, .. }) => assert_eq!(locator, "missing.wav"),
            other => panic!("expected decode failure, got {:?}", other),
        }
    }
}
