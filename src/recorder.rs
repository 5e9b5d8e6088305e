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

//! Captures the master output into an in-memory WebM (Opus) recording.
//!
//! The recorder attaches a tap to the mixer. Elapsed time is counted in captured frames, so it
//! follows the audio clock rather than the wall clock. When the capture window fills, the tap
//! detaches and the capture is finalized the next time the recorder is asked about it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::audio::{AudioMixer, OutputTap};
use crate::util::filename_timestamp;

mod webm;

/// Default capture window.
pub const DEFAULT_MAX_RECORDING: Duration = Duration::from_secs(300);

pub const RECORDING_MIME_TYPE: &str = "audio/webm";
pub const RECORDING_EXTENSION: &str = "webm";

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("already recording")]
    AlreadyRecording,
    #[error("a previous recording must be cleared first")]
    RecordingNotCleared,
    #[error("no recording to download")]
    NoActiveRecording,
    #[error("unable to encode recording: {0}")]
    Encode(String),
    #[error("unable to write recording: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished capture.
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
    pub duration: Duration,
}

/// What callers see of the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingState {
    pub is_recording: bool,
    /// Whole seconds captured so far.
    pub elapsed_seconds: u64,
    pub has_recording: bool,
}

enum Phase {
    Idle,
    Recording,
    /// The capture window filled; samples await encoding.
    LimitReached,
}

struct Capture {
    phase: Phase,
    /// Increments on every start so a stale tap never writes into a newer capture.
    session: u64,
    samples: Vec<f32>,
    frames: u64,
    max_frames: u64,
    channels: u16,
    sample_rate: u32,
    recording: Option<Recording>,
}

impl Capture {
    fn elapsed_seconds(&self) -> u64 {
        self.frames / self.sample_rate.max(1) as u64
    }

    /// Encodes the captured samples and resets the capture buffer.
    fn finalize(&mut self) -> Result<Recording, RecorderError> {
        self.phase = Phase::Idle;
        let samples = std::mem::take(&mut self.samples);
        let data = webm::encode(&samples, self.channels, self.sample_rate)?;
        let recording = Recording {
            data,
            mime_type: RECORDING_MIME_TYPE,
            duration: Duration::from_secs_f64(self.frames as f64 / self.sample_rate.max(1) as f64),
        };
        info!(
            frames = self.frames,
            bytes = recording.data.len(),
            "Recording finalized"
        );
        self.recording = Some(recording.clone());
        Ok(recording)
    }

    /// Finalizes a capture that hit the window limit.
    fn settle(&mut self) {
        if matches!(self.phase, Phase::LimitReached) {
            if let Err(e) = self.finalize() {
                warn!(err = %e, "Unable to finalize recording after reaching the limit");
            }
        }
    }
}

/// The mixer tap feeding one capture session.
struct RecorderTap {
    capture: Arc<Mutex<Capture>>,
    session: u64,
}

impl OutputTap for RecorderTap {
    fn on_block(&mut self, block: &[f32], channels: u16) -> bool {
        let mut capture = self.capture.lock();
        if capture.session != self.session || !matches!(capture.phase, Phase::Recording) {
            return false;
        }

        let channels = channels.max(1) as usize;
        let remaining = capture.max_frames.saturating_sub(capture.frames) as usize;
        let frames = (block.len() / channels).min(remaining);
        capture.samples.extend_from_slice(&block[..frames * channels]);
        capture.frames += frames as u64;

        if capture.frames >= capture.max_frames {
            capture.phase = Phase::LimitReached;
            return false;
        }
        true
    }
}

/// Records the master output.
pub struct Recorder {
    capture: Arc<Mutex<Capture>>,
    mixer: AudioMixer,
}

impl Recorder {
    pub fn new(mixer: AudioMixer, max_duration: Duration) -> Recorder {
        let max_frames = mixer.frames_for(max_duration).max(1);
        Recorder {
            capture: Arc::new(Mutex::new(Capture {
                phase: Phase::Idle,
                session: 0,
                samples: Vec::new(),
                frames: 0,
                max_frames,
                channels: mixer.num_channels(),
                sample_rate: mixer.sample_rate(),
                recording: None,
            })),
            mixer,
        }
    }

    /// Starts capturing the master output.
    pub fn start(&self) -> Result<(), RecorderError> {
        let session = {
            let mut capture = self.capture.lock();
            capture.settle();
            if matches!(capture.phase, Phase::Recording) {
                return Err(RecorderError::AlreadyRecording);
            }
            if capture.recording.is_some() {
                return Err(RecorderError::RecordingNotCleared);
            }
            capture.session += 1;
            capture.phase = Phase::Recording;
            capture.samples.clear();
            capture.frames = 0;
            capture.session
        };

        self.mixer.add_tap(Box::new(RecorderTap {
            capture: self.capture.clone(),
            session,
        }));
        info!(session, "Recording started");
        Ok(())
    }

    /// Stops capturing and returns the finished recording. Returns None if not recording.
    pub fn stop(&self) -> Result<Option<Recording>, RecorderError> {
        let mut capture = self.capture.lock();
        capture.settle();
        if !matches!(capture.phase, Phase::Recording) {
            return Ok(None);
        }
        capture.finalize().map(Some)
    }

    /// Discards the finished recording and resets elapsed time.
    pub fn clear(&self) {
        let mut capture = self.capture.lock();
        capture.settle();
        capture.recording = None;
        if !matches!(capture.phase, Phase::Recording) {
            capture.frames = 0;
            capture.samples.clear();
        }
    }

    pub fn state(&self) -> RecordingState {
        let mut capture = self.capture.lock();
        capture.settle();
        RecordingState {
            is_recording: matches!(capture.phase, Phase::Recording),
            elapsed_seconds: capture.elapsed_seconds(),
            has_recording: capture.recording.is_some(),
        }
    }

    /// The finished recording, if any.
    pub fn recording(&self) -> Option<Recording> {
        let mut capture = self.capture.lock();
        capture.settle();
        capture.recording.clone()
    }

    /// Writes the finished recording into `dir` under a timestamped name and returns its path.
    pub fn download_recording(&self, dir: &Path) -> Result<PathBuf, RecorderError> {
        let recording = self.recording().ok_or(RecorderError::NoActiveRecording)?;
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "beatpad-{}.{}",
            filename_timestamp(SystemTime::now()),
            RECORDING_EXTENSION
        ));
        fs::write(&path, &recording.data)?;
        info!(path = %path.display(), "Recording written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8000;
    const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

    fn advance(mixer: &AudioMixer, frames: usize) {
        let mut block = vec![0.0; frames * mixer.num_channels() as usize];
        mixer.render(&mut block);
    }

    #[test]
    fn test_start_stop_produces_webm() {
        let mixer = AudioMixer::new(2, RATE);
        let recorder = Recorder::new(mixer.clone(), DEFAULT_MAX_RECORDING);

        assert_eq!(recorder.stop().expect("stop"), None);
        recorder.start().expect("start");
        advance(&mixer, 20_000);
        let state = recorder.state();
        assert!(state.is_recording);
        assert_eq!(state.elapsed_seconds, 2);

        let recording = recorder.stop().expect("stop").expect("recording");
        assert_eq!(recording.mime_type, "audio/webm");
        assert_eq!(recording.duration, Duration::from_millis(2500));
        assert_eq!(&recording.data[..4], &WEBM_MAGIC);
        assert!(recording
            .data
            .windows(6)
            .any(|window| window == b"A_OPUS"));

        let state = recorder.state();
        assert!(!state.is_recording);
        assert!(state.has_recording);
    }

    #[test]
    fn test_start_errors() {
        let mixer = AudioMixer::new(1, RATE);
        let recorder = Recorder::new(mixer.clone(), DEFAULT_MAX_RECORDING);
        recorder.start().expect("start");
        assert!(matches!(
            recorder.start(),
            Err(RecorderError::AlreadyRecording)
        ));

        recorder.stop().expect("stop");
        assert!(matches!(
            recorder.start(),
            Err(RecorderError::RecordingNotCleared)
        ));

        recorder.clear();
        assert_eq!(
            recorder.state(),
            RecordingState {
                is_recording: false,
                elapsed_seconds: 0,
                has_recording: false,
            }
        );
        recorder.start().expect("start after clear");
    }

    #[test]
    fn test_auto_stop_at_limit() {
        let mixer = AudioMixer::new(1, RATE);
        let recorder = Recorder::new(mixer.clone(), Duration::from_secs(2));
        recorder.start().expect("start");
        advance(&mixer, 12_000);
        advance(&mixer, 12_000);
        advance(&mixer, 12_000);

        let state = recorder.state();
        assert!(!state.is_recording);
        assert!(state.has_recording);
        assert_eq!(state.elapsed_seconds, 2);
        assert_eq!(
            recorder.recording().expect("recording").duration,
            Duration::from_secs(2)
        );
        assert_eq!(recorder.stop().expect("stop"), None);
    }

    #[test]
    fn test_default_window_stops_at_five_minutes() {
        let mixer = AudioMixer::new(1, RATE);
        let recorder = Recorder::new(mixer.clone(), DEFAULT_MAX_RECORDING);
        recorder.start().expect("start");
        for _ in 0..10 {
            advance(&mixer, 248_000);
        }
        let state = recorder.state();
        assert!(!state.is_recording);
        assert_eq!(state.elapsed_seconds, 300);
        assert_eq!(
            recorder.recording().expect("recording").duration,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_stale_tap_does_not_write_into_new_session() {
        let mixer = AudioMixer::new(1, RATE);
        let recorder = Recorder::new(mixer.clone(), DEFAULT_MAX_RECORDING);
        recorder.start().expect("start");
        recorder.stop().expect("stop");
        recorder.clear();
        recorder.start().expect("start");
        // Both taps are attached on this render; only the second session's counts.
        advance(&mixer, 8000);
        assert_eq!(recorder.state().elapsed_seconds, 1);
        let recording = recorder.stop().expect("stop").expect("recording");
        assert_eq!(recording.duration, Duration::from_secs(1));
    }

    #[test]
    fn test_download_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mixer = AudioMixer::new(1, RATE);
        let recorder = Recorder::new(mixer.clone(), DEFAULT_MAX_RECORDING);

        assert!(matches!(
            recorder.download_recording(dir.path()),
            Err(RecorderError::NoActiveRecording)
        ));

        recorder.start().expect("start");
        advance(&mixer, 800);
        recorder.stop().expect("stop");

        let path = recorder.download_recording(dir.path()).expect("download");
        let name = path
            .file_name()
            .and_then(|f| f.to_str())
            .expect("file name");
        assert!(name.starts_with("beatpad-"));
        assert!(name.ends_with(".webm"));
        assert_eq!(name.len(), "beatpad-2026-01-01T00-00-00.webm".len());
        assert_eq!(&fs::read(&path).expect("read")[..4], &WEBM_MAGIC);
    }
}
