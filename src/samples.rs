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

//! Sample playback.
//!
//! This module provides:
//! - Decoding sounds into memory (zero-latency playback once loaded)
//! - The sample bank tracking per-sound load state
//! - The polyphony-limited voice pool that schedules playback on the mixer

use thiserror::Error;

use crate::audio::MixerError;

mod bank;
mod loader;
mod voice;

pub use bank::{LoadError, LoadState, LoadSummary, SampleBank, SampleBuffer};
pub(crate) use loader::transcode_samples;
pub use loader::{Decoder, FileDecoder, LoadedSample};
pub use voice::{Voice, VoiceHandle, VoicePool};

/// Errors raised while loading or triggering sounds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("sound {0} is not in the sample bank")]
    SoundNotFound(String),
    #[error("sound {0} has not finished loading")]
    NotReady(String),
    #[error("failed to decode {locator}: {message}")]
    DecodeFailed { locator: String, message: String },
    #[error("unable to start decoder pool: {0}")]
    DecoderPool(String),
    #[error(transparent)]
    Mixer(#[from] MixerError),
}
