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

use std::{
    collections::HashMap,
    error::Error,
    fs::File,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::catalog::{Catalog, Category, Sound};
use crate::samples::{Decoder, LoadedSample, SampleError};

/// Wait for the given predicate to return true or fail.
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let mut tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(5);
    let max_tick = Duration::from_millis(50);

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, max_tick);
    }
}

/// Writes a 32-bit float WAV file. `samples` holds one vector per channel.
pub fn write_wav(
    path: PathBuf,
    samples: Vec<Vec<f32>>,
    sample_rate: u32,
) -> Result<(), Box<dyn Error>> {
    let num_channels = samples.len();
    assert!(num_channels > 0, "At least one channel is required");
    assert!(num_channels <= u16::MAX.into(), "Too many channels!");

    let mut writer = WavWriter::new(
        File::create(path)?,
        WavSpec {
            channels: num_channels as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )?;

    let frames = samples.iter().map(|channel| channel.len()).max().unwrap_or(0);
    for frame in 0..frames {
        for channel in samples.iter() {
            writer.write_sample(channel.get(frame).copied().unwrap_or(0.0))?;
        }
    }
    writer.finalize()?;

    Ok(())
}

/// How a fake decoder answers for one locator.
#[derive(Clone)]
enum FakeSound {
    Ok(LoadedSample),
    Fail(String),
}

/// A decoder serving canned results, optionally after a delay.
#[derive(Clone, Default)]
pub struct FakeDecoder {
    sounds: HashMap<String, FakeSound>,
    delays: HashMap<String, Duration>,
}

impl FakeDecoder {
    pub fn new() -> FakeDecoder {
        FakeDecoder::default()
    }

    /// Serves a mono buffer of `frames` frames at 0.5 amplitude.
    pub fn with_sound(mut self, locator: &str, frames: usize, sample_rate: u32) -> FakeDecoder {
        self.sounds.insert(
            locator.to_string(),
            FakeSound::Ok(LoadedSample::new(vec![0.5; frames], 1, sample_rate)),
        );
        self
    }

    pub fn with_failure(mut self, locator: &str, message: &str) -> FakeDecoder {
        self.sounds
            .insert(locator.to_string(), FakeSound::Fail(message.to_string()));
        self
    }

    pub fn with_delay(mut self, locator: &str, delay: Duration) -> FakeDecoder {
        self.delays.insert(locator.to_string(), delay);
        self
    }
}

impl Decoder for FakeDecoder {
    fn decode(&self, locator: &str) -> Result<LoadedSample, SampleError> {
        if let Some(delay) = self.delays.get(locator) {
            thread::sleep(*delay);
        }
        match self.sounds.get(locator) {
            Some(FakeSound::Ok(sample)) => Ok(sample.clone()),
            Some(FakeSound::Fail(message)) => Err(SampleError::DecodeFailed {
                locator: locator.to_string(),
                message: message.clone(),
            }),
            None => Err(SampleError::DecodeFailed {
                locator: locator.to_string(),
                message: "no such file".to_string(),
            }),
        }
    }
}

/// A catalog sound whose locator equals its id.
pub fn sound(id: &str) -> Sound {
    Sound::new(id, id, id, Category::Drum)
}

/// A catalog of sounds whose locators equal their ids.
pub fn catalog(ids: &[&str]) -> Catalog {
    Catalog::new(ids.iter().map(|id| sound(id)).collect())
}
