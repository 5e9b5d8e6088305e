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
use serde::Deserialize;

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_SAMPLE_RATE: u32 = 48000;
const DEFAULT_CHANNELS: u16 = 2;

/// How to choose the CPAL stream buffer size (period size). Affects latency vs underrun tolerance.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(try_from = "RawStreamBufferSize")]
pub enum StreamBufferSize {
    /// Use the backend's default (may be high latency on some systems).
    Default,
    /// Use the device's minimum supported period size (lowest latency, most jitter-sensitive).
    Min,
    /// Use a fixed size in frames.
    Fixed(u32),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStreamBufferSize {
    Frames(u32),
    Name(String),
}

impl TryFrom<RawStreamBufferSize> for StreamBufferSize {
    type Error = String;

    fn try_from(raw: RawStreamBufferSize) -> Result<Self, Self::Error> {
        match raw {
            RawStreamBufferSize::Frames(frames) => Ok(StreamBufferSize::Fixed(frames)),
            RawStreamBufferSize::Name(name) => match name.to_lowercase().as_str() {
                "default" => Ok(StreamBufferSize::Default),
                "min" => Ok(StreamBufferSize::Min),
                other => other.parse().map(StreamBufferSize::Fixed).map_err(|_| {
                    format!(
                        "invalid stream buffer size {}: expected default, min or a frame count",
                        other
                    )
                }),
            },
        }
    }
}

/// A YAML representation of the audio output configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Audio {
    /// The output device. Names starting with "mock" select a device that discards audio.
    device: String,

    /// Mixer sample rate in Hz (default: 48000). Sounds are transcoded to this rate on load.
    sample_rate: Option<u32>,

    /// Output channel count (default: 2).
    channels: Option<u16>,

    /// CPAL stream buffer: "default" (backend default), "min" (lowest latency), or a number (frames).
    stream_buffer_size: Option<StreamBufferSize>,
}

impl Default for Audio {
    fn default() -> Self {
        Audio::new(DEFAULT_DEVICE)
    }
}

impl Audio {
    /// New will create a new Audio configuration.
    pub fn new(device: &str) -> Audio {
        Audio {
            device: device.to_string(),
            sample_rate: None,
            channels: None,
            stream_buffer_size: None,
        }
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the mixer sample rate (default: 48000).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE).max(1)
    }

    /// Returns the output channel count (default: 2).
    pub fn channels(&self) -> u16 {
        self.channels.unwrap_or(DEFAULT_CHANNELS).max(1)
    }

    /// Returns the stream buffer size choice for CPAL. None uses the backend default.
    pub fn stream_buffer_size(&self) -> Option<StreamBufferSize> {
        self.stream_buffer_size.clone()
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    fn parse(yaml: &str) -> Audio {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize")
    }

    #[test]
    fn test_defaults() {
        let audio = parse("device: mock-output");
        assert_eq!(audio.device(), "mock-output");
        assert_eq!(audio.sample_rate(), 48000);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.stream_buffer_size(), None);
    }

    #[test]
    fn test_stream_buffer_size() {
        let audio = parse("device: hw\nsample_rate: 44100\nchannels: 1\nstream_buffer_size: min");
        assert_eq!(audio.sample_rate(), 44100);
        assert_eq!(audio.channels(), 1);
        assert_eq!(audio.stream_buffer_size(), Some(StreamBufferSize::Min));

        let audio = parse("device: hw\nstream_buffer_size: 256");
        assert_eq!(audio.stream_buffer_size(), Some(StreamBufferSize::Fixed(256)));

        let audio = parse("device: hw\nstream_buffer_size: default");
        assert_eq!(audio.stream_buffer_size(), Some(StreamBufferSize::Default));
    }
}
