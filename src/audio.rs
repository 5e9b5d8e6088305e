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
use std::{error::Error, fmt, sync::Arc, thread};

use tracing::{debug, error};

use crate::config;
use crate::playsync::CancelHandle;

pub mod cpal;
pub mod mixer;
pub mod mock;
pub mod thread_priority;

pub use mixer::{AudioMixer, MixerError, OutputTap, ScheduledSource, MAX_SOURCES};

/// An output device pulls rendered blocks from the master mixer.
pub trait Device: fmt::Display + Send + Sync {
    /// Opens the device and starts pulling audio from the mixer. The returned handle keeps the
    /// output running until it is stopped or dropped.
    fn open(&self, mixer: AudioMixer) -> Result<OutputHandle, Box<dyn Error>>;
}

/// Keeps an open output alive. Dropping it closes the output.
pub struct OutputHandle {
    cancel_handle: CancelHandle,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl OutputHandle {
    pub(crate) fn new(
        cancel_handle: CancelHandle,
        join_handle: thread::JoinHandle<()>,
    ) -> OutputHandle {
        OutputHandle {
            cancel_handle,
            join_handle: Some(join_handle),
        }
    }

    /// Stops the output and waits for its thread to exit.
    pub fn stop(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.cancel_handle.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("Output thread panicked");
            } else {
                debug!("Output closed");
            }
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, Box<dyn Error>> {
    cpal::Device::list()
}

/// Gets a device with the given name. Names starting with "mock" get a mock device.
pub fn get_device(config: &config::Audio) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device)));
    };

    Ok(Arc::new(cpal::Device::get(config)?))
}

/// Converts a linear volume to decibels. Silence maps to negative infinity.
pub fn gain_to_db(volume: f32) -> f32 {
    if volume <= 0.0 || volume.is_nan() {
        f32::NEG_INFINITY
    } else {
        20.0 * volume.log10()
    }
}

/// Converts decibels back to a linear gain.
pub fn db_to_gain(db: f32) -> f32 {
    if db == f32::NEG_INFINITY {
        0.0
    } else {
        10.0f32.powf(db / 20.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gain_conversion() {
        assert_eq!(gain_to_db(1.0), 0.0);
        assert_eq!(gain_to_db(0.0), f32::NEG_INFINITY);
        assert!((gain_to_db(0.5) - (-6.0206)).abs() < 0.001);
        assert_eq!(db_to_gain(f32::NEG_INFINITY), 0.0);

        for volume in [0.1f32, 0.25, 0.8, 1.0] {
            assert!((db_to_gain(gain_to_db(volume)) - volume).abs() < 1e-5);
        }
    }

    #[test]
    fn test_get_mock_device() {
        let device = get_device(&config::Audio::new("mock-output")).expect("mock device");
        assert_eq!(device.to_string(), "mock-output (Mock)");
    }
}
