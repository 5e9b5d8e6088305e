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
    error::Error,
    fmt, thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, span, Level};

use crate::audio::{AudioMixer, OutputHandle};
use crate::playsync::CancelHandle;

/// Frames rendered per block.
const BLOCK_FRAMES: usize = 256;

/// A mock device. Renders the mixer in real time and throws the audio away.
#[derive(Clone)]
pub struct Device {
    name: String,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
        }
    }
}

impl crate::audio::Device for Device {
    fn open(&self, mixer: AudioMixer) -> Result<OutputHandle, Box<dyn Error>> {
        info!(
            device = self.name,
            channels = mixer.num_channels(),
            sample_rate = mixer.sample_rate(),
            "Opening mock output."
        );

        let cancel_handle = CancelHandle::new();
        let join_handle = {
            let cancel_handle = cancel_handle.clone();
            let name = self.name.clone();
            thread::Builder::new()
                .name("mock-output".to_string())
                .spawn(move || render_loop(name, mixer, cancel_handle))?
        };

        Ok(OutputHandle::new(cancel_handle, join_handle))
    }
}

fn render_loop(name: String, mixer: AudioMixer, cancel_handle: CancelHandle) {
    let span = span!(Level::INFO, "mock output", device = name);
    let _enter = span.enter();

    let mut block = vec![0.0f32; BLOCK_FRAMES * mixer.num_channels() as usize];
    let block_duration =
        Duration::from_secs_f64(BLOCK_FRAMES as f64 / mixer.sample_rate().max(1) as f64);
    let mut deadline = Instant::now();

    while !cancel_handle.is_cancelled() {
        mixer.render(&mut block);
        deadline += block_duration;
        let now = Instant::now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        } else {
            // Fell behind; resync rather than render a burst.
            deadline = now;
        }
    }

    debug!(frames = mixer.current_frame(), "Mock output stopped");
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name,)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::Device as _;
    use crate::testutil::eventually;

    #[test]
    fn test_mock_advances_clock_until_stopped() {
        let mixer = AudioMixer::new(2, 48000);
        let output = Device::get("mock").open(mixer.clone()).expect("open");

        eventually(
            || mixer.current_frame() >= 4800,
            "mock output never advanced the clock",
        );

        output.stop();
        let stopped_at = mixer.current_frame();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(mixer.current_frame(), stopped_at);
    }
}
