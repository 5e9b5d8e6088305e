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
// Master bus mixing logic shared by the cpal and mock outputs.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::playsync::CancelHandle;
use crate::samples::LoadedSample;

/// The most sources the mixer will hold at once. Past this, the oldest source is dropped.
pub const MAX_SOURCES: usize = 256;

/// Errors raised when scheduling onto the master bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixerError {
    #[error("output is faulted: {0}")]
    Faulted(String),
}

/// Receives every block the mixer renders, after master volume.
pub trait OutputTap: Send {
    /// Called with one interleaved block. Returning false detaches the tap.
    fn on_block(&mut self, block: &[f32], channels: u16) -> bool;
}

/// A sample scheduled to start at an exact frame on the audio clock.
pub struct ScheduledSource {
    sample: LoadedSample,
    gain: f32,
    start_at_frame: u64,
    gate: Option<CancelHandle>,
}

impl ScheduledSource {
    pub fn new(
        sample: LoadedSample,
        gain: f32,
        start_at_frame: u64,
        gate: Option<CancelHandle>,
    ) -> ScheduledSource {
        ScheduledSource {
            sample,
            gain,
            start_at_frame,
            gate,
        }
    }
}

/// A source held by the mixer.
struct ActiveSource {
    id: u64,
    source: ScheduledSource,
    /// Next frame of the sample to read. Zero until the source has started.
    position: usize,
}

impl ActiveSource {
    /// A gated source is revoked only if it has not produced any audio yet.
    fn revoked(&self) -> bool {
        self.position == 0
            && self
                .source
                .gate
                .as_ref()
                .is_some_and(|gate| gate.is_cancelled())
    }
}

/// The master bus. Cloning shares the same bus.
///
/// The mixer owns the audio clock: a frame counter advanced by every rendered block. Anything
/// that schedules audio reads the clock here so scheduling and playback agree on time.
#[derive(Clone)]
pub struct AudioMixer {
    /// Sources waiting to start or currently playing.
    sources: Arc<Mutex<Vec<ActiveSource>>>,
    /// Attached taps.
    taps: Arc<Mutex<Vec<Box<dyn OutputTap>>>>,
    /// New taps are handed over through a channel so attaching never contends with a render.
    tap_tx: crossbeam_channel::Sender<Box<dyn OutputTap>>,
    tap_rx: crossbeam_channel::Receiver<Box<dyn OutputTap>>,
    /// Frames rendered so far.
    frame: Arc<AtomicU64>,
    /// Master gain, stored as f32 bits.
    master_gain: Arc<AtomicU32>,
    next_source_id: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<String>>>,
    num_channels: u16,
    sample_rate: u32,
}

impl AudioMixer {
    /// Creates a new mixer with a silent bus and the clock at frame zero.
    pub fn new(num_channels: u16, sample_rate: u32) -> Self {
        let (tap_tx, tap_rx) = crossbeam_channel::unbounded();
        Self {
            sources: Arc::new(Mutex::new(Vec::new())),
            taps: Arc::new(Mutex::new(Vec::new())),
            tap_tx,
            tap_rx,
            frame: Arc::new(AtomicU64::new(0)),
            master_gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            next_source_id: Arc::new(AtomicU64::new(1)),
            fault: Arc::new(Mutex::new(None)),
            num_channels: num_channels.max(1),
            sample_rate,
        }
    }

    /// Schedules a source. Returns the id the mixer assigned to it. At capacity the oldest
    /// playing source is dropped to make room, or the oldest pending one if none has started.
    pub fn add_source(&self, source: ScheduledSource) -> Result<u64, MixerError> {
        if let Some(fault) = self.fault() {
            return Err(MixerError::Faulted(fault));
        }

        let mut sources = self.sources.lock();
        if sources.len() >= MAX_SOURCES {
            let oldest = sources
                .iter()
                .enumerate()
                .filter(|(_, active)| active.position > 0)
                .min_by_key(|(_, active)| active.id)
                .or_else(|| sources.iter().enumerate().min_by_key(|(_, active)| active.id))
                .map(|(index, active)| (index, active.id));
            if let Some((index, id)) = oldest {
                sources.remove(index);
                debug!(dropped = id, max_sources = MAX_SOURCES, "Mixer full, dropping oldest source");
            }
        }

        let id = self.next_source_id.fetch_add(1, Ordering::Relaxed);
        sources.push(ActiveSource {
            id,
            source,
            position: 0,
        });
        Ok(id)
    }

    /// Drops every source, playing or pending.
    pub fn clear_sources(&self) {
        self.sources.lock().clear();
    }

    /// The number of sources currently held.
    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Returns true if the source with the given id is still held and has not been revoked.
    pub fn has_source(&self, id: u64) -> bool {
        self.sources
            .lock()
            .iter()
            .any(|source| source.id == id && !source.revoked())
    }

    /// Attaches a tap. It receives blocks starting with the next render.
    pub fn add_tap(&self, tap: Box<dyn OutputTap>) {
        if self.tap_tx.send(tap).is_err() {
            warn!("Unable to attach output tap");
        }
    }

    /// Renders one interleaved block into `output`, advancing the audio clock.
    pub fn render(&self, output: &mut [f32]) {
        let channels = self.num_channels as usize;
        let num_frames = output.len() / channels;
        let output = &mut output[..num_frames * channels];
        output.fill(0.0);

        let block_start = self.frame.load(Ordering::Acquire);

        {
            let mut sources = self.sources.lock();
            sources.retain_mut(|active| {
                if active.revoked() {
                    return false;
                }

                let offset = active.source.start_at_frame.saturating_sub(block_start);
                if offset >= num_frames as u64 {
                    return true;
                }

                let sample = &active.source.sample;
                let source_channels = sample.channel_count().max(1) as usize;
                let source_frames = sample.frames();
                let data = sample.data();
                let gain = active.source.gain;

                for frame in output.chunks_exact_mut(channels).skip(offset as usize) {
                    if active.position >= source_frames {
                        break;
                    }
                    let base = active.position * source_channels;
                    // Mono fans out to every channel; wider sources map channel for channel and
                    // repeat their last channel on any extra outputs.
                    for (channel, out) in frame.iter_mut().enumerate() {
                        let source_channel = channel.min(source_channels - 1);
                        *out += data[base + source_channel] * gain;
                    }
                    active.position += 1;
                }

                active.position < source_frames
            });
        }

        let master = self.master_volume();
        if master != 1.0 {
            output.iter_mut().for_each(|sample| *sample *= master);
        }

        self.frame
            .fetch_add(num_frames as u64, Ordering::AcqRel);

        let mut taps = self.taps.lock();
        while let Ok(tap) = self.tap_rx.try_recv() {
            taps.push(tap);
        }
        taps.retain_mut(|tap| tap.on_block(output, self.num_channels));
    }

    /// The current audio clock position, in frames.
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Converts a duration to a frame count at the mixer's sample rate.
    pub fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }

    /// Sets the master volume, clamped to 0.0..=1.0.
    pub fn set_master_volume(&self, volume: f32) {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.master_gain.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }

    /// Puts the mixer into the fault state. The first fault is kept.
    pub fn report_fault(&self, message: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            error!(fault = message.as_str(), "Audio output faulted");
            *fault = Some(message);
        }
    }

    /// Returns the fault, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Clears the fault state and drops every source.
    pub fn reset(&self) {
        self.clear_sources();
        *self.fault.lock() = None;
    }

    /// Gets the number of output channels
    pub fn num_channels(&self) -> u16 {
        self.num_channels
    }

    /// Gets the sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
