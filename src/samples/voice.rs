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

//! Voice management for polyphonic sample playback.
//!
//! Voices live in a fixed-capacity slot arena. A handle pairs a slot with the generation it was
//! issued for, so a handle to a retired or evicted voice never aliases a newer one.

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bank::SampleBank;
use super::SampleError;
use crate::audio::{db_to_gain, gain_to_db, AudioMixer, ScheduledSource};
use crate::playsync::CancelHandle;

/// Identifies one voice for as long as it is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoiceHandle {
    slot: usize,
    generation: u64,
}

/// Represents an active voice playing a sample.
#[derive(Clone, Debug)]
pub struct Voice {
    pub sound_id: String,
    pub volume_db: f32,
    /// Frame on the audio clock where playback starts.
    pub start_frame: u64,
    /// Frame on the audio clock where playback ends.
    pub end_frame: u64,
    /// Registration order. Lower is older.
    pub seq: u64,
    /// The audio source ID in the mixer.
    pub mixer_source_id: u64,
}

struct Slot {
    generation: u64,
    voice: Option<Voice>,
}

struct PoolState {
    slots: Vec<Slot>,
    next_seq: u64,
}

impl PoolState {
    /// Frees every slot whose voice ended at or before `now`, or whose source the mixer no
    /// longer holds because it was revoked or dropped.
    fn retire(&mut self, now: u64, mixer: &AudioMixer) {
        for slot in self.slots.iter_mut() {
            if slot
                .voice
                .as_ref()
                .is_some_and(|v| v.end_frame <= now || !mixer.has_source(v.mixer_source_id))
            {
                slot.voice = None;
            }
        }
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.voice.is_some()).count()
    }

    /// Drops the oldest voice by registration order and returns its slot. Its audio is left
    /// playing.
    fn evict_oldest(&mut self) -> (usize, Option<Voice>) {
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.voice.as_ref().map(|v| (index, v.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(index, _)| index)
            .unwrap_or(0);
        (index, self.slots[index].voice.take())
    }
}

/// Bounded set of concurrently sounding voices.
pub struct VoicePool {
    state: Mutex<PoolState>,
    bank: SampleBank,
    mixer: AudioMixer,
    max_polyphony: usize,
}

impl VoicePool {
    /// Creates a new voice pool. A polyphony of zero is raised to one.
    pub fn new(bank: SampleBank, mixer: AudioMixer, max_polyphony: usize) -> VoicePool {
        let max_polyphony = max_polyphony.max(1);
        VoicePool {
            state: Mutex::new(PoolState {
                slots: (0..max_polyphony)
                    .map(|_| Slot {
                        generation: 0,
                        voice: None,
                    })
                    .collect(),
                next_seq: 0,
            }),
            bank,
            mixer,
            max_polyphony,
        }
    }

    /// Plays a sound immediately.
    pub fn trigger(&self, sound_id: &str, volume: f32) -> Result<VoiceHandle, SampleError> {
        self.trigger_at(sound_id, volume, self.mixer.current_frame(), None)
    }

    /// Schedules a sound at an exact frame on the audio clock. A gate revokes the source if it
    /// is cancelled before playback starts.
    pub fn trigger_at(
        &self,
        sound_id: &str,
        volume: f32,
        frame: u64,
        gate: Option<CancelHandle>,
    ) -> Result<VoiceHandle, SampleError> {
        let sample = self.bank.playable(sound_id)?;
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        let volume_db = gain_to_db(volume);

        let mut state = self.state.lock();
        let now = self.mixer.current_frame();
        state.retire(now, &self.mixer);

        let start_frame = frame.max(now);
        let end_frame = start_frame + sample.frames() as u64;
        let mixer_source_id = self.mixer.add_source(ScheduledSource::new(
            sample,
            db_to_gain(volume_db),
            frame,
            gate,
        ))?;

        let slot_index = match state.slots.iter().position(|slot| slot.voice.is_none()) {
            Some(index) => index,
            None => {
                let (index, evicted) = state.evict_oldest();
                warn!(
                    max_polyphony = self.max_polyphony,
                    evicted = ?evicted.map(|v| v.sound_id),
                    "Voice limit reached, evicting oldest"
                );
                index
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let slot = &mut state.slots[slot_index];
        slot.generation += 1;
        slot.voice = Some(Voice {
            sound_id: sound_id.to_string(),
            volume_db,
            start_frame,
            end_frame,
            seq,
            mixer_source_id,
        });
        debug!(
            sound_id,
            volume_db,
            start_frame,
            end_frame,
            slot = slot_index,
            "Voice triggered"
        );

        Ok(VoiceHandle {
            slot: slot_index,
            generation: slot.generation,
        })
    }

    /// Returns true while the voice behind the handle is still registered.
    pub fn is_active(&self, handle: VoiceHandle) -> bool {
        let mut state = self.state.lock();
        state.retire(self.mixer.current_frame(), &self.mixer);
        state
            .slots
            .get(handle.slot)
            .is_some_and(|slot| slot.generation == handle.generation && slot.voice.is_some())
    }

    /// Number of registered voices.
    pub fn active_count(&self) -> usize {
        let mut state = self.state.lock();
        state.retire(self.mixer.current_frame(), &self.mixer);
        state.active_count()
    }

    /// Registered voices, oldest first.
    pub fn active_voices(&self) -> Vec<Voice> {
        let mut state = self.state.lock();
        state.retire(self.mixer.current_frame(), &self.mixer);
        let mut voices: Vec<Voice> = state
            .slots
            .iter()
            .filter_map(|slot| slot.voice.clone())
            .collect();
        voices.sort_by_key(|voice| voice.seq);
        voices
    }

    /// Empties the active set. Audio already scheduled is not touched.
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            slot.voice = None;
        }
    }

    pub fn max_polyphony(&self) -> usize {
        self.max_polyphony
    }
}
