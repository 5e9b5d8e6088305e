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

//! The sequencer controller: wires the transport, the pattern and the pads to the voice pool.
//!
//! Pattern and pad settings are read when each tick is dispatched, so edits made while running
//! are heard on the next pass. Every voice a run schedules is gated by that run's cancel handle;
//! stopping cancels the gate, which revokes voices scheduled inside the lookahead window that
//! have not started sounding yet. A faulted output ends the run from inside the dispatch.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pads::{PadSet, PAD_COUNT};
use crate::playsync::CancelHandle;
use crate::audio::MixerError;
use crate::samples::{SampleError, VoicePool};
use crate::transport::{Tick, Transport, STEPS_PER_BAR};

mod pattern;

pub use pattern::Pattern;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    #[error("step ({pad}, {step}) is outside the {pads}x{steps} grid", pads = PAD_COUNT, steps = STEPS_PER_BAR)]
    OutOfRange { pad: usize, step: usize },
}

/// Start/stop state machine driving the voice pool from the pattern.
pub struct Sequencer {
    transport: Transport,
    pattern: Arc<RwLock<Pattern>>,
    pads: Arc<RwLock<PadSet>>,
    gate: Arc<Mutex<CancelHandle>>,
    /// Serializes start and stop so a gate is only ever cancelled by the run that owns it.
    control: Mutex<()>,
}

impl Sequencer {
    /// Creates the sequencer and installs its step callback on the transport.
    pub fn new(transport: Transport, pads: Arc<RwLock<PadSet>>, pool: Arc<VoicePool>) -> Sequencer {
        let pattern = Arc::new(RwLock::new(Pattern::new()));
        let gate = Arc::new(Mutex::new(CancelHandle::new()));

        {
            let pattern = pattern.clone();
            let pads = pads.clone();
            let gate = gate.clone();
            transport.set_callback(Box::new(move |tick| {
                dispatch_step(tick, &pattern, &pads, &pool, &gate)
            }));
        }

        Sequencer {
            transport,
            pattern,
            pads,
            gate,
            control: Mutex::new(()),
        }
    }

    /// Starts playback. No-op while running.
    pub fn start(&self) -> bool {
        let _control = self.control.lock();
        self.start_locked()
    }

    /// Stops playback and revokes voices this run scheduled that have not started.
    pub fn stop(&self) -> bool {
        let _control = self.control.lock();
        self.stop_locked()
    }

    /// Starts if stopped, stops if running. Returns true if now playing.
    pub fn toggle(&self) -> bool {
        let _control = self.control.lock();
        if self.transport.is_running() {
            self.stop_locked();
            false
        } else {
            self.start_locked()
        }
    }

    fn start_locked(&self) -> bool {
        if self.transport.is_running() {
            return false;
        }
        *self.gate.lock() = CancelHandle::new();
        self.transport.start()
    }

    fn stop_locked(&self) -> bool {
        let stopped = self.transport.stop();
        self.gate.lock().cancel();
        stopped
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_running()
    }

    pub fn current_step(&self) -> i32 {
        self.transport.current_step()
    }

    pub fn set_bpm(&self, bpm: f64) -> f64 {
        self.transport.set_bpm(bpm)
    }

    pub fn bpm(&self) -> f64 {
        self.transport.bpm()
    }

    /// Flips one step. Valid whether or not the sequencer is running.
    pub fn toggle_step(&self, pad: usize, step: usize) -> Result<bool, SequencerError> {
        self.pattern
            .write()
            .toggle(pad, step)
            .ok_or(SequencerError::OutOfRange { pad, step })
    }

    pub fn clear_pattern(&self) {
        self.pattern.write().clear();
    }

    /// A copy of the current pattern.
    pub fn pattern(&self) -> Pattern {
        *self.pattern.read()
    }

    pub fn set_pattern(&self, pattern: Pattern) {
        *self.pattern.write() = pattern;
    }

    pub fn pads(&self) -> Arc<RwLock<PadSet>> {
        self.pads.clone()
    }
}

/// Triggers every armed pad for one tick, pad index ascending, all at the tick's frame. Breaks
/// when the output has faulted, which stops the transport.
fn dispatch_step(
    tick: Tick,
    pattern: &RwLock<Pattern>,
    pads: &RwLock<PadSet>,
    pool: &VoicePool,
    gate: &Mutex<CancelHandle>,
) -> ControlFlow<()> {
    let gate = gate.lock().clone();
    let pattern = *pattern.read();
    let pads = pads.read();

    for index in pattern.armed_pads(tick.step) {
        let Some(pad) = pads.get(index) else {
            continue;
        };
        let Some(sound_id) = pad.sound_id.as_deref() else {
            continue;
        };

        match pool.trigger_at(sound_id, pad.volume, tick.frame, Some(gate.clone())) {
            Ok(_) => {}
            Err(e @ SampleError::NotReady(_)) => {
                debug!(pad = index, step = tick.step, err = %e, "Skipping step")
            }
            Err(SampleError::Mixer(MixerError::Faulted(fault))) => {
                warn!(step = tick.step, fault = %fault, "Output faulted, stopping sequencer");
                gate.cancel();
                return ControlFlow::Break(());
            }
            Err(e) => warn!(pad = index, step = tick.step, err = %e, "Unable to trigger pad"),
        }
    }
    ControlFlow::Continue(())
}
