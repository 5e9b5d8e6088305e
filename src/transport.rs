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

//! The transport clock.
//!
//! A tempo-driven timeline subdivided into sixteenth notes. Ticks are scheduled ahead of the
//! audio clock: every poll dispatches each tick whose frame falls inside the lookahead window,
//! and the step callback receives the exact frame the step should sound at. A scheduler thread
//! polls on a fixed interval while the transport runs.
//!
//! The state lock is held while a batch of ticks is dispatched, so `stop` cannot interleave
//! with a dispatch. Step callbacks must not call back into the transport; a callback that
//! returns `ControlFlow::Break` halts the run instead.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level};

use crate::audio::thread_priority::{configure_thread_priority, scheduler_thread_priority};
use crate::audio::AudioMixer;
use crate::playsync::CancelHandle;

pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 200.0;
pub const DEFAULT_BPM: f64 = 120.0;

/// Sixteenth notes per bar. One pattern is one bar.
pub const STEPS_PER_BAR: usize = 16;

/// A step the transport dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    /// Step within the bar, 0..16.
    pub step: usize,
    /// Frame on the audio clock the step sounds at.
    pub frame: u64,
    /// The run this tick belongs to.
    pub session: u64,
}

/// Receives every dispatched tick. Breaking stops the transport.
pub type StepCallback = Box<dyn FnMut(Tick) -> ControlFlow<()> + Send>;

/// Scheduler timing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    /// How often the scheduler thread polls.
    pub interval: Duration,
    /// How far ahead of the audio clock ticks are dispatched.
    pub lookahead: Duration,
    /// Gap between `start` and the first tick.
    pub start_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            interval: Duration::from_millis(25),
            lookahead: Duration::from_millis(100),
            start_delay: Duration::from_millis(50),
        }
    }
}

/// Clamps a tempo into the supported range. NaN falls back to the default.
pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_nan() {
        DEFAULT_BPM
    } else {
        bpm.clamp(MIN_BPM, MAX_BPM)
    }
}

struct TransportState {
    bpm: f64,
    running: bool,
    /// Last dispatched step, -1 while stopped.
    current_step: i32,
    next_step: usize,
    /// Frame of the last dispatched tick, None before the first tick of a run.
    last_tick_frame: Option<f64>,
    next_tick_frame: f64,
    session: u64,
    callback: Option<StepCallback>,
    scheduler: Option<(CancelHandle, thread::JoinHandle<()>)>,
}

/// The transport clock. Cloning shares the same transport.
#[derive(Clone)]
pub struct Transport {
    state: Arc<Mutex<TransportState>>,
    mixer: AudioMixer,
    timing: Timing,
}

impl Transport {
    pub fn new(mixer: AudioMixer, timing: Timing) -> Transport {
        Transport {
            state: Arc::new(Mutex::new(TransportState {
                bpm: DEFAULT_BPM,
                running: false,
                current_step: -1,
                next_step: 0,
                last_tick_frame: None,
                next_tick_frame: 0.0,
                session: 0,
                callback: None,
                scheduler: None,
            })),
            mixer,
            timing,
        }
    }

    /// Registers the step callback, replacing any previous one.
    pub fn set_callback(&self, callback: StepCallback) {
        self.state.lock().callback = Some(callback);
    }

    /// Frames between two sixteenth notes at the given tempo.
    pub fn frames_per_step(&self, bpm: f64) -> f64 {
        self.mixer.sample_rate() as f64 * 60.0 / bpm / 4.0
    }

    /// Starts the transport. Returns false if it was already running, or if the step callback
    /// halted the run on its first tick.
    ///
    /// The first tick is scheduled `start_delay` after the current audio-clock frame and
    /// dispatched before this returns if it falls inside the lookahead window.
    pub fn start(&self) -> bool {
        let span = span!(Level::INFO, "transport start");
        let _enter = span.enter();

        let mut state = self.state.lock();
        if state.running {
            return false;
        }

        state.session += 1;
        state.running = true;
        state.current_step = -1;
        state.next_step = 0;
        state.last_tick_frame = None;
        state.next_tick_frame =
            self.mixer.current_frame() as f64 + self.mixer.frames_for(self.timing.start_delay) as f64;
        info!(session = state.session, bpm = state.bpm, "Transport started");

        self.dispatch_due(&mut state);
        if !state.running {
            // The first tick halted the run.
            return false;
        }

        let cancel_handle = CancelHandle::new();
        let transport = self.clone();
        let scheduler_cancel = cancel_handle.clone();
        let interval = self.timing.interval;
        match thread::Builder::new()
            .name("transport-scheduler".to_string())
            .spawn(move || transport.scheduler_loop(scheduler_cancel, interval))
        {
            Ok(join_handle) => state.scheduler = Some((cancel_handle, join_handle)),
            Err(e) => warn!(err = %e, "Unable to spawn transport scheduler; ticks need polling"),
        }
        true
    }

    /// Stops the transport. No callback runs after this returns and `current_step` is -1.
    /// Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let scheduler = {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            state.running = false;
            state.current_step = -1;
            state.last_tick_frame = None;
            info!(session = state.session, "Transport stopped");
            state.scheduler.take()
        };

        if let Some((cancel_handle, join_handle)) = scheduler {
            cancel_handle.cancel();
            if join_handle.join().is_err() {
                warn!("Transport scheduler panicked");
            }
        }
        true
    }

    /// Dispatches every tick due inside the lookahead window. Returns the number dispatched.
    pub fn poll(&self) -> usize {
        let mut state = self.state.lock();
        self.dispatch_due(&mut state)
    }

    fn dispatch_due(&self, state: &mut TransportState) -> usize {
        if !state.running {
            return 0;
        }

        let horizon =
            self.mixer.current_frame() as f64 + self.mixer.frames_for(self.timing.lookahead) as f64;
        let mut dispatched = 0;
        while state.next_tick_frame < horizon {
            let tick = Tick {
                step: state.next_step,
                frame: state.next_tick_frame.round() as u64,
                session: state.session,
            };
            state.current_step = tick.step as i32;
            if let Some(callback) = state.callback.as_mut() {
                if callback(tick).is_break() {
                    self.halt(state);
                    return dispatched;
                }
            }

            state.last_tick_frame = Some(state.next_tick_frame);
            state.next_step = (state.next_step + 1) % STEPS_PER_BAR;
            state.next_tick_frame += self.frames_per_step(state.bpm);
            dispatched += 1;
        }
        dispatched
    }

    /// Stops from inside a dispatch. The scheduler thread may be the caller, so it is signalled
    /// and left to exit on its own.
    fn halt(&self, state: &mut TransportState) {
        state.running = false;
        state.current_step = -1;
        state.last_tick_frame = None;
        warn!(session = state.session, "Transport halted by step callback");
        if let Some((cancel_handle, _)) = state.scheduler.take() {
            cancel_handle.cancel();
        }
    }

    fn scheduler_loop(&self, cancel_handle: CancelHandle, interval: Duration) {
        let span = span!(Level::DEBUG, "transport scheduler");
        let _enter = span.enter();

        let mut priority_set = false;
        configure_thread_priority(
            "transport-scheduler",
            scheduler_thread_priority(),
            false,
            &mut priority_set,
        );

        while !cancel_handle.wait_timeout(interval) {
            self.poll();
        }
        debug!("Transport scheduler exited");
    }

    /// Sets the tempo, clamped to 60..=200. While running, the new tempo applies from the
    /// interval leading to the next undispatched tick; the step position is unchanged.
    pub fn set_bpm(&self, bpm: f64) -> f64 {
        let bpm = clamp_bpm(bpm);
        let mut state = self.state.lock();
        state.bpm = bpm;
        if state.running {
            if let Some(last) = state.last_tick_frame {
                state.next_tick_frame = last + self.frames_per_step(bpm);
            }
        }
        debug!(bpm, "Tempo set");
        bpm
    }

    pub fn bpm(&self) -> f64 {
        self.state.lock().bpm
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// The last dispatched step, or -1 while stopped.
    pub fn current_step(&self) -> i32 {
        self.state.lock().current_step
    }

    /// The current run number. Increments on every start.
    pub fn session(&self) -> u64 {
        self.state.lock().session
    }

    /// Looping is always on: one pattern is one bar and the bar repeats.
    pub fn loop_enabled(&self) -> bool {
        true
    }
}
