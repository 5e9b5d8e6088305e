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

//! The sample bank: one decoded buffer and load state per known sound.
//!
//! Loading fans out over a rayon pool. Each job reports back over a channel; results are
//! applied whenever the bank is queried, so nothing needs to drive the bank between calls.
//! A batch finishes when every sound is terminal, or when the grace period passes and the
//! bank force-finalizes whatever is left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level};

use super::loader::{Decoder, LoadedSample};
use super::SampleError;
use crate::catalog::Sound;

/// Message recorded for sounds still pending when the bank force-finalizes.
const TIMED_OUT: &str = "timed out";

/// How long a batch may take before the bank force-finalizes it.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Per-sound load state.
#[derive(Clone, Debug, PartialEq)]
pub enum LoadState {
    Pending,
    Ready,
    Failed(String),
}

impl LoadState {
    fn is_terminal(&self) -> bool {
        !matches!(self, LoadState::Pending)
    }
}

/// A sound that failed to load.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadError {
    pub sound_id: String,
    pub name: String,
    pub error: String,
}

/// Outcome of waiting for a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
    /// True if the batch was force-finalized at the grace deadline.
    pub timed_out: bool,
}

/// Snapshot of one sound's entry in the bank.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    pub sound_id: String,
    pub load_state: LoadState,
    /// Present once the sound is ready.
    pub sample: Option<LoadedSample>,
}

impl SampleBuffer {
    pub fn duration(&self) -> Duration {
        self.sample
            .as_ref()
            .map(|sample| sample.duration())
            .unwrap_or(Duration::ZERO)
    }
}

/// A finished decode job.
struct Completion {
    batch: u64,
    sound_id: String,
    result: Result<LoadedSample, SampleError>,
}

struct Entry {
    name: String,
    state: LoadState,
    sample: Option<LoadedSample>,
}

#[derive(Default)]
struct BankState {
    entries: HashMap<String, Entry>,
    /// Increments on every load and teardown; results from older batches are dropped.
    batch: u64,
    total: usize,
    terminal: usize,
    finalized: bool,
    timed_out: bool,
    /// When the current batch is force-finalized if still unfinished.
    deadline: Option<Instant>,
    errors: Vec<LoadError>,
}

impl BankState {
    fn apply(&mut self, completion: Completion) {
        if completion.batch != self.batch || self.finalized {
            debug!(
                sound_id = completion.sound_id,
                "Discarding late decode result"
            );
            return;
        }
        let Some(entry) = self.entries.get_mut(&completion.sound_id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }

        match completion.result {
            Ok(sample) => {
                entry.state = LoadState::Ready;
                entry.sample = Some(sample);
            }
            Err(e) => {
                warn!(
                    sound_id = completion.sound_id,
                    name = entry.name,
                    err = %e,
                    "Failed to load sound"
                );
                entry.state = LoadState::Failed(e.to_string());
                self.errors.push(LoadError {
                    sound_id: completion.sound_id.clone(),
                    name: entry.name.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.terminal += 1;
        if self.terminal == self.total {
            self.finalize(false);
        }
    }

    fn finalize(&mut self, timed_out: bool) {
        if self.finalized {
            return;
        }
        if timed_out {
            let mut expired: Vec<(&String, &mut Entry)> = self
                .entries
                .iter_mut()
                .filter(|(_, entry)| !entry.state.is_terminal())
                .collect();
            expired.sort_by(|a, b| a.0.cmp(b.0));
            for (sound_id, entry) in expired {
                entry.state = LoadState::Failed(TIMED_OUT.to_string());
                self.errors.push(LoadError {
                    sound_id: sound_id.clone(),
                    name: entry.name.clone(),
                    error: TIMED_OUT.to_string(),
                });
                self.terminal += 1;
            }
        }
        self.finalized = true;
        self.timed_out = timed_out;

        let (loaded, failed) = self.counts();
        info!(loaded, failed, timed_out, "Sample loading finished");
    }

    /// Force-finalizes the batch if its deadline has passed.
    fn expire(&mut self, now: Instant) {
        if self.finalized || !self.deadline.is_some_and(|deadline| now >= deadline) {
            return;
        }
        warn!(
            pending = self.total - self.terminal,
            "Sample loading timed out"
        );
        self.finalize(true);
    }

    fn counts(&self) -> (usize, usize) {
        let loaded = self
            .entries
            .values()
            .filter(|entry| entry.state == LoadState::Ready)
            .count();
        let failed = self
            .entries
            .values()
            .filter(|entry| matches!(entry.state, LoadState::Failed(_)))
            .count();
        (loaded, failed)
    }

    fn summary(&self) -> LoadSummary {
        let (loaded, failed) = self.counts();
        LoadSummary {
            loaded,
            failed,
            timed_out: self.timed_out,
        }
    }
}

/// Sound id to decoded buffer. Cloning shares the same bank.
#[derive(Clone)]
pub struct SampleBank {
    state: Arc<Mutex<BankState>>,
    decoder: Arc<dyn Decoder>,
    pool: Arc<rayon::ThreadPool>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    grace: Duration,
}

impl SampleBank {
    /// Creates an empty bank that decodes with the given decoder.
    pub fn new(decoder: Arc<dyn Decoder>) -> Result<SampleBank, SampleError> {
        let threads = num_cpus::get().clamp(1, 8);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sample-decode-{}", i))
            .build()
            .map_err(|e| SampleError::DecoderPool(e.to_string()))?;
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();

        Ok(SampleBank {
            state: Arc::new(Mutex::new(BankState::default())),
            decoder,
            pool: Arc::new(pool),
            completion_tx,
            completion_rx,
            grace: DEFAULT_GRACE_PERIOD,
        })
    }

    /// Sets how long each batch may take before pending sounds are marked timed out.
    pub fn with_grace_period(mut self, grace: Duration) -> SampleBank {
        self.grace = grace;
        self
    }

    /// Starts decoding every given sound. Replaces anything loaded before. Returns immediately;
    /// outcomes are independent and a failure never aborts the batch. Sounds still pending once
    /// the grace period has passed are failed by the next query.
    pub fn load(&self, sounds: &[Sound]) {
        let span = span!(Level::INFO, "load sounds");
        let _enter = span.enter();

        let mut state = self.state.lock();
        state.batch += 1;
        state.entries.clear();
        state.errors.clear();
        state.terminal = 0;
        state.finalized = false;
        state.timed_out = false;
        state.deadline = Some(Instant::now() + self.grace);

        let mut jobs = Vec::with_capacity(sounds.len());
        for sound in sounds {
            if state.entries.contains_key(&sound.id) {
                warn!(sound_id = sound.id, "Duplicate sound id in catalog, skipping");
                continue;
            }
            state.entries.insert(
                sound.id.clone(),
                Entry {
                    name: sound.display_name.clone(),
                    state: LoadState::Pending,
                    sample: None,
                },
            );
            jobs.push((sound.id.clone(), sound.source_file.clone()));
        }
        state.total = jobs.len();
        info!(sounds = state.total, "Loading sounds");

        if state.total == 0 {
            state.finalize(false);
            return;
        }

        let batch = state.batch;
        drop(state);

        for (sound_id, locator) in jobs {
            let decoder = self.decoder.clone();
            let completion_tx = self.completion_tx.clone();
            self.pool.spawn(move || {
                let result = decoder.decode(&locator);
                // The bank may already be gone; nothing to report to then.
                let _ = completion_tx.send(Completion {
                    batch,
                    sound_id,
                    result,
                });
            });
        }
    }

    /// Applies every completion that has arrived so far, then enforces the grace deadline.
    fn drain(&self, state: &mut BankState) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            state.apply(completion);
        }
        state.expire(Instant::now());
    }

    /// Blocks until every sound is terminal, then returns the outcome. The batch is
    /// force-finalized at its own grace deadline or after `grace`, whichever comes first.
    pub fn wait_until_loaded(&self, grace: Duration) -> LoadSummary {
        let mut deadline = Instant::now() + grace;
        if let Some(batch_deadline) = self.state.lock().deadline {
            deadline = deadline.min(batch_deadline);
        }
        loop {
            {
                let mut state = self.state.lock();
                self.drain(&mut state);
                if state.finalized {
                    return state.summary();
                }
            }

            match self.completion_rx.recv_deadline(deadline) {
                Ok(completion) => self.state.lock().apply(completion),
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = self.state.lock();
                    self.drain(&mut state);
                    if !state.finalized {
                        warn!(
                            grace_ms = grace.as_millis(),
                            pending = state.total - state.terminal,
                            "Sample loading timed out"
                        );
                        state.finalize(true);
                    }
                    return state.summary();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Unreachable while the bank holds a sender; finalize anyway.
                    let mut state = self.state.lock();
                    state.finalize(true);
                    return state.summary();
                }
            }
        }
    }

    /// Load progress as a rounded percentage. 100 once finalized or when nothing was requested.
    pub fn progress(&self) -> u8 {
        let mut state = self.state.lock();
        self.drain(&mut state);
        if state.finalized || state.total == 0 {
            return 100;
        }
        ((state.terminal as f64 * 100.0 / state.total as f64).round() as u8).min(100)
    }

    /// Returns true once every sound is terminal.
    pub fn is_complete(&self) -> bool {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.finalized
    }

    pub fn is_ready(&self, sound_id: &str) -> bool {
        self.load_state(sound_id) == Some(LoadState::Ready)
    }

    pub fn load_state(&self, sound_id: &str) -> Option<LoadState> {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state
            .entries
            .get(sound_id)
            .map(|entry| entry.state.clone())
    }

    /// Snapshot of a sound's entry.
    pub fn get(&self, sound_id: &str) -> Option<SampleBuffer> {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.entries.get(sound_id).map(|entry| SampleBuffer {
            sound_id: sound_id.to_string(),
            load_state: entry.state.clone(),
            sample: entry.sample.clone(),
        })
    }

    /// Returns the decoded sample, or why it can't be played.
    pub fn playable(&self, sound_id: &str) -> Result<LoadedSample, SampleError> {
        let mut state = self.state.lock();
        self.drain(&mut state);
        match state.entries.get(sound_id) {
            None => Err(SampleError::SoundNotFound(sound_id.to_string())),
            Some(Entry {
                sample: Some(sample),
                ..
            }) => Ok(sample.clone()),
            Some(_) => Err(SampleError::NotReady(sound_id.to_string())),
        }
    }

    /// Every failure so far, in the order they were recorded.
    pub fn load_errors(&self) -> Vec<LoadError> {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.errors.clone()
    }

    /// Releases every buffer. Results still in flight are discarded.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        self.drain(&mut state);
        let released = state.entries.len();
        *state = BankState {
            batch: state.batch + 1,
            ..BankState::default()
        };
        debug!(released, "Sample bank torn down");
    }

    /// Number of sounds in the bank.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
