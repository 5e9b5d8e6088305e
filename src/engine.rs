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

//! The engine context. One engine owns everything a session needs: the mixer and its output,
//! the sample bank, the voice pool, the sequencer, the recorder, the pads and the persisted
//! settings.
//!
//! Settings writes are best effort. A failed save is logged and the in-memory state stays
//! authoritative. An output fault is fatal to playback: a running sequencer stops on its next
//! step, and `start` and the trigger operations refuse until `reinitialize` reopens the output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, span, warn, Level};

use crate::audio::{self, AudioMixer, Device, OutputHandle};
use crate::catalog::Catalog;
use crate::config::{ConfigError, EngineConfig};
use crate::pads::{Pad, PadSet, PadUpdate, PAD_COUNT};
use crate::recorder::{Recorder, RecorderError, Recording, RecordingState};
use crate::samples::{
    Decoder, FileDecoder, LoadError, LoadSummary, SampleBank, SampleError, VoiceHandle, VoicePool,
};
use crate::sequencer::{Pattern, Sequencer, SequencerError};
use crate::settings::{PersistenceError, SettingsStore, StoredSettings, MAX_PATTERNS};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("audio output fault: {0}")]
    OutputFault(String),
    #[error("unable to open audio output: {0}")]
    Output(String),
    #[error("pad {0} does not exist")]
    InvalidPad(usize),
    #[error("pattern slot {0} does not exist, slots are 1 to {max}", max = MAX_PATTERNS)]
    InvalidPatternSlot(usize),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// A drum pad session.
pub struct Engine {
    config: EngineConfig,
    catalog: Catalog,
    mixer: AudioMixer,
    device: Arc<dyn Device>,
    output: Mutex<Option<OutputHandle>>,
    bank: SampleBank,
    pool: Arc<VoicePool>,
    sequencer: Sequencer,
    recorder: Recorder,
    pads: Arc<RwLock<PadSet>>,
    store: SettingsStore,
    settings: Mutex<StoredSettings>,
}

impl Engine {
    /// Creates an engine from its configuration, decoding sounds from the sounds directory.
    pub fn new(config: EngineConfig) -> Result<Engine, EngineError> {
        let catalog = match config.catalog() {
            Some(path) => Catalog::from_file(&path)?,
            None => Catalog::builtin(),
        };
        let device = audio::get_device(config.audio()).map_err(|e| EngineError::Output(e.to_string()))?;
        let decoder = FileDecoder::new(config.sounds_dir(), config.audio().sample_rate());
        Engine::with_parts(config, catalog, device, Arc::new(decoder))
    }

    /// Creates an engine from explicit parts.
    pub fn with_parts(
        config: EngineConfig,
        catalog: Catalog,
        device: Arc<dyn Device>,
        decoder: Arc<dyn Decoder>,
    ) -> Result<Engine, EngineError> {
        let span = span!(Level::INFO, "engine");
        let _enter = span.enter();

        let timing = config.timing()?;
        let max_recording = config.max_recording()?;
        let load_timeout = config.load_timeout()?;

        let mixer = AudioMixer::new(config.audio().channels(), config.audio().sample_rate());
        let output = device
            .open(mixer.clone())
            .map_err(|e| EngineError::Output(e.to_string()))?;
        info!(
            device = %device,
            channels = mixer.num_channels(),
            sample_rate = mixer.sample_rate(),
            "Output opened"
        );

        let bank = SampleBank::new(decoder)?.with_grace_period(load_timeout);
        let pool = Arc::new(VoicePool::new(
            bank.clone(),
            mixer.clone(),
            config.max_polyphony(),
        ));

        let store = SettingsStore::new(&config.settings_path());
        let settings = store.load(&catalog);
        let mut pad_set = PadSet::with_defaults(&catalog);
        settings.apply_pads(&mut pad_set, &catalog);
        let pads = Arc::new(RwLock::new(pad_set));

        let transport = Transport::new(mixer.clone(), timing);
        let sequencer = Sequencer::new(transport, pads.clone(), pool.clone());
        let recorder = Recorder::new(mixer.clone(), max_recording);

        let engine = Engine {
            config,
            catalog,
            mixer,
            device,
            output: Mutex::new(Some(output)),
            bank,
            pool,
            sequencer,
            recorder,
            pads,
            store,
            settings: Mutex::new(settings),
        };
        engine.apply_settings();
        Ok(engine)
    }

    /// Pushes the stored tempo, volume and current pattern into the live components.
    fn apply_settings(&self) {
        let settings = self.settings.lock();
        self.sequencer.set_bpm(settings.settings.bpm);
        self.mixer.set_master_volume(settings.settings.volume);
        let pattern = settings
            .pattern_slot(settings.current_pattern)
            .map(|slot| slot.to_pattern())
            .unwrap_or_default();
        self.sequencer.set_pattern(pattern);
    }

    /// Writes the settings, logging rather than failing.
    fn persist(&self) {
        if let Err(e) = self.save_settings() {
            warn!(err = %e, "Unable to save settings, keeping them in memory");
        }
    }

    /// Writes the current pads and settings to disk.
    pub fn save_settings(&self) -> Result<(), PersistenceError> {
        let mut settings = self.settings.lock();
        settings.capture_pads(&self.pads.read(), &self.catalog);
        self.store.save(&settings)
    }

    fn check_output(&self) -> Result<(), EngineError> {
        match self.mixer.fault() {
            Some(fault) => Err(EngineError::OutputFault(fault)),
            None => Ok(()),
        }
    }

    /// Decodes every catalog sound and waits until they finish or the load timeout passes.
    pub fn load_sounds(&self) -> Result<LoadSummary, EngineError> {
        let timeout = self.config.load_timeout()?;
        self.bank.load(self.catalog.sounds());
        let summary = self.bank.wait_until_loaded(timeout);
        info!(
            loaded = summary.loaded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Sounds loaded"
        );
        Ok(summary)
    }

    /// Load progress as a percentage.
    pub fn load_progress(&self) -> u8 {
        self.bank.progress()
    }

    pub fn load_errors(&self) -> Vec<LoadError> {
        self.bank.load_errors()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Plays the sound assigned to a pad at the pad's volume. Returns None for an unassigned pad.
    pub fn play_pad(&self, index: usize) -> Result<Option<VoiceHandle>, EngineError> {
        self.check_output()?;
        let (sound_id, volume) = {
            let pads = self.pads.read();
            let pad = pads.get(index).ok_or(EngineError::InvalidPad(index))?;
            match &pad.sound_id {
                Some(sound_id) => (sound_id.clone(), pad.volume),
                None => return Ok(None),
            }
        };
        Ok(Some(self.pool.trigger(&sound_id, volume)?))
    }

    /// Plays any loaded sound immediately.
    pub fn trigger(&self, sound_id: &str, volume: f32) -> Result<VoiceHandle, EngineError> {
        self.check_output()?;
        Ok(self.pool.trigger(sound_id, volume)?)
    }

    /// Starts the sequencer. Returns false if it was already running.
    pub fn start(&self) -> Result<bool, EngineError> {
        self.check_output()?;
        Ok(self.sequencer.start())
    }

    /// Stops the sequencer. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        self.sequencer.stop()
    }

    /// Starts or stops the sequencer. Returns true if now playing.
    pub fn toggle_playback(&self) -> Result<bool, EngineError> {
        if self.sequencer.is_playing() {
            self.sequencer.stop();
            Ok(false)
        } else {
            self.start()?;
            Ok(true)
        }
    }

    pub fn is_playing(&self) -> bool {
        self.sequencer.is_playing()
    }

    pub fn current_step(&self) -> i32 {
        self.sequencer.current_step()
    }

    /// Sets the tempo, clamped to 60..=200, and persists it. Returns the applied tempo.
    pub fn set_bpm(&self, bpm: f64) -> f64 {
        let bpm = self.sequencer.set_bpm(bpm);
        self.settings.lock().settings.bpm = bpm;
        self.persist();
        bpm
    }

    pub fn bpm(&self) -> f64 {
        self.sequencer.bpm()
    }

    /// Sets the master volume, clamped to 0..=1, and persists it.
    pub fn set_volume(&self, volume: f32) -> f32 {
        self.mixer.set_master_volume(volume);
        let volume = self.mixer.master_volume();
        self.settings.lock().settings.volume = volume;
        self.persist();
        volume
    }

    pub fn volume(&self) -> f32 {
        self.mixer.master_volume()
    }

    pub fn toggle_step(&self, pad: usize, step: usize) -> Result<bool, EngineError> {
        Ok(self.sequencer.toggle_step(pad, step)?)
    }

    pub fn clear_pattern(&self) {
        self.sequencer.clear_pattern();
    }

    pub fn pattern(&self) -> Pattern {
        self.sequencer.pattern()
    }

    pub fn set_pattern(&self, pattern: Pattern) {
        self.sequencer.set_pattern(pattern);
    }

    /// Changes one pad and persists the pad set. Assigned sounds must be in the catalog.
    pub fn update_pad(&self, index: usize, update: PadUpdate) -> Result<Pad, EngineError> {
        if index >= PAD_COUNT {
            return Err(EngineError::InvalidPad(index));
        }
        if let Some(Some(sound_id)) = &update.sound_id {
            if self.catalog.get(sound_id).is_none() {
                return Err(SampleError::SoundNotFound(sound_id.clone()).into());
            }
        }

        let pad = {
            let mut pads = self.pads.write();
            pads.update(index, update);
            pads.get(index).cloned().ok_or(EngineError::InvalidPad(index))?
        };
        info!(
            pad = index,
            sound_id = ?pad.sound_id,
            volume = pad.volume,
            "Pad updated"
        );
        self.persist();
        Ok(pad)
    }

    pub fn pads(&self) -> Vec<Pad> {
        self.pads.read().iter().cloned().collect()
    }

    /// Stores the live pattern in a slot (1..=8) and makes it the current pattern.
    pub fn save_pattern(&self, slot: usize) -> Result<(), EngineError> {
        let pattern = self.sequencer.pattern();
        {
            let mut settings = self.settings.lock();
            settings
                .pattern_slot_mut(slot)
                .ok_or(EngineError::InvalidPatternSlot(slot))?
                .set_pattern(&pattern);
            settings.current_pattern = slot;
        }
        info!(slot, "Pattern saved");
        self.persist();
        Ok(())
    }

    /// Replaces the live pattern with a stored one and makes it the current pattern.
    pub fn load_pattern(&self, slot: usize) -> Result<Pattern, EngineError> {
        let pattern = {
            let mut settings = self.settings.lock();
            let pattern = settings
                .pattern_slot(slot)
                .ok_or(EngineError::InvalidPatternSlot(slot))?
                .to_pattern();
            settings.current_pattern = slot;
            pattern
        };
        self.sequencer.set_pattern(pattern);
        info!(slot, "Pattern loaded");
        Ok(pattern)
    }

    /// Discards stored settings and restores the defaults in every live component.
    pub fn reset_settings(&self) {
        let defaults = self.store.reset(&self.catalog);
        {
            let mut pads = self.pads.write();
            *pads = PadSet::with_defaults(&self.catalog);
            defaults.apply_pads(&mut pads, &self.catalog);
        }
        *self.settings.lock() = defaults;
        self.apply_settings();
    }

    pub fn start_recording(&self) -> Result<(), EngineError> {
        Ok(self.recorder.start()?)
    }

    pub fn stop_recording(&self) -> Result<Option<Recording>, EngineError> {
        Ok(self.recorder.stop()?)
    }

    pub fn clear_recording(&self) {
        self.recorder.clear();
    }

    /// Writes the finished recording to the configured recordings directory.
    pub fn download_recording(&self) -> Result<PathBuf, EngineError> {
        self.download_recording_to(&self.config.recordings_dir())
    }

    pub fn download_recording_to(&self, dir: &Path) -> Result<PathBuf, EngineError> {
        Ok(self.recorder.download_recording(dir)?)
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recorder.state()
    }

    /// The output fault, if the output has failed.
    pub fn fault(&self) -> Option<String> {
        self.mixer.fault()
    }

    /// Stops playback, clears the mixer and reopens the output.
    pub fn reinitialize(&self) -> Result<(), EngineError> {
        let span = span!(Level::INFO, "engine reinitialize");
        let _enter = span.enter();

        self.sequencer.stop();
        let mut output = self.output.lock();
        if let Some(output) = output.take() {
            output.stop();
        }
        self.pool.stop_all();
        self.mixer.reset();

        *output = Some(
            self.device
                .open(self.mixer.clone())
                .map_err(|e| EngineError::Output(e.to_string()))?,
        );
        info!(device = %self.device, "Output reopened");
        Ok(())
    }

    /// Stops everything, saves settings and releases sounds.
    pub fn teardown(&self) {
        self.sequencer.stop();
        if let Err(e) = self.recorder.stop() {
            warn!(err = %e, "Unable to finalize recording on teardown");
        }
        self.persist();
        if let Some(output) = self.output.lock().take() {
            output.stop();
        }
        self.pool.stop_all();
        self.bank.teardown();
        info!("Engine torn down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sequencer.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::config::Audio;
    use crate::samples::LoadState;
    use crate::testutil::{catalog, eventually, FakeDecoder};

    const RATE: u32 = 48000;

    fn engine(dir: &Path) -> Engine {
        let config = EngineConfig::new(Audio::new("mock-output")).with_base_dir(dir);
        let decoder = FakeDecoder::new()
            .with_sound("kick-deep", 2000, RATE)
            .with_sound("snare-acoustic", 2000, RATE)
            .with_sound("hihat-closed", 500, RATE)
            .with_failure("clap", "corrupt file");
        let device = audio::get_device(config.audio()).expect("mock device");
        Engine::with_parts(
            config,
            catalog(&["kick-deep", "snare-acoustic", "hihat-closed", "clap"]),
            device,
            Arc::new(decoder),
        )
        .expect("engine")
    }

    #[test]
    fn test_load_and_play_pads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let summary = engine.load_sounds().expect("load");
        assert_eq!(summary.loaded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.load_progress(), 100);

        let errors = engine.load_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].sound_id, "clap");
        assert_eq!(engine.bank.load_state("clap").map(|s| matches!(s, LoadState::Failed(_))), Some(true));

        // Pad 0 defaults to kick-deep, which this catalog carries.
        assert!(engine.play_pad(0).expect("play").is_some());
        // Pad 1 defaults to a sound outside this catalog, so it is unassigned.
        assert!(engine.play_pad(1).expect("play").is_none());
        assert!(matches!(
            engine.play_pad(16),
            Err(EngineError::InvalidPad(16))
        ));
        assert!(matches!(
            engine.trigger("clap", 1.0),
            Err(EngineError::Sample(SampleError::NotReady(_)))
        ));
        engine.teardown();
    }

    #[test]
    fn test_sequencer_runs_against_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.load_sounds().expect("load");

        engine.toggle_step(0, 0).expect("toggle");
        assert_eq!(engine.set_bpm(200.0), 200.0);
        assert!(engine.toggle_playback().expect("start"));
        assert!(engine.is_playing());
        eventually(|| engine.current_step() > 0, "sequencer never advanced");

        assert!(!engine.toggle_playback().expect("stop"));
        assert_eq!(engine.current_step(), -1);
        assert!(!engine.stop());
        engine.teardown();
    }

    #[test]
    fn test_settings_persist_across_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let engine = engine(dir.path());
            engine.set_bpm(90.0);
            engine
                .update_pad(
                    3,
                    PadUpdate {
                        sound_id: Some(Some("hihat-closed".to_string())),
                        volume: Some(0.5),
                        ..Default::default()
                    },
                )
                .expect("update pad");
            engine.toggle_step(3, 4).expect("toggle");
            engine.save_pattern(2).expect("save pattern");
            engine.teardown();
        }

        let engine = engine(dir.path());
        assert_eq!(engine.bpm(), 90.0);
        let pad = engine.pads()[3].clone();
        assert_eq!(pad.sound_id.as_deref(), Some("hihat-closed"));
        assert_eq!(pad.volume, 0.5);
        // The current pattern is restored.
        assert!(engine.pattern().is_armed(3, 4));

        engine.clear_pattern();
        assert!(engine.load_pattern(1).expect("slot 1").is_empty());
        assert!(engine.load_pattern(2).expect("slot 2").is_armed(3, 4));
        assert!(matches!(
            engine.load_pattern(9),
            Err(EngineError::InvalidPatternSlot(9))
        ));
        assert!(matches!(
            engine.save_pattern(0),
            Err(EngineError::InvalidPatternSlot(0))
        ));
    }

    #[test]
    fn test_update_pad_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        assert!(matches!(
            engine.update_pad(
                0,
                PadUpdate {
                    sound_id: Some(Some("tuba".to_string())),
                    ..Default::default()
                }
            ),
            Err(EngineError::Sample(SampleError::SoundNotFound(_)))
        ));
        assert!(matches!(
            engine.update_pad(20, PadUpdate::default()),
            Err(EngineError::InvalidPad(20))
        ));
        let pad = engine
            .update_pad(
                0,
                PadUpdate {
                    sound_id: Some(None),
                    ..Default::default()
                },
            )
            .expect("unassign");
        assert!(pad.sound_id.is_none());
    }

    #[test]
    fn test_reset_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.set_bpm(150.0);
        engine.set_volume(0.2);
        engine.toggle_step(0, 0).expect("toggle");
        assert!(dir.path().join("beatpad-settings.json").exists());

        engine.reset_settings();
        assert_eq!(engine.bpm(), 120.0);
        assert!((engine.volume() - 0.8).abs() < 1e-6);
        assert!(engine.pattern().is_empty());
        assert!(!dir.path().join("beatpad-settings.json").exists());
    }

    #[test]
    fn test_output_fault_refuses_until_reinitialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.load_sounds().expect("load");

        engine.mixer.report_fault("device unplugged".to_string());
        assert_eq!(engine.fault().as_deref(), Some("device unplugged"));
        assert!(matches!(engine.start(), Err(EngineError::OutputFault(_))));
        assert!(matches!(
            engine.trigger("kick-deep", 1.0),
            Err(EngineError::OutputFault(_))
        ));
        assert!(matches!(engine.play_pad(0), Err(EngineError::OutputFault(_))));
        assert!(!engine.is_playing());

        engine.reinitialize().expect("reinitialize");
        assert_eq!(engine.fault(), None);
        assert!(engine.start().expect("start"));
        engine.stop();
        engine.trigger("kick-deep", 1.0).expect("trigger");
        engine.teardown();
    }

    #[test]
    fn test_fault_while_running_stops_playback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.load_sounds().expect("load");
        engine.set_pattern(Pattern::parse(&["xxxxxxxxxxxxxxxx"]).expect("pattern"));
        assert!(engine.start().expect("start"));

        engine.mixer.report_fault("device unplugged".to_string());
        eventually(|| !engine.is_playing(), "sequencer kept running");
        assert_eq!(engine.current_step(), -1);
        engine.teardown();
    }

    #[test]
    fn test_recording_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.load_sounds().expect("load");

        engine.start_recording().expect("start recording");
        engine.trigger("kick-deep", 1.0).expect("trigger");
        let frames = engine.mixer.current_frame();
        eventually(
            || engine.mixer.current_frame() > frames + 4800,
            "output clock never advanced",
        );
        let recording = engine
            .stop_recording()
            .expect("stop recording")
            .expect("recording");
        assert!(recording.duration > Duration::ZERO);

        let path = engine.download_recording().expect("download");
        assert!(path.starts_with(dir.path().join("recordings")));
        assert_eq!(fs::read(&path).expect("read"), recording.data);

        engine.clear_recording();
        assert!(!engine.recording_state().has_recording);
        engine.teardown();
    }
}
