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

//! Persisted user settings: tempo, master volume, pad assignments and stored patterns.
//!
//! The document is versioned JSON. Anything that cannot be used as-is (missing file, bad JSON,
//! another version, the wrong number of pads) is replaced by defaults.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{Catalog, DEFAULT_PAD_ASSIGNMENTS};
use crate::pads::{default_color, Pad, PadSet, PadUpdate, DEFAULT_PAD_VOLUME, PAD_COUNT};
use crate::sequencer::Pattern;
use crate::transport::{DEFAULT_BPM, STEPS_PER_BAR};

pub const STORAGE_VERSION: &str = "1.0.0";

/// Number of stored pattern slots. Slot ids run 1..=MAX_PATTERNS.
pub const MAX_PATTERNS: usize = 8;

const UNKNOWN_SOUND_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("not enough space to save settings to {0}")]
    QuotaExceeded(PathBuf),
    #[error("unable to save settings: {0}")]
    Io(#[from] io::Error),
    #[error("unable to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSettings {
    pub bpm: f64,
    pub volume: f32,
    pub metronome: bool,
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            bpm: DEFAULT_BPM,
            volume: DEFAULT_PAD_VOLUME,
            metronome: false,
            loop_enabled: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredPad {
    pub id: usize,
    pub sound_id: Option<String>,
    pub sound_name: String,
    pub volume: f32,
    pub color_index: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredPattern {
    pub id: usize,
    pub name: String,
    /// Pad index to its steps. Pads with nothing armed are omitted.
    #[serde(default)]
    pub steps: BTreeMap<usize, Vec<bool>>,
}

impl StoredPattern {
    fn empty(id: usize) -> StoredPattern {
        StoredPattern {
            id,
            name: format!("Pattern {}", id),
            steps: BTreeMap::new(),
        }
    }

    /// Rebuilds a pattern. Unknown pads are ignored; short rows are padded with rests.
    pub fn to_pattern(&self) -> Pattern {
        let mut pattern = Pattern::new();
        for (pad, row) in &self.steps {
            for (step, armed) in row.iter().take(STEPS_PER_BAR).enumerate() {
                pattern.set(*pad, step, *armed);
            }
        }
        pattern
    }

    pub fn set_pattern(&mut self, pattern: &Pattern) {
        self.steps = (0..PAD_COUNT)
            .filter_map(|pad| {
                let row = pattern.row(pad)?;
                row.iter().any(|s| *s).then(|| (pad, row.to_vec()))
            })
            .collect();
    }
}

/// The whole persisted document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSettings {
    pub version: String,
    pub settings: GeneralSettings,
    pub pads: Vec<StoredPad>,
    pub patterns: Vec<StoredPattern>,
    pub current_pattern: usize,
}

impl StoredSettings {
    pub fn defaults(catalog: &Catalog) -> StoredSettings {
        StoredSettings {
            version: STORAGE_VERSION.to_string(),
            settings: GeneralSettings::default(),
            pads: (0..PAD_COUNT)
                .map(|index| {
                    let sound_id = DEFAULT_PAD_ASSIGNMENTS.get(index).map(|id| id.to_string());
                    StoredPad {
                        id: index,
                        sound_name: sound_name(catalog, sound_id.as_deref()),
                        sound_id,
                        volume: DEFAULT_PAD_VOLUME,
                        color_index: default_color(index),
                    }
                })
                .collect(),
            patterns: (1..=MAX_PATTERNS).map(StoredPattern::empty).collect(),
            current_pattern: 1,
        }
    }

    /// The reason this document cannot be used, if any.
    fn validate(&self) -> Option<String> {
        if self.version != STORAGE_VERSION {
            return Some(format!(
                "version {} does not match {}",
                self.version, STORAGE_VERSION
            ));
        }
        if self.pads.len() != PAD_COUNT {
            return Some(format!(
                "{} pads stored, expected {}",
                self.pads.len(),
                PAD_COUNT
            ));
        }
        None
    }

    /// Applies the stored pads to a pad set. Sounds missing from the catalog are unassigned.
    pub fn apply_pads(&self, pads: &mut PadSet, catalog: &Catalog) {
        for stored in &self.pads {
            let sound_id = stored
                .sound_id
                .clone()
                .filter(|id| catalog.get(id).is_some());
            pads.update(
                stored.id,
                PadUpdate {
                    sound_id: Some(sound_id),
                    volume: Some(stored.volume),
                    color_index: Some(stored.color_index),
                },
            );
        }
    }

    /// Records the live pad set.
    pub fn capture_pads(&mut self, pads: &PadSet, catalog: &Catalog) {
        self.pads = pads
            .iter()
            .map(|pad: &Pad| StoredPad {
                id: pad.index,
                sound_id: pad.sound_id.clone(),
                sound_name: sound_name(catalog, pad.sound_id.as_deref()),
                volume: pad.volume,
                color_index: pad.color_index,
            })
            .collect();
    }

    pub fn pattern_slot(&self, id: usize) -> Option<&StoredPattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn pattern_slot_mut(&mut self, id: usize) -> Option<&mut StoredPattern> {
        self.patterns.iter_mut().find(|p| p.id == id)
    }
}

fn sound_name(catalog: &Catalog, sound_id: Option<&str>) -> String {
    sound_id
        .and_then(|id| catalog.get(id))
        .map(|sound| sound.display_name.clone())
        .unwrap_or_else(|| UNKNOWN_SOUND_NAME.to_string())
}

fn is_storage_full(e: &io::Error) -> bool {
    #[cfg(unix)]
    const STORAGE_FULL: i32 = 28;
    #[cfg(windows)]
    const STORAGE_FULL: i32 = 112;
    #[cfg(not(any(unix, windows)))]
    const STORAGE_FULL: i32 = -1;

    e.raw_os_error() == Some(STORAGE_FULL)
}

/// Reads and writes the settings document at a fixed path.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: &Path) -> SettingsStore {
        SettingsStore {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored settings, or defaults when they are missing or unusable.
    pub fn load(&self, catalog: &Catalog) -> StoredSettings {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No stored settings, using defaults");
                return StoredSettings::defaults(catalog);
            }
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "Unable to read settings, using defaults");
                return StoredSettings::defaults(catalog);
            }
        };

        match serde_json::from_str::<StoredSettings>(&contents) {
            Ok(stored) => match stored.validate() {
                None => {
                    info!(path = %self.path.display(), "Loaded stored settings");
                    stored
                }
                Some(reason) => {
                    warn!(path = %self.path.display(), reason = %reason, "Stored settings unusable, using defaults");
                    StoredSettings::defaults(catalog)
                }
            },
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "Unable to parse settings, using defaults");
                StoredSettings::defaults(catalog)
            }
        }
    }

    /// Writes the settings. The version is always the current one.
    pub fn save(&self, settings: &StoredSettings) -> Result<(), PersistenceError> {
        let mut settings = settings.clone();
        settings.version = STORAGE_VERSION.to_string();
        let contents = serde_json::to_string_pretty(&settings)?;

        let map_io = |e: io::Error| {
            if is_storage_full(&e) {
                PersistenceError::QuotaExceeded(self.path.clone())
            } else {
                PersistenceError::Io(e)
            }
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(map_io)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(map_io)?;
        fs::rename(&tmp, &self.path).map_err(map_io)?;
        info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }

    /// Removes the stored settings and returns defaults.
    pub fn reset(&self, catalog: &Catalog) -> StoredSettings {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Settings reset"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), err = %e, "Unable to remove settings"),
        }
        StoredSettings::defaults(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(&dir.path().join("settings.json"));
        (dir, store)
    }

    #[test]
    fn test_defaults() {
        let settings = StoredSettings::defaults(&Catalog::builtin());
        assert_eq!(settings.version, "1.0.0");
        assert_eq!(settings.settings.bpm, 120.0);
        assert!(settings.settings.loop_enabled);
        assert_eq!(settings.pads.len(), 16);
        assert_eq!(settings.pads[0].sound_id.as_deref(), Some("kick-deep"));
        assert_ne!(settings.pads[0].sound_name, "Unknown");
        assert_eq!(settings.patterns.len(), 8);
        assert_eq!(settings.patterns[7].name, "Pattern 8");
        assert_eq!(settings.current_pattern, 1);
    }

    #[test]
    fn test_round_trip() {
        let (_dir, store) = store();
        let catalog = Catalog::builtin();
        let mut settings = StoredSettings::defaults(&catalog);
        settings.settings.bpm = 95.0;
        let pattern = Pattern::parse(&["x...x...x...x...", "................", "..x...x...x...x."])
            .expect("parses");
        settings
            .pattern_slot_mut(3)
            .expect("slot 3")
            .set_pattern(&pattern);

        store.save(&settings).expect("save");
        let loaded = store.load(&catalog);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.pattern_slot(3).expect("slot 3").to_pattern(), pattern);
        // Empty rows are not stored.
        assert_eq!(
            loaded
                .pattern_slot(3)
                .expect("slot 3")
                .steps
                .keys()
                .collect::<Vec<_>>(),
            vec![&0, &2]
        );
    }

    #[test]
    fn test_document_shape() {
        let (_dir, store) = store();
        store
            .save(&StoredSettings::defaults(&Catalog::builtin()))
            .expect("save");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).expect("read")).expect("json");
        assert_eq!(value["version"], "1.0.0");
        assert_eq!(value["settings"]["loop"], true);
        assert_eq!(value["pads"][0]["soundId"], "kick-deep");
        assert_eq!(value["pads"][0]["colorIndex"], 0);
        assert_eq!(value["currentPattern"], 1);
    }

    #[test]
    fn test_unusable_documents_fall_back_to_defaults() {
        let (_dir, store) = store();
        let catalog = Catalog::builtin();
        let defaults = StoredSettings::defaults(&catalog);

        // Missing.
        assert_eq!(store.load(&catalog), defaults);

        // Garbage.
        fs::write(store.path(), "{not json").expect("write");
        assert_eq!(store.load(&catalog), defaults);

        // Another version.
        let mut other = defaults.clone();
        other.version = "0.9.0".to_string();
        other.settings.bpm = 150.0;
        fs::write(store.path(), serde_json::to_string(&other).expect("json")).expect("write");
        assert_eq!(store.load(&catalog), defaults);

        // Wrong pad count.
        let mut short = defaults.clone();
        short.pads.truncate(4);
        fs::write(store.path(), serde_json::to_string(&short).expect("json")).expect("write");
        assert_eq!(store.load(&catalog), defaults);
    }

    #[test]
    fn test_reset_removes_file() {
        let (_dir, store) = store();
        let catalog = Catalog::builtin();
        let mut settings = StoredSettings::defaults(&catalog);
        settings.settings.volume = 0.3;
        store.save(&settings).expect("save");
        assert!(store.path().exists());

        assert_eq!(store.reset(&catalog), StoredSettings::defaults(&catalog));
        assert!(!store.path().exists());
        // Resetting twice is fine.
        store.reset(&catalog);
    }

    #[test]
    fn test_pads_apply_and_capture() {
        let catalog = Catalog::builtin();
        let mut settings = StoredSettings::defaults(&catalog);
        settings.pads[2].sound_id = Some("not-in-catalog".to_string());
        settings.pads[5].volume = 0.25;

        let mut pads = PadSet::empty();
        settings.apply_pads(&mut pads, &catalog);
        assert_eq!(pads.get(0).expect("pad").sound_id.as_deref(), Some("kick-deep"));
        assert!(pads.get(2).expect("pad").sound_id.is_none());
        assert_eq!(pads.get(5).expect("pad").volume, 0.25);

        settings.capture_pads(&pads, &catalog);
        assert_eq!(settings.pads[2].sound_id, None);
        assert_eq!(settings.pads[2].sound_name, "Unknown");
        assert_eq!(settings.pads.len(), 16);
    }

    #[test]
    fn test_tolerant_pattern_rows() {
        let mut steps = BTreeMap::new();
        steps.insert(0, vec![true, false, true]);
        steps.insert(40, vec![true; 16]);
        steps.insert(1, vec![true; 20]);
        let stored = StoredPattern {
            id: 1,
            name: "Pattern 1".to_string(),
            steps,
        };
        let pattern = stored.to_pattern();
        assert!(pattern.is_armed(0, 0));
        assert!(pattern.is_armed(0, 2));
        assert!(!pattern.is_armed(0, 3));
        assert!(pattern.row(1).expect("row").iter().all(|s| *s));
    }
}
