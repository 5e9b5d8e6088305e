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

//! The sound catalog: every sound the instrument knows about.
//!
//! The catalog is fixed for the lifetime of a session. It is either the built-in reference set
//! of 40 sounds or a YAML file of the form:
//!
//! ```yaml
//! sounds:
//!   - id: kick-deep
//!     name: Kick Deep
//!     file: /sounds/drums/kick-deep.mp3
//!     category: drum
//! ```

use std::fmt;
use std::path::Path;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// The broad grouping a sound belongs to.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "drums")]
    Drum,
    Synth,
    Fx,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Drum => "drums",
            Category::Synth => "synth",
            Category::Fx => "fx",
        };
        write!(f, "{}", name)
    }
}

/// An immutable catalog entry.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Sound {
    /// Stable key used by pads, patterns and the sample bank.
    pub id: String,
    /// Human readable name.
    #[serde(rename = "name")]
    pub display_name: String,
    /// Resource locator, resolved against the sounds directory.
    #[serde(rename = "file")]
    pub source_file: String,
    pub category: Category,
}

impl Sound {
    pub fn new(id: &str, display_name: &str, source_file: &str, category: Category) -> Sound {
        Sound {
            id: id.to_string(),
            display_name: display_name.to_string(),
            source_file: source_file.to_string(),
            category,
        }
    }
}

impl fmt::Display for Sound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.display_name, self.id, self.category)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    sounds: Vec<Sound>,
}

/// An ordered list of sounds.
#[derive(Clone, Debug)]
pub struct Catalog {
    sounds: Vec<Sound>,
}

/// The reference sound set: (id, name, file, category).
const BUILTIN_SOUNDS: [(&str, &str, &str, Category); 40] = [
    ("kick-deep", "Kick Deep", "/sounds/drums/kick-deep.mp3", Category::Drum),
    ("kick-tight", "Kick Tight", "/sounds/drums/kick-tight.mp3", Category::Drum),
    ("kick-808", "Kick 808", "/sounds/drums/kick-808.mp3", Category::Drum),
    ("snare-acoustic", "Snare Acoustic", "/sounds/drums/snare-acoustic.mp3", Category::Drum),
    ("snare-electronic", "Snare Electronic", "/sounds/drums/snare-electronic.mp3", Category::Drum),
    ("snare-rim", "Snare Rim", "/sounds/drums/snare-rim.mp3", Category::Drum),
    ("clap", "Clap", "/sounds/drums/clap.mp3", Category::Drum),
    ("hihat-closed", "Hi-Hat Closed", "/sounds/drums/hihat-closed.mp3", Category::Drum),
    ("hihat-open", "Hi-Hat Open", "/sounds/drums/hihat-open.mp3", Category::Drum),
    ("hihat-pedal", "Hi-Hat Pedal", "/sounds/drums/hihat-pedal.mp3", Category::Drum),
    ("crash", "Crash", "/sounds/drums/crash.mp3", Category::Drum),
    ("ride", "Ride", "/sounds/drums/ride.mp3", Category::Drum),
    ("tom-high", "Tom High", "/sounds/drums/tom-high.mp3", Category::Drum),
    ("tom-mid", "Tom Mid", "/sounds/drums/tom-mid.mp3", Category::Drum),
    ("tom-low", "Tom Low", "/sounds/drums/tom-low.mp3", Category::Drum),
    ("floor-tom", "Floor Tom", "/sounds/drums/floor-tom.mp3", Category::Drum),
    ("cowbell", "Cowbell", "/sounds/drums/cowbell.mp3", Category::Drum),
    ("tambourine", "Tambourine", "/sounds/drums/tambourine.mp3", Category::Drum),
    ("shaker", "Shaker", "/sounds/drums/shaker.mp3", Category::Drum),
    ("cross-stick", "Cross Stick", "/sounds/drums/cross-stick.mp3", Category::Drum),
    ("bass-808", "Bass 808", "/sounds/synth/bass-808.mp3", Category::Synth),
    ("bass-sub", "Bass Sub", "/sounds/synth/bass-sub.mp3", Category::Synth),
    ("bass-wobble", "Bass Wobble", "/sounds/synth/bass-wobble.mp3", Category::Synth),
    ("synth-lead", "Synth Lead", "/sounds/synth/synth-lead.mp3", Category::Synth),
    ("synth-pluck", "Synth Pluck", "/sounds/synth/synth-pluck.mp3", Category::Synth),
    ("synth-stab", "Synth Stab", "/sounds/synth/synth-stab.mp3", Category::Synth),
    ("synth-pad", "Synth Pad", "/sounds/synth/synth-pad.mp3", Category::Synth),
    ("synth-arp", "Synth Arp", "/sounds/synth/synth-arp.mp3", Category::Synth),
    ("piano-hit", "Piano Hit", "/sounds/synth/piano-hit.mp3", Category::Synth),
    ("organ-stab", "Organ Stab", "/sounds/synth/organ-stab.mp3", Category::Synth),
    ("brass-hit", "Brass Hit", "/sounds/synth/brass-hit.mp3", Category::Synth),
    ("string-hit", "String Hit", "/sounds/synth/string-hit.mp3", Category::Synth),
    ("conga-high", "Conga High", "/sounds/fx/conga-high.mp3", Category::Fx),
    ("conga-low", "Conga Low", "/sounds/fx/conga-low.mp3", Category::Fx),
    ("bongo", "Bongo", "/sounds/fx/bongo.mp3", Category::Fx),
    ("djembe", "Djembe", "/sounds/fx/djembe.mp3", Category::Fx),
    ("fx-rise", "FX Rise", "/sounds/fx/fx-rise.mp3", Category::Fx),
    ("fx-down", "FX Down", "/sounds/fx/fx-down.mp3", Category::Fx),
    ("fx-noise", "FX Noise", "/sounds/fx/fx-noise.mp3", Category::Fx),
    ("fx-laser", "FX Laser", "/sounds/fx/fx-laser.mp3", Category::Fx),
];

/// Default sound for each of the 16 pads, in pad order.
pub const DEFAULT_PAD_ASSIGNMENTS: [&str; 16] = [
    "kick-deep",
    "kick-tight",
    "snare-acoustic",
    "snare-electronic",
    "hihat-closed",
    "hihat-open",
    "clap",
    "crash",
    "bass-808",
    "bass-sub",
    "synth-lead",
    "synth-stab",
    "conga-high",
    "conga-low",
    "fx-rise",
    "fx-laser",
];

impl Catalog {
    /// Creates a catalog from an explicit list of sounds.
    pub fn new(sounds: Vec<Sound>) -> Catalog {
        Catalog { sounds }
    }

    /// The built-in reference catalog.
    pub fn builtin() -> Catalog {
        Catalog::new(
            BUILTIN_SOUNDS
                .iter()
                .map(|(id, name, file, category)| Sound::new(id, name, file, *category))
                .collect(),
        )
    }

    /// Parses a catalog from a YAML file.
    pub fn from_file(path: &Path) -> Result<Catalog, ConfigError> {
        let file: CatalogFile = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(Catalog::new(file.sounds))
    }

    /// All sounds in catalog order.
    pub fn sounds(&self) -> &[Sound] {
        &self.sounds
    }

    /// Looks a sound up by id.
    pub fn get(&self, id: &str) -> Option<&Sound> {
        self.sounds.iter().find(|sound| sound.id == id)
    }

    /// Sounds in the given category, catalog order preserved.
    pub fn by_category(&self, category: Category) -> Vec<&Sound> {
        self.sounds
            .iter()
            .filter(|sound| sound.category == category)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sounds.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::builtin()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.len(), 40);
        assert_eq!(catalog.by_category(Category::Drum).len(), 20);
        assert_eq!(catalog.by_category(Category::Synth).len(), 12);
        assert_eq!(catalog.by_category(Category::Fx).len(), 8);

        let ids: HashSet<&str> = catalog.sounds().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 40, "sound ids must be unique");

        let kick = catalog.get("kick-deep").expect("kick-deep is built in");
        assert_eq!(kick.display_name, "Kick Deep");
        assert_eq!(kick.source_file, "/sounds/drums/kick-deep.mp3");
        assert!(catalog.get("does-not-exist").is_none());
    }

    #[test]
    fn test_default_assignments_exist() {
        let catalog = Catalog::builtin();
        for id in DEFAULT_PAD_ASSIGNMENTS {
            assert!(catalog.get(id).is_some(), "{} missing from catalog", id);
        }
    }

    #[test]
    fn test_catalog_from_yaml() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        write!(
            file,
            r#"
sounds:
  - id: kick
    name: Kick
    file: drums/kick.wav
    category: drums
  - id: zap
    name: Zap
    file: fx/zap.wav
    category: fx
"#
        )
        .expect("write yaml");

        let catalog = Catalog::from_file(file.path()).expect("catalog parses");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.sounds()[0].category, Category::Drum);
        assert_eq!(catalog.sounds()[1].id, "zap");
        assert_eq!(catalog.sounds()[1].category, Category::Fx);
    }
}
