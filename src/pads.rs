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

use crate::catalog::{Catalog, DEFAULT_PAD_ASSIGNMENTS};

/// Number of pads on the grid.
pub const PAD_COUNT: usize = 16;

pub const DEFAULT_PAD_VOLUME: f32 = 0.8;

/// One pad on the 4x4 grid.
#[derive(Clone, Debug, PartialEq)]
pub struct Pad {
    pub index: usize,
    /// None leaves the pad silent.
    pub sound_id: Option<String>,
    pub volume: f32,
    pub color_index: u8,
}

/// A partial change to a pad. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PadUpdate {
    /// `Some(None)` unassigns the pad.
    pub sound_id: Option<Option<String>>,
    pub volume: Option<f32>,
    pub color_index: Option<u8>,
}

/// Default color for a pad: one color per row.
pub fn default_color(index: usize) -> u8 {
    (index / 4) as u8
}

/// The sixteen pads.
#[derive(Clone, Debug, PartialEq)]
pub struct PadSet {
    pads: Vec<Pad>,
}

impl PadSet {
    /// Pads with the reference assignment. Sounds missing from the catalog are left unassigned.
    pub fn with_defaults(catalog: &Catalog) -> PadSet {
        PadSet {
            pads: (0..PAD_COUNT)
                .map(|index| Pad {
                    index,
                    sound_id: DEFAULT_PAD_ASSIGNMENTS
                        .get(index)
                        .filter(|id| catalog.get(id).is_some())
                        .map(|id| id.to_string()),
                    volume: DEFAULT_PAD_VOLUME,
                    color_index: default_color(index),
                })
                .collect(),
        }
    }

    /// Sixteen silent pads.
    pub fn empty() -> PadSet {
        PadSet {
            pads: (0..PAD_COUNT)
                .map(|index| Pad {
                    index,
                    sound_id: None,
                    volume: DEFAULT_PAD_VOLUME,
                    color_index: default_color(index),
                })
                .collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Pad> {
        self.pads.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pad> {
        self.pads.iter()
    }

    /// Applies an update. Returns false if the index is out of range.
    pub fn update(&mut self, index: usize, update: PadUpdate) -> bool {
        let Some(pad) = self.pads.get_mut(index) else {
            return false;
        };
        if let Some(sound_id) = update.sound_id {
            pad.sound_id = sound_id;
        }
        if let Some(volume) = update.volume {
            pad.volume = if volume.is_nan() {
                0.0
            } else {
                volume.clamp(0.0, 1.0)
            };
        }
        if let Some(color_index) = update.color_index {
            pad.color_index = color_index;
        }
        true
    }
}
