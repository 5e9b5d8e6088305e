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
use std::fmt;

use crate::pads::PAD_COUNT;
use crate::transport::STEPS_PER_BAR;

/// Per-pad step grids. Every pad has exactly one bar of steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    steps: [[bool; STEPS_PER_BAR]; PAD_COUNT],
}

impl Pattern {
    /// An empty pattern.
    pub fn new() -> Pattern {
        Pattern::default()
    }

    /// Parses rows like `x...x...x...x...`, one per pad starting at pad 0. Any character other
    /// than `.`, `-` or `0` arms a step. Missing rows stay empty.
    pub fn parse(rows: &[&str]) -> Result<Pattern, String> {
        if rows.len() > PAD_COUNT {
            return Err(format!("{} rows given, at most {} pads", rows.len(), PAD_COUNT));
        }
        let mut pattern = Pattern::new();
        for (pad, row) in rows.iter().enumerate() {
            let cells: Vec<char> = row.chars().filter(|c| !c.is_whitespace()).collect();
            if cells.len() != STEPS_PER_BAR {
                return Err(format!(
                    "row {} has {} steps, expected {}",
                    pad,
                    cells.len(),
                    STEPS_PER_BAR
                ));
            }
            for (step, cell) in cells.into_iter().enumerate() {
                pattern.steps[pad][step] = !matches!(cell, '.' | '-' | '0');
            }
        }
        Ok(pattern)
    }

    /// Returns true if the step is armed. Out-of-range coordinates are never armed.
    pub fn is_armed(&self, pad: usize, step: usize) -> bool {
        self.steps
            .get(pad)
            .and_then(|row| row.get(step))
            .copied()
            .unwrap_or(false)
    }

    /// Flips one step. Returns the new value, or None if out of range.
    pub fn toggle(&mut self, pad: usize, step: usize) -> Option<bool> {
        let cell = self.steps.get_mut(pad)?.get_mut(step)?;
        *cell = !*cell;
        Some(*cell)
    }

    pub fn set(&mut self, pad: usize, step: usize, armed: bool) -> bool {
        match self.steps.get_mut(pad).and_then(|row| row.get_mut(step)) {
            Some(cell) => {
                *cell = armed;
                true
            }
            None => false,
        }
    }

    pub fn row(&self, pad: usize) -> Option<&[bool; STEPS_PER_BAR]> {
        self.steps.get(pad)
    }

    /// Pads armed at the given step, ascending.
    pub fn armed_pads(&self, step: usize) -> impl Iterator<Item = usize> + '_ {
        (0..PAD_COUNT).filter(move |pad| self.is_armed(*pad, step))
    }

    pub fn clear(&mut self) {
        *self = Pattern::new();
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|row| row.iter().all(|s| !s))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pad, row) in self.steps.iter().enumerate() {
            let cells: String = row.iter().map(|s| if *s { 'x' } else { '.' }).collect();
            writeln!(f, "{:>2} {}", pad, cells)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_is_an_involution() {
        let mut pattern = Pattern::new();
        assert_eq!(pattern.toggle(2, 5), Some(true));
        assert!(pattern.is_armed(2, 5));
        assert_eq!(pattern.toggle(2, 5), Some(false));
        assert_eq!(pattern, Pattern::new());
    }

    #[test]
    fn test_out_of_range() {
        let mut pattern = Pattern::new();
        assert_eq!(pattern.toggle(16, 0), None);
        assert_eq!(pattern.toggle(0, 16), None);
        assert!(!pattern.is_armed(99, 99));
        assert!(!pattern.set(0, 16, true));
    }

    #[test]
    fn test_parse_and_armed_pads() {
        let pattern = Pattern::parse(&["x...x...x...x...", "....x.......x..."]).expect("parses");
        assert_eq!(pattern.armed_pads(0).collect::<Vec<_>>(), vec![0]);
        assert_eq!(pattern.armed_pads(4).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(pattern.armed_pads(1).count(), 0);

        assert!(Pattern::parse(&["x..."]).is_err());
    }

    #[test]
    fn test_clear() {
        let mut pattern = Pattern::parse(&["xxxxxxxxxxxxxxxx"]).expect("parses");
        assert!(!pattern.is_empty());
        pattern.clear();
        assert!(pattern.is_empty());
    }
}
