//! Step sequencer types.

use serde::{Deserialize, Serialize};

/// Numbered tracks; the master bus is not counted.
pub const TRACK_COUNT: usize = 10;
/// Step slots per track.
pub const STEP_COUNT: usize = 16;
pub const BEATS_PER_BAR: f64 = 4.0;
pub const STEPS_PER_BEAT: f64 = 4.0;

/// The active/inactive flags for one track's 16 steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepSequence {
    steps: [bool; STEP_COUNT],
}

impl StepSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of active step indices; out-of-range indices are ignored.
    pub fn from_active<I: IntoIterator<Item = usize>>(active: I) -> Self {
        let mut sequence = Self::new();
        for index in active {
            sequence.set(index, true);
        }
        sequence
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.steps.get(index).copied().unwrap_or(false)
    }

    /// Flip a step. Returns the new state, or `None` if `index` is out of range.
    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        let step = self.steps.get_mut(index)?;
        *step = !*step;
        Some(*step)
    }

    /// Returns `false` if `index` is out of range.
    pub fn set(&mut self, index: usize, active: bool) -> bool {
        match self.steps.get_mut(index) {
            Some(step) => {
                *step = active;
                true
            }
            None => false,
        }
    }

    pub fn active_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, &active)| active.then_some(i))
            .collect()
    }

    pub fn clear(&mut self) {
        self.steps = [false; STEP_COUNT];
    }
}

/// Which step is playing at `position_beats`: `floor((position mod 4) * 4)`.
///
/// `None` means the transport is not running. Negative positions wrap
/// (Euclidean remainder) so count-ins still land on a valid step.
pub fn active_step_index(position_beats: Option<f64>) -> Option<usize> {
    let position = position_beats.filter(|p| p.is_finite())?;
    let index = (position.rem_euclid(BEATS_PER_BAR) * STEPS_PER_BEAT).floor() as usize;
    Some(index.min(STEP_COUNT - 1))
}

/// Steps that start a beat get a stronger render.
pub fn is_beat(index: usize) -> bool {
    index % STEPS_PER_BEAT as usize == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playing_step_from_position() {
        assert_eq!(active_step_index(Some(4.25)), Some(1));
        assert_eq!(active_step_index(Some(0.0)), Some(0));
        assert_eq!(active_step_index(Some(3.99)), Some(15));
        assert_eq!(active_step_index(Some(8.0)), Some(0));
    }

    #[test]
    fn no_playing_step_when_stopped() {
        assert_eq!(active_step_index(None), None);
        assert_eq!(active_step_index(Some(f64::NAN)), None);
        assert_eq!(active_step_index(Some(f64::INFINITY)), None);
    }

    #[test]
    fn negative_position_wraps() {
        assert_eq!(active_step_index(Some(-0.25)), Some(15));
    }

    #[test]
    fn toggle_twice_restores() {
        let mut sequence = StepSequence::new();
        assert_eq!(sequence.toggle(5), Some(true));
        assert_eq!(sequence.toggle(5), Some(false));
        assert_eq!(sequence, StepSequence::new());
    }

    #[test]
    fn toggle_out_of_range() {
        let mut sequence = StepSequence::new();
        assert_eq!(sequence.toggle(STEP_COUNT), None);
        assert!(!sequence.set(STEP_COUNT, true));
        assert!(!sequence.is_active(STEP_COUNT));
    }

    #[test]
    fn from_active_ignores_out_of_range() {
        let sequence = StepSequence::from_active([0, 4, 99]);
        assert_eq!(sequence.active_steps(), vec![0, 4]);
    }

    #[test]
    fn beats() {
        assert!(is_beat(0));
        assert!(is_beat(12));
        assert!(!is_beat(3));
    }
}
