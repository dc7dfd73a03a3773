//! # loopbridge-types
//!
//! Shared type definitions for the loopbridge control bridge.
//! This crate contains the data that both sides of the bridge agree on:
//! parameter declarations issued by the engine and the track/step model the
//! sequencer surface renders. Nothing here knows about sockets or UI.

pub mod param;
pub mod sequence;

pub use param::{DeclarationSet, ParameterDeclaration, ParameterId, ParameterKind, TrackId, TrackScope};
pub use sequence::{
    active_step_index, is_beat, StepSequence, BEATS_PER_BAR, STEPS_PER_BEAT, STEP_COUNT, TRACK_COUNT,
};
