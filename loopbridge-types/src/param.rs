//! Parameter declaration model.
//!
//! The engine owns parameter truth. It describes what it exposes with a
//! [`DeclarationSet`]; the UI keeps a cached copy and must never render a
//! control for something that is not declared.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sequence::TRACK_COUNT;

/// A numbered track, `1..=TRACK_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TrackId(u8);

impl TrackId {
    /// Returns `None` outside `1..=TRACK_COUNT`.
    pub fn new(number: u8) -> Option<Self> {
        if (1..=TRACK_COUNT as u8).contains(&number) {
            Some(Self(number))
        } else {
            None
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based index into per-track storage.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn all() -> impl Iterator<Item = TrackId> {
        (1..=TRACK_COUNT as u8).map(TrackId)
    }
}

impl TryFrom<u8> for TrackId {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        TrackId::new(number).ok_or_else(|| format!("track {} outside 1..={}", number, TRACK_COUNT))
    }
}

impl From<TrackId> for u8 {
    fn from(track: TrackId) -> u8 {
        track.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bus a parameter lives on. On the wire this is a track number, or
/// `null`/absent for the master bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<TrackId>", into = "Option<TrackId>")]
pub enum TrackScope {
    #[default]
    Master,
    Track(TrackId),
}

impl From<Option<TrackId>> for TrackScope {
    fn from(track: Option<TrackId>) -> Self {
        match track {
            Some(track) => TrackScope::Track(track),
            None => TrackScope::Master,
        }
    }
}

impl From<TrackScope> for Option<TrackId> {
    fn from(scope: TrackScope) -> Self {
        match scope {
            TrackScope::Master => None,
            TrackScope::Track(track) => Some(track),
        }
    }
}

impl fmt::Display for TrackScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackScope::Master => write!(f, "master"),
            TrackScope::Track(track) => write!(f, "track {}", track),
        }
    }
}

/// Identity of a parameter: (track scope, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterId {
    pub scope: TrackScope,
    pub name: String,
}

impl ParameterId {
    pub fn new(scope: TrackScope, name: impl Into<String>) -> Self {
        Self { scope, name: name.into() }
    }

    pub fn master(name: impl Into<String>) -> Self {
        Self::new(TrackScope::Master, name)
    }

    pub fn track(track: TrackId, name: impl Into<String>) -> Self {
        Self::new(TrackScope::Track(track), name)
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParameterKind {
    #[default]
    Continuous,
    /// Snaps to `steps` evenly spaced positions between min and max.
    Stepped { steps: u32 },
}

fn default_min() -> f32 {
    0.0
}

fn default_max() -> f32 {
    1.0
}

/// Engine-issued description of one controllable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDeclaration {
    pub name: String,
    #[serde(default)]
    pub track: TrackScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_min")]
    pub min: f32,
    #[serde(default = "default_max")]
    pub max: f32,
    pub default: f32,
    /// Current engine-side value, if the engine reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(default)]
    pub kind: ParameterKind,
}

impl ParameterDeclaration {
    /// A continuous parameter with no reported value.
    pub fn continuous(scope: TrackScope, name: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self {
            name: name.into(),
            track: scope,
            label: None,
            min,
            max,
            default,
            value: None,
            kind: ParameterKind::Continuous,
        }
    }

    pub fn stepped(scope: TrackScope, name: impl Into<String>, min: f32, max: f32, default: f32, steps: u32) -> Self {
        Self {
            kind: ParameterKind::Stepped { steps },
            ..Self::continuous(scope, name, min, max, default)
        }
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> ParameterId {
        ParameterId::new(self.track, self.name.clone())
    }

    /// Ordered `(lo, hi)` bounds. Non-finite bounds fall back to the
    /// canonical `[0, 1]` range and reversed bounds are swapped.
    pub fn range(&self) -> (f32, f32) {
        let lo = if self.min.is_finite() { self.min } else { 0.0 };
        let hi = if self.max.is_finite() { self.max } else { 1.0 };
        if lo <= hi {
            (lo, hi)
        } else {
            (hi, lo)
        }
    }

    /// Clamp a value into the declared range, snapping stepped parameters.
    /// NaN maps to the declared default.
    pub fn clamp(&self, value: f32) -> f32 {
        let (lo, hi) = self.range();
        let value = if value.is_nan() { self.default } else { value };
        let value = if value.is_nan() { lo } else { value.clamp(lo, hi) };

        match self.kind {
            ParameterKind::Stepped { steps } if steps > 1 && hi > lo => {
                let step = (hi - lo) / (steps - 1) as f32;
                (lo + ((value - lo) / step).round() * step).clamp(lo, hi)
            }
            _ => value,
        }
    }

    /// The value the UI should show before any update arrives.
    pub fn current(&self) -> f32 {
        self.clamp(self.value.unwrap_or(self.default))
    }

    /// Position of `value` within the range, `0.0..=1.0`.
    pub fn normalized(&self, value: f32) -> f32 {
        let (lo, hi) = self.range();
        if hi > lo {
            (self.clamp(value) - lo) / (hi - lo)
        } else {
            0.0
        }
    }

    /// Move `value` by a fraction of the range, as a knob or arrow key would.
    pub fn nudge(&self, value: f32, increase: bool, fraction: f32) -> f32 {
        let (lo, hi) = self.range();
        let delta = match self.kind {
            ParameterKind::Stepped { steps } if steps > 1 => (hi - lo) / (steps - 1) as f32,
            _ => (hi - lo) * fraction,
        };
        if increase {
            self.clamp(value + delta)
        } else {
            self.clamp(value - delta)
        }
    }
}

/// Ordered set of declarations issued once per session.
///
/// Duplicate identities collapse: the last declaration wins but keeps the
/// position where the identity first appeared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ParameterDeclaration>", into = "Vec<ParameterDeclaration>")]
pub struct DeclarationSet {
    declarations: Vec<ParameterDeclaration>,
    index: HashMap<ParameterId, usize>,
}

impl DeclarationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ParameterId) -> Option<&ParameterDeclaration> {
        self.index.get(id).map(|&i| &self.declarations[i])
    }

    pub fn contains(&self, id: &ParameterId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDeclaration> {
        self.declarations.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.declarations.iter().map(ParameterDeclaration::id)
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Declarations scoped to one bus, in declaration order.
    pub fn for_scope(&self, scope: TrackScope) -> impl Iterator<Item = &ParameterDeclaration> {
        self.declarations.iter().filter(move |d| d.track == scope)
    }

    fn push(&mut self, declaration: ParameterDeclaration) {
        let id = declaration.id();
        match self.index.get(&id) {
            Some(&i) => self.declarations[i] = declaration,
            None => {
                self.index.insert(id, self.declarations.len());
                self.declarations.push(declaration);
            }
        }
    }
}

impl From<Vec<ParameterDeclaration>> for DeclarationSet {
    fn from(declarations: Vec<ParameterDeclaration>) -> Self {
        declarations.into_iter().collect()
    }
}

impl From<DeclarationSet> for Vec<ParameterDeclaration> {
    fn from(set: DeclarationSet) -> Self {
        set.declarations
    }
}

impl FromIterator<ParameterDeclaration> for DeclarationSet {
    fn from_iter<I: IntoIterator<Item = ParameterDeclaration>>(iter: I) -> Self {
        let mut set = DeclarationSet::new();
        for declaration in iter {
            set.push(declaration);
        }
        set
    }
}
