//! UI-side state: parameter declarations and values, step grids, playback
//! position, connection status.
//!
//! The store is the single place UI intents enter. User edits update the
//! local state optimistically and are forwarded through the command sink;
//! engine updates arrive through the `apply_*` methods, which never send.
//! Mutations queue a [`Change`]; [`Store::deliver_changes`] hands the queue
//! to observers once the store is no longer borrowed, so an observer may
//! read the store it watches.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, info, warn};
use thiserror::Error;

use loopbridge_net::LogLevel;
use loopbridge_types::{
    active_step_index, DeclarationSet, ParameterDeclaration, ParameterId, StepSequence, TrackId,
    STEP_COUNT, TRACK_COUNT,
};

use crate::dispatch::{Command, CommandSink, TransportCommand};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("parameter {0} has not been declared by the engine")]
    Undeclared(ParameterId),
    #[error("no track {0} (tracks are 1..={max})", max = TRACK_COUNT)]
    InvalidTrack(u8),
    #[error("no step {0} (steps are 0..{max})", max = STEP_COUNT)]
    InvalidStep(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Parameters,
    Steps,
    Position,
    Connection,
    EngineError,
}

/// One notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The declaration set was replaced (or cleared).
    Declarations { count: usize },
    ParameterValue { id: ParameterId, value: f32 },
    Step { track: TrackId, index: usize, active: bool },
    /// A whole track grid was replaced by the engine.
    Sequence { track: TrackId },
    Position(Option<f64>),
    PlayingStep(Option<usize>),
    Connection(ConnectionStatus),
    EngineError(String),
}

impl Change {
    pub fn field(&self) -> Field {
        match self {
            Change::Declarations { .. } | Change::ParameterValue { .. } => Field::Parameters,
            Change::Step { .. } | Change::Sequence { .. } => Field::Steps,
            Change::Position(_) | Change::PlayingStep(_) => Field::Position,
            Change::Connection(_) => Field::Connection,
            Change::EngineError(_) => Field::EngineError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Rc<RefCell<dyn FnMut(&Change)>>;

/// Changes raised by observers during delivery are delivered in a further
/// round; past this many they wait for the next call.
const MAX_DELIVERY_ROUNDS: usize = 8;

pub struct Store {
    declarations: DeclarationSet,
    values: HashMap<ParameterId, f32>,
    sequences: [StepSequence; TRACK_COUNT],
    /// Latest engine-reported position, published on the next frame.
    position: Option<f64>,
    published_position: Option<f64>,
    position_dirty: bool,
    playing_step: Option<usize>,
    connection: ConnectionStatus,
    last_engine_error: Option<String>,
    sink: Box<dyn CommandSink>,
    observers: Vec<(SubscriptionId, Field, Observer)>,
    pending: Vec<Change>,
    next_subscription: u64,
}

impl Store {
    pub fn new(sink: Box<dyn CommandSink>) -> Self {
        Self {
            declarations: DeclarationSet::new(),
            values: HashMap::new(),
            sequences: [StepSequence::new(); TRACK_COUNT],
            position: None,
            published_position: None,
            position_dirty: false,
            playing_step: None,
            connection: ConnectionStatus::Disconnected,
            last_engine_error: None,
            sink,
            observers: Vec::new(),
            pending: Vec::new(),
            next_subscription: 0,
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn declarations(&self) -> &DeclarationSet {
        &self.declarations
    }

    pub fn declaration(&self, id: &ParameterId) -> Option<&ParameterDeclaration> {
        self.declarations.get(id)
    }

    /// Current value of a declared parameter.
    pub fn value(&self, id: &ParameterId) -> Option<f32> {
        self.values.get(id).copied()
    }

    pub fn sequence(&self, track: TrackId) -> &StepSequence {
        &self.sequences[track.index()]
    }

    /// Position as of the last frame, not the latest push.
    pub fn playback_position(&self) -> Option<f64> {
        self.published_position
    }

    pub fn playing_step(&self) -> Option<usize> {
        self.playing_step
    }

    pub fn is_playing(&self, index: usize) -> bool {
        self.playing_step == Some(index)
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn last_engine_error(&self) -> Option<&str> {
        self.last_engine_error.as_deref()
    }

    // ── Observers ───────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, field: Field, observer: F) -> SubscriptionId
    where
        F: FnMut(&Change) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        let observer: Observer = Rc::new(RefCell::new(observer));
        self.observers.push((id, field, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _, _)| *sub != id);
        self.observers.len() != before
    }

    fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.observers.iter().any(|(sub, _, _)| *sub == id)
    }

    /// Changes queued since the last delivery.
    pub fn pending_changes(&self) -> &[Change] {
        &self.pending
    }

    fn notify(&mut self, change: Change) {
        self.pending.push(change);
    }

    /// Run observers for every queued change, in order.
    ///
    /// The store is borrowed only to take the queue, never while an observer
    /// runs. An observer unsubscribed mid-delivery gets nothing further.
    pub fn deliver_changes(store: &RefCell<Store>) {
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let (changes, observers) = {
                let Ok(mut inner) = store.try_borrow_mut() else {
                    debug!(target: "core::store", "Store busy, delivery deferred");
                    return;
                };
                if inner.pending.is_empty() {
                    return;
                }
                let observers: Vec<_> = inner
                    .observers
                    .iter()
                    .map(|(id, field, observer)| (*id, *field, Rc::clone(observer)))
                    .collect();
                (std::mem::take(&mut inner.pending), observers)
            };

            for change in &changes {
                let field = change.field();
                for (id, wanted, observer) in &observers {
                    if *wanted != field || !store.borrow().is_subscribed(*id) {
                        continue;
                    }
                    match observer.try_borrow_mut() {
                        Ok(mut observer) => (&mut *observer)(change),
                        Err(_) => warn!(target: "core::store", "Observer re-entered, {:?} skipped", field),
                    }
                }
            }
        }
        debug!(target: "core::store", "Observers still raising changes, rest deferred");
    }

    // ── User intents ────────────────────────────────────────────

    /// Toggle one step and forward the new state. Returns it.
    pub fn on_click_step(&mut self, track: u8, index: usize) -> Result<bool, StoreError> {
        let track = TrackId::new(track).ok_or(StoreError::InvalidTrack(track))?;
        let active = self.sequences[track.index()]
            .toggle(index)
            .ok_or(StoreError::InvalidStep(index))?;

        self.notify(Change::Step { track, index, active });
        self.send(Command::SetStep {
            track,
            step: index,
            active,
        });
        Ok(active)
    }

    /// Clamp to the declared range, update optimistically, forward.
    /// Returns the value actually sent.
    pub fn set_parameter(&mut self, id: &ParameterId, value: f32) -> Result<f32, StoreError> {
        let declaration = self
            .declarations
            .get(id)
            .ok_or_else(|| StoreError::Undeclared(id.clone()))?;
        let value = declaration.clamp(value);

        self.values.insert(id.clone(), value);
        self.notify(Change::ParameterValue { id: id.clone(), value });
        self.send(Command::SetParameter { id: id.clone(), value });
        Ok(value)
    }

    /// Move a parameter by a fraction of its range, as a knob drag would.
    pub fn nudge_parameter(&mut self, id: &ParameterId, increase: bool, fraction: f32) -> Result<f32, StoreError> {
        let declaration = self
            .declarations
            .get(id)
            .ok_or_else(|| StoreError::Undeclared(id.clone()))?;
        let current = self.values.get(id).copied().unwrap_or_else(|| declaration.current());
        let next = declaration.nudge(current, increase, fraction);
        self.set_parameter(id, next)
    }

    pub fn transport(&mut self, command: TransportCommand) {
        self.send(Command::Transport(command));
    }

    /// Forward a UI log line to the engine.
    pub fn forward_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.send(Command::Log {
            level,
            message: message.into(),
        });
    }

    fn send(&mut self, command: Command) {
        let name = command.name();
        if let Err(e) = self.sink.dispatch(command) {
            warn!(target: "core::store", "{} not sent: {}", name, e);
        }
    }

    // ── Engine updates ──────────────────────────────────────────

    /// Replace every declaration and cached value.
    pub fn apply_declarations(&mut self, declarations: DeclarationSet) {
        self.values = declarations
            .iter()
            .map(|d| (d.id(), d.current()))
            .collect();
        self.declarations = declarations;
        info!(target: "core::store", "{} parameters declared", self.declarations.len());
        self.notify(Change::Declarations {
            count: self.declarations.len(),
        });
    }

    /// Engine-side value change. Last received wins over optimistic state.
    pub fn apply_parameter_value(&mut self, id: ParameterId, value: f32) {
        let Some(declaration) = self.declarations.get(&id) else {
            warn!(target: "core::store", "Ignoring value for undeclared parameter {}", id);
            return;
        };
        let value = declaration.clamp(value);
        self.values.insert(id.clone(), value);
        self.notify(Change::ParameterValue { id, value });
    }

    pub fn apply_sequence(&mut self, track: TrackId, active_steps: &[usize]) {
        if let Some(&bad) = active_steps.iter().find(|&&i| i >= STEP_COUNT) {
            warn!(target: "core::store", "Sequence for track {} has out-of-range step {}", track, bad);
        }
        self.sequences[track.index()] = StepSequence::from_active(active_steps.iter().copied());
        self.notify(Change::Sequence { track });
    }

    /// Record the latest position; observers hear about it on the next frame.
    pub fn set_playback_position(&mut self, position: Option<f64>) {
        self.position = position;
        self.position_dirty = true;
    }

    /// Publish at most one position change per frame.
    pub fn on_frame(&mut self) {
        if !self.position_dirty {
            return;
        }
        self.position_dirty = false;

        if self.position != self.published_position {
            self.published_position = self.position;
            self.notify(Change::Position(self.position));
        }

        let step = active_step_index(self.position);
        if step != self.playing_step {
            self.playing_step = step;
            self.notify(Change::PlayingStep(step));
        }
    }

    pub fn record_engine_error(&mut self, message: String) {
        self.last_engine_error = Some(message.clone());
        self.notify(Change::EngineError(message));
    }

    /// Going `Disconnected` ends the session: declarations are dropped.
    pub fn set_connection(&mut self, status: ConnectionStatus) {
        if status == self.connection {
            return;
        }
        debug!(target: "core::store", "Connection {:?} -> {:?}", self.connection, status);
        self.connection = status;
        self.notify(Change::Connection(status));

        if status == ConnectionStatus::Disconnected && !self.declarations.is_empty() {
            self.apply_declarations(DeclarationSet::new());
        }
    }
}
