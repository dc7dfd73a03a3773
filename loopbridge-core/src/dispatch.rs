//! Outbound command routing.
//!
//! UI intents become [`Command`]s and go through one [`CommandSink`]. The
//! [`CommandRouter`] decides per command whether it travels as an OSC
//! datagram or as a structured message on the duplex channel; the store
//! never knows which.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use loopbridge_net::datagram::InvalidAddress;
use loopbridge_net::{
    ClientMessage, DatagramChannel, DatagramCommand, DuplexTransport, LogLevel, OscAddress, OscArg,
    SendError, TransportError, DEFAULT_CHANNEL,
};
use loopbridge_types::{ParameterId, TrackId, TrackScope};

/// Looper transport controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCommand {
    Record,
    Play,
    Clear,
}

impl TransportCommand {
    pub fn datagram(self) -> DatagramCommand {
        match self {
            TransportCommand::Record => DatagramCommand::record(),
            TransportCommand::Play => DatagramCommand::play(),
            TransportCommand::Clear => DatagramCommand::clear(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `value` is already clamped to the declared range.
    SetParameter { id: ParameterId, value: f32 },
    SetStep { track: TrackId, step: usize, active: bool },
    Transport(TransportCommand),
    Log { level: LogLevel, message: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetParameter { .. } => "SetParameter",
            Command::SetStep { .. } => "SetStep",
            Command::Transport(_) => "Transport",
            Command::Log { .. } => "Log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Datagram(#[from] SendError),
    #[error(transparent)]
    Address(#[from] InvalidAddress),
    #[error("{0} cannot be sent on this channel")]
    Unsupported(&'static str),
    #[error("no channel available for {0}")]
    NoRoute(&'static str),
}

/// Anything that can carry a command towards the engine.
pub trait CommandSink {
    fn dispatch(&mut self, command: Command) -> Result<(), CommandError>;
}

/// Structured messages on the duplex transport.
pub struct DuplexSink {
    transport: Rc<RefCell<DuplexTransport>>,
    channel: String,
}

impl DuplexSink {
    pub fn new(transport: Rc<RefCell<DuplexTransport>>) -> Self {
        Self {
            transport,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl CommandSink for DuplexSink {
    fn dispatch(&mut self, command: Command) -> Result<(), CommandError> {
        let message = match command {
            Command::SetParameter { id, value } => ClientMessage::SetParameter {
                track: id.scope,
                name: id.name,
                value,
            },
            Command::SetStep { track, step, active } => ClientMessage::SetStep { track, step, active },
            Command::Log { level, message } => ClientMessage::Log { level, message },
            Command::Transport(_) => return Err(CommandError::Unsupported("Transport")),
        };
        self.transport
            .borrow_mut()
            .post_message(&self.channel, &message)?;
        Ok(())
    }
}

/// OSC datagrams. Master parameters go to `/<name>`, track parameters to
/// `/track/<n>/<name>`.
pub struct DatagramSink {
    channel: DatagramChannel,
}

impl DatagramSink {
    pub fn new(channel: DatagramChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &DatagramChannel {
        &self.channel
    }
}

pub fn parameter_address(id: &ParameterId) -> Result<OscAddress, InvalidAddress> {
    match id.scope {
        TrackScope::Master => OscAddress::parse(&format!("/{}", id.name)),
        TrackScope::Track(track) => OscAddress::parse(&format!("/track/{}/{}", track.number(), id.name)),
    }
}

impl CommandSink for DatagramSink {
    fn dispatch(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::SetParameter { id, value } => {
                let address = parameter_address(&id)?;
                self.channel.send(&address, vec![OscArg::Float(value)])?;
            }
            Command::Transport(transport) => self.channel.send_command(&transport.datagram())?,
            other => return Err(CommandError::Unsupported(other.name())),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Datagram,
    Duplex,
}

/// Picks a backing per command. Either backing may be absent.
pub struct CommandRouter {
    duplex: Option<Box<dyn CommandSink>>,
    datagram: Option<Box<dyn CommandSink>>,
    datagram_parameters: HashSet<String>,
}

impl CommandRouter {
    pub fn new(
        duplex: Option<Box<dyn CommandSink>>,
        datagram: Option<Box<dyn CommandSink>>,
        datagram_parameters: HashSet<String>,
    ) -> Self {
        Self {
            duplex,
            datagram,
            datagram_parameters,
        }
    }

    pub fn route(&self, command: &Command) -> Route {
        match command {
            Command::Transport(_) => Route::Datagram,
            Command::SetParameter { id, .. } if self.datagram_parameters.contains(&id.name) => Route::Datagram,
            _ => Route::Duplex,
        }
    }
}

impl CommandSink for CommandRouter {
    fn dispatch(&mut self, command: Command) -> Result<(), CommandError> {
        let route = self.route(&command);
        let sink = match route {
            Route::Datagram => self.datagram.as_mut(),
            Route::Duplex => self.duplex.as_mut(),
        };
        let Some(sink) = sink else {
            return Err(CommandError::NoRoute(command.name()));
        };
        debug!(target: "core::dispatch", "{} via {:?}", command.name(), route);
        sink.dispatch(command)
    }
}

/// Records every command. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    commands: Rc<RefCell<Vec<Command>>>,
    failure: Option<CommandError>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records commands but reports `error` for each one.
    pub fn failing(error: CommandError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn clear(&self) {
        self.commands.borrow_mut().clear();
    }

    pub fn count<F: Fn(&Command) -> bool>(&self, f: F) -> usize {
        self.commands.borrow().iter().filter(|c| f(c)).count()
    }
}

impl CommandSink for RecordingSink {
    fn dispatch(&mut self, command: Command) -> Result<(), CommandError> {
        self.commands.borrow_mut().push(command);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
