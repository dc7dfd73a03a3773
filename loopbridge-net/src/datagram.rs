//! Fire-and-forget OSC control channel.
//!
//! Discrete UI actions (transport buttons, a knob's float) are encoded as one
//! OSC message each and pushed to a bounded queue. A dedicated sender thread
//! drains the queue and performs `socket.send_to()`, so `send` never blocks
//! the UI thread. Nothing is acknowledged or retried: an engine that is not
//! listening looks exactly like a lost packet.

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rosc::{OscMessage, OscPacket, OscType};
use thiserror::Error;

pub const DEFAULT_DATAGRAM_PORT: u16 = 1449;

pub const VOLUME: &str = "/volume";
pub const LOOPER_RECORD: &str = "/looper/record";
pub const LOOPER_PLAY: &str = "/looper/play";
pub const LOOPER_CLEAR: &str = "/looper/clear";

/// Queue depth between `send` and the sender thread. UI actions arrive at
/// human rates, so a full queue means the socket is wedged.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Local send-path failure. Callers log and drop these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("failed to encode OSC packet: {0}")]
    Encode(String),
    #[error("OSC send queue full")]
    QueueFull,
    #[error("OSC socket unavailable")]
    SocketUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid OSC address {0:?}")]
pub struct InvalidAddress(pub String);

/// A validated, slash-delimited OSC address such as `/looper/record`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OscAddress(String);

impl OscAddress {
    pub fn parse(path: &str) -> Result<Self, InvalidAddress> {
        let valid = path.starts_with('/')
            && path.len() > 1
            && path[1..].split('/').all(|segment| !segment.is_empty())
            && !path
                .chars()
                .any(|c| c.is_whitespace() || "#*,?[]{}".contains(c));
        if valid {
            Ok(Self(path.to_string()))
        } else {
            Err(InvalidAddress(path.to_string()))
        }
    }

    /// For the address constants in this module, which are known to be valid.
    fn known(path: &'static str) -> Self {
        Self(path.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for OscAddress {
    type Error = InvalidAddress;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        OscAddress::parse(path)
    }
}

impl fmt::Display for OscAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed OSC argument, so callers don't depend on `rosc`.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Float(f32),
    Int(i32),
    Str(String),
    Bool(bool),
}

impl From<OscArg> for OscType {
    fn from(arg: OscArg) -> Self {
        match arg {
            OscArg::Float(v) => OscType::Float(v),
            OscArg::Int(v) => OscType::Int(v),
            OscArg::Str(v) => OscType::String(v),
            OscArg::Bool(v) => OscType::Bool(v),
        }
    }
}

/// One outbound datagram: address plus ordered arguments. No reply is modelled.
#[derive(Debug, Clone, PartialEq)]
pub struct DatagramCommand {
    pub address: OscAddress,
    pub args: Vec<OscArg>,
}

impl DatagramCommand {
    pub fn new(address: OscAddress, args: Vec<OscArg>) -> Self {
        Self { address, args }
    }

    /// `/volume` with one float, clamped to `0..=1`.
    pub fn volume(value: f32) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self::new(OscAddress::known(VOLUME), vec![OscArg::Float(value)])
    }

    pub fn record() -> Self {
        Self::new(OscAddress::known(LOOPER_RECORD), vec![])
    }

    pub fn play() -> Self {
        Self::new(OscAddress::known(LOOPER_PLAY), vec![])
    }

    pub fn clear() -> Self {
        Self::new(OscAddress::known(LOOPER_CLEAR), vec![])
    }

    pub fn encode(&self) -> Result<Vec<u8>, SendError> {
        encode_message(&self.address, self.args.clone())
    }
}

fn encode_message(address: &OscAddress, args: Vec<OscArg>) -> Result<Vec<u8>, SendError> {
    let packet = OscPacket::Message(OscMessage {
        addr: address.as_str().to_string(),
        args: args.into_iter().map(OscType::from).collect(),
    });
    rosc::encoder::encode(&packet).map_err(|e| SendError::Encode(e.to_string()))
}

/// Best-effort UDP sender with a background `osc-sender` thread.
pub struct DatagramChannel {
    target: SocketAddr,
    tx: Sender<Vec<u8>>,
    sent: Arc<AtomicU64>,
    _sender: JoinHandle<()>,
}

impl DatagramChannel {
    pub fn open(target: SocketAddr) -> io::Result<Self> {
        Self::with_capacity(target, SEND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(target: SocketAddr, capacity: usize) -> io::Result<Self> {
        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(capacity.max(1));
        let sent = Arc::new(AtomicU64::new(0));
        let sent_clone = Arc::clone(&sent);

        let handle = thread::Builder::new()
            .name("osc-sender".into())
            .spawn(move || sender_loop(socket, target, rx, sent_clone))?;

        log::info!(target: "net::datagram", "OSC channel sending to {}", target);

        Ok(Self {
            target,
            tx,
            sent,
            _sender: handle,
        })
    }

    /// Queue one datagram. Never blocks.
    pub fn send(&self, address: &OscAddress, args: Vec<OscArg>) -> Result<(), SendError> {
        let packet = encode_message(address, args)?;
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SendError::SocketUnavailable),
        }
    }

    pub fn send_command(&self, command: &DatagramCommand) -> Result<(), SendError> {
        self.send(&command.address, command.args.clone())
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Datagrams the sender thread has handed to the socket so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

fn sender_loop(socket: UdpSocket, target: SocketAddr, rx: Receiver<Vec<u8>>, sent: Arc<AtomicU64>) {
    while let Ok(packet) = rx.recv() {
        match socket.send_to(&packet, target) {
            Ok(_) => {
                sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::debug!(target: "net::datagram", "OSC send to {} failed: {}", target, e);
            }
        }
    }
    log::debug!(target: "net::datagram", "OSC sender thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(OscAddress::parse("/volume").is_ok());
        assert!(OscAddress::parse("/looper/record").is_ok());
        assert!(OscAddress::parse("volume").is_err());
        assert!(OscAddress::parse("/").is_err());
        assert!(OscAddress::parse("/looper//record").is_err());
        assert!(OscAddress::parse("/looper/").is_err());
        assert!(OscAddress::parse("/track 1").is_err());
        assert!(OscAddress::parse("/track/*").is_err());
    }

    #[test]
    fn known_addresses_are_valid() {
        for path in [VOLUME, LOOPER_RECORD, LOOPER_PLAY, LOOPER_CLEAR] {
            assert_eq!(OscAddress::parse(path).unwrap(), OscAddress::known(path));
        }
    }

    #[test]
    fn volume_is_clamped() {
        assert_eq!(DatagramCommand::volume(1.4).args, vec![OscArg::Float(1.0)]);
        assert_eq!(DatagramCommand::volume(-3.0).args, vec![OscArg::Float(0.0)]);
        assert_eq!(DatagramCommand::volume(f32::NAN).args, vec![OscArg::Float(0.0)]);
    }

    #[test]
    fn encodes_as_osc_message() {
        let bytes = DatagramCommand::volume(0.5).encode().unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();
        match packet {
            OscPacket::Message(msg) => {
                assert_eq!(msg.addr, "/volume");
                assert_eq!(msg.args, vec![OscType::Float(0.5)]);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn transport_commands_have_no_args() {
        for command in [DatagramCommand::record(), DatagramCommand::play(), DatagramCommand::clear()] {
            assert!(command.args.is_empty());
        }
        assert_eq!(DatagramCommand::play().address.as_str(), "/looper/play");
    }
}
