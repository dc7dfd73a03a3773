//! Duplex session transport.
//!
//! A bidirectional, handshake-gated channel to the engine host. The
//! connection and all blocking reads live on a background thread; the UI
//! thread drives everything else through [`DuplexTransport::poll`], which
//! resolves the handshake and invokes listeners in receive order. Outbound
//! frames are encoded on the caller's thread and handed to a writer thread
//! through a bounded queue, so a stalled host never blocks the caller.
//!
//! States: `Uninitialized → Handshaking → Ready → Closed`.
//!
//! - A failed handshake or a lost connection returns to `Uninitialized`;
//!   the caller decides whether and when to call `setup()` again.
//! - `post_message` before `Ready` is rejected with
//!   [`TransportError::NotReady`]; nothing is held for a later session.
//! - A full outbound queue rejects the post with
//!   [`TransportError::QueueFull`].
//! - `close()` is terminal.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use crossbeam_channel::TrySendError;
use log::{debug, info, warn};
use thiserror::Error;

use crate::framing::{encode_frame, read_message, read_payload, write_message};
use crate::protocol::{
    decode_value, ClientMessage, DecodeError, EncodeError, Frame, ServerMessage, DEFAULT_CHANNEL,
    PROTOCOL_VERSION,
};

/// Default host address for the duplex channel.
pub const DEFAULT_DUPLEX_ADDR: &str = "127.0.0.1:1450";

/// Encoded frames waiting for the writer thread.
pub const WRITE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("transport is closed")]
    Closed,
    #[error("transport not ready (state: {0:?})")]
    NotReady(TransportState),
    #[error("setup() already called")]
    AlreadySetUp,
    #[error("channel {0:?} was not negotiated")]
    UnknownChannel(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("outbound queue full, host is not reading")]
    QueueFull,
    #[error("i/o error: {0}")]
    Io(String),
}

/// Things the caller needs to react to, returned from `poll()`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Ready { session_id: u64 },
    HandshakeFailed(TransportError),
    /// The session ended without `close()`; state is back to `Uninitialized`.
    Disconnected { reason: Option<String> },
}

/// A decoded message from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: u64,
    pub channel: String,
    pub message: ServerMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listeners run on the thread that calls `poll()`. They must not call back
/// into the transport.
type Listener = Box<dyn FnMut(&InboundMessage)>;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub address: String,
    pub client_name: String,
    /// Logical channels requested in the handshake.
    pub channels: Vec<String>,
    /// Depth of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_DUPLEX_ADDR.to_string(),
            client_name: "loopbridge".to_string(),
            channels: vec![DEFAULT_CHANNEL.to_string()],
            queue_capacity: WRITE_QUEUE_CAPACITY,
        }
    }
}

/// UI-side handle on the writer thread.
struct FrameWriter {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    /// Clone of the socket, used only to shut it down.
    stream: TcpStream,
}

impl FrameWriter {
    fn start(stream: TcpStream, capacity: usize) -> io::Result<Self> {
        let control = stream.try_clone()?;
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        thread::Builder::new()
            .name("duplex-writer".into())
            .spawn(move || writer_loop(stream, rx))?;
        Ok(Self { tx, stream: control })
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Messages from the connection thread.
enum Inbound {
    Connected {
        session_id: u64,
        channels: Vec<String>,
        stream: TcpStream,
    },
    HandshakeFailed(String),
    Message(InboundMessage),
    Malformed { channel: String, error: DecodeError },
    Disconnected(Option<String>),
}

pub struct DuplexTransport {
    options: TransportOptions,
    state: TransportState,
    inbound_rx: Option<Receiver<Inbound>>,
    writer: Option<FrameWriter>,
    session_id: Option<u64>,
    /// Channels the host accepted.
    channels: Vec<String>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
    next_message_id: u64,
}

impl DuplexTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            state: TransportState::Uninitialized,
            inbound_rx: None,
            writer: None,
            session_id: None,
            channels: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            next_message_id: 0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn negotiated_channels(&self) -> &[String] {
        &self.channels
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Start the handshake. Returns immediately; completion is reported by
    /// `poll()` as `Ready` or `HandshakeFailed`.
    pub fn setup(&mut self) -> Result<(), TransportError> {
        match self.state {
            TransportState::Uninitialized => {}
            TransportState::Handshaking | TransportState::Ready => {
                return Err(TransportError::AlreadySetUp)
            }
            TransportState::Closed => return Err(TransportError::Closed),
        }

        let hello = Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.options.client_name.clone(),
            channels: self.options.channels.clone(),
        };
        let address = self.options.address.clone();
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("duplex-transport".into())
            .spawn(move || connection_thread(address, hello, tx))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        info!(target: "net::transport", "Handshaking with {}", self.options.address);
        self.inbound_rx = Some(rx);
        self.state = TransportState::Handshaking;
        Ok(())
    }

    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&InboundMessage) + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Queue a message on a negotiated channel. Returns the envelope id.
    /// Never blocks on the socket.
    pub fn post_message(&mut self, channel: &str, message: &ClientMessage) -> Result<u64, TransportError> {
        match self.state {
            TransportState::Ready => {}
            TransportState::Closed => return Err(TransportError::Closed),
            other => return Err(TransportError::NotReady(other)),
        }
        if !self.channels.iter().any(|c| c == channel) {
            return Err(TransportError::UnknownChannel(channel.to_string()));
        }

        let id = self.next_message_id;
        let frame = Frame::message(id, channel, message)?;
        let bytes = encode_frame(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        let writer = self.writer.as_ref().ok_or(TransportError::Closed)?;

        match writer.tx.try_send(bytes) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(target: "net::transport", "Outbound queue full, dropping {}", message.type_name());
                return Err(TransportError::QueueFull);
            }
            // The writer hit an error and shut the socket; poll() will
            // report the disconnect.
            Err(TrySendError::Disconnected(_)) => {
                return Err(TransportError::Io("connection writer stopped".into()));
            }
        }

        self.next_message_id += 1;
        debug!(target: "net::transport", "Posted {} #{} on {:?}", message.type_name(), id, channel);
        Ok(id)
    }

    /// Drain everything the connection thread produced since the last call.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Some(rx) = self.inbound_rx.as_ref() else {
            return events;
        };

        let mut inbound = Vec::new();
        let mut thread_gone = false;
        loop {
            match rx.try_recv() {
                Ok(item) => inbound.push(item),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    thread_gone = true;
                    break;
                }
            }
        }

        for item in inbound {
            match item {
                Inbound::Connected { session_id, channels, stream } => {
                    if self.state != TransportState::Handshaking {
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    let writer = match FrameWriter::start(stream, self.options.queue_capacity) {
                        Ok(writer) => writer,
                        Err(e) => {
                            warn!(target: "net::transport", "Could not start writer: {}", e);
                            self.reset();
                            events.push(TransportEvent::HandshakeFailed(TransportError::Io(e.to_string())));
                            continue;
                        }
                    };
                    info!(
                        target: "net::transport",
                        "Session {} ready, channels {:?}", session_id, channels
                    );
                    self.writer = Some(writer);
                    self.session_id = Some(session_id);
                    self.channels = channels;
                    self.state = TransportState::Ready;
                    events.push(TransportEvent::Ready { session_id });
                }
                Inbound::HandshakeFailed(reason) => {
                    warn!(target: "net::transport", "Handshake failed: {}", reason);
                    self.reset();
                    events.push(TransportEvent::HandshakeFailed(TransportError::HandshakeFailed(reason)));
                }
                Inbound::Message(message) => self.deliver(&message),
                Inbound::Malformed { channel, error } => {
                    warn!(target: "net::transport", "Dropping message on {:?}: {}", channel, error);
                }
                Inbound::Disconnected(reason) => {
                    if self.state == TransportState::Ready {
                        info!(target: "net::transport", "Session ended: {:?}", reason);
                        self.reset();
                        events.push(TransportEvent::Disconnected { reason });
                    }
                }
            }
        }

        if thread_gone && matches!(self.state, TransportState::Handshaking | TransportState::Ready) {
            let was_ready = self.state == TransportState::Ready;
            self.reset();
            let reason = "connection thread exited".to_string();
            events.push(if was_ready {
                TransportEvent::Disconnected { reason: Some(reason) }
            } else {
                TransportEvent::HandshakeFailed(TransportError::HandshakeFailed(reason))
            });
        }

        events
    }

    /// Send `Goodbye` if connected and stop for good.
    ///
    /// Frames already queued go out ahead of `Goodbye`. If the queue is
    /// full the socket is shut down at once instead.
    pub fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        if let Some(writer) = self.writer.take() {
            let queued = match encode_frame(&Frame::Goodbye) {
                Ok(bytes) => writer.tx.try_send(bytes).is_ok(),
                Err(_) => false,
            };
            // Otherwise dropping the sender lets the writer drain and shut
            // the socket itself.
            if !queued {
                writer.shutdown();
            }
        }
        self.inbound_rx = None;
        self.session_id = None;
        self.channels.clear();
        self.state = TransportState::Closed;
        info!(target: "net::transport", "Transport closed");
    }

    fn deliver(&mut self, message: &InboundMessage) {
        if self.state != TransportState::Ready {
            return;
        }
        if !self.channels.iter().any(|c| *c == message.channel) {
            warn!(
                target: "net::transport",
                "Dropping {} on unnegotiated channel {:?}", message.message.type_name(), message.channel
            );
            return;
        }
        for (_, listener) in self.listeners.iter_mut() {
            listener(message);
        }
    }

    fn reset(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.shutdown();
        }
        self.inbound_rx = None;
        self.session_id = None;
        self.channels.clear();
        self.state = TransportState::Uninitialized;
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect, handshake, then read frames until the connection ends.
fn connection_thread(address: String, hello: Frame, tx: Sender<Inbound>) {
    let (stream, mut reader, session_id, channels) = match handshake(&address, &hello) {
        Ok(parts) => parts,
        Err(reason) => {
            let _ = tx.send(Inbound::HandshakeFailed(reason));
            return;
        }
    };

    if tx.send(Inbound::Connected { session_id, channels, stream }).is_err() {
        return;
    }

    loop {
        let payload = match read_payload(&mut reader) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = (e.kind() != io::ErrorKind::UnexpectedEof).then(|| e.to_string());
                let _ = tx.send(Inbound::Disconnected(reason));
                break;
            }
        };

        let frame: Frame = match serde_json::from_slice(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "net::transport", "Skipping unreadable frame: {}", e);
                continue;
            }
        };

        let item = match frame {
            Frame::Message(envelope) => match decode_value(envelope.message) {
                Ok(message) => Inbound::Message(InboundMessage {
                    id: envelope.id,
                    channel: envelope.channel,
                    message,
                }),
                Err(error) => Inbound::Malformed {
                    channel: envelope.channel,
                    error,
                },
            },
            Frame::Goodbye => {
                let _ = tx.send(Inbound::Disconnected(Some("host closed the session".into())));
                break;
            }
            other => {
                warn!(target: "net::transport", "Unexpected frame after handshake: {:?}", other);
                continue;
            }
        };

        if tx.send(item).is_err() {
            // Transport dropped or reset.
            break;
        }
    }

    debug!(target: "net::transport", "Connection thread exiting");
}

/// Write queued frames until the queue is dropped or the socket fails,
/// then shut the socket so the reader thread sees the end.
fn writer_loop(stream: TcpStream, rx: crossbeam_channel::Receiver<Vec<u8>>) {
    let mut writer = BufWriter::new(stream);
    for bytes in rx.iter() {
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            warn!(target: "net::transport", "Write failed, dropping connection: {}", e);
            break;
        }
    }
    let _ = writer.get_ref().shutdown(Shutdown::Both);
    debug!(target: "net::transport", "Writer thread exiting");
}

type Handshake = (TcpStream, BufReader<TcpStream>, u64, Vec<String>);

fn handshake(address: &str, hello: &Frame) -> Result<Handshake, String> {
    let stream = TcpStream::connect(address).map_err(|e| format!("connect to {}: {}", address, e))?;
    let _ = stream.set_nodelay(true);

    let mut writer = BufWriter::new(stream.try_clone().map_err(|e| e.to_string())?);
    write_message(&mut writer, hello).map_err(|e| format!("send Hello: {}", e))?;

    // The reader outlives the handshake: it may already hold frames sent
    // right after Welcome.
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| e.to_string())?);
    match read_message::<_, Frame>(&mut reader).map_err(|e| format!("read Welcome: {}", e))? {
        Frame::Welcome { session_id, channels } => Ok((stream, reader, session_id, channels)),
        Frame::Rejected { reason } => Err(format!("rejected by host: {}", reason)),
        other => Err(format!("expected Welcome, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_before_setup_is_rejected() {
        let mut transport = DuplexTransport::new(TransportOptions::default());
        let err = transport
            .post_message(DEFAULT_CHANNEL, &ClientMessage::AppStarted)
            .unwrap_err();
        assert_eq!(err, TransportError::NotReady(TransportState::Uninitialized));
    }

    #[test]
    fn poll_before_setup_is_empty() {
        let mut transport = DuplexTransport::new(TransportOptions::default());
        assert!(transport.poll().is_empty());
        assert_eq!(transport.state(), TransportState::Uninitialized);
    }

    #[test]
    fn listeners_register_and_remove() {
        let mut transport = DuplexTransport::new(TransportOptions::default());
        let a = transport.add_listener(|_| {});
        let b = transport.add_listener(|_| {});
        assert_ne!(a, b);
        assert_eq!(transport.listener_count(), 2);
        assert!(transport.remove_listener(a));
        assert!(!transport.remove_listener(a));
        assert_eq!(transport.listener_count(), 1);
    }

    #[test]
    fn closed_is_terminal() {
        let mut transport = DuplexTransport::new(TransportOptions::default());
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.setup(), Err(TransportError::Closed));
        assert_eq!(
            transport.post_message(DEFAULT_CHANNEL, &ClientMessage::AppStarted),
            Err(TransportError::Closed)
        );
        transport.close();
    }
}
