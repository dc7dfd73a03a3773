//! Engine side of the duplex channel.
//!
//! Accepts connections, completes the `Hello`/`Welcome` handshake and hands
//! decoded client messages to the caller through [`HostPeer::poll`]. One UI
//! session is served at a time; a second `Hello` while a session is active is
//! rejected.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use log::{error, info, warn};

use loopbridge_types::DeclarationSet;

use crate::framing::{read_payload, write_message};
use crate::protocol::{
    decode_client_value, ClientMessage, DecodeError, Frame, ServerMessage, DEFAULT_CHANNEL,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionStarted {
        session_id: u64,
        client_name: String,
        channels: Vec<String>,
    },
    Message {
        id: u64,
        channel: String,
        message: ClientMessage,
    },
    /// A message frame whose body did not decode; the session continues.
    Malformed { channel: String, error: DecodeError },
    SessionEnded { session_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionId(u64);

/// What a connection's reader thread reports.
enum PeerInbound {
    Hello {
        protocol_version: u32,
        client_name: String,
        channels: Vec<String>,
    },
    Message {
        id: u64,
        channel: String,
        message: ClientMessage,
    },
    Malformed { channel: String, error: DecodeError },
    Closed,
}

struct Session {
    id: u64,
    connection: ConnectionId,
    writer: BufWriter<TcpStream>,
    channels: Vec<String>,
}

pub struct HostPeer {
    listener: TcpListener,
    /// Connections that have not completed the handshake.
    pending: HashMap<ConnectionId, BufWriter<TcpStream>>,
    session: Option<Session>,
    inbound_rx: Receiver<(ConnectionId, PeerInbound)>,
    inbound_tx: Sender<(ConnectionId, PeerInbound)>,
    channels: Vec<String>,
    rejection: Option<String>,
    next_connection_id: u64,
    next_session_id: u64,
    next_message_id: u64,
}

impl HostPeer {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (inbound_tx, inbound_rx) = mpsc::channel();

        info!(target: "net::host", "Host listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            pending: HashMap::new(),
            session: None,
            inbound_rx,
            inbound_tx,
            channels: vec![DEFAULT_CHANNEL.to_string()],
            rejection: None,
            next_connection_id: 0,
            next_session_id: 1,
            next_message_id: 0,
        })
    }

    /// Channels this host serves. Requested channels outside this set are dropped
    /// from the `Welcome`.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Refuse every handshake with `reason`.
    pub fn with_rejection(mut self, reason: impl Into<String>) -> Self {
        self.rejection = Some(reason.into());
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let connection = ConnectionId(self.next_connection_id);
                    self.next_connection_id += 1;

                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            error!(target: "net::host", "Failed to clone stream: {}", e);
                            continue;
                        }
                    };
                    // Accepted sockets may inherit non-blocking mode.
                    let _ = read_stream.set_nonblocking(false);
                    let _ = stream.set_nodelay(true);

                    let inbound_tx = self.inbound_tx.clone();
                    let spawned = thread::Builder::new()
                        .name("host-reader".into())
                        .spawn(move || connection_reader_thread(connection, read_stream, inbound_tx));
                    if let Err(e) = spawned {
                        error!(target: "net::host", "Failed to spawn reader for {}: {}", addr, e);
                        continue;
                    }

                    self.pending.insert(connection, BufWriter::new(stream));
                    info!(target: "net::host", "Connection {:?} from {}, awaiting Hello", connection, addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "net::host", "Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Accept new connections and drain everything the reader threads produced.
    pub fn poll(&mut self) -> Vec<HostEvent> {
        self.accept_connections();

        let mut events = Vec::new();
        while let Ok((connection, inbound)) = self.inbound_rx.try_recv() {
            match inbound {
                PeerInbound::Hello {
                    protocol_version,
                    client_name,
                    channels,
                } => {
                    if let Some(event) = self.handle_hello(connection, protocol_version, client_name, channels) {
                        events.push(event);
                    }
                }
                PeerInbound::Message { id, channel, message } => {
                    if self.is_session(connection) {
                        events.push(HostEvent::Message { id, channel, message });
                    } else {
                        warn!(target: "net::host", "Message from {:?} before handshake, dropping", connection);
                    }
                }
                PeerInbound::Malformed { channel, error } => {
                    if self.is_session(connection) {
                        warn!(target: "net::host", "Malformed message on {:?}: {}", channel, error);
                        events.push(HostEvent::Malformed { channel, error });
                    }
                }
                PeerInbound::Closed => {
                    self.pending.remove(&connection);
                    if self.is_session(connection) {
                        if let Some(session) = self.session.take() {
                            info!(target: "net::host", "Session {} ended", session.id);
                            events.push(HostEvent::SessionEnded { session_id: session.id });
                        }
                    }
                }
            }
        }
        events
    }

    /// Send a message to the active session. Returns the envelope id.
    pub fn send(&mut self, channel: &str, message: &ServerMessage) -> io::Result<u64> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no active session"))?;
        if !session.channels.iter().any(|c| c == channel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel {:?} was not negotiated", channel),
            ));
        }

        let id = self.next_message_id;
        let frame = Frame::message(id, channel, message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Err(e) = write_message(&mut session.writer, &frame) {
            warn!(target: "net::host", "Failed to send to session {}: {}", session.id, e);
            let _ = session.writer.get_ref().shutdown(Shutdown::Both);
            return Err(e);
        }
        self.next_message_id += 1;
        Ok(id)
    }

    pub fn publish_parameters(&mut self, parameters: DeclarationSet) -> io::Result<u64> {
        self.send(DEFAULT_CHANNEL, &ServerMessage::PublishParameters { parameters })
    }

    /// Say goodbye and drop the active session. The client sees `Disconnected`.
    pub fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = write_message(&mut session.writer, &Frame::Goodbye);
            let _ = session.writer.get_ref().shutdown(Shutdown::Both);
            info!(target: "net::host", "Ended session {}", session.id);
        }
    }

    fn is_session(&self, connection: ConnectionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.connection == connection)
    }

    fn handle_hello(
        &mut self,
        connection: ConnectionId,
        protocol_version: u32,
        client_name: String,
        requested: Vec<String>,
    ) -> Option<HostEvent> {
        let mut writer = self.pending.remove(&connection)?;

        let granted: Vec<String> = requested
            .into_iter()
            .filter(|c| self.channels.contains(c))
            .collect();

        let refusal = if let Some(reason) = &self.rejection {
            Some(reason.clone())
        } else if protocol_version != PROTOCOL_VERSION {
            Some(format!(
                "unsupported protocol version {} (expected {})",
                protocol_version, PROTOCOL_VERSION
            ))
        } else if self.session.is_some() {
            Some("a session is already active".to_string())
        } else if granted.is_empty() {
            Some("no common channels".to_string())
        } else {
            None
        };

        if let Some(reason) = refusal {
            info!(target: "net::host", "Rejecting {:?} ({}): {}", connection, client_name, reason);
            let _ = write_message(&mut writer, &Frame::Rejected { reason });
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            return None;
        }

        let session_id = self.next_session_id;
        let welcome = Frame::Welcome {
            session_id,
            channels: granted.clone(),
        };
        if let Err(e) = write_message(&mut writer, &welcome) {
            error!(target: "net::host", "Failed to send Welcome to {:?}: {}", connection, e);
            return None;
        }
        self.next_session_id += 1;

        info!(target: "net::host", "Session {} started for {}", session_id, client_name);
        self.session = Some(Session {
            id: session_id,
            connection,
            writer,
            channels: granted.clone(),
        });

        Some(HostEvent::SessionStarted {
            session_id,
            client_name,
            channels: granted,
        })
    }
}

fn connection_reader_thread(
    connection: ConnectionId,
    stream: TcpStream,
    inbound_tx: Sender<(ConnectionId, PeerInbound)>,
) {
    let mut reader = BufReader::new(stream);

    loop {
        let payload = match read_payload(&mut reader) {
            Ok(payload) => payload,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "net::host", "Connection {:?} read error: {}", connection, e);
                }
                break;
            }
        };

        let inbound = match serde_json::from_slice::<Frame>(&payload) {
            Ok(Frame::Hello {
                protocol_version,
                client_name,
                channels,
            }) => PeerInbound::Hello {
                protocol_version,
                client_name,
                channels,
            },
            Ok(Frame::Message(envelope)) => match decode_client_value(envelope.message) {
                Ok(message) => PeerInbound::Message {
                    id: envelope.id,
                    channel: envelope.channel,
                    message,
                },
                Err(error) => PeerInbound::Malformed {
                    channel: envelope.channel,
                    error,
                },
            },
            Ok(Frame::Goodbye) => break,
            Ok(other) => {
                warn!(target: "net::host", "Unexpected frame from {:?}: {:?}", connection, other);
                continue;
            }
            Err(e) => {
                warn!(target: "net::host", "Skipping unreadable frame from {:?}: {}", connection, e);
                continue;
            }
        };

        if inbound_tx.send((connection, inbound)).is_err() {
            return;
        }
    }

    let _ = inbound_tx.send((connection, PeerInbound::Closed));
}
