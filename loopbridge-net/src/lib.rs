//! Transport layer for the loopbridge control bridge.
//!
//! Two delivery paths connect a UI surface to the audio engine:
//!
//! - [`datagram`]: fire-and-forget OSC over UDP for discrete actions.
//! - [`transport`]: a duplex, handshake-gated channel carrying the JSON
//!   message envelopes defined in [`protocol`].
//!
//! [`host`] is the engine side of the duplex protocol.

pub mod datagram;
pub mod framing;
pub mod host;
pub mod protocol;
pub mod transport;

pub use datagram::{DatagramChannel, DatagramCommand, OscAddress, OscArg, SendError};
pub use host::{HostEvent, HostPeer};
pub use protocol::{
    decode, encode, ClientMessage, DecodeError, EncodeError, Envelope, LogLevel, ServerMessage,
    DEFAULT_CHANNEL,
};
pub use transport::{
    DuplexTransport, InboundMessage, ListenerId, TransportError, TransportEvent, TransportOptions,
    TransportState, DEFAULT_DUPLEX_ADDR, WRITE_QUEUE_CAPACITY,
};
