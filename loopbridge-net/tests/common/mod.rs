#![allow(dead_code)]
//! Test harness utilities for loopbridge-net integration tests.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use loopbridge_net::framing::{read_message, write_message};
use loopbridge_net::protocol::{Frame, PROTOCOL_VERSION};
use loopbridge_net::{DuplexTransport, HostEvent, HostPeer, TransportEvent, TransportOptions};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Bind a host on an ephemeral loopback port.
pub fn bind_host() -> (HostPeer, String) {
    let host = HostPeer::bind("127.0.0.1:0").unwrap();
    let addr = host.local_addr().unwrap().to_string();
    (host, addr)
}

pub fn options_for(addr: &str) -> TransportOptions {
    TransportOptions {
        address: addr.to_string(),
        ..TransportOptions::default()
    }
}

/// Drive both ends until the transport reports an event, or timeout.
pub fn drive_until_transport_event(
    host: &mut HostPeer,
    transport: &mut DuplexTransport,
    timeout: Duration,
) -> (Vec<TransportEvent>, Vec<HostEvent>) {
    let start = Instant::now();
    let mut host_events = Vec::new();
    while start.elapsed() < timeout {
        host_events.extend(host.poll());
        let events = transport.poll();
        if !events.is_empty() {
            host_events.extend(host.poll());
            return (events, host_events);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for a transport event (state {:?})", transport.state());
}

/// Drive the host (and the transport, so listeners fire) until the host
/// reports at least `expected` events.
pub fn drive_host_events(
    host: &mut HostPeer,
    transport: &mut DuplexTransport,
    expected: usize,
    timeout: Duration,
) -> Vec<HostEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < timeout {
        events.extend(host.poll());
        transport.poll();
        if events.len() >= expected {
            return events;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for {} host events (have {:?})", expected, events);
}

/// Poll the transport for `duration`, collecting any events.
pub fn drain_transport(transport: &mut DuplexTransport, duration: Duration) -> Vec<TransportEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < duration {
        events.extend(transport.poll());
        std::thread::sleep(Duration::from_millis(5));
    }
    events
}

/// Set up a transport against `host` and wait until it is ready.
pub fn connect_ready(host: &mut HostPeer, addr: &str) -> DuplexTransport {
    let mut transport = DuplexTransport::new(options_for(addr));
    transport.setup().unwrap();
    let (events, _) = drive_until_transport_event(host, &mut transport, TIMEOUT);
    assert!(
        matches!(events[0], TransportEvent::Ready { .. }),
        "expected Ready, got {:?}",
        events
    );
    transport
}

/// A raw TCP peer for protocol-level tests.
pub struct RawClient {
    pub reader: BufReader<TcpStream>,
    pub writer: BufWriter<TcpStream>,
}

impl RawClient {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    pub fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        write_message(&mut self.writer, frame)
    }

    pub fn recv(&mut self) -> std::io::Result<Frame> {
        read_message(&mut self.reader)
    }

    pub fn send_hello(&mut self, name: &str, channels: &[&str]) -> std::io::Result<()> {
        self.send(&Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: name.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
        })
    }
}

/// Poll the host until `count` events arrive.
pub fn drive_host(host: &mut HostPeer, count: usize, timeout: Duration) -> Vec<HostEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < timeout {
        events.extend(host.poll());
        if events.len() >= count {
            return events;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for {} host events (have {:?})", count, events);
}

/// Poll the host for `duration` so it can answer handshakes that produce no event.
pub fn pump_host(host: &mut HostPeer, duration: Duration) -> Vec<HostEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < duration {
        events.extend(host.poll());
        std::thread::sleep(Duration::from_millis(5));
    }
    events
}
