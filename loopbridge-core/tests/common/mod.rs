#![allow(dead_code)]
//! Test harness utilities for loopbridge-core integration tests.

use std::time::{Duration, Instant};

use loopbridge_core::{Bridge, Config};
use loopbridge_net::{HostEvent, HostPeer};

pub const TIMEOUT: Duration = Duration::from_secs(3);

pub fn bind_host() -> (HostPeer, String) {
    let host = HostPeer::bind("127.0.0.1:0").unwrap();
    let addr = host.local_addr().unwrap().to_string();
    (host, addr)
}

/// Config pointing at a local host with fast reconnects. `datagram_port`
/// points the OSC channel at a local receiver.
pub fn config_for(addr: &str, datagram_parameters: &[&str], datagram_port: Option<u16>) -> Config {
    let params = datagram_parameters
        .iter()
        .map(|p| format!("{:?}", p))
        .collect::<Vec<_>>()
        .join(", ");
    let port = datagram_port.unwrap_or(9);
    Config::from_toml_str(&format!(
        r#"
        [datagram]
        host = "127.0.0.1"
        port = {port}

        [duplex]
        address = "{addr}"
        client_name = "test-ui"

        [reconnect]
        initial_delay_ms = 10
        max_delay_ms = 40

        [routing]
        datagram_parameters = [{params}]
        "#
    ))
    .unwrap()
}

/// Tick the bridge and poll the host until `done` holds, or panic at `timeout`.
/// Returns every host event seen along the way.
pub fn drive_until<F>(bridge: &mut Bridge, host: &mut HostPeer, timeout: Duration, mut done: F) -> Vec<HostEvent>
where
    F: FnMut(&Bridge, &[HostEvent]) -> bool,
{
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < timeout {
        events.extend(host.poll());
        bridge.tick(Instant::now());
        events.extend(host.poll());
        if done(bridge, &events) {
            return events;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out (host events so far: {:?})", events);
}

/// Start a bridge against `host` and wait until the engine has seen `AppStarted`.
pub fn connected_bridge(host: &mut HostPeer, config: &Config) -> Bridge {
    let mut bridge = Bridge::start(config);
    drive_until(&mut bridge, host, TIMEOUT, |_, events| {
        events.iter().any(|e| matches!(e, HostEvent::Message { message: loopbridge_net::ClientMessage::AppStarted, .. }))
    });
    bridge
}
