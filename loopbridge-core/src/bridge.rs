//! Wires transport, router, store and handler together and drives them
//! from the UI loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::{error, info, warn};

use loopbridge_net::{ClientMessage, DatagramChannel, DuplexTransport, TransportEvent, TransportState, DEFAULT_CHANNEL};

use crate::config::Config;
use crate::dispatch::{CommandRouter, CommandSink, DatagramSink, DuplexSink};
use crate::handler::MessageHandlingService;
use crate::reconnect::Backoff;
use crate::store::{ConnectionStatus, Store};

pub struct Bridge {
    transport: Rc<RefCell<DuplexTransport>>,
    store: Rc<RefCell<Store>>,
    service: MessageHandlingService,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl Bridge {
    /// Build everything and begin the handshake. Never blocks on it: the
    /// store starts empty and `Connecting`.
    pub fn start(config: &Config) -> Self {
        let transport = Rc::new(RefCell::new(DuplexTransport::new(config.transport_options())));

        let datagram: Option<Box<dyn CommandSink>> =
            match DatagramChannel::with_capacity(config.datagram_target(), config.datagram_queue_capacity()) {
                Ok(channel) => Some(Box::new(DatagramSink::new(channel))),
                Err(e) => {
                    error!(target: "core::bridge", "OSC channel unavailable, datagram commands disabled: {}", e);
                    None
                }
            };
        let router = CommandRouter::new(
            Some(Box::new(DuplexSink::new(Rc::clone(&transport)))),
            datagram,
            config.datagram_parameters(),
        );

        let store = Rc::new(RefCell::new(Store::new(Box::new(router))));
        let mut service = MessageHandlingService::new(Rc::clone(&transport), Rc::clone(&store));
        service.start();

        let mut bridge = Self {
            transport,
            store,
            service,
            backoff: config.backoff(),
            retry_at: None,
        };
        bridge.connect(Instant::now());
        bridge
    }

    pub fn store(&self) -> &Rc<RefCell<Store>> {
        &self.store
    }

    pub fn transport(&self) -> &Rc<RefCell<DuplexTransport>> {
        &self.transport
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Call once per UI frame. Store observers run at the end, after every
    /// borrow taken here is released.
    pub fn tick(&mut self, now: Instant) {
        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            self.connect(now);
        }

        let events = self.transport.borrow_mut().poll();
        for event in events {
            match event {
                TransportEvent::Ready { session_id } => {
                    info!(target: "core::bridge", "Connected (session {})", session_id);
                    if let Err(e) = self
                        .transport
                        .borrow_mut()
                        .post_message(DEFAULT_CHANNEL, &ClientMessage::AppStarted)
                    {
                        warn!(target: "core::bridge", "AppStarted not sent: {}", e);
                    }
                    self.backoff.reset();
                    self.store.borrow_mut().set_connection(ConnectionStatus::Connected);
                }
                TransportEvent::HandshakeFailed(e) => {
                    warn!(target: "core::bridge", "{}", e);
                    self.connection_lost(now);
                }
                TransportEvent::Disconnected { reason } => {
                    warn!(target: "core::bridge", "Disconnected: {}", reason.as_deref().unwrap_or("connection closed"));
                    self.connection_lost(now);
                }
            }
        }

        self.store.borrow_mut().on_frame();
        Store::deliver_changes(&self.store);
    }

    /// Stop handling messages and close the transport for good.
    pub fn shutdown(&mut self) {
        self.service.stop();
        self.transport.borrow_mut().close();
        self.retry_at = None;
        self.store.borrow_mut().set_connection(ConnectionStatus::Disconnected);
        Store::deliver_changes(&self.store);
    }

    fn connect(&mut self, now: Instant) {
        let result = {
            let mut transport = self.transport.borrow_mut();
            if transport.state() != TransportState::Uninitialized {
                return;
            }
            transport.setup()
        };
        match result {
            Ok(()) => self.store.borrow_mut().set_connection(ConnectionStatus::Connecting),
            Err(e) => {
                error!(target: "core::bridge", "Could not start handshake: {}", e);
                self.connection_lost(now);
            }
        }
    }

    fn connection_lost(&mut self, now: Instant) {
        self.store.borrow_mut().set_connection(ConnectionStatus::Disconnected);
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(target: "core::bridge", "Reconnecting in {:?}", delay);
                self.retry_at = Some(now + delay);
            }
            None => {
                error!(
                    target: "core::bridge",
                    "Giving up after {} reconnect attempts",
                    self.backoff.attempts()
                );
                self.retry_at = None;
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.service.stop();
    }
}
