//! Routes inbound engine messages into the store.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, error, warn};

use loopbridge_net::{DuplexTransport, InboundMessage, ListenerId, ServerMessage};
use loopbridge_types::ParameterId;

use crate::store::Store;

/// Owns at most one transport listener. Holds no state of its own.
///
/// The listener keeps only a weak handle on the store. The store's command
/// sink may hold the transport, and the transport holds the listener, so a
/// strong handle would keep all three alive after the bridge is dropped.
/// Messages arriving after the store is gone are dropped.
pub struct MessageHandlingService {
    transport: Rc<RefCell<DuplexTransport>>,
    store: Rc<RefCell<Store>>,
    listener: Option<ListenerId>,
}

impl MessageHandlingService {
    pub fn new(transport: Rc<RefCell<DuplexTransport>>, store: Rc<RefCell<Store>>) -> Self {
        Self {
            transport,
            store,
            listener: None,
        }
    }

    /// Register the listener. Calling again while running does nothing.
    pub fn start(&mut self) {
        if self.listener.is_some() {
            return;
        }
        let store: Weak<RefCell<Store>> = Rc::downgrade(&self.store);
        let id = self.transport.borrow_mut().add_listener(move |inbound: &InboundMessage| {
            match store.upgrade() {
                Some(store) => handle_message(&mut store.borrow_mut(), &inbound.message),
                None => debug!(target: "core::handler", "Store dropped, ignoring message {}", inbound.id),
            }
        });
        self.listener = Some(id);
    }

    /// Deregister the listener. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.transport.borrow_mut().remove_listener(id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }
}

/// Apply one engine message to the store.
pub fn handle_message(store: &mut Store, message: &ServerMessage) {
    match message {
        ServerMessage::PublishParameters { parameters } => store.apply_declarations(parameters.clone()),
        ServerMessage::ParameterChanged { track, name, value } => {
            store.apply_parameter_value(ParameterId::new(*track, name.clone()), *value)
        }
        ServerMessage::PlaybackPosition { position_beats } => store.set_playback_position(*position_beats),
        ServerMessage::SequenceChanged { track, active_steps } => store.apply_sequence(*track, active_steps),
        ServerMessage::EngineError { message } => {
            error!(target: "core::handler", "Engine error: {}", message);
            store.record_engine_error(message.clone());
        }
        ServerMessage::Unknown { kind } => {
            warn!(target: "core::handler", "Ignoring unknown message type {:?}", kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopbridge_net::TransportOptions;
    use loopbridge_types::{DeclarationSet, ParameterDeclaration, TrackId, TrackScope};

    use crate::dispatch::{DuplexSink, RecordingSink};

    fn service() -> (MessageHandlingService, Rc<RefCell<DuplexTransport>>, Rc<RefCell<Store>>) {
        let transport = Rc::new(RefCell::new(DuplexTransport::new(TransportOptions::default())));
        let store = Rc::new(RefCell::new(Store::new(Box::new(RecordingSink::new()))));
        let service = MessageHandlingService::new(Rc::clone(&transport), Rc::clone(&store));
        (service, transport, store)
    }

    #[test]
    fn start_is_idempotent() {
        let (mut service, transport, _) = service();
        service.start();
        service.start();
        assert!(service.is_running());
        assert_eq!(transport.borrow().listener_count(), 1);

        service.stop();
        assert!(!service.is_running());
        assert_eq!(transport.borrow().listener_count(), 0);
    }

    #[test]
    fn stop_without_start() {
        let (mut service, transport, _) = service();
        service.stop();
        assert!(!service.is_running());
        assert_eq!(transport.borrow().listener_count(), 0);
    }

    #[test]
    fn listener_does_not_keep_store_alive() {
        let transport = Rc::new(RefCell::new(DuplexTransport::new(TransportOptions::default())));
        let sink = DuplexSink::new(Rc::clone(&transport));
        let store = Rc::new(RefCell::new(Store::new(Box::new(sink))));
        let mut service = MessageHandlingService::new(Rc::clone(&transport), Rc::clone(&store));
        service.start();
        assert_eq!(Rc::strong_count(&store), 2);

        let weak = Rc::downgrade(&store);
        drop(service);
        drop(store);
        assert!(weak.upgrade().is_none());
        // The listener outlives the store but is still registered.
        assert_eq!(transport.borrow().listener_count(), 1);
        assert_eq!(Rc::strong_count(&transport), 1);
    }

    #[test]
    fn dispatches_by_type() {
        let (_, _, store) = service();
        let mut store = store.borrow_mut();

        let declarations: DeclarationSet =
            vec![ParameterDeclaration::continuous(TrackScope::Master, "volume", 0.0, 1.0, 0.5)].into();
        handle_message(&mut store, &ServerMessage::PublishParameters { parameters: declarations });
        assert_eq!(store.declarations().len(), 1);

        handle_message(
            &mut store,
            &ServerMessage::ParameterChanged { track: TrackScope::Master, name: "volume".into(), value: 0.9 },
        );
        assert_eq!(store.value(&ParameterId::master("volume")), Some(0.9));

        let track = TrackId::new(4).unwrap();
        handle_message(&mut store, &ServerMessage::SequenceChanged { track, active_steps: vec![2, 6] });
        assert_eq!(store.sequence(track).active_steps(), vec![2, 6]);

        handle_message(&mut store, &ServerMessage::PlaybackPosition { position_beats: Some(4.25) });
        store.on_frame();
        assert_eq!(store.playing_step(), Some(1));

        handle_message(&mut store, &ServerMessage::EngineError { message: "xrun".into() });
        assert_eq!(store.last_engine_error(), Some("xrun"));
    }

    #[test]
    fn unknown_is_a_no_op() {
        let (_, _, store) = service();
        let mut store = store.borrow_mut();
        handle_message(&mut store, &ServerMessage::Unknown { kind: "SpectrumFrame".into() });
        assert!(store.declarations().is_empty());
        assert_eq!(store.last_engine_error(), None);
    }
}
