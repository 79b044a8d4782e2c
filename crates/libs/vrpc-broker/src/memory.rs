use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use tokio::sync::mpsc;
use vrpc_core::topic::matches_filter;
use vrpc_core::VrpcError;

use crate::client::{Broker, BrokerLink, ConnectRequest, InboundMessage, Session, Will};

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    subscriptions: Vec<Subscription>,
    connections: BTreeMap<u64, ConnectionState>,
    next_connection: u64,
}

struct Subscription {
    connection: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

struct ConnectionState {
    will: Option<Will>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

/// In-process broker carrying the contract the runtime depends on: `+`/`#`
/// wildcard filters, retained messages (empty retained payload clears),
/// last-will on ungraceful connection loss, at-least-once fan-out.
///
/// Credentials in the connect request are accepted as-is; enforcement is the
/// real broker's concern. A message matching two overlapping filters of one
/// connection is delivered once per filter, as MQTT allows; receivers route
/// by correlation id so the duplication is harmless.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained payload currently stored for a topic, if any.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("broker state mutex poisoned");
        state.retained.get(topic).cloned()
    }

    fn deliver_locked(state: &mut BrokerState, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_owned(), payload.to_vec());
            }
        }
        for sub in &state.subscriptions {
            if matches_filter(&sub.filter, topic) {
                trace!("broker: {} -> filter {}", topic, sub.filter);
                let _ = sub
                    .sender
                    .send(InboundMessage { topic: topic.to_owned(), payload: payload.to_vec() });
            }
        }
    }
}

impl Broker for MemoryBroker {
    fn connect(&self, request: ConnectRequest) -> Result<Session, VrpcError> {
        let (sender, inbound) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("broker state mutex poisoned");
        let connection = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(connection, ConnectionState { will: request.will, sender });
        drop(state);
        let link =
            MemoryLink { state: self.state.clone(), connection, closed: AtomicBool::new(false) };
        Ok(Session { link: Arc::new(link), inbound })
    }
}

struct MemoryLink {
    state: Arc<Mutex<BrokerState>>,
    connection: u64,
    closed: AtomicBool,
}

impl MemoryLink {
    fn sender(&self, state: &BrokerState) -> Result<mpsc::UnboundedSender<InboundMessage>, VrpcError> {
        state
            .connections
            .get(&self.connection)
            .map(|conn| conn.sender.clone())
            .ok_or_else(|| VrpcError::transport("connection closed"))
    }
}

impl BrokerLink for MemoryLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), VrpcError> {
        let mut state = self.state.lock().expect("broker state mutex poisoned");
        if !state.connections.contains_key(&self.connection) {
            return Err(VrpcError::transport("connection closed"));
        }
        MemoryBroker::deliver_locked(&mut state, topic, &payload, retain);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), VrpcError> {
        let mut state = self.state.lock().expect("broker state mutex poisoned");
        let sender = self.sender(&state)?;
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| matches_filter(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();
        state.subscriptions.push(Subscription {
            connection: self.connection,
            filter: filter.to_owned(),
            sender: sender.clone(),
        });
        for (topic, payload) in retained {
            let _ = sender.send(InboundMessage { topic, payload });
        }
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), VrpcError> {
        let mut state = self.state.lock().expect("broker state mutex poisoned");
        state
            .subscriptions
            .retain(|sub| !(sub.connection == self.connection && sub.filter == filter));
        Ok(())
    }

    fn disconnect(&self, graceful: bool) -> Result<(), VrpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().expect("broker state mutex poisoned");
        state.subscriptions.retain(|sub| sub.connection != self.connection);
        let removed = state.connections.remove(&self.connection);
        if !graceful {
            if let Some(Will { topic, payload }) = removed.and_then(|conn| conn.will) {
                MemoryBroker::deliver_locked(&mut state, &topic, &payload, true);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryLink {
    // An abandoned link behaves like a lost process: the will fires.
    fn drop(&mut self) {
        let _ = self.disconnect(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BrokerOptions;

    fn connect(broker: &MemoryBroker, will: Option<Will>) -> Session {
        broker
            .connect(ConnectRequest {
                client_id: "test".into(),
                options: BrokerOptions::default(),
                will,
            })
            .expect("connect")
    }

    #[test]
    fn retained_messages_replay_on_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = connect(&broker, None);
        publisher.link.publish("d/a1/Foo/__static__/__info__", b"info".to_vec(), true).expect("publish");

        let mut subscriber = connect(&broker, None);
        subscriber.link.subscribe("d/+/+/__static__/__info__").expect("subscribe");
        let msg = subscriber.inbound.try_recv().expect("retained replay");
        assert_eq!(msg.topic, "d/a1/Foo/__static__/__info__");
        assert_eq!(msg.payload, b"info");
    }

    #[test]
    fn empty_retained_payload_clears_the_topic() {
        let broker = MemoryBroker::new();
        let session = connect(&broker, None);
        session.link.publish("d/x", b"v".to_vec(), true).expect("publish");
        assert!(broker.retained("d/x").is_some());
        session.link.publish("d/x", Vec::new(), true).expect("clear");
        assert!(broker.retained("d/x").is_none());
    }

    #[test]
    fn will_fires_on_ungraceful_loss_only() {
        let broker = MemoryBroker::new();
        let mut watcher = connect(&broker, None);
        watcher.link.subscribe("d/+/__agent__/__static__/__info__").expect("subscribe");

        let will = Will { topic: "d/a1/__agent__/__static__/__info__".into(), payload: b"offline".to_vec() };
        let graceful = connect(&broker, Some(will.clone()));
        graceful.link.disconnect(true).expect("disconnect");
        assert!(watcher.inbound.try_recv().is_err());

        let lost = connect(&broker, Some(will.clone()));
        drop(lost);
        let msg = watcher.inbound.try_recv().expect("will delivery");
        assert_eq!(msg.payload, b"offline");
        assert_eq!(broker.retained(&will.topic), Some(b"offline".to_vec()));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let mut session = connect(&broker, None);
        session.link.subscribe("d/#").expect("subscribe");
        let publisher = connect(&broker, None);
        publisher.link.publish("d/one", b"1".to_vec(), false).expect("publish");
        assert!(session.inbound.try_recv().is_ok());

        session.link.unsubscribe("d/#").expect("unsubscribe");
        publisher.link.publish("d/two", b"2".to_vec(), false).expect("publish");
        assert!(session.inbound.try_recv().is_err());
    }

    #[test]
    fn publish_after_disconnect_is_a_transport_error() {
        let broker = MemoryBroker::new();
        let session = connect(&broker, None);
        session.link.disconnect(true).expect("disconnect");
        let err = session.link.publish("d/x", Vec::new(), false).expect_err("closed");
        assert!(matches!(err, VrpcError::Transport(_)));
    }
}
