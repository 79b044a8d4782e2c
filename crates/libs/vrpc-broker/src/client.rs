use tokio::sync::mpsc;
use vrpc_core::VrpcError;

use crate::options::BrokerOptions;

/// One message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Last-will publication, delivered retained by the broker when the
/// connection dies without a graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub options: BrokerOptions,
    pub will: Option<Will>,
}

/// A live connection. Delivery is at-least-once; QoS is not surfaced.
pub struct Session {
    pub link: std::sync::Arc<dyn BrokerLink>,
    /// Single serial inbound stream; every subscription of this connection
    /// funnels into it in broker order.
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), VrpcError>;
    fn subscribe(&self, filter: &str) -> Result<(), VrpcError>;
    fn unsubscribe(&self, filter: &str) -> Result<(), VrpcError>;
    /// A graceful disconnect suppresses the will; an ungraceful one fires it.
    fn disconnect(&self, graceful: bool) -> Result<(), VrpcError>;
}

/// The seam behind which the real MQTT socket client lives. The in-process
/// implementation in [`crate::memory`] carries the full retained/wildcard/
/// last-will contract the runtime depends on.
pub trait Broker: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> Result<Session, VrpcError>;
}
