//! Broker seam: connection options, the pub/sub link abstraction and an
//! in-process broker with retained, wildcard and last-will semantics.

pub mod client;
pub mod memory;
pub mod options;

pub use client::{Broker, BrokerLink, ConnectRequest, InboundMessage, Session, Will};
pub use memory::MemoryBroker;
pub use options::{BrokerOptions, Endpoint, DEFAULT_BROKER_URL, TOKEN_USERNAME};
