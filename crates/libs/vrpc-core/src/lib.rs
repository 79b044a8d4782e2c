//! Protocol core: topic grammar, id generation, wire schema and the
//! discovery-tree model shared by agent and remote.

pub mod discovery;
pub mod error;
pub mod ident;
pub mod topic;
pub mod wire;

pub use discovery::{AgentEntry, AgentInfo, AgentStatus, ClassInfo, DiscoveryTree};
pub use error::VrpcError;
pub use ident::{client_id, hostname, random_token, tunnel_id, tunnel_proxy_prefix, CorrelationIds};
pub use topic::Topic;
pub use wire::RpcMessage;
