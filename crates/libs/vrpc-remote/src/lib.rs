//! Remote side of the runtime: request/reply correlation over the shared
//! connection, callback tunneling, the discovery cache and the proxy
//! factory.

pub mod correlator;
pub mod discovery_cache;
pub mod proxy;
pub mod remote;
pub mod tunnel;

pub use correlator::Correlator;
pub use discovery_cache::{DiscoveryCache, RemoteEvent};
pub use proxy::Proxy;
pub use remote::{
    CallRequest, CreateRequest, DeleteRequest, InstanceRequest, Remote, RemoteOptions,
};
pub use tunnel::{CallArg, CallbackFn, EventEmitter, TunnelTable};
