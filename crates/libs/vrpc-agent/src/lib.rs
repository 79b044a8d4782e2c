//! Agent side of the runtime: the adapter seam reflecting callable classes
//! into the registry, and the dispatcher that serves them over the broker.

pub mod adapter;
pub mod agent;

pub use adapter::{
    new_promise_token, Adapter, CallContext, CallbackGate, ClassBinding, ClassRegistry,
    RemoteCallback,
};
pub use agent::{Agent, AgentOptions};
