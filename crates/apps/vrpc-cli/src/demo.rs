use std::any::Any;
use std::sync::Arc;

use serde_json::{json, Value};
use vrpc_agent::{Agent, AgentOptions, ClassBinding, ClassRegistry};
use vrpc_broker::MemoryBroker;
use vrpc_core::VrpcError;

pub const DEMO_DOMAIN: &str = "demo";
pub const DEMO_AGENT: &str = "demo";

/// Embedded playground served on `memory://` brokers so every subcommand has
/// something real to talk to.
pub fn start(broker: &MemoryBroker) -> Result<Agent, VrpcError> {
    let registry = ClassRegistry::new()
        .register(
            ClassBinding::new("Foo")
                .static_fn("greet", |ctx| Ok(json!(format!("hi {}", ctx.string_arg(0)?))))
                .static_fn("echo", |ctx| Ok(ctx.arg(0).cloned().unwrap_or(Value::Null))),
        )
        .register(
            ClassBinding::new("Counter")
                .constructor(|ctx| {
                    let start = ctx.arg(0).and_then(Value::as_i64).unwrap_or(0);
                    Ok(Box::new(start) as Box<dyn Any + Send>)
                })
                .member("increment", |state, _ctx| {
                    let value = state
                        .downcast_mut::<i64>()
                        .ok_or_else(|| VrpcError::Remote("instance state has the wrong type".into()))?;
                    *value += 1;
                    Ok(json!(*value))
                })
                .member("value", |state, _ctx| {
                    let value = state
                        .downcast_ref::<i64>()
                        .ok_or_else(|| VrpcError::Remote("instance state has the wrong type".into()))?;
                    Ok(json!(*value))
                }),
        );
    Agent::serve(
        broker,
        AgentOptions::new(DEMO_DOMAIN).with_agent(DEMO_AGENT),
        Arc::new(registry),
    )
}
