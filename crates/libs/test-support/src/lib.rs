//! Shared end-to-end fixtures: an in-process broker, an agent hosting the
//! conformance classes, and remotes wired against them.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use vrpc_agent::{new_promise_token, Agent, AgentOptions, ClassBinding, ClassRegistry, RemoteCallback};
use vrpc_broker::MemoryBroker;
use vrpc_core::VrpcError;
use vrpc_remote::{Remote, RemoteOptions};

pub const DOMAIN: &str = "d";
pub const AGENT: &str = "a1";

struct CounterState {
    value: i64,
    listeners: Vec<(String, RemoteCallback)>,
}

fn counter_state(state: &mut (dyn Any + Send)) -> Result<&mut CounterState, VrpcError> {
    state
        .downcast_mut::<CounterState>()
        .ok_or_else(|| VrpcError::Remote("instance state has the wrong type".into()))
}

/// The classes every conformance scenario runs against.
///
/// `Foo` carries the static surface (`greet`, `echo`, `deferred`); `Counter`
/// is the stateful instance class with callback and event behavior
/// (`increment`, `compute`, `on`, `feed`, `sleepy`).
pub fn conformance_registry() -> Arc<ClassRegistry> {
    let registry = ClassRegistry::new()
        .register(
            ClassBinding::new("Foo")
                .static_fn("greet", |ctx| Ok(json!(format!("hi {}", ctx.string_arg(0)?))))
                .static_fn("echo", |ctx| Ok(ctx.arg(0).cloned().unwrap_or(Value::Null)))
                .static_fn("deferred", |ctx| {
                    // Answer with a promise token and settle it shortly after.
                    let token = new_promise_token();
                    let gate = ctx.gate.clone();
                    let settled = token.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let _ = gate.resolve(&settled, json!(42));
                    });
                    Ok(json!(token))
                }),
        )
        .register(
            ClassBinding::new("Counter")
                .constructor(|ctx| {
                    let start = ctx.arg(0).and_then(Value::as_i64).unwrap_or(0);
                    Ok(Box::new(CounterState { value: start, listeners: Vec::new() })
                        as Box<dyn Any + Send>)
                })
                .member("increment", |state, _ctx| {
                    let counter = counter_state(state)?;
                    counter.value += 1;
                    Ok(json!(counter.value))
                })
                .member("compute", |_state, ctx| {
                    // One-shot callback shape: invoked exactly twice so the
                    // remote can prove the sink was removed after the first
                    // delivery.
                    let callback = ctx.callback(1)?;
                    callback.invoke(&[json!(42), json!("x")])?;
                    callback.invoke(&[json!(42), json!("x")])?;
                    Ok(Value::Null)
                })
                .member("on", |state, ctx| {
                    let event = ctx.string_arg(0)?.to_owned();
                    let callback = ctx.callback(1)?;
                    counter_state(state)?.listeners.push((event, callback));
                    Ok(Value::Null)
                })
                .member("feed", |state, ctx| {
                    let value = ctx.arg(0).cloned().unwrap_or(Value::Null);
                    let counter = counter_state(state)?;
                    let mut delivered = 0;
                    for (event, callback) in &counter.listeners {
                        if event == "data" {
                            callback.invoke(&[value.clone()])?;
                            delivered += 1;
                        }
                    }
                    Ok(json!(delivered))
                })
                .member("sleepy", |_state, _ctx| {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(json!(1))
                }),
        );
    Arc::new(registry)
}

pub fn start_agent(broker: &MemoryBroker) -> Agent {
    Agent::serve(
        broker,
        AgentOptions::new(DOMAIN).with_agent(AGENT),
        conformance_registry(),
    )
    .expect("agent serves")
}

pub async fn connect_remote(broker: &MemoryBroker) -> Remote {
    connect_remote_with_timeout(broker, 5000).await
}

pub async fn connect_remote_with_timeout(broker: &MemoryBroker, timeout_ms: u64) -> Remote {
    Remote::connect(
        Arc::new(broker.clone()),
        RemoteOptions::default()
            .with_domain(DOMAIN)
            .with_agent(AGENT)
            .with_timeout_ms(timeout_ms),
    )
    .await
    .expect("remote connects")
}
