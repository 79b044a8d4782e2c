use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::{Map, Value};
use vrpc_core::ident::{tunnel_id, tunnel_proxy_prefix};
use vrpc_core::wire::positional_args;

/// Local delivery sink for a tunneled callable.
pub type CallbackFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Anything that can receive bridged remote events, the `(emitter, event)`
/// argument shape.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, args: Vec<Value>);
}

/// One argument of an outbound call. Callables never travel; they are
/// replaced on the wire by a tunnel id and delivered through the table.
pub enum CallArg {
    Value(Value),
    Callback(CallbackFn),
    Emitter { emitter: Arc<dyn EventEmitter>, event: String },
}

impl CallArg {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    pub fn emitter(emitter: Arc<dyn EventEmitter>, event: impl Into<String>) -> Self {
        Self::Emitter { emitter, event: event.into() }
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

enum Sink {
    /// Removed after the first delivery.
    OneShot(CallbackFn),
    /// Survives until proxy teardown or client shutdown.
    Persistent(CallbackFn),
}

/// Table `tunnel id → local sink`. Packing inspects each argument and
/// replaces callables per the wire contract:
///
/// - `on`-style registration (`method == "on"`, arg index 1, leading string
///   event) gets a persistent id embedding the event name, so repeated
///   identical registrations are idempotent;
/// - `(emitter, event)` pairs get a persistent id dispatching
///   `emitter.emit(event, args)`;
/// - any other callable gets a counter-suffixed one-shot id.
#[derive(Clone, Default)]
pub struct TunnelTable {
    sinks: Arc<Mutex<HashMap<String, Sink>>>,
    counter: Arc<AtomicU64>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces callables with tunnel ids and returns the wire-ready
    /// positional values.
    pub fn pack(&self, proxy_id: &str, method: &str, args: Vec<CallArg>) -> Vec<Value> {
        let leading_event = match args.first() {
            Some(CallArg::Value(Value::String(event))) => Some(event.clone()),
            _ => None,
        };
        let mut sinks = self.sinks.lock().expect("sinks mutex poisoned");
        args.into_iter()
            .enumerate()
            .map(|(index, arg)| match arg {
                CallArg::Value(value) => value,
                CallArg::Callback(f) => {
                    let (id, sink) = match &leading_event {
                        Some(event) if method == "on" && index == 1 => {
                            (tunnel_id(proxy_id, method, index, event), Sink::Persistent(f))
                        }
                        _ => {
                            let suffix = self.counter.fetch_add(1, Ordering::Relaxed);
                            (
                                tunnel_id(proxy_id, method, index, &suffix.to_string()),
                                Sink::OneShot(f),
                            )
                        }
                    };
                    sinks.insert(id.clone(), sink);
                    Value::String(id)
                }
                CallArg::Emitter { emitter, event } => {
                    let id = tunnel_id(proxy_id, method, index, &event);
                    let sink = Arc::new(move |args: Vec<Value>| emitter.emit(&event, args));
                    sinks.insert(id.clone(), Sink::Persistent(sink));
                    Value::String(id)
                }
            })
            .collect()
    }

    /// Delivers an inbound callback invocation; positional arguments are the
    /// `_`-prefixed keys of `data` in lexicographic order. Returns whether a
    /// sink matched.
    pub fn deliver(&self, id: &str, data: &Map<String, Value>) -> bool {
        let (sink, one_shot) = {
            let sinks = self.sinks.lock().expect("sinks mutex poisoned");
            match sinks.get(id) {
                Some(Sink::Persistent(f)) => (Some(f.clone()), false),
                Some(Sink::OneShot(f)) => (Some(f.clone()), true),
                None => (None, false),
            }
        };
        let Some(f) = sink else {
            debug!("no sink for tunnel id {id}");
            return false;
        };
        if one_shot {
            self.sinks.lock().expect("sinks mutex poisoned").remove(id);
        }
        f(positional_args(data));
        true
    }

    /// Drops every sink scoped to one proxy.
    pub fn remove_proxy(&self, proxy_id: &str) {
        let prefix = tunnel_proxy_prefix(proxy_id);
        let mut sinks = self.sinks.lock().expect("sinks mutex poisoned");
        sinks.retain(|id, _| !id.starts_with(&prefix));
    }

    pub fn clear(&self) {
        self.sinks.lock().expect("sinks mutex poisoned").clear();
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().expect("sinks mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use vrpc_core::wire::pack_positional;

    fn recorder() -> (CallbackFn, Arc<StdMutex<Vec<Vec<Value>>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let sink_calls = calls.clone();
        let f: CallbackFn = Arc::new(move |args| {
            sink_calls.lock().expect("calls mutex poisoned").push(args);
        });
        (f, calls)
    }

    #[test]
    fn plain_values_pass_through_unchanged() {
        let table = TunnelTable::new();
        let packed = table.pack("beef", "add", vec![CallArg::value(json!(1)), CallArg::value(json!("x"))]);
        assert_eq!(packed, vec![json!(1), json!("x")]);
        assert_eq!(table.sink_count(), 0);
    }

    #[test]
    fn one_shot_callbacks_are_removed_after_first_delivery() {
        let table = TunnelTable::new();
        let (f, calls) = recorder();
        let packed = table.pack("beef", "compute", vec![json!("evt").into(), CallArg::Callback(f)]);
        let id = packed[1].as_str().expect("tunnel id").to_owned();
        assert!(id.starts_with("__f__beef-compute-1-"));

        let data = pack_positional(&[json!(42), json!("x")]);
        assert!(table.deliver(&id, &data));
        assert!(!table.deliver(&id, &data));
        assert_eq!(*calls.lock().expect("calls"), vec![vec![json!(42), json!("x")]]);
        assert_eq!(table.sink_count(), 0);
    }

    #[test]
    fn on_registration_reuses_the_event_scoped_id() {
        let table = TunnelTable::new();
        let (f1, calls) = recorder();
        let (f2, _) = recorder();
        let first = table.pack("beef", "on", vec![json!("data").into(), CallArg::Callback(f1)]);
        let second = table.pack("beef", "on", vec![json!("data").into(), CallArg::Callback(f2)]);
        assert_eq!(first[1], json!("__f__beef-on-1-data"));
        assert_eq!(first, second);
        assert_eq!(table.sink_count(), 1);

        let id = first[1].as_str().expect("id");
        assert!(table.deliver(id, &pack_positional(&[json!(1)])));
        assert!(table.deliver(id, &pack_positional(&[json!(2)])));
        // f1 was replaced by f2 on re-registration, so f1 saw nothing.
        assert!(calls.lock().expect("calls").is_empty());
    }

    #[test]
    fn emitter_pairs_dispatch_through_emit() {
        struct Recorder(StdMutex<Vec<(String, Vec<Value>)>>);
        impl EventEmitter for Recorder {
            fn emit(&self, event: &str, args: Vec<Value>) {
                self.0.lock().expect("events").push((event.to_owned(), args));
            }
        }
        let table = TunnelTable::new();
        let emitter = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let packed =
            table.pack("beef", "stream", vec![CallArg::emitter(emitter.clone(), "tick")]);
        assert_eq!(packed[0], json!("__f__beef-stream-0-tick"));

        let id = packed[0].as_str().expect("id");
        table.deliver(id, &pack_positional(&[json!(7)]));
        table.deliver(id, &pack_positional(&[json!(8)]));
        let events = emitter.0.lock().expect("events");
        assert_eq!(events.len(), 2, "persistent sink survives deliveries");
        assert_eq!(events[0], ("tick".to_owned(), vec![json!(7)]));
    }

    #[test]
    fn remove_proxy_sweeps_only_that_scope() {
        let table = TunnelTable::new();
        let (f1, _) = recorder();
        let (f2, _) = recorder();
        table.pack("beef", "on", vec![json!("data").into(), CallArg::Callback(f1)]);
        table.pack("cafe", "on", vec![json!("data").into(), CallArg::Callback(f2)]);
        assert_eq!(table.sink_count(), 2);
        table.remove_proxy("beef");
        assert_eq!(table.sink_count(), 1);
        assert!(table.deliver("__f__cafe-on-1-data", &pack_positional(&[])));
    }
}
