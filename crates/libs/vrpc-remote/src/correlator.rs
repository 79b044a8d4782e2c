use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;
use vrpc_core::wire::is_promise_token;
use vrpc_core::{RpcMessage, VrpcError};

type Completion = oneshot::Sender<Result<Value, VrpcError>>;

/// Pending-call registry. A reply is routed only by its correlation id,
/// never by topic; every entry is removed on reply, timeout or
/// abandonment, so nothing leaks.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<String, Completion>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot completion guarded by a timeout timer. When the
    /// timer fires first the entry is removed, so a late reply is dropped
    /// silently.
    pub fn register(
        &self,
        id: &str,
        timeout_ms: u64,
    ) -> oneshot::Receiver<Result<Value, VrpcError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.insert(id.to_owned(), tx);
        }
        let pending = self.pending.clone();
        let id = id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let timed_out = pending.lock().expect("pending mutex poisoned").remove(&id);
            if let Some(tx) = timed_out {
                let _ = tx.send(Err(VrpcError::Timeout(timeout_ms)));
            }
        });
        rx
    }

    /// Routes an inbound reply. A result beginning with `__p__` is a promise
    /// token: the completion is re-registered under the token id and the
    /// actual result arrives in a second message. The chained wait carries
    /// no fresh timer, mirroring the wire contract's unbounded second phase.
    ///
    /// Returns whether the reply matched a pending entry.
    pub fn settle(&self, msg: &RpcMessage) -> bool {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let Some(tx) = pending.remove(&msg.id) else {
            debug!("dropping late reply {}", msg.id);
            return false;
        };
        if let Some(error) = msg.error() {
            let _ = tx.send(Err(VrpcError::Remote(error.to_owned())));
            return true;
        }
        let result = msg.result().cloned().unwrap_or(Value::Null);
        if let Some(token) = result.as_str().filter(|value| is_promise_token(value)) {
            pending.insert(token.to_owned(), tx);
            return true;
        }
        let _ = tx.send(Ok(result));
        true
    }

    /// Fails every in-flight call, used on shutdown and reconnect.
    pub fn abandon_all(&self, error: VrpcError) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }
}
