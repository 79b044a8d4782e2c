use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;
use serde_json::{json, Value};
use vrpc_core::topic::instance_topic;
use vrpc_core::wire::pack_positional;
use vrpc_core::VrpcError;

use crate::remote::RemoteInner;
use crate::tunnel::CallArg;

/// Local handle for a remote instance. The method set is the deduplicated,
/// overload-stripped member-function list captured when the proxy was
/// created; the proxy id scopes every tunnel this handle registers.
pub struct Proxy {
    inner: Arc<RemoteInner>,
    domain: String,
    agent: String,
    klass: String,
    target_id: String,
    proxy_id: String,
    methods: BTreeSet<String>,
}

impl Proxy {
    pub(crate) fn new(
        inner: Arc<RemoteInner>,
        domain: String,
        agent: String,
        klass: String,
        target_id: String,
        proxy_id: String,
        methods: Vec<String>,
    ) -> Self {
        Self {
            inner,
            domain,
            agent,
            klass,
            target_id,
            proxy_id,
            methods: methods.into_iter().collect(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.klass
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().cloned().collect()
    }

    /// Invokes a member method. Remote failures are wrapped with call
    /// context; configuration problems surface synchronously.
    pub async fn call(&self, method: &str, args: Vec<CallArg>) -> Result<Value, VrpcError> {
        match self.call_raw(method, args).await {
            Err(VrpcError::Remote(message)) => {
                Err(VrpcError::Remote(format!("remote function call failed: {message}")))
            }
            other => other,
        }
    }

    async fn call_raw(&self, method: &str, args: Vec<CallArg>) -> Result<Value, VrpcError> {
        if !self.methods.contains(method) {
            return Err(VrpcError::config(format!(
                "class {} has no method {method:?}",
                self.klass
            )));
        }
        let packed = self.inner.tunnels.pack(&self.proxy_id, method, args);
        let topic =
            instance_topic(&self.domain, &self.agent, &self.klass, &self.target_id, method);
        self.inner.request(&topic, &self.target_id, method, pack_positional(&packed)).await
    }

    /// Event registration sugar: `call("on", [event, handler])` with the
    /// benign "Repeated event registration" rejection swallowed, so
    /// re-registering the same event is idempotent.
    pub async fn on<F>(&self, event: &str, handler: F) -> Result<(), VrpcError>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let args = vec![CallArg::value(json!(event)), CallArg::callback(handler)];
        match self.call_raw("on", args).await {
            Ok(_) => Ok(()),
            Err(VrpcError::Remote(message)) if message == "Repeated event registration" => {
                debug!("ignoring benign re-registration for {event}");
                Ok(())
            }
            Err(VrpcError::Remote(message)) => {
                Err(VrpcError::Remote(format!("remote function call failed: {message}")))
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for Proxy {
    // Teardown sweeps this proxy's tunnel scope; the agent gets no
    // notification, deletion stays explicit.
    fn drop(&mut self) {
        self.inner.tunnels.remove_proxy(&self.proxy_id);
    }
}
