use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::task::JoinHandle;
use vrpc_broker::{Broker, BrokerLink, BrokerOptions, ConnectRequest, InboundMessage, Will};
use vrpc_core::discovery::{stripped_names, AgentInfo, AgentStatus};
use vrpc_core::ident::{client_id, hostname, random_token};
use vrpc_core::topic::{
    self, Topic, CREATE_METHOD, CREATE_NAMED_METHOD, DELETE_METHOD, GET_NAMED_METHOD,
};
use vrpc_core::wire::{is_tunnel_id, positional_args};
use vrpc_core::{RpcMessage, VrpcError};

use crate::adapter::{Adapter, CallContext, CallbackGate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub domain: String,
    pub agent: String,
    pub broker: BrokerOptions,
}

impl AgentOptions {
    /// Agent name defaults to the host name, the usual deployment shape.
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), agent: hostname(), broker: BrokerOptions::default() }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_broker(mut self, broker: BrokerOptions) -> Self {
        self.broker = broker;
        self
    }

    fn validate(&self) -> Result<(), VrpcError> {
        for (label, value) in [("domain", &self.domain), ("agent", &self.agent)] {
            if value.is_empty() || value == topic::ANY {
                return Err(VrpcError::config(format!("{label} must be a concrete value")));
            }
            if value.contains(['/', '+', '#']) {
                return Err(VrpcError::config(format!(
                    "{label} must not contain topic separators or wildcards: {value:?}"
                )));
            }
        }
        Ok(())
    }
}

struct AgentInner {
    domain: String,
    agent: String,
    hostname: String,
    adapter: Arc<dyn Adapter>,
    link: Arc<dyn BrokerLink>,
    /// Registered `on`-style tunnels per instance; repeated identical
    /// registrations are answered with an error instead of reaching the
    /// adapter.
    listeners: Mutex<BTreeSet<(String, String)>>,
}

/// Serves an adapter's classes over the broker: static subscriptions and
/// retained class info on connect, per-instance subscriptions as instances
/// come and go, last-will-backed presence.
pub struct Agent {
    inner: Arc<AgentInner>,
    pump: JoinHandle<()>,
}

impl Agent {
    /// Connects and starts serving. Must run inside a tokio runtime; the
    /// inbound pump is spawned onto it.
    pub fn serve(
        broker: &dyn Broker,
        options: AgentOptions,
        adapter: Arc<dyn Adapter>,
    ) -> Result<Self, VrpcError> {
        options.validate()?;
        let AgentOptions { domain, agent, broker: broker_options } = options;
        let hostname = hostname();

        let offline = AgentInfo { status: AgentStatus::Offline, hostname: hostname.clone() };
        let will = Will {
            topic: topic::agent_info_topic(&domain, &agent),
            payload: encode_info(&offline)?,
        };
        let session = broker.connect(ConnectRequest {
            client_id: client_id(&random_token()),
            options: broker_options,
            will: Some(will),
        })?;
        let link = session.link.clone();

        for klass in adapter.classes() {
            for method in [CREATE_METHOD, CREATE_NAMED_METHOD, GET_NAMED_METHOD, DELETE_METHOD] {
                link.subscribe(&topic::static_topic(&domain, &agent, &klass, method))?;
            }
            if let Some(info) = adapter.class_info(&klass) {
                for function in stripped_names(&info.static_functions) {
                    link.subscribe(&topic::static_topic(&domain, &agent, &klass, &function))?;
                }
                link.publish(
                    &topic::class_info_topic(&domain, &agent, &klass),
                    encode_info(&info)?,
                    true,
                )?;
            }
        }

        let online = AgentInfo { status: AgentStatus::Online, hostname: hostname.clone() };
        link.publish(&topic::agent_info_topic(&domain, &agent), encode_info(&online)?, true)?;
        info!("agent {agent} serving domain {domain}");

        let inner = Arc::new(AgentInner {
            domain,
            agent,
            hostname,
            adapter,
            link,
            listeners: Mutex::new(BTreeSet::new()),
        });
        let pump = tokio::spawn({
            let inner = inner.clone();
            let mut inbound = session.inbound;
            async move {
                while let Some(message) = inbound.recv().await {
                    inner.handle(message);
                }
            }
        });
        Ok(Self { inner, pump })
    }

    /// Publishes retained offline presence and disconnects gracefully, so
    /// the will does not fire a second time.
    pub fn stop(&self) -> Result<(), VrpcError> {
        let offline =
            AgentInfo { status: AgentStatus::Offline, hostname: self.inner.hostname.clone() };
        self.inner.link.publish(
            &topic::agent_info_topic(&self.inner.domain, &self.inner.agent),
            encode_info(&offline)?,
            true,
        )?;
        self.inner.link.disconnect(true)?;
        self.pump.abort();
        Ok(())
    }

    /// Simulates process loss: drops the connection without a graceful
    /// disconnect so the broker delivers the last will.
    pub fn kill(self) {
        self.pump.abort();
        let _ = self.inner.link.disconnect(false);
    }
}

impl AgentInner {
    fn handle(&self, inbound: InboundMessage) {
        let parsed = match Topic::parse(&inbound.topic) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("dropping message: {err}");
                return;
            }
        };
        let mut msg = match RpcMessage::decode(&inbound.payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("dropping malformed payload on {}: {err}", inbound.topic);
                return;
            }
        };
        // The topic is authoritative for addressing; the payload only
        // carries correlation and arguments.
        msg.target_id =
            if parsed.is_static() { parsed.klass.clone() } else { parsed.target.clone() };
        msg.method = parsed.method.clone();

        self.dispatch(&parsed, &mut msg);
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode reply for {}: {err}", msg.id);
                return;
            }
        };
        if let Err(err) = self.link.publish(&msg.sender, bytes, false) {
            warn!("failed to publish reply to {}: {err}", msg.sender);
        }
    }

    fn dispatch(&self, parsed: &Topic, msg: &mut RpcMessage) {
        let gate = CallbackGate::new(
            self.link.clone(),
            msg.sender.clone(),
            msg.target_id.clone(),
            msg.method.clone(),
        );
        let ctx = CallContext { args: positional_args(&msg.data), gate };
        debug!("dispatch {} -> {}::{}", msg.id, msg.target_id, msg.method);

        let result = match msg.method.as_str() {
            CREATE_METHOD => self.create(parsed, None, &ctx),
            // `_1` is the instance name, constructor arguments follow.
            CREATE_NAMED_METHOD => ctx.string_arg(0).map(str::to_owned).and_then(|name| {
                let ctor = CallContext { args: ctx.args[1..].to_vec(), gate: ctx.gate.clone() };
                self.create(parsed, Some(name), &ctor)
            }),
            GET_NAMED_METHOD => ctx
                .string_arg(0)
                .and_then(|name| self.adapter.get_named(&parsed.klass, name))
                .map(Value::String),
            DELETE_METHOD => ctx
                .string_arg(0)
                .map(str::to_owned)
                .and_then(|instance| self.delete(parsed, &instance)),
            _ if parsed.is_static() => self.adapter.invoke_static(&parsed.klass, &msg.method, &ctx),
            _ => self.invoke_member(parsed, msg, &ctx),
        };
        match result {
            Ok(value) => msg.set_ok(value),
            Err(err) => msg.set_err(err.to_string()),
        }
    }

    fn create(
        &self,
        parsed: &Topic,
        name: Option<String>,
        ctx: &CallContext,
    ) -> Result<Value, VrpcError> {
        let id = self.adapter.create(&parsed.klass, name.as_deref(), ctx)?;
        self.subscribe_members(&parsed.klass, &id)?;
        self.publish_class_info(&parsed.klass)?;
        Ok(Value::String(id))
    }

    // Member subscriptions are kept after deletion so a late call gets a
    // proper "does not exist" error instead of silence.
    fn delete(&self, parsed: &Topic, instance: &str) -> Result<Value, VrpcError> {
        let deleted = self.adapter.delete(&parsed.klass, instance)?;
        if deleted {
            let mut listeners = self.listeners.lock().expect("listeners mutex poisoned");
            listeners.retain(|(registered, _)| registered != instance);
            drop(listeners);
            self.publish_class_info(&parsed.klass)?;
        }
        Ok(Value::Bool(deleted))
    }

    fn invoke_member(
        &self,
        parsed: &Topic,
        msg: &RpcMessage,
        ctx: &CallContext,
    ) -> Result<Value, VrpcError> {
        if msg.method == "on" {
            if let Some(tunnel) =
                ctx.arg(1).and_then(Value::as_str).filter(|id| is_tunnel_id(id))
            {
                let mut listeners = self.listeners.lock().expect("listeners mutex poisoned");
                if !listeners.insert((parsed.target.clone(), tunnel.to_owned())) {
                    return Err(VrpcError::Remote("Repeated event registration".into()));
                }
            }
        }
        self.adapter.invoke_member(&parsed.target, &msg.method, ctx)
    }

    fn subscribe_members(&self, klass: &str, instance: &str) -> Result<(), VrpcError> {
        for function in self.member_functions(klass) {
            self.link.subscribe(&topic::instance_topic(
                &self.domain,
                &self.agent,
                klass,
                instance,
                &function,
            ))?;
        }
        Ok(())
    }

    fn member_functions(&self, klass: &str) -> Vec<String> {
        self.adapter
            .class_info(klass)
            .map(|info| stripped_names(&info.member_functions))
            .unwrap_or_default()
    }

    fn publish_class_info(&self, klass: &str) -> Result<(), VrpcError> {
        if let Some(info) = self.adapter.class_info(klass) {
            self.link.publish(
                &topic::class_info_topic(&self.domain, &self.agent, klass),
                encode_info(&info)?,
                true,
            )?;
        }
        Ok(())
    }
}

fn encode_info<T: serde::Serialize>(info: &T) -> Result<Vec<u8>, VrpcError> {
    serde_json::to_vec(info).map_err(|err| VrpcError::protocol(err.to_string()))
}
