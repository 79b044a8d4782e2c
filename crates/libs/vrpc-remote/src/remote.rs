use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use vrpc_broker::{Broker, BrokerLink, BrokerOptions, ConnectRequest, InboundMessage, Session, Will};
use vrpc_core::discovery::{stripped_names, AgentInfo, AgentStatus};
use vrpc_core::ident::{client_id, hostname, random_token, CorrelationIds};
use vrpc_core::topic::{
    discovery_filter, static_topic, Topic, ANY, CREATE_METHOD, CREATE_NAMED_METHOD, DELETE_METHOD,
    GET_NAMED_METHOD, INFO_METHOD,
};
use vrpc_core::wire::{is_tunnel_id, pack_positional};
use vrpc_core::{RpcMessage, VrpcError};

use crate::correlator::Correlator;
use crate::discovery_cache::{DiscoveryCache, RemoteEvent};
use crate::proxy::Proxy;
use crate::tunnel::{CallArg, TunnelTable};

/// Grace period after connect in which retained discovery info is absorbed
/// before the client reports itself operational.
const SETTLE_MS: u64 = 200;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOptions {
    pub broker: BrokerOptions,
    /// Default domain scope; `*` subscribes across all domains but is
    /// rejected by operations that need a concrete one.
    pub domain: String,
    pub agent: String,
    pub timeout_ms: u64,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            broker: BrokerOptions::default(),
            domain: ANY.to_owned(),
            agent: ANY.to_owned(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl RemoteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, broker: BrokerOptions) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Creation request; `instance` selects named (idempotent) creation.
#[derive(Default)]
pub struct CreateRequest {
    pub class_name: String,
    pub instance: Option<String>,
    pub args: Vec<CallArg>,
    pub domain: Option<String>,
    pub agent: Option<String>,
}

impl CreateRequest {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), ..Self::default() }
    }
}

/// Attach to an existing named instance without creating it.
#[derive(Default)]
pub struct InstanceRequest {
    pub class_name: String,
    pub instance: String,
    pub domain: Option<String>,
    pub agent: Option<String>,
}

/// Static function invocation.
#[derive(Default)]
pub struct CallRequest {
    pub class_name: String,
    pub function_name: String,
    pub args: Vec<CallArg>,
    pub domain: Option<String>,
    pub agent: Option<String>,
}

#[derive(Default)]
pub struct DeleteRequest {
    pub class_name: String,
    pub instance: String,
    pub domain: Option<String>,
    pub agent: Option<String>,
}

pub(crate) struct RemoteInner {
    domain: String,
    agent: String,
    timeout_ms: u64,
    instance: String,
    inbox: String,
    broker: Arc<dyn Broker>,
    broker_options: Mutex<BrokerOptions>,
    ids: CorrelationIds,
    pub(crate) correlator: Correlator,
    pub(crate) tunnels: TunnelTable,
    pub(crate) cache: DiscoveryCache,
    link: Mutex<Arc<dyn BrokerLink>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: watch::Sender<bool>,
}

/// Client endpoint: discovers agents through the retained info tree, creates
/// and uses remote instances, and multiplexes every call over one broker
/// connection.
pub struct Remote {
    inner: Arc<RemoteInner>,
}

impl Remote {
    /// Connects, subscribes the reply inbox and the discovery filter, and
    /// waits out the settle window so retained info has arrived.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        options: RemoteOptions,
    ) -> Result<Self, VrpcError> {
        let RemoteOptions { broker: broker_options, domain, agent, timeout_ms } = options;
        let instance = random_token();
        let inbox = format!("{}/{}/{}", domain, hostname(), instance);
        let session = open_session(broker.as_ref(), &broker_options, &domain, &agent, &instance, &inbox)?;

        let inner = Arc::new(RemoteInner {
            domain,
            agent,
            timeout_ms,
            ids: CorrelationIds::new(&instance),
            instance,
            inbox,
            broker,
            broker_options: Mutex::new(broker_options),
            correlator: Correlator::new(),
            tunnels: TunnelTable::new(),
            cache: DiscoveryCache::new(),
            link: Mutex::new(session.link.clone()),
            pump: Mutex::new(None),
            connected: watch::channel(false).0,
        });
        RemoteInner::start_pump(&inner, session.inbound);
        tokio::time::sleep(Duration::from_millis(SETTLE_MS)).await;
        inner.connected.send_replace(true);
        info!("remote {} operational on inbox {}", inner.instance, inner.inbox);
        Ok(Self { inner })
    }

    /// Resolves once the client is connected and settled. Carries no
    /// timeout; bounding the wait is the caller's responsibility.
    pub async fn connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Discovery change notifications (`agent` / `class`).
    pub fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.inner.cache.subscribe()
    }

    pub async fn create(&self, request: CreateRequest) -> Result<Proxy, VrpcError> {
        self.connected().await;
        let (domain, agent) = self.inner.resolve_scope(&request.domain, &request.agent)?;
        let proxy_id = random_token();
        let (method, args) = match &request.instance {
            Some(name) => {
                let mut args = vec![CallArg::Value(Value::String(name.clone()))];
                args.extend(request.args);
                (CREATE_NAMED_METHOD, args)
            }
            None => (CREATE_METHOD, request.args),
        };
        let packed = self.inner.tunnels.pack(&proxy_id, method, args);
        let reply = self
            .inner
            .request(
                &static_topic(&domain, &agent, &request.class_name, method),
                &request.class_name,
                method,
                pack_positional(&packed),
            )
            .await?;
        self.proxy_from_reply(domain, agent, request.class_name, proxy_id, reply)
    }

    pub async fn get_instance(&self, request: InstanceRequest) -> Result<Proxy, VrpcError> {
        self.connected().await;
        let (domain, agent) = self.inner.resolve_scope(&request.domain, &request.agent)?;
        let proxy_id = random_token();
        let reply = self
            .inner
            .request(
                &static_topic(&domain, &agent, &request.class_name, GET_NAMED_METHOD),
                &request.class_name,
                GET_NAMED_METHOD,
                pack_positional(&[Value::String(request.instance.clone())]),
            )
            .await?;
        self.proxy_from_reply(domain, agent, request.class_name, proxy_id, reply)
    }

    pub async fn call_static(&self, request: CallRequest) -> Result<Value, VrpcError> {
        self.connected().await;
        let (domain, agent) = self.inner.resolve_scope(&request.domain, &request.agent)?;
        let packed =
            self.inner.tunnels.pack(&self.inner.instance, &request.function_name, request.args);
        self.inner
            .request(
                &static_topic(&domain, &agent, &request.class_name, &request.function_name),
                &request.class_name,
                &request.function_name,
                pack_positional(&packed),
            )
            .await
    }

    pub async fn delete(&self, request: DeleteRequest) -> Result<bool, VrpcError> {
        self.connected().await;
        let (domain, agent) = self.inner.resolve_scope(&request.domain, &request.agent)?;
        let reply = self
            .inner
            .request(
                &static_topic(&domain, &agent, &request.class_name, DELETE_METHOD),
                &request.class_name,
                DELETE_METHOD,
                pack_positional(&[Value::String(request.instance.clone())]),
            )
            .await?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    pub async fn available_domains(&self) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.domains())
    }

    pub async fn available_agents(&self, domain: &str) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.agents(domain))
    }

    pub async fn agent_status(&self, domain: &str, agent: &str) -> Option<AgentStatus> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.agent_entry(domain, agent).map(|entry| entry.status))
    }

    pub async fn available_classes(&self, domain: &str, agent: &str) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.classes(domain, agent))
    }

    pub async fn available_instances(&self, domain: &str, agent: &str, klass: &str) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.instances(domain, agent, klass))
    }

    pub async fn available_member_functions(
        &self,
        domain: &str,
        agent: &str,
        klass: &str,
    ) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.member_functions(domain, agent, klass))
    }

    pub async fn available_static_functions(
        &self,
        domain: &str,
        agent: &str,
        klass: &str,
    ) -> Vec<String> {
        self.connected().await;
        self.inner.cache.snapshot(|tree| tree.static_functions(domain, agent, klass))
    }

    /// Tears the connection down and rebuilds it with the new token.
    /// In-flight calls fail with a reconnect transport error rather than
    /// lingering until their timers fire.
    pub async fn reconnect_with_token(&self, token: &str) -> Result<(), VrpcError> {
        self.inner.connected.send_replace(false);
        self.inner
            .correlator
            .abandon_all(VrpcError::transport("reconnecting with a new token"));
        let old_link = self.inner.link();
        let _ = old_link.disconnect(true);
        if let Some(pump) = self.inner.pump.lock().expect("pump mutex poisoned").take() {
            pump.abort();
        }

        let broker_options = {
            let mut options = self.inner.broker_options.lock().expect("options mutex poisoned");
            *options = options.clone().with_token(token);
            options.clone()
        };
        let session = open_session(
            self.inner.broker.as_ref(),
            &broker_options,
            &self.inner.domain,
            &self.inner.agent,
            &self.inner.instance,
            &self.inner.inbox,
        )?;
        *self.inner.link.lock().expect("link mutex poisoned") = session.link.clone();
        RemoteInner::start_pump(&self.inner, session.inbound);
        tokio::time::sleep(Duration::from_millis(SETTLE_MS)).await;
        self.inner.connected.send_replace(true);
        Ok(())
    }

    /// Publishes retained offline presence on the inbox info topic, fails
    /// whatever is still in flight and closes the connection gracefully.
    pub async fn end(self) -> Result<(), VrpcError> {
        let offline = AgentInfo { status: AgentStatus::Offline, hostname: hostname() };
        let payload =
            serde_json::to_vec(&offline).map_err(|err| VrpcError::protocol(err.to_string()))?;
        let link = self.inner.link();
        link.publish(&format!("{}/{INFO_METHOD}", self.inner.inbox), payload, true)?;
        self.inner.correlator.abandon_all(VrpcError::transport("client ended"));
        self.inner.tunnels.clear();
        link.disconnect(true)?;
        if let Some(pump) = self.inner.pump.lock().expect("pump mutex poisoned").take() {
            pump.abort();
        }
        self.inner.connected.send_replace(false);
        Ok(())
    }

    fn proxy_from_reply(
        &self,
        domain: String,
        agent: String,
        klass: String,
        proxy_id: String,
        reply: Value,
    ) -> Result<Proxy, VrpcError> {
        let target_id = reply
            .as_str()
            .ok_or_else(|| VrpcError::protocol("creation reply did not carry an instance id"))?
            .to_owned();
        let methods = self
            .inner
            .cache
            .snapshot(|tree| {
                tree.class_info(&domain, &agent, &klass)
                    .map(|info| stripped_names(&info.member_functions))
            })
            .ok_or_else(|| {
                VrpcError::config(format!("no class info discovered for {klass} on {domain}/{agent}"))
            })?;
        Ok(Proxy::new(self.inner.clone(), domain, agent, klass, target_id, proxy_id, methods))
    }
}

impl RemoteInner {
    fn start_pump(
        inner: &Arc<Self>,
        mut inbound: tokio::sync::mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let handle = tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(message) = inbound.recv().await {
                    inner.route(&message);
                }
            }
        });
        *inner.pump.lock().expect("pump mutex poisoned") = Some(handle);
    }

    fn route(&self, message: &InboundMessage) {
        if message.topic == self.inbox {
            let msg = match RpcMessage::decode(&message.payload) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("dropping malformed inbox payload: {err}");
                    return;
                }
            };
            if is_tunnel_id(&msg.id) {
                self.tunnels.deliver(&msg.id, &msg.data);
            } else {
                self.correlator.settle(&msg);
            }
            return;
        }
        match Topic::parse(&message.topic) {
            Ok(parsed) if parsed.is_info() => self.cache.apply_info(&parsed, &message.payload),
            _ => debug!("ignoring message on {}", message.topic),
        }
    }

    fn link(&self) -> Arc<dyn BrokerLink> {
        self.link.lock().expect("link mutex poisoned").clone()
    }

    pub(crate) async fn request(
        &self,
        publish_topic: &str,
        target_id: &str,
        method: &str,
        data: Map<String, Value>,
    ) -> Result<Value, VrpcError> {
        let id = self.ids.next();
        let msg = RpcMessage::request(target_id, method, &id, &self.inbox, data);
        let rx = self.correlator.register(&id, self.timeout_ms);
        self.link().publish(publish_topic, msg.encode()?, false)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(VrpcError::transport("connection closed")),
        }
    }

    fn resolve_scope(
        &self,
        domain: &Option<String>,
        agent: &Option<String>,
    ) -> Result<(String, String), VrpcError> {
        let domain = domain.clone().unwrap_or_else(|| self.domain.clone());
        if domain == ANY {
            return Err(VrpcError::config("operation requires a concrete domain, not *"));
        }
        let agent = agent.clone().unwrap_or_else(|| self.agent.clone());
        if agent == ANY {
            return Err(VrpcError::config("operation requires a concrete agent, not *"));
        }
        Ok((domain, agent))
    }
}

fn open_session(
    broker: &dyn Broker,
    broker_options: &BrokerOptions,
    domain: &str,
    agent: &str,
    instance: &str,
    inbox: &str,
) -> Result<Session, VrpcError> {
    let offline = AgentInfo { status: AgentStatus::Offline, hostname: hostname() };
    let payload =
        serde_json::to_vec(&offline).map_err(|err| VrpcError::protocol(err.to_string()))?;
    let session = broker.connect(ConnectRequest {
        client_id: client_id(instance),
        options: broker_options.clone(),
        will: Some(Will { topic: format!("{inbox}/{INFO_METHOD}"), payload }),
    })?;
    session.link.subscribe(inbox)?;
    session.link.subscribe(&discovery_filter(domain, agent))?;
    Ok(session)
}
