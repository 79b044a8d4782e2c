use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use vrpc_broker::BrokerLink;
use vrpc_core::discovery::ClassInfo;
use vrpc_core::ident::random_token;
use vrpc_core::wire::{is_tunnel_id, pack_positional, PROMISE_PREFIX};
use vrpc_core::{RpcMessage, VrpcError};

/// Outbound path handed to every invocation: lets adapter code call tunneled
/// callbacks and settle promise tokens on the requester's reply topic.
#[derive(Clone)]
pub struct CallbackGate {
    link: Arc<dyn BrokerLink>,
    sender: String,
    target_id: String,
    method: String,
}

impl CallbackGate {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        sender: impl Into<String>,
        target_id: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            link,
            sender: sender.into(),
            target_id: target_id.into(),
            method: method.into(),
        }
    }

    fn send(&self, id: &str, data: serde_json::Map<String, Value>) -> Result<(), VrpcError> {
        let msg = RpcMessage::request(&self.target_id, &self.method, id, &self.sender, data);
        self.link.publish(&self.sender, msg.encode()?, false)
    }

    /// Invokes a tunneled callable: a message whose id is the tunnel id and
    /// whose data carries the positional arguments.
    pub fn invoke(&self, tunnel_id: &str, args: &[Value]) -> Result<(), VrpcError> {
        self.send(tunnel_id, pack_positional(args))
    }

    /// Settles a previously returned promise token with a success value.
    pub fn resolve(&self, promise_token: &str, value: Value) -> Result<(), VrpcError> {
        let mut msg =
            RpcMessage::request(&self.target_id, &self.method, promise_token, &self.sender, serde_json::Map::new());
        msg.set_ok(value);
        self.link.publish(&self.sender, msg.encode()?, false)
    }

    /// Settles a previously returned promise token with an error.
    pub fn reject(&self, promise_token: &str, message: impl Into<String>) -> Result<(), VrpcError> {
        let mut msg =
            RpcMessage::request(&self.target_id, &self.method, promise_token, &self.sender, serde_json::Map::new());
        msg.set_err(message);
        self.link.publish(&self.sender, msg.encode()?, false)
    }
}

/// Fresh promise token; return it as the call result and settle it later via
/// [`CallbackGate::resolve`] / [`CallbackGate::reject`].
pub fn new_promise_token() -> String {
    format!("{PROMISE_PREFIX}{}{}", random_token(), random_token())
}

/// Everything one invocation sees: positional arguments plus the gate back
/// to the caller.
pub struct CallContext {
    pub args: Vec<Value>,
    pub gate: CallbackGate,
}

impl CallContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn string_arg(&self, index: usize) -> Result<&str, VrpcError> {
        self.arg(index)
            .and_then(Value::as_str)
            .ok_or_else(|| VrpcError::Remote(format!("argument {} must be a string", index + 1)))
    }

    /// Interprets argument `index` as a tunneled callable.
    pub fn callback(&self, index: usize) -> Result<RemoteCallback, VrpcError> {
        let id = self.string_arg(index)?;
        if !is_tunnel_id(id) {
            return Err(VrpcError::Remote(format!("argument {} is not callable", index + 1)));
        }
        Ok(RemoteCallback { gate: self.gate.clone(), id: id.to_owned() })
    }
}

/// A tunneled callable captured from the arguments; may outlive the call for
/// event-style registrations.
#[derive(Clone)]
pub struct RemoteCallback {
    gate: CallbackGate,
    id: String,
}

impl RemoteCallback {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn invoke(&self, args: &[Value]) -> Result<(), VrpcError> {
        self.gate.invoke(&self.id, args)
    }
}

/// The binding layer seam: reflects host classes and their live instances
/// into the dispatcher.
pub trait Adapter: Send + Sync {
    fn classes(&self) -> Vec<String>;
    fn class_info(&self, klass: &str) -> Option<ClassInfo>;
    /// Creates an instance; `name` makes the creation idempotent per name and
    /// doubles as the instance id.
    fn create(&self, klass: &str, name: Option<&str>, ctx: &CallContext) -> Result<String, VrpcError>;
    fn get_named(&self, klass: &str, name: &str) -> Result<String, VrpcError>;
    fn delete(&self, klass: &str, instance: &str) -> Result<bool, VrpcError>;
    fn invoke_static(&self, klass: &str, method: &str, ctx: &CallContext) -> Result<Value, VrpcError>;
    fn invoke_member(&self, instance: &str, method: &str, ctx: &CallContext) -> Result<Value, VrpcError>;
}

type Constructor = Box<dyn Fn(&CallContext) -> Result<Box<dyn Any + Send>, VrpcError> + Send + Sync>;
type MemberFn = Box<dyn Fn(&mut (dyn Any + Send), &CallContext) -> Result<Value, VrpcError> + Send + Sync>;
type StaticFn = Box<dyn Fn(&CallContext) -> Result<Value, VrpcError> + Send + Sync>;

/// One callable class: constructor plus named member and static functions.
/// Function names may carry overload tags (`name-<sig>`); the dispatcher
/// routes on the bare name.
pub struct ClassBinding {
    name: String,
    constructor: Option<Constructor>,
    member_functions: BTreeMap<String, MemberFn>,
    static_functions: BTreeMap<String, StaticFn>,
}

impl ClassBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            member_functions: BTreeMap::new(),
            static_functions: BTreeMap::new(),
        }
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext) -> Result<Box<dyn Any + Send>, VrpcError> + Send + Sync + 'static,
    {
        self.constructor = Some(Box::new(f));
        self
    }

    pub fn member<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut (dyn Any + Send), &CallContext) -> Result<Value, VrpcError> + Send + Sync + 'static,
    {
        self.member_functions.insert(name.into(), Box::new(f));
        self
    }

    pub fn static_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext) -> Result<Value, VrpcError> + Send + Sync + 'static,
    {
        self.static_functions.insert(name.into(), Box::new(f));
        self
    }
}

struct InstanceSlot {
    klass: String,
    state: Box<dyn Any + Send>,
}

/// In-repo [`Adapter`] implementation backed by closures.
#[derive(Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, ClassBinding>,
    instances: Mutex<BTreeMap<String, InstanceSlot>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, binding: ClassBinding) -> Self {
        self.classes.insert(binding.name.clone(), binding);
        self
    }

    fn binding(&self, klass: &str) -> Result<&ClassBinding, VrpcError> {
        self.classes
            .get(klass)
            .ok_or_else(|| VrpcError::Remote(format!("Unknown class: {klass}")))
    }

    fn function<'a, F>(
        functions: &'a BTreeMap<String, F>,
        method: &str,
    ) -> Option<&'a F> {
        // Exact match first, then the first overload carrying this bare name.
        functions.get(method).or_else(|| {
            functions
                .iter()
                .find(|(name, _)| vrpc_core::discovery::strip_signature(name) == method)
                .map(|(_, f)| f)
        })
    }
}

impl Adapter for ClassRegistry {
    fn classes(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    fn class_info(&self, klass: &str) -> Option<ClassInfo> {
        let binding = self.classes.get(klass)?;
        let instances = {
            let slots = self.instances.lock().expect("instances mutex poisoned");
            slots
                .iter()
                .filter(|(_, slot)| slot.klass == klass)
                .map(|(id, _)| id.clone())
                .collect()
        };
        Some(ClassInfo {
            class_name: binding.name.clone(),
            instances,
            member_functions: binding.member_functions.keys().cloned().collect(),
            static_functions: binding.static_functions.keys().cloned().collect(),
        })
    }

    fn create(&self, klass: &str, name: Option<&str>, ctx: &CallContext) -> Result<String, VrpcError> {
        let binding = self.binding(klass)?;
        let id = match name {
            Some(name) => name.to_owned(),
            None => format!("{klass}-{}", random_token()),
        };
        let mut slots = self.instances.lock().expect("instances mutex poisoned");
        if let Some(slot) = slots.get(&id) {
            if slot.klass == klass {
                return Ok(id);
            }
            return Err(VrpcError::Remote(format!(
                "Instance {id} already exists with class {}",
                slot.klass
            )));
        }
        let constructor = binding
            .constructor
            .as_ref()
            .ok_or_else(|| VrpcError::Remote(format!("Class {klass} has no constructor")))?;
        let state = constructor(ctx)?;
        slots.insert(id.clone(), InstanceSlot { klass: klass.to_owned(), state });
        Ok(id)
    }

    fn get_named(&self, klass: &str, name: &str) -> Result<String, VrpcError> {
        let slots = self.instances.lock().expect("instances mutex poisoned");
        match slots.get(name) {
            Some(slot) if slot.klass == klass => Ok(name.to_owned()),
            _ => Err(VrpcError::Remote(format!("Instance {name} does not exist"))),
        }
    }

    fn delete(&self, _klass: &str, instance: &str) -> Result<bool, VrpcError> {
        let mut slots = self.instances.lock().expect("instances mutex poisoned");
        Ok(slots.remove(instance).is_some())
    }

    fn invoke_static(&self, klass: &str, method: &str, ctx: &CallContext) -> Result<Value, VrpcError> {
        let binding = self.binding(klass)?;
        let function = Self::function(&binding.static_functions, method)
            .ok_or_else(|| VrpcError::Remote(format!("Unknown static function: {klass}::{method}")))?;
        function(ctx)
    }

    fn invoke_member(&self, instance: &str, method: &str, ctx: &CallContext) -> Result<Value, VrpcError> {
        let mut slots = self.instances.lock().expect("instances mutex poisoned");
        let slot = slots
            .get_mut(instance)
            .ok_or_else(|| VrpcError::Remote(format!("Instance {instance} does not exist")))?;
        let binding = self.binding(&slot.klass)?;
        let function = Self::function(&binding.member_functions, method).ok_or_else(|| {
            VrpcError::Remote(format!("Unknown member function: {}::{method}", slot.klass))
        })?;
        function(slot.state.as_mut(), ctx)
    }
}
