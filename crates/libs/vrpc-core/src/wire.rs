use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::VrpcError;

/// Prefix marking a reply whose real result arrives in a second message.
pub const PROMISE_PREFIX: &str = "__p__";
/// Prefix marking an on-wire stand-in for a callable argument.
pub const TUNNEL_PREFIX: &str = "__f__";

const RESULT_KEY: &str = "r";
const ERROR_KEY: &str = "e";

/// The single payload shape used for requests, replies and callback
/// invocations. Everything is UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Class name for static calls, instance id otherwise.
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub method: String,
    /// Correlation id, promise token or tunnel id.
    pub id: String,
    /// The remote's client-id reply topic.
    pub sender: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RpcMessage {
    pub fn request(
        target_id: impl Into<String>,
        method: impl Into<String>,
        id: impl Into<String>,
        sender: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            method: method.into(),
            id: id.into(),
            sender: sender.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, VrpcError> {
        serde_json::to_vec(self).map_err(|err| VrpcError::protocol(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VrpcError> {
        serde_json::from_slice(bytes).map_err(|err| VrpcError::protocol(err.to_string()))
    }

    pub fn set_ok(&mut self, value: Value) {
        self.data.remove(ERROR_KEY);
        self.data.insert(RESULT_KEY.to_owned(), value);
    }

    pub fn set_err(&mut self, message: impl Into<String>) {
        self.data.remove(RESULT_KEY);
        self.data.insert(ERROR_KEY.to_owned(), Value::String(message.into()));
    }

    pub fn result(&self) -> Option<&Value> {
        self.data.get(RESULT_KEY)
    }

    pub fn error(&self) -> Option<&str> {
        self.data.get(ERROR_KEY).and_then(Value::as_str)
    }
}

/// Packs arguments positionally as `_1.._N`.
pub fn pack_positional(args: &[Value]) -> Map<String, Value> {
    let mut data = Map::new();
    for (index, arg) in args.iter().enumerate() {
        data.insert(format!("_{}", index + 1), arg.clone());
    }
    data
}

/// Recovers positional arguments: keys beginning with `_`, sorted
/// lexicographically. For ten or more arguments this yields `_1,_10,_2,…`;
/// the skew is kept for wire compatibility.
pub fn positional_args(data: &Map<String, Value>) -> Vec<Value> {
    let mut entries: Vec<(&String, &Value)> =
        data.iter().filter(|(key, _)| key.starts_with('_')).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, value)| value.clone()).collect()
}

pub fn is_promise_token(id: &str) -> bool {
    id.starts_with(PROMISE_PREFIX)
}

pub fn is_tunnel_id(id: &str) -> bool {
    id.starts_with(TUNNEL_PREFIX)
}
