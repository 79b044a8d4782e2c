use vrpc_core::VrpcError;

pub const DEFAULT_BROKER_URL: &str = "mqtts://vrpc.io:8883";

/// Username substituted whenever token authentication is used; the token
/// itself travels as the password.
pub const TOKEN_USERNAME: &str = "__token__";

/// Broker endpoint and credentials shared by agent and remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub broker_url: String,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_owned(),
            token: None,
            username: None,
            password: None,
        }
    }
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Resolved (username, password) pair: a token fixes the username to
    /// `__token__` and travels as the password.
    pub fn credentials(&self) -> Option<(String, String)> {
        if let Some(token) = &self.token {
            return Some((TOKEN_USERNAME.to_owned(), token.clone()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, VrpcError> {
        Endpoint::parse(&self.broker_url)
    }
}

/// Parsed broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, VrpcError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| VrpcError::config(format!("broker url has no scheme: {url:?}")))?;
        let (tls, default_port) = match scheme {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" => (true, 8883),
            other => {
                return Err(VrpcError::config(format!("unsupported broker scheme: {other:?}")))
            }
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| VrpcError::config(format!("bad broker port in {url:?}")))?;
                (host, port)
            }
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(VrpcError::config(format!("broker url has no host: {url:?}")));
        }
        Ok(Self { scheme: scheme.to_owned(), host: host.to_owned(), port, tls })
    }
}
