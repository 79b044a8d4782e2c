use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use vrpc_broker::BrokerOptions;
use vrpc_remote::RemoteOptions;

/// Optional profile file carrying the same fields as the command-line flags;
/// flags always win over the profile.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub broker: Option<String>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse profile {}", path.display()))
    }
}

/// Fully resolved connection settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerOptions,
    pub domain: String,
    pub agent: String,
    pub timeout_ms: u64,
}

pub struct Overrides {
    pub broker: Option<String>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl Settings {
    pub fn resolve(profile: Profile, flags: Overrides) -> Self {
        let defaults = RemoteOptions::default();
        let mut broker = BrokerOptions::default();
        if let Some(url) = flags.broker.or(profile.broker) {
            broker = broker.with_broker(url);
        }
        if let (Some(username), Some(password)) =
            (flags.username.or(profile.username), flags.password.or(profile.password))
        {
            broker = broker.with_credentials(username, password);
        }
        // Token last: it overrides username/password by fixing the username.
        if let Some(token) = flags.token.or(profile.token) {
            broker = broker.with_token(token);
        }
        Self {
            broker,
            domain: flags.domain.or(profile.domain).unwrap_or(defaults.domain),
            agent: flags.agent.or(profile.agent).unwrap_or(defaults.agent),
            timeout_ms: flags.timeout_ms.or(profile.timeout_ms).unwrap_or(defaults.timeout_ms),
        }
    }

    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions::default()
            .with_broker(self.broker.clone())
            .with_domain(self.domain.clone())
            .with_agent(self.agent.clone())
            .with_timeout_ms(self.timeout_ms)
    }
}
