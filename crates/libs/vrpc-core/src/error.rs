use thiserror::Error;

/// Error surface shared by every crate in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VrpcError {
    /// A required parameter is absent or a wildcard was passed where a
    /// concrete value is required. Raised synchronously at the call site.
    #[error("configuration error: {0}")]
    Config(String),

    /// No reply arrived within the configured call timeout.
    #[error("Function call timed out (> {0} ms)")]
    Timeout(u64),

    /// The peer answered with an error payload; the message is verbatim.
    #[error("{0}")]
    Remote(String),

    /// Publish, subscribe or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload or topic. Logged and dropped on the agent side,
    /// surfaced on the remote side only when it hits an awaited call.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl VrpcError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
