use std::fmt;

/// Public error taxonomy for the supervisor.
///
/// Internal helpers return `anyhow::Result` (see `transport.rs`, `connection.rs`);
/// the Runner is the boundary that maps those into the variant a caller of
/// `Supervisor::add_server` / `ToolProxy::invoke` actually needs to match on.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("MCP server '{0}' already exists")]
    Duplicate(String),

    #[error("MCP server '{0}' not found")]
    NotFound(String),

    #[error("invalid configuration for MCP server '{server}': {reason}")]
    Config { server: String, reason: String },

    #[error("transport error talking to MCP server '{server}' after {attempts} attempt(s): {source}")]
    Transport {
        server: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("MCP server '{server}' rejected the protocol handshake: {source}")]
    Protocol {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("tool '{tool}' on MCP server '{server}' reported a failure: {message}")]
    ToolExecution {
        server: String,
        tool: String,
        message: String,
    },

    #[error("operation on MCP server '{0}' was cancelled because the supervisor is shutting down")]
    Cancelled(String),

    #[error(
        "{method}() must be called from the supervisor's execution context (got called from outside it)"
    )]
    WrongContext { method: &'static str },
}

impl SupervisorError {
    pub(crate) fn transport(server: impl Into<String>, attempts: u32, source: anyhow::Error) -> Self {
        Self::Transport {
            server: server.into(),
            attempts,
            source,
        }
    }

    pub(crate) fn protocol(server: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Protocol {
            server: server.into(),
            source,
        }
    }

    /// Whether this error reflects a retriable transport/protocol condition
    /// as opposed to a remote tool-side failure or local misconfiguration.
    pub fn is_transport_like(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }
}

/// A short, loggable classification of an error, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Protocol,
    ToolExecution,
    Cancelled,
    NotFound,
    Duplicate,
    WrongContext,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::ToolExecution => "tool_execution",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::WrongContext => "wrong_context",
        };
        f.write_str(s)
    }
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Config { .. } => ErrorKind::Config,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::ToolExecution { .. } => ErrorKind::ToolExecution,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::WrongContext { .. } => ErrorKind::WrongContext,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
