//! Supervises long-lived connections to external MCP servers and exposes
//! their tools through a single, live-patched [`registry::ToolRegistry`].
//!
//! See `supervisor` for the entry point ([`Supervisor`]), `runner` for the
//! per-server reconnection state machine, and `proxy` for the registry-
//! visible representation of one remote tool.

mod config;
mod connection;
mod error;
mod proxy;
mod registry;
mod runner;
mod stats;
mod supervisor;
mod transport;

pub use config::{ServerConfig, TransportConfig};
pub use error::{ErrorKind, Result, SupervisorError};
pub use proxy::{ArgumentAdaptor, ToolProxy, ToolProxyStats};
pub use registry::{InMemoryToolRegistry, ToolRegistry};
pub use stats::{ServerStats, SupervisorStats, ToolProxyStatsSnapshot};
pub use supervisor::{AddServerOptions, Supervisor, WaitHandle};
