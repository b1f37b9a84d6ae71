//! Machine-readable statistics snapshot, `Serialize`d in the shape an
//! embedding application would want to expose on its own status endpoint.

use std::collections::HashMap;

use serde::Serialize;

/// Snapshot of one Proxy's call counters.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct ToolProxyStatsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Per-server aggregation: how many tools it currently publishes, and each
/// one's call counters keyed by prefixed name.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub tool_count: usize,
    pub tools: HashMap<String, ToolProxyStatsSnapshot>,
}

/// Top-level statistics returned by `Supervisor::stats`.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub total_servers: usize,
    pub total_tools: usize,
    pub servers: HashMap<String, ServerStats>,
}
