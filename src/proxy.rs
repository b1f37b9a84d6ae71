//! Tool Proxy: the registry-visible representation of one remote tool.
//!
//! A Proxy's identity (prefixed name, remote name, description, schema) is
//! fixed at creation. Its Connection reference is the one thing that
//! changes in place, patched by the owning Runner on every successful
//! reconnect so in-flight references held by callers stay valid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::Map;

use crate::connection::Connection;
use crate::error::{ErrorKind, Result, SupervisorError};
use crate::supervisor::SupervisorInner;

/// How long a Proxy's retried `invoke` waits for a requested reconnect to
/// complete before giving up and retrying against whatever connection is
/// current anyway.
pub(crate) const RECONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The mutable Connection reference shared by every Proxy of one server.
/// `None` before the server's first successful connect, or while its
/// connection is being replaced.
pub(crate) type ConnectionSlot = tokio::sync::RwLock<Option<Arc<Connection>>>;

/// Rewrites call arguments before they are forwarded to the remote server.
///
/// Grounded in the original implementation's per-server `path_adaptor` hook
/// (see the crate's design notes): an optional, per-Proxy transform applied
/// just before `Connection::call_tool`. Defaults to the identity transform
/// when a server configures none.
#[async_trait]
pub trait ArgumentAdaptor: Send + Sync {
    async fn adapt(&self, remote_tool_name: &str, arguments: Option<Map<String, serde_json::Value>>) -> Option<Map<String, serde_json::Value>>;
}

/// Running counters for one Proxy, surfaced through `Supervisor::stats`.
#[derive(Default)]
pub struct ToolProxyStats {
    calls: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl ToolProxyStats {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }
    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// One remote tool, addressable in the Tool Registry by its prefixed name.
pub struct ToolProxy {
    pub server_name: String,
    pub remote_name: String,
    pub prefixed_name: String,
    pub description: Option<String>,
    pub input_schema: Arc<Map<String, serde_json::Value>>,
    connection: Arc<ConnectionSlot>,
    supervisor: Weak<SupervisorInner>,
    adaptor: Option<Arc<dyn ArgumentAdaptor>>,
    pub stats: ToolProxyStats,
}

impl ToolProxy {
    pub(crate) fn new(
        server_name: String,
        remote_name: String,
        description: Option<String>,
        input_schema: Arc<Map<String, serde_json::Value>>,
        connection: Arc<ConnectionSlot>,
        supervisor: Weak<SupervisorInner>,
        adaptor: Option<Arc<dyn ArgumentAdaptor>>,
    ) -> Self {
        let prefixed_name = format!("{server_name}_{remote_name}");
        Self {
            server_name,
            remote_name,
            prefixed_name,
            description,
            input_schema,
            connection,
            supervisor,
            adaptor,
            stats: ToolProxyStats::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(server_name: &str, remote_name: &str, connection: Arc<ConnectionSlot>) -> Self {
        Self::new(
            server_name.to_string(),
            remote_name.to_string(),
            None,
            Arc::new(Map::new()),
            connection,
            Weak::new(),
            None,
        )
    }

    /// Forward one invocation to the server currently owning this tool.
    ///
    /// 1. Snapshot the current Connection reference.
    /// 2. Call it.
    /// 3. On a transport-shaped failure, ask the supervisor to reconnect,
    ///    wait (bounded) for that to resolve, then retry exactly once.
    /// 4. On a tool-execution failure, surface it without retrying — it is
    ///    a remote-side failure, not a transport problem.
    pub async fn invoke(&self, arguments: Option<Map<String, serde_json::Value>>) -> Result<CallToolResult> {
        self.stats.record_call();
        let adapted = match &self.adaptor {
            Some(adaptor) => adaptor.adapt(&self.remote_name, arguments).await,
            None => arguments,
        };

        match self.call_once(adapted.clone()).await {
            Ok(result) => {
                self.stats.record_success();
                Ok(result)
            }
            Err(error) if error.kind() == ErrorKind::Transport || error.kind() == ErrorKind::Protocol => {
                self.stats.record_retry();
                if let Some(supervisor) = self.supervisor.upgrade() {
                    let handle = supervisor.request_reconnect(&self.server_name);
                    let _ = tokio::time::timeout(RECONNECT_WAIT_TIMEOUT, handle.wait()).await;
                }
                match self.call_once(adapted).await {
                    Ok(result) => {
                        self.stats.record_success();
                        Ok(result)
                    }
                    Err(error) => {
                        self.stats.record_failure();
                        Err(error)
                    }
                }
            }
            Err(error) => {
                self.stats.record_failure();
                Err(error)
            }
        }
    }

    async fn call_once(&self, arguments: Option<Map<String, serde_json::Value>>) -> Result<CallToolResult> {
        let connection = self.connection.read().await.clone();
        let Some(connection) = connection else {
            return Err(SupervisorError::transport(
                self.server_name.clone(),
                0,
                anyhow::anyhow!("server '{}' has no live connection yet", self.server_name),
            ));
        };

        let request = CallToolRequestParam {
            name: self.remote_name.clone().into(),
            arguments,
        };

        let response = connection.call_tool(request).await.map_err(|source| {
            if is_protocol_error(&source) {
                SupervisorError::protocol(self.server_name.clone(), source)
            } else {
                SupervisorError::transport(self.server_name.clone(), 1, source)
            }
        })?;

        if response.is_error.unwrap_or(false) {
            let message = extract_text(&response);
            return Err(SupervisorError::ToolExecution {
                server: self.server_name.clone(),
                tool: self.remote_name.clone(),
                message,
            });
        }

        Ok(response)
    }
}

/// Concatenate the textual content blocks of a tool result, used to build
/// a human-readable message for `ToolExecutionError`.
fn extract_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|block| block.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Best-effort classification of an internal error as protocol-shaped
/// (the server responded but rejected the request) versus transport-shaped
/// (couldn't reach it / it went away). Grounded on the same `ServiceError`
/// variants rmcp exposes; anything we can't downcast is treated as a
/// transport error since that is the more common failure mode in practice.
fn is_protocol_error(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<rmcp::ServiceError>(),
        Some(rmcp::ServiceError::McpError(_)) | Some(rmcp::ServiceError::UnexpectedResponse)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::write_echo_script;

    struct UppercaseAdaptor;

    #[async_trait]
    impl ArgumentAdaptor for UppercaseAdaptor {
        async fn adapt(
            &self,
            _remote_tool_name: &str,
            arguments: Option<Map<String, serde_json::Value>>,
        ) -> Option<Map<String, serde_json::Value>> {
            let mut arguments = arguments.unwrap_or_default();
            if let Some(serde_json::Value::String(value)) = arguments.get_mut("value") {
                *value = value.to_uppercase();
            }
            Some(arguments)
        }
    }

    async fn connected_slot(dir: &std::path::Path) -> anyhow::Result<Arc<ConnectionSlot>> {
        let script = write_echo_script(dir)?;
        let transport_config = crate::config::TransportConfig::Stdio {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: Default::default(),
        };
        let connection = Connection::open("mock", &transport_config).await?;
        Ok(Arc::new(tokio::sync::RwLock::new(Some(Arc::new(connection)))))
    }

    #[tokio::test]
    async fn invoke_without_connection_is_a_transport_error() {
        let slot: Arc<ConnectionSlot> = Arc::new(tokio::sync::RwLock::new(None));
        let proxy = ToolProxy::new_for_test("s1", "echo_tool", slot);
        let err = proxy.invoke(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn invoke_forwards_to_the_current_connection() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let slot = connected_slot(temp.path()).await?;
        let proxy = ToolProxy::new_for_test("mock", "echo_tool", slot);

        let result = proxy.invoke(None).await?;
        assert_eq!(
            result.content[0].as_text().map(|t| t.text.as_str()),
            Some("pong")
        );
        assert_eq!(proxy.stats.calls(), 1);
        assert_eq!(proxy.stats.successes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn invoke_runs_the_argument_adaptor_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let slot = connected_slot(temp.path()).await?;
        let mut proxy = ToolProxy::new_for_test("mock", "echo_tool", slot);
        proxy.adaptor = Some(Arc::new(UppercaseAdaptor));

        // The mock server always answers "pong" regardless of arguments, so
        // this only exercises that the adaptor runs without erroring, not
        // that its output reaches the wire distinctly.
        let result = proxy
            .invoke(Some(
                serde_json::json!({"value": "ping"}).as_object().cloned().unwrap(),
            ))
            .await?;
        assert!(result.content[0].as_text().is_some());
        Ok(())
    }
}
