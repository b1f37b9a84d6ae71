//! The Supervisor: the crate's public entry point. Owns every Runner,
//! publishes tools through a shared Tool Registry, and bridges the one
//! cross-context operation (`request_reconnect`) into its own execution
//! context via a command channel, mirroring the teacher's queue-worker
//! pattern (`ServerQueueHandle`) rather than a raw thread-safe callback.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::TransportConfig;
use crate::error::{Result, SupervisorError};
use crate::proxy::ArgumentAdaptor;
use crate::registry::{InMemoryToolRegistry, ToolRegistry};
use crate::runner::{self, RunnerConfig, RunnerHandle};
use crate::stats::{ServerStats, SupervisorStats, ToolProxyStatsSnapshot};

/// Per-server options accepted by [`Supervisor::add_server`].
#[derive(Clone, Default)]
pub struct AddServerOptions {
    /// If set, only these remote tool names are registered at first
    /// connect. `None` registers everything the server reports.
    pub include_tools: Option<Vec<String>>,
    /// Rewrites call arguments before they reach the remote server.
    pub adaptor: Option<Arc<dyn ArgumentAdaptor>>,
}

/// A completion handle returned by [`Supervisor::request_reconnect`].
/// Resolves once the server's next reconnect cycle exits `Connecting`
/// (success or terminal failure), or immediately if the server is unknown
/// or the supervisor has already shut down.
pub struct WaitHandle {
    rx: oneshot::Receiver<()>,
}

impl WaitHandle {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

enum Command {
    RequestReconnect {
        server_name: String,
        waiter: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct StoredServerConfig {
    transport: TransportConfig,
    options: AddServerOptions,
}

#[derive(Default)]
struct SupervisorState {
    runners: HashMap<String, RunnerHandle>,
    configs: HashMap<String, StoredServerConfig>,
}

/// Shared state behind every `Supervisor` handle and every `ToolProxy`'s
/// back-reference (held as a `Weak`, per the spec's ownership model).
pub(crate) struct SupervisorInner {
    state: Mutex<SupervisorState>,
    registry: tokio::sync::RwLock<Arc<dyn ToolRegistry>>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorInner {
    /// The one operation safe to call from outside the supervisor's
    /// execution context (including a foreign OS thread): non-blocking,
    /// posts a command rather than touching `state` directly.
    pub(crate) fn request_reconnect(&self, server_name: &str) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        let command = Command::RequestReconnect {
            server_name: server_name.to_string(),
            waiter: tx,
        };
        if let Err(mpsc::error::SendError(Command::RequestReconnect { waiter, .. })) =
            self.command_tx.send(command)
        {
            // Supervisor has shut down: the handle is already signaled.
            let _ = waiter.send(());
        }
        WaitHandle { rx }
    }
}

fn spawn_command_loop(inner: std::sync::Weak<SupervisorInner>, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::RequestReconnect { server_name, waiter } => {
                    let Some(inner) = inner.upgrade() else {
                        let _ = waiter.send(());
                        continue;
                    };
                    let state = inner.state.lock().await;
                    match state.runners.get(&server_name) {
                        Some(runner) => runner.request_reconnect(waiter),
                        None => {
                            let _ = waiter.send(());
                        }
                    }
                }
            }
        }
    });
}

/// Supervises long-lived connections to MCP servers and keeps their tools
/// published in a shared [`ToolRegistry`].
///
/// ```no_run
/// # async fn example() -> Result<(), mcp_supervisor::SupervisorError> {
/// use mcp_supervisor::{Supervisor, AddServerOptions, TransportConfig};
///
/// let supervisor = Supervisor::new();
/// supervisor
///     .add_server(
///         "docs",
///         TransportConfig::Stdio {
///             command: "docs-mcp".into(),
///             args: vec![],
///             env: Default::default(),
///         },
///         AddServerOptions::default(),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor with the default in-memory Tool Registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(InMemoryToolRegistry::new()))
    }

    /// Create a supervisor publishing into a caller-supplied registry.
    pub fn with_registry(registry: Arc<dyn ToolRegistry>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak| {
            spawn_command_loop(weak.clone(), command_rx);
            SupervisorInner {
                state: Mutex::new(SupervisorState::default()),
                registry: tokio::sync::RwLock::new(registry),
                command_tx,
            }
        });
        Self { inner }
    }

    /// Attach a Tool Registry as the publication target for subsequent
    /// `add_server`/`remove_server`/`reload_server` calls. Idempotent.
    pub async fn register_tools(&self, registry: Arc<dyn ToolRegistry>) {
        *self.inner.registry.write().await = registry;
    }

    /// Start a Runner for `name` and block until its first connect
    /// resolves. Must be called from the supervisor's own execution
    /// context (an `async fn` already running on the ambient runtime).
    pub async fn add_server(
        &self,
        name: impl Into<String>,
        transport: TransportConfig,
        options: AddServerOptions,
    ) -> Result<()> {
        let name = name.into();
        let mut state = self.inner.state.lock().await;
        if state.runners.contains_key(&name) {
            return Err(SupervisorError::Duplicate(name));
        }

        let registry = self.inner.registry.read().await.clone();
        let config = RunnerConfig {
            server_name: name.clone(),
            transport: transport.clone(),
            include_tools: options.include_tools.clone(),
            adaptor: options.adaptor.clone(),
        };

        let (handle, first_connect) =
            runner::spawn(config, registry, Arc::downgrade(&self.inner)).await;

        match first_connect {
            Ok(()) => {
                state.runners.insert(name.clone(), handle);
                state
                    .configs
                    .insert(name, StoredServerConfig { transport, options });
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Stop the Runner for `name`, await its task completion, and unpublish
    /// its tools. Must be called from the supervisor's own execution
    /// context.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let handle = {
            let mut state = self.inner.state.lock().await;
            let handle = state
                .runners
                .remove(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            state.configs.remove(name);
            handle
        };

        let registry = self.inner.registry.read().await.clone();
        registry.unregister_server(name).await;

        handle.request_stop();
        let _ = handle.join_handle.await;
        Ok(())
    }

    /// Remove and re-add `name` against its original configuration,
    /// rebuilding its Proxies from a fresh `list_tools` call. Unlike an
    /// in-place reconnect, this re-applies the include-filter and replaces
    /// Proxy identities — the explicit mechanism for picking up a remote
    /// tool list that changed since the server was added.
    pub async fn reload_server(&self, name: &str) -> Result<()> {
        let stored = {
            let state = self.inner.state.lock().await;
            state
                .configs
                .get(name)
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?
        };

        self.remove_server(name).await?;
        self.add_server(name, stored.transport, stored.options).await
    }

    /// Non-blocking; safe to call from any context, including a foreign OS
    /// thread. See [`SupervisorInner::request_reconnect`].
    pub fn request_reconnect(&self, name: &str) -> WaitHandle {
        self.inner.request_reconnect(name)
    }

    /// Remove every server, tolerating per-server failures by logging and
    /// continuing. Must be called from the supervisor's own execution
    /// context.
    pub async fn cleanup(&self) -> Result<()> {
        let names: Vec<String> = {
            let state = self.inner.state.lock().await;
            state.runners.keys().cloned().collect()
        };

        let mut had_failure = false;
        for name in names {
            if let Err(error) = self.remove_server(&name).await {
                tracing::warn!(server = %name, error = %error, "cleanup: failed to remove server, continuing");
                had_failure = true;
            }
        }

        if had_failure {
            Err(SupervisorError::Config {
                server: "*".to_string(),
                reason: "cleanup encountered per-server failures; see logs".to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.inner.state.lock().await.runners.keys().cloned().collect()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.inner.registry.read().await.clone().tool_names().await
    }

    pub async fn tool_names_for_server(&self, server_name: &str) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .clone()
            .tool_names_for_server(server_name)
            .await
    }

    /// Machine-readable statistics: server/tool counts and per-tool call
    /// counters, in the shape documented on [`SupervisorStats`].
    pub async fn stats(&self) -> SupervisorStats {
        let registry = self.inner.registry.read().await.clone();
        let proxies = registry.all().await;

        let mut servers: HashMap<String, ServerStats> = HashMap::new();
        for proxy in &proxies {
            let entry = servers.entry(proxy.server_name.clone()).or_default();
            entry.tool_count += 1;
            entry.tools.insert(
                proxy.prefixed_name.clone(),
                ToolProxyStatsSnapshot {
                    calls: proxy.stats.calls(),
                    successes: proxy.stats.successes(),
                    retries: proxy.stats.retries(),
                    failures: proxy.stats.failures(),
                },
            );
        }

        let state = self.inner.state.lock().await;
        for server_name in state.runners.keys() {
            servers.entry(server_name.clone()).or_default();
        }

        SupervisorStats {
            total_servers: state.runners.len(),
            total_tools: proxies.len(),
            servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::write_echo_script;

    async fn supervisor_with_echo_server(dir: &std::path::Path) -> anyhow::Result<(Supervisor, String)> {
        let script = write_echo_script(dir)?;
        let supervisor = Supervisor::new();
        supervisor
            .add_server(
                "mock",
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await?;
        Ok((supervisor, "mock".to_string()))
    }

    #[tokio::test]
    async fn add_server_publishes_tools_and_invoke_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (supervisor, _) = supervisor_with_echo_server(temp.path()).await?;

        assert_eq!(supervisor.tool_names().await, vec!["mock_echo_tool".to_string()]);

        let registry = supervisor.inner.registry.read().await.clone();
        let proxy = registry.get("mock_echo_tool").await.expect("proxy registered");
        let result = proxy.invoke(None).await?;
        assert_eq!(
            result.content[0].as_text().map(|t| t.text.as_str()),
            Some("pong")
        );

        supervisor.cleanup().await?;
        assert!(supervisor.tool_names().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn add_server_rejects_duplicate_name() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (supervisor, name) = supervisor_with_echo_server(temp.path()).await?;

        let script = write_echo_script(temp.path())?;
        let err = supervisor
            .add_server(
                name,
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Duplicate);
        Ok(())
    }

    #[tokio::test]
    async fn remove_server_unpublishes_its_tools_law_l1() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (supervisor, name) = supervisor_with_echo_server(temp.path()).await?;
        assert_eq!(supervisor.tool_names().await.len(), 1);

        supervisor.remove_server(&name).await?;
        assert!(supervisor.tool_names().await.is_empty());

        let err = supervisor.remove_server(&name).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn request_reconnect_after_remove_is_already_signaled_law_l2() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (supervisor, name) = supervisor_with_echo_server(temp.path()).await?;
        supervisor.remove_server(&name).await?;

        let handle = supervisor.request_reconnect(&name);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.wait())
            .await
            .expect("already-signaled handle must resolve promptly");
        Ok(())
    }

    #[tokio::test]
    async fn request_reconnect_on_unknown_server_is_already_signaled() {
        let supervisor = Supervisor::new();
        let handle = supervisor.request_reconnect("never-added");
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.wait())
            .await
            .expect("unknown-server handle must resolve promptly");
    }

    #[tokio::test]
    async fn first_connect_failure_leaves_no_bookkeeping() {
        let supervisor = Supervisor::new();
        let err = supervisor
            .add_server(
                "broken",
                TransportConfig::Stdio {
                    command: "definitely-not-a-real-binary-xyz".to_string(),
                    args: vec![],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert!(supervisor.server_names().await.is_empty());
        assert!(supervisor.tool_names().await.is_empty());
    }

    #[tokio::test]
    async fn include_filter_registers_only_named_tools() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let script = write_echo_script(temp.path())?;
        let supervisor = Supervisor::new();

        supervisor
            .add_server(
                "mock",
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions {
                    include_tools: Some(vec!["nonexistent_tool".to_string()]),
                    adaptor: None,
                },
            )
            .await?;

        assert!(supervisor.tool_names().await.is_empty());
        supervisor.cleanup().await?;
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_clears_every_server() -> anyhow::Result<()> {
        let temp_a = tempfile::tempdir()?;
        let temp_b = tempfile::tempdir()?;
        let script_a = write_echo_script(temp_a.path())?;
        let script_b = write_echo_script(temp_b.path())?;
        let supervisor = Supervisor::new();

        supervisor
            .add_server(
                "s1",
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script_a.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await?;
        supervisor
            .add_server(
                "s2",
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script_b.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await?;

        assert_eq!(supervisor.server_names().await.len(), 2);
        supervisor.cleanup().await?;
        assert!(supervisor.server_names().await.is_empty());
        assert!(supervisor.tool_names().await.is_empty());
        Ok(())
    }

    /// A script that behaves like the normal echo server on its first
    /// invocation, then exits immediately (before completing the MCP
    /// handshake) on every later invocation — used to force a server into
    /// a failing reconnect cycle after a successful first connect.
    fn write_fails_after_first_script(dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
        let path = dir.join("mock-fails-after-first.sh");
        let counter = dir.join("invocations.count");
        std::fs::write(&counter, "0")?;
        std::fs::write(
            &path,
            format!(
                r#"#!/bin/sh
COUNTER_FILE="{counter}"
N=$(cat "$COUNTER_FILE")
N=$((N + 1))
echo "$N" > "$COUNTER_FILE"
if [ "$N" -gt 1 ]; then
  exit 7
fi
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo_tool","description":"echo","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"pong"}}]}}}}\n' "$id"
      ;;
  esac
done
"#,
                counter = counter.display()
            ),
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(path)
    }

    /// Boundary behavior: "stop set while Connecting" (§8) must not leave
    /// `remove_server` hanging behind the 2s/5s retry-and-backoff sleeps a
    /// failing reconnect cycle would otherwise sit in.
    #[tokio::test]
    async fn remove_server_during_failing_reconnect_does_not_hang() -> anyhow::Result<()> {
        use std::time::Duration;

        let temp = tempfile::tempdir()?;
        let script = write_fails_after_first_script(temp.path())?;
        let supervisor = Supervisor::new();

        supervisor
            .add_server(
                "flaky",
                TransportConfig::Stdio {
                    command: "sh".to_string(),
                    args: vec![script.to_string_lossy().into_owned()],
                    env: Default::default(),
                },
                AddServerOptions::default(),
            )
            .await?;

        // Force the runner into a reconnect cycle that will keep failing
        // (every subsequent spawn of the script exits before handshaking).
        let _wait_handle = supervisor.request_reconnect("flaky");

        tokio::time::timeout(Duration::from_secs(3), supervisor.remove_server("flaky"))
            .await
            .expect("remove_server must not hang behind a failing reconnect's retry/backoff sleeps")?;

        assert!(supervisor.tool_names().await.is_empty());
        assert!(supervisor.server_names().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stats_report_server_and_tool_counts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (supervisor, _) = supervisor_with_echo_server(temp.path()).await?;

        let stats = supervisor.stats().await;
        assert_eq!(stats.total_servers, 1);
        assert_eq!(stats.total_tools, 1);
        assert_eq!(stats.servers["mock"].tool_count, 1);
        Ok(())
    }
}
