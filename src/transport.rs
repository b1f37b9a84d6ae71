//! Backend transports: stdio child process, SSE, and Streamable HTTP.
//!
//! A [`BackendTransport`] owns exactly one live connection to a remote MCP
//! server. It has no retry or reconnect logic of its own; that lives in
//! `runner.rs`, which calls [`BackendTransport::connect`] again for each
//! attempt and replaces the old transport on success.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rmcp::RoleClient;
use rmcp::service::{RunningService, ServiceExt};
use tokio::process::Command;

use crate::config::TransportConfig;

/// How long a stdio child process is given to exit after `service.cancel()`
/// before it is forcibly killed.
const STDIO_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A live connection to one MCP server, established over whichever
/// transport its [`TransportConfig`] names.
pub(crate) enum BackendTransport {
    Stdio {
        service: RunningService<RoleClient, ()>,
        child: Box<tokio::process::Child>,
    },
    #[cfg(feature = "transport-http-client")]
    Sse {
        service: RunningService<RoleClient, ()>,
    },
    #[cfg(feature = "transport-http-client")]
    Http {
        service: RunningService<RoleClient, ()>,
    },
}

impl BackendTransport {
    pub(crate) async fn connect(server_name: &str, config: &TransportConfig) -> Result<Self> {
        match config {
            TransportConfig::Stdio { command, args, env } => {
                Self::spawn_stdio(server_name, command, args, env).await
            }
            #[cfg(feature = "transport-http-client")]
            TransportConfig::Sse { url, headers } => Self::connect_sse(server_name, url, headers).await,
            #[cfg(feature = "transport-http-client")]
            TransportConfig::Http { url, headers } => Self::connect_http(server_name, url, headers).await,
            #[cfg(not(feature = "transport-http-client"))]
            TransportConfig::Sse { .. } | TransportConfig::Http { .. } => Err(anyhow!(
                "server '{server_name}' requires a network transport, but mcp-supervisor \
                 was built without the 'transport-http-client' feature"
            )),
        }
    }

    pub(crate) fn service(&self) -> &RunningService<RoleClient, ()> {
        match self {
            Self::Stdio { service, .. } => service,
            #[cfg(feature = "transport-http-client")]
            Self::Sse { service } => service,
            #[cfg(feature = "transport-http-client")]
            Self::Http { service } => service,
        }
    }

    /// Cancel the underlying rmcp service and, for stdio, wait out the
    /// child process (killing it if it overstays its welcome).
    pub(crate) async fn shutdown(self) {
        match self {
            Self::Stdio { service, mut child } => {
                let _ = service.cancel().await;
                match tokio::time::timeout(STDIO_SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(error = %error, "error waiting for MCP child process to exit");
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            #[cfg(feature = "transport-http-client")]
            Self::Sse { service } => {
                let _ = service.cancel().await;
            }
            #[cfg(feature = "transport-http-client")]
            Self::Http { service } => {
                let _ = service.cancel().await;
            }
        }
    }

    async fn spawn_stdio(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{server_name}' ({command})"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{server_name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{server_name}'"))?;
        if let Some(mut stderr) = child.stderr.take() {
            let name = server_name.to_string();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(&mut stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "{line}");
                }
            });
        }

        let service: RunningService<RoleClient, ()> =
            ().serve((stdout, stdin)).await.with_context(|| {
                format!("failed to complete MCP handshake with server '{server_name}' ({command})")
            })?;

        Ok(Self::Stdio {
            service,
            child: Box::new(child),
        })
    }

    #[cfg(feature = "transport-http-client")]
    async fn connect_sse(
        server_name: &str,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
    ) -> Result<Self> {
        use rmcp::transport::SseClientTransport;
        use rmcp::transport::sse_client::SseClientConfig;

        validate_remote_url(server_name, url)?;
        let http_client = build_header_client(headers)
            .with_context(|| format!("failed to build HTTP client for MCP server '{server_name}'"))?;

        let transport_config = SseClientConfig {
            sse_endpoint: url.to_string().into(),
            ..Default::default()
        };

        let transport = SseClientTransport::start_with_client(http_client, transport_config)
            .await
            .with_context(|| format!("failed to start SSE transport for MCP server '{server_name}'"))?;

        let service: RunningService<RoleClient, ()> = ().serve(transport).await.with_context(|| {
            format!("failed to complete MCP handshake with SSE server '{server_name}' at {url}")
        })?;

        Ok(Self::Sse { service })
    }

    #[cfg(feature = "transport-http-client")]
    async fn connect_http(
        server_name: &str,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
    ) -> Result<Self> {
        use rmcp::transport::StreamableHttpClientTransport;
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

        validate_remote_url(server_name, url)?;
        let http_client = build_header_client(headers)
            .with_context(|| format!("failed to build HTTP client for MCP server '{server_name}'"))?;

        let transport_config = StreamableHttpClientTransportConfig {
            uri: url.to_string().into(),
            ..Default::default()
        };

        let transport = StreamableHttpClientTransport::with_client(http_client, transport_config);

        let service: RunningService<RoleClient, ()> = ().serve(transport).await.with_context(|| {
            format!("failed to complete MCP handshake with HTTP server '{server_name}' at {url}")
        })?;

        Ok(Self::Http { service })
    }
}

/// Rejects transport URLs that are not plain `http`/`https`. This crate does
/// not attempt full SSRF protection (DNS-resolution IP blocking, etc.) since
/// servers are operator-configured rather than reachable from untrusted
/// input; it still refuses the obviously wrong scheme rather than silently
/// sending credentials somewhere unexpected.
#[cfg(feature = "transport-http-client")]
fn validate_remote_url(server_name: &str, url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .with_context(|| format!("server '{server_name}': invalid URL '{url}'"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!(
            "server '{server_name}': unsupported URL scheme '{other}' in '{url}' (expected http or https)"
        )),
    }
}

#[cfg(feature = "transport-http-client")]
fn build_header_client(headers: &std::collections::HashMap<String, String>) -> Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_str(key)
            .with_context(|| format!("invalid header name '{key}'"))?;
        let val = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for '{key}'"))?;
        header_map.insert(name, val);
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .context("failed to build reqwest client")
}

/// Shared test support for spinning up a fake stdio MCP server. Other
/// modules' tests (`runner.rs`, `proxy.rs`, `supervisor.rs`) reuse this
/// rather than talking to rmcp internals directly.
#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::Result;

    /// Writes a `sh` script that speaks just enough line-delimited
    /// JSON-RPC to satisfy an rmcp client: initialize, tools/list (one
    /// tool named `echo_tool`), and tools/call (always replies "pong").
    pub(crate) fn write_echo_script(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("mock-mcp.sh");
        fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms)?;
        }

        Ok(path)
    }

    /// Writes a variant of [`write_echo_script`] that fails the first
    /// `attempts_to_fail` times it is invoked (tracked via a counter file
    /// next to the script) before behaving like the normal echo server.
    /// Used to exercise the runner's retry/backoff path deterministically.
    pub(crate) fn write_flaky_echo_script(dir: &Path, attempts_to_fail: u32) -> Result<PathBuf> {
        let path = dir.join("mock-mcp-flaky.sh");
        let counter = dir.join("attempts.count");
        fs::write(&counter, "0")?;
        fs::write(
            &path,
            format!(
                r#"#!/bin/sh
COUNTER_FILE="{counter}"
N=$(cat "$COUNTER_FILE")
N=$((N + 1))
echo "$N" > "$COUNTER_FILE"
if [ "$N" -le {attempts_to_fail} ]; then
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
                counter = counter.display(),
                attempts_to_fail = attempts_to_fail
            ),
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms)?;
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_echo_script;
    use super::*;
    use crate::config::TransportConfig;

    #[tokio::test]
    async fn stdio_transport_connects_and_lists_tools() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let script = write_echo_script(temp.path())?;

        let config = TransportConfig::Stdio {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: Default::default(),
        };

        let transport = BackendTransport::connect("mock", &config).await?;
        let tools = transport.service().list_tools(None).await?;
        assert_eq!(tools.tools[0].name.as_ref(), "echo_tool");

        transport.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn stdio_transport_reports_spawn_failure() {
        let config = TransportConfig::Stdio {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            args: vec![],
            env: Default::default(),
        };

        let result = BackendTransport::connect("missing", &config).await;
        assert!(result.is_err());
    }
}
