//! Scoped wrapper around one [`BackendTransport`]: `open` acquires it and
//! runs the MCP handshake, `close` releases it on every exit path, and
//! `list_tools`/`call_tool` are the only operations valid in between.

use anyhow::Result;
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};

use crate::config::TransportConfig;
use crate::transport::BackendTransport;

/// A live binding of one transport to one MCP session.
///
/// Construction always succeeds; the fallible step is [`Connection::open`],
/// which is kept separate so a `Connection` value never exists in a
/// half-acquired state — either `open` returns an error and nothing was
/// kept, or it returns `Ok` and `transport` is `Some`.
pub(crate) struct Connection {
    server_name: String,
    transport: Option<BackendTransport>,
}

impl Connection {
    /// Acquire a transport and complete the MCP `initialize` handshake.
    ///
    /// On any failure, no resources are left acquired: `BackendTransport::connect`
    /// itself tears down anything it opened before returning `Err`, so there is
    /// nothing for this function to roll back.
    pub(crate) async fn open(server_name: &str, transport_config: &TransportConfig) -> Result<Self> {
        let transport = BackendTransport::connect(server_name, transport_config).await?;
        Ok(Self {
            server_name: server_name.to_string(),
            transport: Some(transport),
        })
    }

    /// List the tools the remote server currently exposes. Pure read; no
    /// retries happen at this layer, matching `callTool`'s behavior.
    pub(crate) async fn list_tools(&self) -> Result<Vec<Tool>> {
        let service = self.service()?;
        let response = service.list_tools(None).await?;
        Ok(response.tools)
    }

    /// Forward one tool invocation to the remote server.
    pub(crate) async fn call_tool(&self, request: CallToolRequestParam) -> Result<CallToolResult> {
        let service = self.service()?;
        let response = service.call_tool(request).await?;
        Ok(response)
    }

    /// Release the session and transport. Safe to call even if the
    /// connection was never fully opened; idempotent.
    pub(crate) async fn close(mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
    }

    fn service(&self) -> Result<&rmcp::service::RunningService<rmcp::RoleClient, ()>> {
        self.transport
            .as_ref()
            .map(BackendTransport::service)
            .ok_or_else(|| anyhow::anyhow!("connection to '{}' is closed", self.server_name))
    }
}
