use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Transport-specific configuration for one MCP server.
///
/// Serialized with `#[serde(tag = "type")]` so a TOML/JSON source uses
/// `type = "stdio"` etc.; embedding applications that build configs
/// programmatically construct variants directly.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum TransportConfig {
    /// Spawn a child process communicating over stdio (JSON-RPC on stdin/stdout).
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a remote MCP server via legacy Server-Sent Events.
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Connect to a remote MCP server via Streamable HTTP.
    #[serde(rename = "http")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::Http { .. } => "http",
        }
    }

    /// Parse a transport keyword, accepting the streamable-HTTP aliases
    /// the spec calls out (`http`, `streamable_http`, `streamable-http`).
    pub fn keyword_matches(keyword: &str, label: &str) -> bool {
        let normalized = keyword.to_ascii_lowercase().replace('_', "-");
        match label {
            "http" => matches!(normalized.as_str(), "http" | "streamable-http"),
            other => normalized == other,
        }
    }
}

/// Per-server configuration: identity, transport, and optional tool filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    /// If set, only tools whose remote name appears here are registered at
    /// first connect. `None` registers every tool the server reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_tools: Option<Vec<String>>,
}

impl ServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            include_tools: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let TransportConfig::Stdio { args: a, .. } = &mut self.transport {
            *a = args.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        if let TransportConfig::Stdio { env: e, .. } = &mut self.transport {
            *e = env;
        }
        self
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            include_tools: None,
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Sse {
                url: url.into(),
                headers: HashMap::new(),
            },
            include_tools: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        match &mut self.transport {
            TransportConfig::Http { headers: h, .. } | TransportConfig::Sse { headers: h, .. } => {
                *h = headers;
            }
            TransportConfig::Stdio { .. } => {}
        }
        self
    }

    pub fn with_include_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }
}

/// Custom deserializer mirroring the teacher's flattened, alias-tolerant
/// config parsing: a raw `type` string selects the transport variant, with
/// `http`/`streamable_http`/`streamable-http` all accepted for HTTP.
impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            transport_type: String,
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            #[serde(default)]
            include_tools: Option<Vec<String>>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let keyword = raw.transport_type.to_ascii_lowercase().replace('_', "-");

        let transport = match keyword.as_str() {
            "stdio" => {
                let command = raw.command.ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"stdio\" requires a 'command' field",
                        raw.name
                    ))
                })?;
                TransportConfig::Stdio {
                    command,
                    args: raw.args,
                    env: raw.env,
                }
            }
            "sse" => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"sse\" requires a 'url' field",
                        raw.name
                    ))
                })?;
                TransportConfig::Sse {
                    url,
                    headers: raw.headers,
                }
            }
            "http" | "streamable-http" => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"http\" requires a 'url' field",
                        raw.name
                    ))
                })?;
                TransportConfig::Http {
                    url,
                    headers: raw.headers,
                }
            }
            other => {
                return Err(serde::de::Error::custom(format!(
                    "server '{}': unsupported transport type '{other}' \
                     (expected stdio, sse, http, streamable_http, or streamable-http)",
                    raw.name
                )));
            }
        };

        Ok(ServerConfig {
            name: raw.name,
            transport,
            include_tools: raw.include_tools,
        })
    }
}
