//! External MCP server client over streamable HTTP.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
    ServiceExt,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One connected MCP server.
pub struct ExternalMcpClient {
    pub server_name: String,
    service: RunningService<rmcp::RoleClient, ()>,
}

impl ExternalMcpClient {
    /// Connect to a streamable-HTTP MCP server, optionally with a bearer
    /// auth header.
    pub async fn connect(
        server_name: &str,
        url: &str,
        auth_token: Option<&str>,
    ) -> anyhow::Result<Self> {
        let transport = if let Some(token) = auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
            let client = reqwest::Client::builder().default_headers(headers).build()?;
            StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(Arc::<str>::from(url)),
            )
        } else {
            StreamableHttpClientTransport::from_uri(url)
        };
        let service = ().serve(transport).await?;
        info!("Connected to MCP server {} at {}", server_name, url);
        Ok(Self {
            server_name: server_name.to_string(),
            service,
        })
    }

    /// Names and specs of the tools the server offers, as OpenAI tool
    /// specs.
    pub async fn list_tool_specs(&self) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        let listing = self.service.list_tools(Default::default()).await?;
        let mut specs = Vec::with_capacity(listing.tools.len());
        for tool in listing.tools {
            let name = tool.name.to_string();
            let spec = serde_json::json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.description.as_deref().unwrap_or_default(),
                    "parameters": tool.input_schema,
                }
            });
            specs.push((name, spec));
        }
        Ok(specs)
    }

    /// Invoke a tool and flatten its text content.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> anyhow::Result<String> {
        let result = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await?;

        let mut text = String::new();
        for content in result.content {
            if let RawContent::Text(t) = content.raw {
                text.push_str(&t.text);
            }
        }
        Ok(text)
    }

    pub async fn disconnect(self) -> anyhow::Result<()> {
        self.service.cancel().await?;
        Ok(())
    }
}

/// Process-wide cache of connected MCP servers, shared across sessions.
#[derive(Default)]
pub struct ExternalMcpPool {
    clients: Mutex<HashMap<String, Arc<ExternalMcpClient>>>,
}

impl ExternalMcpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the connected client for `server_name`, connecting on first
    /// use.
    pub async fn get_or_connect(
        &self,
        server_name: &str,
        url: &str,
        auth_token: Option<&str>,
    ) -> anyhow::Result<Arc<ExternalMcpClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(server_name) {
            return Ok(client.clone());
        }
        let client = Arc::new(ExternalMcpClient::connect(server_name, url, auth_token).await?);
        clients.insert(server_name.to_string(), client.clone());
        Ok(client)
    }

    /// Already-connected client, if any.
    pub async fn get(&self, server_name: &str) -> Option<Arc<ExternalMcpClient>> {
        self.clients.lock().await.get(server_name).cloned()
    }

    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ExternalMcpClient>> = {
            let mut map = self.clients.lock().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            match Arc::try_unwrap(client) {
                Ok(owned) => {
                    if let Err(e) = owned.disconnect().await {
                        warn!("MCP disconnect failed: {}", e);
                    }
                }
                Err(shared) => {
                    warn!(
                        "MCP client {} still shared at shutdown, dropping handle",
                        shared.server_name
                    );
                }
            }
        }
    }
}
