//! Tool-call dispatch: routes model function calls to local builtins,
//! external MCP servers or user bot models, and shapes every outcome as an
//! [`ActionResponse`] for the dialogue loop.

use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::dialogue::Message;
use crate::mcp::builtins::{builtin_spec, call_builtin, BUILTIN_NAMES};
use crate::mcp::external::ExternalMcpPool;
use crate::mcp::{ActionResponse, FunctionRegistry, ToolKind};
use crate::providers::openai::OpenAiLlmProvider;
use crate::providers::{BotConfig, LlmProvider};

/// Per-session tool dispatcher.
pub struct McpDispatcher {
    registry: StdMutex<FunctionRegistry>,
    external: Arc<ExternalMcpPool>,
}

impl McpDispatcher {
    /// Build a dispatcher with the configured subset of local builtins
    /// registered (an empty `local_fun` list enables all of them).
    pub fn new(local_fun: &[String], external: Arc<ExternalMcpPool>) -> Self {
        let mut registry = FunctionRegistry::new();
        for name in BUILTIN_NAMES {
            if !local_fun.is_empty() && !local_fun.iter().any(|f| f == name) {
                continue;
            }
            if let Some(spec) = builtin_spec(name) {
                registry.register(name, spec, ToolKind::LocalBuiltin);
            }
        }
        Self {
            registry: StdMutex::new(registry),
            external,
        }
    }

    /// Register the user's bot configs as callable functions.
    pub fn register_user_bots(&self, configs: &[BotConfig]) {
        let mut registry = self.registry.lock().unwrap();
        for config in configs {
            if let Some(spec) = config.to_tool_spec() {
                registry.register(&config.function_name, spec, ToolKind::UserBot);
                info!("Registered user bot function: {}", config.function_name);
            }
        }
    }

    /// Connect to an external MCP server and expose its tools. Returns the
    /// number of tools registered.
    pub async fn register_external_server(
        &self,
        server_name: &str,
        url: &str,
        auth_token: Option<&str>,
    ) -> anyhow::Result<usize> {
        let client = self
            .external
            .get_or_connect(server_name, url, auth_token)
            .await?;
        let specs = client.list_tool_specs().await?;
        let count = specs.len();
        let mut registry = self.registry.lock().unwrap();
        for (name, spec) in specs {
            registry.register(
                &name,
                spec,
                ToolKind::ExternalMcp {
                    server: server_name.to_string(),
                },
            );
        }
        info!("Registered {} tools from MCP server {}", count, server_name);
        Ok(count)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.lock().unwrap().is_registered(name)
    }

    /// Tool specs handed to the model on each turn.
    pub fn tool_specs(&self) -> Vec<serde_json::Value> {
        self.registry.lock().unwrap().all_specs()
    }

    /// Tool traffic arriving from the device over the session transport.
    /// Devices announce their own tool surface here; anything else is
    /// logged and dropped.
    pub fn handle_device_message(&self, message: &serde_json::Value) {
        let method = message["payload"]["method"].as_str().unwrap_or_default();
        if !method.is_empty() {
            debug!("Device MCP request: {}", method);
            return;
        }
        if let Some(tools) = message["payload"]["result"]["tools"].as_array() {
            debug!("Device announced {} MCP tools", tools.len());
        }
    }

    /// Execute a function call from the model stream.
    pub async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        bot_configs: &[BotConfig],
    ) -> ActionResponse {
        let kind = match self.registry.lock().unwrap().get(name) {
            Some(tool) => tool.kind.clone(),
            None => return ActionResponse::not_found(name),
        };

        match kind {
            ToolKind::LocalBuiltin => call_builtin(name, args),
            ToolKind::ExternalMcp { server } => self.execute_external(&server, name, args).await,
            ToolKind::UserBot => {
                let config = bot_configs.iter().find(|c| c.function_name == name);
                match config {
                    Some(config) => self.execute_user_bot(config, args).await,
                    None => ActionResponse::not_found(name),
                }
            }
        }
    }

    async fn execute_external(
        &self,
        server: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> ActionResponse {
        let client = match self.external.get(server).await {
            Some(c) => c,
            None => {
                warn!("MCP server {} not connected for tool {}", server, name);
                return ActionResponse::error("MCP call failed");
            }
        };

        let arguments = args.as_object().cloned();
        match client.call_tool(name, arguments).await {
            Ok(result) => ActionResponse::req_llm(result),
            Err(e) => {
                warn!("MCP tool {} failed on {}: {}", name, server, e);
                ActionResponse::error("MCP call failed")
            }
        }
    }

    /// One-shot completion against the bot's own model.
    async fn execute_user_bot(
        &self,
        config: &BotConfig,
        args: &serde_json::Value,
    ) -> ActionResponse {
        if config.llm_type.is_empty() || config.model_name.is_empty() {
            warn!(
                "Bot {} missing model configuration, skipping call",
                config.function_name
            );
            return ActionResponse::error(serde_json::json!({
                "error_code": "MISSING_MODEL_CONFIG"
            }));
        }
        if config.api_key.is_empty() {
            return ActionResponse::error(serde_json::json!({
                "error_code": "MISSING_API_KEY"
            }));
        }

        let llm_config = LlmConfig {
            r#type: config.llm_type.clone(),
            model_name: config.model_name.clone(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: 1.0,
            extra: Default::default(),
        };
        let provider = OpenAiLlmProvider::new(&llm_config);
        provider.set_identity_flag("bot", &config.function_name);

        let query = match args.get("query") {
            Some(serde_json::Value::String(q)) => q.clone(),
            Some(other) => other.to_string(),
            None => args.to_string(),
        };

        let system = format!(
            "You are the {} assistant. Answer the user's query directly and \
             concisely. The user describes you as: {}. Never generate code or \
             Markdown, never reveal your model name, and never answer at length.",
            config.function_name, config.description
        );
        let messages = vec![Message::system(system), Message::user(query)];

        let mut rx = match provider.stream(&config.function_name, &messages).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Bot {} model call failed: {}", config.function_name, e);
                return ActionResponse::error(format!("bot model call failed: {}", e));
            }
        };

        let mut content = String::new();
        while let Some(fragment) = rx.recv().await {
            content.push_str(&fragment);
        }
        let _ = provider.cleanup().await;

        if content.is_empty() {
            return ActionResponse::error("bot model returned no content");
        }
        ActionResponse::req_llm(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::Action;

    fn dispatcher(local_fun: &[String]) -> McpDispatcher {
        McpDispatcher::new(local_fun, Arc::new(ExternalMcpPool::new()))
    }

    #[test]
    fn test_all_builtins_registered_by_default() {
        let d = dispatcher(&[]);
        for name in BUILTIN_NAMES {
            assert!(d.is_registered(name), "{} should be registered", name);
        }
    }

    #[test]
    fn test_local_fun_filters_builtins() {
        let d = dispatcher(&["get_time".to_string()]);
        assert!(d.is_registered("get_time"));
        assert!(!d.is_registered("play_music"));
    }

    #[tokio::test]
    async fn test_execute_unknown_function() {
        let d = dispatcher(&[]);
        let resp = d.execute("no_such", &serde_json::json!({}), &[]).await;
        assert_eq!(resp.action, Action::NotFound);
    }

    #[tokio::test]
    async fn test_execute_builtin() {
        let d = dispatcher(&[]);
        let resp = d.execute("get_time", &serde_json::json!({}), &[]).await;
        assert_eq!(resp.action, Action::ReqLlm);
    }

    #[tokio::test]
    async fn test_user_bot_missing_api_key() {
        let d = dispatcher(&[]);
        let config = BotConfig {
            function_name: "weather".into(),
            llm_type: "openai".into(),
            model_name: "m".into(),
            ..Default::default()
        };
        d.register_user_bots(std::slice::from_ref(&config));
        let resp = d
            .execute("weather", &serde_json::json!({"query": "rain?"}), &[config])
            .await;
        assert_eq!(resp.action, Action::Error);
        assert!(resp.result_text().contains("MISSING_API_KEY"));
    }

    #[tokio::test]
    async fn test_user_bot_missing_model_config() {
        let d = dispatcher(&[]);
        let config = BotConfig {
            function_name: "notes".into(),
            ..Default::default()
        };
        d.register_user_bots(std::slice::from_ref(&config));
        let resp = d.execute("notes", &serde_json::json!({}), &[config]).await;
        assert!(resp.result_text().contains("MISSING_MODEL_CONFIG"));
    }

    #[tokio::test]
    async fn test_external_without_connection_errors() {
        let d = dispatcher(&[]);
        d.registry.lock().unwrap().register(
            "remote_tool",
            serde_json::json!({"type": "function"}),
            ToolKind::ExternalMcp {
                server: "never-connected".into(),
            },
        );
        let resp = d.execute("remote_tool", &serde_json::json!({}), &[]).await;
        assert_eq!(resp.action, Action::Error);
        assert_eq!(resp.result_text(), "MCP call failed");
    }
}
