//! Tool execution: the function registry and the action protocol between
//! tool handlers and the dialogue loop.

pub mod builtins;
pub mod dispatcher;
pub mod external;

use std::collections::HashMap;

/// What the dialogue loop should do with a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing further.
    None,
    /// Tool failed; log and speak a fallback.
    Error,
    /// No such function.
    NotFound,
    /// Speak `response` directly, bypassing the model.
    Response,
    /// Invoke a server-side result handler, then feed the result back to
    /// the model.
    CallHandler,
    /// Feed `result` back to the model and continue generating.
    ReqLlm,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone)]
pub struct ActionResponse {
    pub action: Action,
    pub result: Option<serde_json::Value>,
    pub response: Option<String>,
}

impl ActionResponse {
    pub fn req_llm(result: impl Into<serde_json::Value>) -> Self {
        Self {
            action: Action::ReqLlm,
            result: Some(result.into()),
            response: None,
        }
    }

    pub fn respond(text: impl Into<String>) -> Self {
        Self {
            action: Action::Response,
            result: None,
            response: Some(text.into()),
        }
    }

    pub fn call_handler(result: serde_json::Value) -> Self {
        Self {
            action: Action::CallHandler,
            result: Some(result),
            response: None,
        }
    }

    pub fn error(result: impl Into<serde_json::Value>) -> Self {
        Self {
            action: Action::Error,
            result: Some(result.into()),
            response: None,
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self {
            action: Action::NotFound,
            result: Some(serde_json::Value::String(format!(
                "function not found: {}",
                name
            ))),
            response: None,
        }
    }

    /// The result rendered as plain text for a `tool` message.
    pub fn result_text(&self) -> String {
        match &self.result {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Where a registered function is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolKind {
    /// Handled in-process.
    LocalBuiltin,
    /// Forwarded to an external MCP server.
    ExternalMcp { server: String },
    /// Answered by a one-shot model from the user's bot config.
    UserBot,
}

/// A function the model may call.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// OpenAI tool spec handed to the model.
    pub spec: serde_json::Value,
    pub kind: ToolKind,
}

/// Per-session registry of callable functions.
#[derive(Default)]
pub struct FunctionRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, spec: serde_json::Value, kind: ToolKind) {
        self.tools
            .insert(name.to_string(), RegisteredTool { spec, kind });
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool specs for the model, in registration-independent stable order.
    pub fn all_specs(&self) -> Vec<serde_json::Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| self.tools[n].spec.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
