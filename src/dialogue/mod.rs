//! Dialogue state: message types and the per-session dialogue manager.

pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dialogue::memory::Memory;

/// A function invocation requested by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, accumulated across stream deltas.
    pub arguments: String,
}

/// One tool call attached to an assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub function: FunctionCall,
    #[serde(default)]
    pub index: u32,
}

/// One dialogue message in the wire shape chat models expect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }
}

/// Manages the in-memory dialogue slice and delegates persistence.
///
/// Persistence rules: only `user`/`assistant` messages with non-empty
/// content are appended to the memory backend; `system` is pinned at index
/// 0 and never stored; `tool` and tool-call-bearing assistant messages stay
/// in memory only.
pub struct DialogueManager {
    dialogue: Vec<Message>,
    memory: Option<Arc<dyn Memory>>,
}

impl DialogueManager {
    pub fn new(memory: Option<Arc<dyn Memory>>) -> Self {
        Self {
            dialogue: Vec::new(),
            memory,
        }
    }

    /// Insert or update the system prompt at the head of the dialogue.
    pub fn set_system_message(&mut self, system_message: &str) {
        if system_message.is_empty() {
            return;
        }
        if let Some(first) = self.dialogue.first_mut() {
            if first.role == "system" {
                first.content = system_message.to_string();
                return;
            }
        }
        self.dialogue.insert(0, Message::system(system_message));
    }

    /// Append a message, persisting it when the rules allow.
    pub async fn put(&mut self, message: Message) {
        let persistable = (message.role == "user" || message.role == "assistant")
            && !message.content.trim().is_empty();
        if persistable {
            if let Some(memory) = &self.memory {
                if let Err(e) = memory.save(std::slice::from_ref(&message)).await {
                    warn!("Failed to persist dialogue message: {}", e);
                }
            }
        }
        self.dialogue.push(message);
    }

    /// The full dialogue, as handed to the model.
    pub fn llm_dialogue(&self) -> &[Message] {
        &self.dialogue
    }

    pub fn len(&self) -> usize {
        self.dialogue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogue.is_empty()
    }

    /// Drop a `tool` message orphaned directly after the system prompt; the
    /// recent-window trim can strand one there.
    fn remove_orphan_tool_message(&mut self) {
        if self.dialogue.len() >= 2
            && self.dialogue[0].role == "system"
            && self.dialogue[1].role == "tool"
        {
            self.dialogue.remove(1);
        }
    }

    /// Trim to the most recent `max_messages`, always preserving a leading
    /// system message.
    pub fn keep_recent_messages(&mut self, max_messages: usize) {
        if max_messages == 0 || self.dialogue.len() <= max_messages {
            return;
        }
        let tail_start = self.dialogue.len() - max_messages;
        if !self.dialogue.is_empty() && self.dialogue[0].role == "system" {
            let mut kept = vec![self.dialogue[0].clone()];
            kept.extend_from_slice(&self.dialogue[tail_start..]);
            self.dialogue = kept;
            self.remove_orphan_tool_message();
        } else {
            self.dialogue.drain(..tail_start);
        }
    }

    /// A recent-window view without mutating the dialogue.
    pub fn recent_messages(&self, max_messages: usize) -> Vec<Message> {
        if max_messages == 0 || self.dialogue.len() <= max_messages {
            return self.dialogue.clone();
        }
        let tail_start = self.dialogue.len() - max_messages;
        if !self.dialogue.is_empty() && self.dialogue[0].role == "system" {
            let mut out = vec![self.dialogue[0].clone()];
            out.extend_from_slice(&self.dialogue[tail_start..]);
            out
        } else {
            self.dialogue[tail_start..].to_vec()
        }
    }

    /// Replace the non-system dialogue from a JSON array, keeping a leading
    /// system message in place.
    pub fn load_from_json(&mut self, json: &str) -> Result<(), serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(());
        }
        let messages: Vec<Message> = serde_json::from_str(json)?;
        if !self.dialogue.is_empty() && self.dialogue[0].role == "system" {
            let system = self.dialogue[0].clone();
            self.dialogue = std::iter::once(system).chain(messages).collect();
        } else {
            self.dialogue = messages;
        }
        Ok(())
    }

    /// Overlay the stored history onto the in-memory dialogue.
    pub async fn load_from_storage(&mut self) -> anyhow::Result<()> {
        let Some(memory) = &self.memory else {
            return Ok(());
        };
        let json = memory.query_json().await?;
        self.load_from_json(&json)?;
        Ok(())
    }

    /// Serialize the dialogue, optionally dropping the system prompt.
    pub fn to_json(&self, keep_system_prompt: bool) -> Result<String, serde_json::Error> {
        let slice = if !keep_system_prompt
            && !self.dialogue.is_empty()
            && self.dialogue[0].role == "system"
        {
            &self.dialogue[1..]
        } else {
            &self.dialogue[..]
        };
        serde_json::to_string(slice)
    }

    /// Drop the in-memory dialogue and purge the backend.
    pub async fn clear(&mut self) {
        self.dialogue.clear();
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.clear().await {
                warn!("Failed to clear dialogue memory: {}", e);
            }
        }
    }
}
