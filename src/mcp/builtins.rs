//! Local builtin functions.
//!
//! Small device-facing verbs handled in-process. Handlers that change
//! session state (voice, role, playback, exit) return `CallHandler` so the
//! session applies the change before the model continues.

use chrono::Local;

use crate::mcp::{ActionResponse, ToolKind};

/// Names of every local builtin.
pub const BUILTIN_NAMES: &[&str] = &[
    "get_time",
    "exit_intent",
    "change_role",
    "play_music",
    "change_voice",
];

/// OpenAI tool spec for a builtin.
pub fn builtin_spec(name: &str) -> Option<serde_json::Value> {
    let (description, parameters) = match name {
        "get_time" => (
            "Get the current date and time.",
            serde_json::json!({"type": "object", "properties": {}}),
        ),
        "exit_intent" => (
            "End the conversation when the user wants to leave.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "farewell": {"type": "string", "description": "Optional goodbye line."}
                }
            }),
        ),
        "change_role" => (
            "Switch the assistant persona.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "role": {"type": "string", "description": "Name of the persona to adopt."},
                    "prompt": {"type": "string", "description": "System prompt for the persona."}
                },
                "required": ["role"]
            }),
        ),
        "play_music" => (
            "Play a song from the local music library.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "song_name": {"type": "string", "description": "Title to play."}
                },
                "required": ["song_name"]
            }),
        ),
        "change_voice" => (
            "Switch the speaking voice.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "voice": {"type": "string", "description": "Voice name."}
                },
                "required": ["voice"]
            }),
        ),
        _ => return None,
    };

    Some(serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    }))
}

/// Kind marker for registry entries created from this module.
pub fn builtin_kind() -> ToolKind {
    ToolKind::LocalBuiltin
}

/// Execute a builtin.
pub fn call_builtin(name: &str, args: &serde_json::Value) -> ActionResponse {
    match name {
        "get_time" => {
            let now = Local::now();
            ActionResponse::req_llm(format!(
                "The current time is {}.",
                now.format("%Y-%m-%d %H:%M:%S (%A)")
            ))
        }
        "exit_intent" => ActionResponse::call_handler(serde_json::json!({
            "handler": "exit_intent",
            "farewell": args["farewell"].as_str().unwrap_or("Goodbye."),
        })),
        "change_role" => {
            let role = args["role"].as_str().unwrap_or_default();
            if role.is_empty() {
                return ActionResponse::error("change_role requires a role name");
            }
            ActionResponse::call_handler(serde_json::json!({
                "handler": "change_role",
                "role": role,
                "prompt": args["prompt"].as_str().unwrap_or_default(),
            }))
        }
        "play_music" => {
            let song = args["song_name"].as_str().unwrap_or_default();
            if song.is_empty() {
                return ActionResponse::error("play_music requires song_name");
            }
            ActionResponse::call_handler(serde_json::json!({
                "handler": "play_music",
                "song": song,
            }))
        }
        "change_voice" => {
            let voice = args["voice"].as_str().unwrap_or_default();
            if voice.is_empty() {
                return ActionResponse::error("change_voice requires a voice name");
            }
            ActionResponse::call_handler(serde_json::json!({
                "handler": "change_voice",
                "voice": voice,
            }))
        }
        _ => ActionResponse::not_found(name),
    }
}
