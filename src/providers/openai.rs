//! OpenAI-compatible streaming chat provider.
//!
//! Works against any endpoint implementing the chat completions API with
//! SSE streaming. Serves three roles: the main dialogue LLM, the one-shot
//! LLM behind user bot tools, and (with an image-capable model) the VLM.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{LlmConfig, VllmConfig};
use crate::dialogue::{FunctionCall, Message, ToolCall};
use crate::errors::ProviderError;
use crate::providers::{Configurable, ImageData, LlmChunk, LlmProvider, VlmProvider};

const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Streaming chat provider over an OpenAI-compatible endpoint.
///
/// The config sits behind a mutex so per-user overrides can land through
/// the [`Configurable`] probe mid-session.
pub struct OpenAiLlmProvider {
    config: StdMutex<LlmConfig>,
    client: Client,
    identity: StdMutex<HashMap<String, String>>,
}

impl OpenAiLlmProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            config: StdMutex::new(config.clone()),
            client: Client::new(),
            identity: StdMutex::new(HashMap::new()),
        }
    }

    fn config_snapshot(&self) -> LlmConfig {
        self.config.lock().unwrap().clone()
    }

    fn request_body(
        &self,
        dialogue: &[Message],
        tools: &[serde_json::Value],
    ) -> serde_json::Value {
        let config = self.config_snapshot();
        let mut body = serde_json::json!({
            "model": config.model_name,
            "messages": dialogue,
            "stream": true,
        });
        if config.temperature > 0.0 {
            body["temperature"] = serde_json::json!(config.temperature);
        }
        if config.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(config.max_tokens);
        }
        if config.top_p > 0.0 {
            body["top_p"] = serde_json::json!(config.top_p);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
            body["tool_choice"] = serde_json::json!("auto");
        }
        body
    }

    async fn open_stream(
        &self,
        session_id: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<mpsc::Receiver<LlmChunk>> {
        let config = self.config_snapshot();
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey(config.r#type.clone()).into());
        }

        debug!("LLM stream request: session={}, model={}", session_id, config.model_name);

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("LLM API returned status {}: {}", status, text);
            return Err(ProviderError::HttpError(format!("HTTP {}: {}", status, text)).into());
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(LlmChunk {
                                error: Some(format!("stream read error: {}", e)),
                                ..Default::default()
                            })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    match parse_stream_chunk(data) {
                        Some(chunk) => {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        None => debug!("Unparseable SSE chunk: {}", data),
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Parse one SSE `data:` payload into a chunk.
fn parse_stream_chunk(data: &str) -> Option<LlmChunk> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;

    if let Some(err) = value.get("error") {
        return Some(LlmChunk {
            error: Some(
                err.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("model error")
                    .to_string(),
            ),
            ..Default::default()
        });
    }

    let delta = &value["choices"][0]["delta"];
    let content = delta["content"].as_str().map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = delta["tool_calls"].as_array() {
        for call in calls {
            tool_calls.push(ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                },
                index: call["index"].as_u64().unwrap_or_default() as u32,
            });
        }
    }

    Some(LlmChunk {
        content,
        tool_calls,
        error: None,
    })
}

#[async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn stream_with_functions(
        &self,
        session_id: &str,
        dialogue: &[Message],
        tools: &[serde_json::Value],
    ) -> anyhow::Result<mpsc::Receiver<LlmChunk>> {
        let body = self.request_body(dialogue, tools);
        self.open_stream(session_id, body).await
    }

    async fn stream(
        &self,
        session_id: &str,
        dialogue: &[Message],
    ) -> anyhow::Result<mpsc::Receiver<String>> {
        let body = self.request_body(dialogue, &[]);
        let mut chunks = self.open_stream(session_id, body).await?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if let Some(err) = chunk.error {
                    warn!("LLM stream error: {}", err);
                    return;
                }
                if let Some(content) = chunk.content {
                    if tx.send(content).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    fn set_identity_flag(&self, key: &str, value: &str) {
        self.identity
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.identity.lock().unwrap().clear();
        Ok(())
    }
}

impl Configurable for OpenAiLlmProvider {
    fn apply_user_config(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let mut current = self.config.lock().unwrap();
        if let Some(model) = config["model_name"].as_str() {
            current.model_name = model.to_string();
        }
        if let Some(url) = config["url"].as_str() {
            current.base_url = url.to_string();
        }
        if let Some(key) = config["api_key"].as_str() {
            current.api_key = key.to_string();
        }
        if let Some(temperature) = config["temperature"].as_f64() {
            current.temperature = temperature;
        }
        if let Some(max_tokens) = config["max_tokens"].as_u64() {
            current.max_tokens = max_tokens as u32;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VLM
// ---------------------------------------------------------------------------

/// Vision provider over the same chat completions surface, sending the
/// image as an `image_url` content part.
pub struct OpenAiVlmProvider {
    inner: OpenAiLlmProvider,
}

impl OpenAiVlmProvider {
    pub fn new(config: &VllmConfig) -> Self {
        let llm_config = LlmConfig {
            r#type: config.r#type.clone(),
            model_name: config.model_name.clone(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            extra: config.extra.clone(),
        };
        Self {
            inner: OpenAiLlmProvider::new(&llm_config),
        }
    }

    fn image_url(image: &ImageData) -> String {
        if !image.url.is_empty() {
            image.url.clone()
        } else {
            let format = if image.format.is_empty() {
                "jpeg"
            } else {
                &image.format
            };
            format!("data:image/{};base64,{}", format, image.data)
        }
    }
}

#[async_trait]
impl VlmProvider for OpenAiVlmProvider {
    async fn stream_with_image(
        &self,
        session_id: &str,
        dialogue: &[Message],
        image: &ImageData,
        text: &str,
    ) -> anyhow::Result<mpsc::Receiver<String>> {
        let mut messages: Vec<serde_json::Value> = dialogue
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or_default())
            .collect();

        messages.push(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": text},
                {"type": "image_url", "image_url": {"url": Self::image_url(image)}},
            ],
        }));

        let config = self.inner.config_snapshot();
        let mut body = serde_json::json!({
            "model": config.model_name,
            "messages": messages,
            "stream": true,
        });
        if config.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(config.max_tokens);
        }

        let mut chunks = self.inner.open_stream(session_id, body).await?;
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if chunk.error.is_some() {
                    return;
                }
                if let Some(content) = chunk.content {
                    if tx.send(content).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_chunk() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        let chunk = parse_stream_chunk(data).unwrap();
        assert_eq!(chunk.content.as_deref(), Some("Hello"));
        assert!(chunk.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_chunk() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"weather","arguments":"{\"ci"}}]}}]}"#;
        let chunk = parse_stream_chunk(data).unwrap();
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].id, "call_1");
        assert_eq!(chunk.tool_calls[0].function.name, "weather");
        assert_eq!(chunk.tool_calls[0].function.arguments, "{\"ci");
    }

    #[test]
    fn test_parse_error_chunk() {
        let data = r#"{"error":{"message":"overloaded"}}"#;
        let chunk = parse_stream_chunk(data).unwrap();
        assert_eq!(chunk.error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn test_missing_api_key_refused() {
        let provider = OpenAiLlmProvider::new(&LlmConfig::default());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt
            .block_on(provider.stream("s", &[]))
            .unwrap_err();
        let provider_err = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(provider_err.error_code(), "MISSING_API_KEY");
    }

    #[test]
    fn test_configurable_override() {
        let provider = OpenAiLlmProvider::new(&LlmConfig {
            model_name: "base-model".into(),
            temperature: 0.5,
            ..Default::default()
        });
        let configurable = provider.as_configurable().unwrap();
        configurable
            .apply_user_config(&serde_json::json!({
                "model_name": "user-model",
                "max_tokens": 512,
            }))
            .unwrap();
        let config = provider.config_snapshot();
        assert_eq!(config.model_name, "user-model");
        assert_eq!(config.max_tokens, 512);
        assert!((config.temperature - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_vlm_image_url_precedence() {
        let by_url = ImageData {
            url: "https://img".into(),
            ..Default::default()
        };
        assert_eq!(OpenAiVlmProvider::image_url(&by_url), "https://img");

        let by_data = ImageData {
            data: "AAAA".into(),
            format: "png".into(),
            ..Default::default()
        };
        assert_eq!(
            OpenAiVlmProvider::image_url(&by_data),
            "data:image/png;base64,AAAA"
        );
    }
}
