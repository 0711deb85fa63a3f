//! OpenAI-compatible `/chat/completions` backend. Ollama exposes the same
//! surface under `/v1`, so both providers share this client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use bazaar_core::config::{LlmConfig, LlmProvider};

use crate::errors::BackendError;
use crate::llm::{BackendReply, ContextEntry, LlmBackend, ToolCallRequest, ToolSpec};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

pub struct OpenAiCompatibleBackend {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiCompatibleBackend {
    pub fn from_config(config: &LlmConfig) -> Result<Self, BackendError> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.clone(),
            (None, LlmProvider::Ollama) => OLLAMA_BASE_URL.to_string(),
            (None, _) => OPENAI_BASE_URL.to_string(),
        };
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|error| BackendError::Unavailable(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, entries: &[ContextEntry], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": format_messages(entries),
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(format_tools(tools));
        }
        body
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn chat(
        &self,
        entries: &[ContextEntry],
        tools: &[ToolSpec],
    ) -> Result<BackendReply, BackendError> {
        let mut request = self.client.post(&self.endpoint).json(&self.request_body(entries, tools));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        debug!(
            event_name = "agent.backend.request",
            endpoint = %self.endpoint,
            model = %self.model,
            entries = entries.len(),
            tools = tools.len(),
            "sending chat completion request"
        );

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Unavailable(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(
                event_name = "agent.backend.http_error",
                status = status.as_u16(),
                body = %snippet,
                "chat completion request rejected"
            );
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => BackendError::Quota(snippet),
                _ => BackendError::Unavailable(format!("HTTP {}: {snippet}", status.as_u16())),
            });
        }

        let payload: Value =
            response.json().await.map_err(|error| BackendError::Malformed(error.to_string()))?;
        parse_reply(&payload)
    }
}

fn format_messages(entries: &[ContextEntry]) -> Vec<Value> {
    entries
        .iter()
        .map(|entry| match entry {
            ContextEntry::System { content } => json!({"role": "system", "content": content}),
            ContextEntry::User { content } => json!({"role": "user", "content": content}),
            ContextEntry::Assistant { content } => {
                json!({"role": "assistant", "content": content})
            }
            ContextEntry::AssistantToolCalls { content, calls } => json!({
                "role": "assistant",
                "content": content,
                "tool_calls": calls
                    .iter()
                    .map(|call| json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    }))
                    .collect::<Vec<_>>(),
            }),
            ContextEntry::ToolResult { call_id, name, content } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "name": name,
                "content": content.to_string(),
            }),
        })
        .collect()
}

fn format_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

/// Reads the first choice of a completion response.
///
/// Tool-call arguments arrive as a JSON string; an unparseable one is kept as a
/// raw string so the tool layer can report `invalid_arguments`.
fn parse_reply(payload: &Value) -> Result<BackendReply, BackendError> {
    let message = payload
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| BackendError::Malformed("response has no choices[0].message".to_string()))?;

    let text = message.get("content").and_then(Value::as_str).map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let function = &call["function"];
            let Some(name) = function["name"].as_str() else {
                return Err(BackendError::Malformed("tool call without a name".to_string()));
            };
            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{index}"));
            let arguments = match &function["arguments"] {
                Value::String(raw) if raw.trim().is_empty() => json!({}),
                Value::String(raw) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Value::Null => json!({}),
                other => other.clone(),
            };
            tool_calls.push(ToolCallRequest { id, name: name.to_string(), arguments });
        }
    }

    if tool_calls.is_empty() && text.is_none() {
        return Err(BackendError::Malformed("message has neither content nor tool calls".into()));
    }

    Ok(BackendReply { text, tool_calls })
}
