use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BackendError;

/// One entry of the input sequence sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ContextEntry {
    System { content: String },
    User { content: String },
    Assistant { content: String },
    /// The model's own request for tools, echoed back on the next call.
    AssistantToolCalls { content: Option<String>, calls: Vec<ToolCallRequest> },
    /// Result of exactly one earlier request, matched by `call_id`.
    ToolResult { call_id: String, name: String, content: Value },
}

impl ContextEntry {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant { content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Declaration of a callable tool in JSON-schema form.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_calls: Vec::new() }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self { text: None, tool_calls: calls }
    }

    /// Trimmed text, `None` when blank.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|text| !text.is_empty())
    }
}

/// The generative text backend. Callers bound every call with their own timeout.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        entries: &[ContextEntry],
        tools: &[ToolSpec],
    ) -> Result<BackendReply, BackendError>;
}

/// Backend used when `llm.provider = "disabled"`.
#[derive(Clone, Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl LlmBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn chat(
        &self,
        _entries: &[ContextEntry],
        _tools: &[ToolSpec],
    ) -> Result<BackendReply, BackendError> {
        Err(BackendError::Unavailable("text backend is disabled".to_string()))
    }
}

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Reply(BackendReply),
    Fail(BackendError),
    /// Never resolves; exercises the caller's timeout.
    Hang,
}

/// Deterministic backend that plays back a fixed script.
///
/// With `repeat_last` the final step is replayed forever, otherwise an exhausted
/// script answers `Unavailable`. Every request is recorded for inspection.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptStep>>,
    repeat_last: bool,
    requests: Mutex<Vec<Vec<ContextEntry>>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps: Mutex::new(steps.into()), repeat_last: false, requests: Mutex::default() }
    }

    pub fn repeating(step: ScriptStep) -> Self {
        Self { repeat_last: true, ..Self::new(vec![step]) }
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| ScriptStep::Reply(BackendReply::text(*text))).collect())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Vec<ContextEntry>> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut steps = self.steps.lock().ok()?;
        if self.repeat_last && steps.len() == 1 {
            return steps.front().cloned();
        }
        steps.pop_front()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        entries: &[ContextEntry],
        _tools: &[ToolSpec],
    ) -> Result<BackendReply, BackendError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(entries.to_vec());
        }

        match self.next_step() {
            Some(ScriptStep::Reply(reply)) => Ok(reply),
            Some(ScriptStep::Fail(error)) => Err(error),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Err(BackendError::Unavailable("script exhausted".to_string())),
        }
    }
}
