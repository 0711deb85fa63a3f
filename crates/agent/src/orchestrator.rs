use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::errors::BackendError;
use crate::llm::{BackendReply, ContextEntry, LlmBackend, ToolSpec};
use crate::tools::{tool_specs, ToolExecutor, ToolScope};

/// Reply used when the iteration cap is hit before any text was produced.
pub const ITERATION_CAP_APOLOGY: &str =
    "ごめんなさい、うまく処理を終えられませんでした。もう一度、別の言い方で話しかけてみてください。";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub call_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self { max_iterations: 5, call_timeout: Duration::from_secs(30) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Termination {
    FinalText,
    MaxIterationsExceeded,
    BackendFailed { code: String },
}

/// One executed tool call, as relayed to the backend and persisted as a hidden turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolLogEntry {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
    pub ok: bool,
}

impl ToolLogEntry {
    pub fn to_log_line(&self) -> String {
        json!({
            "call_id": self.call_id,
            "tool": self.tool,
            "arguments": self.arguments,
            "result": self.result,
            "ok": self.ok,
        })
        .to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoopOutcome {
    pub text: String,
    pub tool_log: Vec<ToolLogEntry>,
    pub iterations: u32,
    pub termination: Termination,
}

/// Calls the backend, runs requested tools, feeds results back, repeats.
///
/// Stops on plain text, on the first backend failure (persona fallback text), or
/// at the iteration cap (last text seen, else a fixed apology).
pub struct OrchestrationLoop {
    backend: Arc<dyn LlmBackend>,
    executor: Arc<ToolExecutor>,
    settings: LoopSettings,
    tools: Vec<ToolSpec>,
}

impl OrchestrationLoop {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        executor: Arc<ToolExecutor>,
        settings: LoopSettings,
    ) -> Self {
        Self { backend, executor, settings, tools: tool_specs() }
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }

    pub async fn run(&self, scope: ToolScope<'_>, mut entries: Vec<ContextEntry>) -> LoopOutcome {
        let mut tool_log = Vec::new();
        let mut last_text: Option<String> = None;
        let max_iterations = self.settings.max_iterations.max(1);

        for iteration in 1..=max_iterations {
            let reply = match self.call_backend(&entries).await {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(
                        event_name = "agent.loop.backend_failed",
                        user_id = %scope.user_id,
                        backend = self.backend.name(),
                        iteration,
                        error_code = error.code(),
                        error = %error,
                        "degrading to persona fallback text"
                    );
                    return LoopOutcome {
                        text: scope.persona.fallback_text().to_string(),
                        tool_log,
                        iterations: iteration,
                        termination: Termination::BackendFailed { code: error.code().to_string() },
                    };
                }
            };

            if reply.tool_calls.is_empty() {
                debug!(
                    event_name = "agent.loop.final_text",
                    user_id = %scope.user_id,
                    iteration,
                    "backend produced final text"
                );
                let text = reply.non_empty_text().map(str::to_string);
                return LoopOutcome {
                    text: text.unwrap_or_else(|| scope.persona.fallback_text().to_string()),
                    tool_log,
                    iterations: iteration,
                    termination: Termination::FinalText,
                };
            }

            if let Some(text) = reply.non_empty_text() {
                last_text = Some(text.to_string());
            }
            entries.push(ContextEntry::AssistantToolCalls {
                content: reply.text.clone(),
                calls: reply.tool_calls.clone(),
            });

            for call in &reply.tool_calls {
                let (result, ok) = match self.executor.execute(scope, call).await {
                    Ok(result) => (result, true),
                    Err(error) => (error.to_payload(), false),
                };
                entries.push(ContextEntry::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: result.clone(),
                });
                tool_log.push(ToolLogEntry {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result,
                    ok,
                });
            }
        }

        info!(
            event_name = "agent.loop.max_iterations_exceeded",
            user_id = %scope.user_id,
            max_iterations,
            tool_calls = tool_log.len(),
            "tool loop hit the iteration cap"
        );
        LoopOutcome {
            text: last_text.unwrap_or_else(|| ITERATION_CAP_APOLOGY.to_string()),
            tool_log,
            iterations: max_iterations,
            termination: Termination::MaxIterationsExceeded,
        }
    }

    async fn call_backend(&self, entries: &[ContextEntry]) -> Result<BackendReply, BackendError> {
        let timeout = self.settings.call_timeout;
        tokio::time::timeout(timeout, self.backend.chat(entries, &self.tools))
            .await
            .unwrap_or(Err(BackendError::Timeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use bazaar_core::domain::persona::PersonaProfile;
    use bazaar_core::domain::user::{UserAccount, UserId};
    use bazaar_core::recommend::CandidateRecommender;
    use bazaar_db::{InMemoryMarketplace, RepositorySet, UserRepository};

    use super::{LoopSettings, OrchestrationLoop, Termination, ITERATION_CAP_APOLOGY};
    use crate::errors::BackendError;
    use crate::guardrails::GuardrailPolicy;
    use crate::llm::{
        BackendReply, ContextEntry, DisabledBackend, ScriptStep, ScriptedBackend, ToolCallRequest,
    };
    use crate::rationale::RationaleAnnotator;
    use crate::tools::{ToolExecutor, ToolScope};

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest { id: id.to_string(), name: name.to_string(), arguments: json!({}) }
    }

    async fn orchestrator(backend: Arc<ScriptedBackend>, max_iterations: u32) -> OrchestrationLoop {
        let store = Arc::new(InMemoryMarketplace::default());
        UserRepository::save(&*store, UserAccount::new(UserId(1), "buyer", 300))
            .await
            .expect("save user");
        let executor = ToolExecutor::with_rng(
            RepositorySet::in_memory(store),
            CandidateRecommender::default(),
            Arc::new(RationaleAnnotator::new(Arc::new(DisabledBackend), Duration::from_secs(1))),
            GuardrailPolicy::default(),
            100,
            StdRng::seed_from_u64(3),
        );
        OrchestrationLoop::new(
            backend,
            Arc::new(executor),
            LoopSettings { max_iterations, call_timeout: Duration::from_secs(5) },
        )
    }

    fn persona() -> PersonaProfile {
        PersonaProfile {
            fallback_line: Some("今はお話しできないの、ごめんね。".to_string()),
            ..PersonaProfile::builtin_fallback()
        }
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_with_matching_call_ids() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::Reply(BackendReply::tool_calls(vec![call("c1", "check_balance")])),
            ScriptStep::Reply(BackendReply::text("残高は300ポイントです")),
        ]));
        let orchestrator = orchestrator(backend.clone(), 5).await;
        let persona = persona();

        let scope = ToolScope { user_id: UserId(1), persona: &persona };
        let outcome = orchestrator.run(scope, vec![ContextEntry::user("残高")]).await;

        assert_eq!(outcome.termination, Termination::FinalText);
        assert_eq!(outcome.text, "残高は300ポイントです");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_log.len(), 1);
        assert!(outcome.tool_log[0].ok);

        let second_request = &backend.requests()[1];
        assert!(matches!(&second_request[1], ContextEntry::AssistantToolCalls { calls, .. }
            if calls[0].id == "c1"));
        assert!(matches!(&second_request[2], ContextEntry::ToolResult { call_id, content, .. }
            if call_id == "c1" && content["gacha_points"] == 300));
    }

    #[tokio::test]
    async fn endless_tool_requests_stop_at_the_cap_with_text() {
        let backend = Arc::new(ScriptedBackend::repeating(ScriptStep::Reply(
            BackendReply::tool_calls(vec![call("loop", "check_balance")]),
        )));
        let orchestrator = orchestrator(backend.clone(), 3).await;
        let persona = persona();

        let scope = ToolScope { user_id: UserId(1), persona: &persona };
        let outcome = orchestrator.run(scope, vec![ContextEntry::user("hi")]).await;

        assert_eq!(outcome.termination, Termination::MaxIterationsExceeded);
        assert_eq!(outcome.text, ITERATION_CAP_APOLOGY);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tool_log.len(), 3);
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn cap_prefers_last_text_seen() {
        let backend = Arc::new(ScriptedBackend::repeating(ScriptStep::Reply(BackendReply {
            text: Some("ちょっと調べてみるね".to_string()),
            tool_calls: vec![call("loop", "check_balance")],
        })));
        let orchestrator = orchestrator(backend, 2).await;
        let persona = persona();

        let scope = ToolScope { user_id: UserId(1), persona: &persona };
        let outcome = orchestrator.run(scope, vec![ContextEntry::user("hi")]).await;

        assert_eq!(outcome.text, "ちょっと調べてみるね");
    }

    #[tokio::test]
    async fn failing_tools_and_unknown_tools_are_data_not_faults() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::Reply(BackendReply::tool_calls(vec![
                call("a", "teleport"),
                ToolCallRequest {
                    id: "b".to_string(),
                    name: "get_item_details".to_string(),
                    arguments: json!({"item_id": 999}),
                },
            ])),
            ScriptStep::Reply(BackendReply::text("見つかりませんでした")),
        ]));
        let orchestrator = orchestrator(backend.clone(), 5).await;
        let persona = persona();

        let outcome = orchestrator
            .run(ToolScope { user_id: UserId(1), persona: &persona }, vec![ContextEntry::user("x")])
            .await;

        assert_eq!(outcome.termination, Termination::FinalText);
        assert_eq!(outcome.tool_log[0].result["error"], "unknown_tool");
        assert_eq!(outcome.tool_log[1].result["error"], "item_not_found");
        assert!(outcome.tool_log.iter().all(|entry| !entry.ok));
    }

    #[tokio::test]
    async fn backend_errors_degrade_to_persona_fallback() {
        for error in [
            BackendError::Unavailable("down".to_string()),
            BackendError::Quota("429".to_string()),
            BackendError::Malformed("not json".to_string()),
        ] {
            let backend = Arc::new(ScriptedBackend::new(vec![ScriptStep::Fail(error.clone())]));
            let orchestrator = orchestrator(backend, 5).await;
            let persona = persona();

            let outcome = orchestrator
                .run(ToolScope { user_id: UserId(1), persona: &persona }, vec![])
                .await;

            assert_eq!(outcome.text, "今はお話しできないの、ごめんね。");
            assert_eq!(
                outcome.termination,
                Termination::BackendFailed { code: error.code().to_string() }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out_into_fallback() {
        let backend = Arc::new(ScriptedBackend::repeating(ScriptStep::Hang));
        let orchestrator = orchestrator(backend.clone(), 5).await;
        let persona = persona();

        let scope = ToolScope { user_id: UserId(1), persona: &persona };
        let outcome = orchestrator.run(scope, vec![ContextEntry::user("hi")]).await;

        assert_eq!(outcome.termination, Termination::BackendFailed {
            code: "backend_timeout".to_string()
        });
        assert_eq!(backend.call_count(), 1);
    }
}
