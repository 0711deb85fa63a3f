use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tera::{Context, Tera};
use tracing::{debug, warn};

use bazaar_core::domain::item::RecommendationCandidate;
use bazaar_core::domain::persona::PersonaProfile;

use crate::llm::{ContextEntry, LlmBackend};

const TEMPLATE_NAME: &str = "rationale_prompt.txt";
const TEMPLATE: &str = include_str!("../templates/rationale_prompt.txt");

#[derive(Serialize)]
struct PromptItem<'a> {
    item_id: i64,
    name: &'a str,
    price: i64,
    category: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Rationale {
    item_id: Option<i64>,
    name: Option<String>,
    reason: String,
}

/// Labels candidates with a persona-voiced reason using one extra backend call.
///
/// Never fails: any backend or parse problem leaves `rationale` unset.
pub struct RationaleAnnotator {
    backend: Arc<dyn LlmBackend>,
    timeout: Duration,
    templates: Tera,
}

fn init_templates() -> Tera {
    let mut tera = Tera::default();
    if let Err(error) = tera.add_raw_template(TEMPLATE_NAME, TEMPLATE) {
        warn!(error = %error, "failed to compile rationale prompt template");
    }
    tera
}

impl RationaleAnnotator {
    pub fn new(backend: Arc<dyn LlmBackend>, timeout: Duration) -> Self {
        Self { backend, timeout, templates: init_templates() }
    }

    pub async fn annotate(
        &self,
        persona: &PersonaProfile,
        mut candidates: Vec<RecommendationCandidate>,
        hint: Option<&str>,
    ) -> Vec<RecommendationCandidate> {
        if candidates.is_empty() {
            return candidates;
        }
        let Some(prompt) = self.render_prompt(persona, &candidates, hint) else {
            return candidates;
        };

        let entries =
            [ContextEntry::system(persona.system_prompt.clone()), ContextEntry::user(prompt)];
        let reply = match tokio::time::timeout(self.timeout, self.backend.chat(&entries, &[])).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                warn!(
                    event_name = "agent.rationale.backend_failed",
                    error_code = error.code(),
                    error = %error,
                    "leaving candidates without rationale"
                );
                return candidates;
            }
            Err(_) => {
                warn!(
                    event_name = "agent.rationale.backend_failed",
                    error_code = "backend_timeout",
                    timeout_ms = self.timeout.as_millis() as u64,
                    "leaving candidates without rationale"
                );
                return candidates;
            }
        };

        let Some(text) = reply.non_empty_text() else {
            return candidates;
        };
        let rationales = parse_rationales(text);
        if rationales.is_empty() {
            debug!(event_name = "agent.rationale.unparseable", "no rationale entries in reply");
            return candidates;
        }
        apply_rationales(&mut candidates, &rationales);
        candidates
    }

    fn render_prompt(
        &self,
        persona: &PersonaProfile,
        candidates: &[RecommendationCandidate],
        hint: Option<&str>,
    ) -> Option<String> {
        let items: Vec<PromptItem<'_>> = candidates
            .iter()
            .map(|candidate| PromptItem {
                item_id: candidate.item_id.0,
                name: &candidate.name,
                price: candidate.price,
                category: candidate.category.as_deref(),
            })
            .collect();

        let mut context = Context::new();
        context.insert("persona_name", &persona.name);
        context.insert("hint", &hint);
        context.insert("items", &items);

        match self.templates.render(TEMPLATE_NAME, &context) {
            Ok(prompt) => Some(prompt),
            Err(error) => {
                warn!(error = %error, "failed to render rationale prompt");
                None
            }
        }
    }
}

/// First balanced JSON object or array in `text`, ignoring fences and prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, byte) in bytes.iter().enumerate() {
        if *byte != b'{' && *byte != b'[' {
            continue;
        }
        if let Some(end) = balanced_end(&text[start..]) {
            if let Ok(value) = serde_json::from_str(&text[start..start + end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Byte length of the bracketed value opening `text`, if it closes.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_rationales(text: &str) -> Vec<Rationale> {
    let Some(value) = extract_json(text) else {
        return Vec::new();
    };
    let entries = match &value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("items").and_then(Value::as_array) {
            Some(entries) => entries.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let reason = entry
                .get("reason")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|reason| !reason.is_empty())?;
            let item_id = match entry.get("item_id") {
                Some(Value::Number(number)) => number.as_i64(),
                Some(Value::String(text)) => text.trim().parse().ok(),
                _ => None,
            };
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            Some(Rationale { item_id, name, reason: reason.to_string() })
        })
        .collect()
}

/// Id match first, then exact name, then containment in either direction.
fn apply_rationales(candidates: &mut [RecommendationCandidate], rationales: &[Rationale]) {
    for rationale in rationales {
        let open = |candidate: &RecommendationCandidate| candidate.rationale.is_none();

        let by_id = rationale.item_id.and_then(|id| {
            candidates.iter().position(|candidate| open(candidate) && candidate.item_id.0 == id)
        });
        let by_name = || {
            let name = rationale.name.as_deref()?;
            candidates
                .iter()
                .position(|candidate| open(candidate) && candidate.name == name)
                .or_else(|| {
                    let needle = name.to_lowercase();
                    candidates.iter().position(|candidate| {
                        let hay = candidate.name.to_lowercase();
                        open(candidate) && (hay.contains(&needle) || needle.contains(&hay))
                    })
                })
        };

        if let Some(idx) = by_id.or_else(by_name) {
            candidates[idx].rationale = Some(rationale.reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus, RecommendationCandidate};
    use bazaar_core::domain::persona::PersonaProfile;

    use super::{extract_json, RationaleAnnotator};
    use crate::errors::BackendError;
    use crate::llm::{ScriptStep, ScriptedBackend};

    fn candidates() -> Vec<RecommendationCandidate> {
        [(1, "Nike Air Max 90"), (2, "Adidas Samba"), (3, "Leather Tote Bag")]
            .into_iter()
            .map(|(id, name)| {
                let item = CatalogItem {
                    id: ItemId(id),
                    seller_id: None,
                    name: name.to_string(),
                    description: String::new(),
                    price: 5000,
                    category: None,
                    condition: None,
                    status: ItemStatus::OnSale,
                    created_at: Utc::now(),
                };
                RecommendationCandidate::from_item(&item, 0.5)
            })
            .collect()
    }

    fn annotator(backend: ScriptedBackend) -> RationaleAnnotator {
        RationaleAnnotator::new(Arc::new(backend), Duration::from_secs(2))
    }

    #[test]
    fn extracts_first_json_from_fenced_prose() {
        let text = "はい！\n```json\n{\"items\": [{\"item_id\": 1, \"reason\": \"a {b}\"}]}\n```\nどうぞ";

        let value = extract_json(text);

        assert_eq!(value, Some(json!({"items": [{"item_id": 1, "reason": "a {b}"}]})));
        assert_eq!(extract_json("no json here { nope"), None);
    }

    #[tokio::test]
    async fn matches_by_id_then_name_then_substring() {
        let reply = r#"{"items": [
            {"item_id": "2", "name": "wrong name", "reason": "by id"},
            {"name": "Leather Tote Bag", "reason": "by name"},
            {"name": "Air Max", "reason": "by substring"}
        ]}"#;
        let annotator = annotator(ScriptedBackend::replies(&[reply]));

        let annotated = annotator
            .annotate(&PersonaProfile::builtin_fallback(), candidates(), Some("shoes"))
            .await;

        assert_eq!(annotated[0].rationale.as_deref(), Some("by substring"));
        assert_eq!(annotated[1].rationale.as_deref(), Some("by id"));
        assert_eq!(annotated[2].rationale.as_deref(), Some("by name"));
    }

    #[tokio::test]
    async fn garbage_output_leaves_rationale_empty() {
        let annotator = annotator(ScriptedBackend::replies(&["素敵な商品ばかりですね！"]));

        let annotated =
            annotator.annotate(&PersonaProfile::builtin_fallback(), candidates(), None).await;

        assert_eq!(annotated, candidates());
    }

    #[tokio::test]
    async fn backend_failure_leaves_rationale_empty() {
        let annotator = annotator(ScriptedBackend::new(vec![ScriptStep::Fail(
            BackendError::Quota("429".to_string()),
        )]));

        let annotated =
            annotator.annotate(&PersonaProfile::builtin_fallback(), candidates(), None).await;

        assert!(annotated.iter().all(|candidate| candidate.rationale.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_is_cut_off_by_timeout() {
        let annotator = annotator(ScriptedBackend::new(vec![ScriptStep::Hang]));

        let annotated =
            annotator.annotate(&PersonaProfile::builtin_fallback(), candidates(), None).await;

        assert!(annotated.iter().all(|candidate| candidate.rationale.is_none()));
    }

    #[tokio::test]
    async fn prompt_lists_every_candidate_and_the_hint() {
        let backend = Arc::new(ScriptedBackend::replies(&["[]"]));
        let annotator = RationaleAnnotator::new(backend.clone(), Duration::from_secs(2));

        annotator.annotate(&PersonaProfile::builtin_fallback(), candidates(), Some("スニーカー")).await;

        let requests = backend.requests();
        let prompt = serde_json::to_string(&requests[0]).expect("serialize");
        assert!(prompt.contains("item_id: 1"));
        assert!(prompt.contains("Leather Tote Bag"));
        assert!(prompt.contains("スニーカー"));
    }
}
