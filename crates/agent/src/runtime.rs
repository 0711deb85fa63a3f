use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use bazaar_core::config::{AppConfig, LlmConfig, LlmProvider, SiteMap};
use bazaar_core::domain::item::{CatalogItem, ItemId, RecommendationCandidate};
use bazaar_core::domain::persona::PersonaDescriptor;
use bazaar_core::domain::user::{UserAccount, UserId};
use bazaar_core::recommend::{CandidateRecommender, RecommenderSettings};
use bazaar_db::RepositorySet;

use crate::context::ConversationContext;
use crate::errors::{AgentError, BackendError};
use crate::guardrails::GuardrailPolicy;
use crate::llm::{ContextEntry, DisabledBackend, LlmBackend};
use crate::openai::OpenAiCompatibleBackend;
use crate::orchestrator::{LoopSettings, OrchestrationLoop, Termination, ToolLogEntry};
use crate::page_context::{fallback_guidance, page_type_for_path, ItemSnapshot, PageContext};
use crate::persona::PersonaResolver;
use crate::rationale::RationaleAnnotator;
use crate::tools::{ToolExecutor, ToolScope};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    pub loop_settings: LoopSettings,
    pub history_window: usize,
    pub gacha_cost: i64,
    pub recommender: RecommenderSettings,
    pub guardrails: GuardrailPolicy,
    pub site_map: SiteMap,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            loop_settings: LoopSettings::default(),
            history_window: 50,
            gacha_cost: 100,
            recommender: RecommenderSettings::default(),
            guardrails: GuardrailPolicy::default(),
            site_map: SiteMap::default(),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            loop_settings: LoopSettings {
                max_iterations: config.agent.max_tool_iterations,
                call_timeout: Duration::from_secs(config.llm.timeout_secs.max(1)),
            },
            history_window: config.agent.history_window as usize,
            gacha_cost: config.gacha.cost,
            recommender: RecommenderSettings::from(&config.recommend),
            guardrails: GuardrailPolicy::from(&config.agent),
            site_map: config.agent.site_map.clone(),
        }
    }
}

/// Builds the text backend named by `llm.provider`.
pub fn backend_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    match config.provider {
        LlmProvider::Disabled => Ok(Arc::new(DisabledBackend)),
        LlmProvider::OpenAi | LlmProvider::Ollama => {
            Ok(Arc::new(OpenAiCompatibleBackend::from_config(config)?))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecommendMode {
    SeedItem(ItemId),
    Keyword(String),
    /// Neighbours of the user's most recent purchase.
    History,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConverseReply {
    pub reply: String,
    pub persona: PersonaDescriptor,
    pub tool_calls: Vec<ToolLogEntry>,
    pub termination: Termination,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecommendReply {
    pub candidates: Vec<RecommendationCandidate>,
    pub persona: PersonaDescriptor,
    pub can_recommend: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GuidanceRequest {
    pub user_id: Option<UserId>,
    pub path: String,
    pub query: Option<String>,
    pub page_context: Option<PageContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GuidanceReply {
    pub message: String,
    pub persona: PersonaDescriptor,
    pub fallback: bool,
}

/// Entry point for chat, recommendation and page guidance.
pub struct AgentRuntime {
    repos: RepositorySet,
    backend: Arc<dyn LlmBackend>,
    resolver: PersonaResolver,
    context: ConversationContext,
    orchestrator: OrchestrationLoop,
    recommender: CandidateRecommender,
    annotator: Arc<RationaleAnnotator>,
    call_timeout: Duration,
    write_locks: UserWriteLocks,
}

impl AgentRuntime {
    pub fn new(
        repos: RepositorySet,
        backend: Arc<dyn LlmBackend>,
        settings: AgentSettings,
    ) -> Self {
        let call_timeout = settings.loop_settings.call_timeout;
        let recommender = CandidateRecommender::new(settings.recommender);
        let annotator = Arc::new(RationaleAnnotator::new(backend.clone(), call_timeout));
        let executor = Arc::new(ToolExecutor::new(
            repos.clone(),
            recommender.clone(),
            annotator.clone(),
            settings.guardrails.clone(),
            settings.gacha_cost,
        ));

        Self {
            resolver: PersonaResolver::new(repos.personas.clone(), repos.users.clone()),
            context: ConversationContext::new(repos.conversations.clone(), settings.history_window)
                .with_site_map(&settings.site_map),
            orchestrator: OrchestrationLoop::new(
                backend.clone(),
                executor,
                settings.loop_settings,
            ),
            repos,
            backend,
            recommender,
            annotator,
            call_timeout,
            write_locks: UserWriteLocks::default(),
        }
    }

    pub fn from_config(config: &AppConfig, repos: RepositorySet) -> Result<Self, AgentError> {
        let backend = backend_from_config(&config.llm).map_err(AgentError::BackendConfig)?;
        info!(
            event_name = "agent.runtime.backend_selected",
            backend = backend.name(),
            model = %config.llm.model,
            "text backend configured"
        );
        Ok(Self::new(repos, backend, AgentSettings::from_config(config)))
    }

    /// One chat exchange. Backend trouble never surfaces here; only store
    /// failures and empty messages are errors.
    pub async fn converse(
        &self,
        user_id: UserId,
        message: &str,
        page_context: Option<&PageContext>,
    ) -> Result<ConverseReply, AgentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::InvalidInput("message must not be empty".to_string()));
        }

        let resolved = self.resolver.resolve(Some(user_id), None).await;
        let account = self.repos.users.find_by_id(user_id).await?;
        if account.is_some() {
            if let Err(error) = self.resolver.repair_equip_if_missing(user_id, &resolved).await {
                warn!(
                    event_name = "agent.persona.equip_repair_failed",
                    user_id = %user_id,
                    error = %error,
                    "continuing with resolved persona"
                );
            }
        }

        let page_text = page_context.map(PageContext::build_context_text);
        let entries =
            self.context.assemble(user_id, &resolved.profile, message, page_text.as_deref()).await?;
        let scope = ToolScope { user_id, persona: &resolved.profile };
        let outcome = self.orchestrator.run(scope, entries).await;

        if account.is_some() {
            let _guard = self.write_locks.lock(user_id).await;
            self.context.record_exchange(user_id, message, &outcome.tool_log, &outcome.text).await?;
        } else {
            info!(
                event_name = "agent.converse.unpersisted",
                user_id = %user_id,
                "user record absent; exchange not logged"
            );
        }

        info!(
            event_name = "agent.converse.completed",
            user_id = %user_id,
            persona_id = resolved.profile.id.0,
            persona_source = ?resolved.source,
            iterations = outcome.iterations,
            tool_calls = outcome.tool_log.len(),
            termination = ?outcome.termination,
            "chat exchange completed"
        );

        Ok(ConverseReply {
            reply: outcome.text,
            persona: resolved.profile.descriptor(),
            tool_calls: outcome.tool_log,
            termination: outcome.termination,
        })
    }

    pub async fn recommend(
        &self,
        user_id: UserId,
        mode: RecommendMode,
        limit: Option<usize>,
    ) -> Result<RecommendReply, AgentError> {
        let resolved = self.resolver.resolve(Some(user_id), None).await;
        let corpus = self.repos.items.list_available(self.recommender.settings().max_corpus).await?;

        let (candidates, hint) = match &mode {
            RecommendMode::SeedItem(seed) => {
                (self.recommender.similar_to(&corpus, *seed, limit), None)
            }
            RecommendMode::Keyword(keyword) => (
                self.recommender.matching_keyword(&corpus, keyword, limit),
                Some(keyword.as_str()),
            ),
            RecommendMode::History => match self.repos.items.latest_purchase(user_id).await? {
                Some(purchase) => {
                    (self.recommender.similar_to_reference(&corpus, &purchase, limit), None)
                }
                None => (Vec::new(), None),
            },
        };
        let candidates = self.annotator.annotate(&resolved.profile, candidates, hint).await;

        info!(
            event_name = "agent.recommend.completed",
            user_id = %user_id,
            mode = ?mode,
            corpus_size = corpus.len(),
            candidates = candidates.len(),
            "recommendation computed"
        );

        Ok(RecommendReply {
            can_recommend: !candidates.is_empty(),
            candidates,
            persona: resolved.profile.descriptor(),
        })
    }

    /// A persona-voiced line about the page the user just opened.
    pub async fn page_guidance(
        &self,
        request: GuidanceRequest,
    ) -> Result<GuidanceReply, AgentError> {
        let path = request.path.trim();
        if path.is_empty() {
            return Err(AgentError::InvalidInput("path is required".to_string()));
        }
        let path_with_query = match request.query.as_deref().filter(|query| !query.is_empty()) {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };

        let resolved = self.resolver.resolve(request.user_id, None).await;
        let account = match request.user_id {
            Some(user_id) => self.repos.users.find_by_id(user_id).await?,
            None => None,
        };

        let page = match request.page_context {
            Some(page) => page,
            None => self.page_from_store(account.as_ref(), path, request.query.as_deref()).await,
        };
        let context_text = page.build_context_text();
        let instruction = page.guidance_instruction(&path_with_query);

        let entries = [
            ContextEntry::system(resolved.profile.system_prompt.clone()),
            ContextEntry::user(format!("{context_text}\n\n{instruction}")),
        ];
        let call = tokio::time::timeout(self.call_timeout, self.backend.chat(&entries, &[]));
        let generated = match call.await.unwrap_or(Err(BackendError::Timeout(self.call_timeout))) {
            Ok(reply) => reply.non_empty_text().map(str::to_string),
            Err(error) => {
                warn!(
                    event_name = "agent.guidance.backend_failed",
                    path = %path,
                    error_code = error.code(),
                    error = %error,
                    "using path fallback line"
                );
                None
            }
        };

        let Some(message) = generated else {
            return Ok(GuidanceReply {
                message: fallback_guidance(path).to_string(),
                persona: resolved.profile.descriptor(),
                fallback: true,
            });
        };

        if let Some(account) = &account {
            let _guard = self.write_locks.lock(account.id).await;
            if let Err(error) = self.context.add_guidance(account.id, &message).await {
                warn!(
                    event_name = "agent.guidance.persist_failed",
                    user_id = %account.id,
                    error = %error,
                    "guidance returned without being logged"
                );
            }
        }

        Ok(GuidanceReply { message, persona: resolved.profile.descriptor(), fallback: false })
    }

    /// Page context rebuilt from the store when the client sent none.
    async fn page_from_store(
        &self,
        account: Option<&UserAccount>,
        path: &str,
        query: Option<&str>,
    ) -> PageContext {
        let mut page = PageContext {
            page_type: page_type_for_path(path),
            search_query: query.and_then(search_keyword),
            user_gacha_points: account.map(|account| account.gacha_points),
            ..PageContext::default()
        };
        if let Some(account) = account {
            page.additional_info.insert("ユーザー".to_string(), account.username.clone().into());
        }

        if page.page_type == "item_detail" {
            let item_id = path
                .trim_start_matches("/items/")
                .split(['/', '?'])
                .next()
                .and_then(|segment| segment.parse::<i64>().ok());
            if let Some(item_id) = item_id {
                match self.repos.items.find_by_id(ItemId(item_id)).await {
                    Ok(item) => page.current_item = item.as_ref().map(item_snapshot),
                    Err(error) => warn!(
                        event_name = "agent.guidance.item_lookup_failed",
                        item_id,
                        error = %error,
                        "guidance continues without item details"
                    ),
                }
            }
        }
        page
    }
}

/// One async mutex per user with pending conversation writes. An entry lives
/// only while a task holds or waits on it.
#[derive(Default)]
struct UserWriteLocks {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl UserWriteLocks {
    async fn lock(&self, user_id: UserId) -> UserWriteGuard<'_> {
        let lock = self.table().entry(user_id).or_default().clone();
        let guard = lock.lock_owned().await;
        UserWriteGuard { owner: self, user_id, guard: Some(guard) }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, user_id: UserId, lock: &Arc<AsyncMutex<()>>) {
        let mut table = self.table();
        // Only the table and `lock` still point at it: nobody is waiting.
        let idle = table.get(&user_id).is_some_and(|current| Arc::ptr_eq(current, lock))
            && Arc::strong_count(lock) == 2;
        if idle {
            table.remove(&user_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

struct UserWriteGuard<'a> {
    owner: &'a UserWriteLocks,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let lock = OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            self.owner.release(self.user_id, &lock);
        }
    }
}

fn search_keyword(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.strip_prefix("q="))
        .map(|value| value.replace('+', " "))
        .find(|value| !value.trim().is_empty())
}

fn item_snapshot(item: &CatalogItem) -> ItemSnapshot {
    ItemSnapshot {
        item_id: item.id.to_string(),
        name: item.name.clone(),
        price: item.price,
        category: item.category.clone(),
        condition: item.condition.clone(),
        description: Some(item.description.clone()),
        ..ItemSnapshot::default()
    }
}
