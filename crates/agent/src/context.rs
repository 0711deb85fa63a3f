use std::sync::Arc;

use bazaar_core::config::SiteMap;
use bazaar_core::domain::conversation::{ConversationTurn, NewTurn, TurnKind, TurnRole};
use bazaar_core::domain::persona::PersonaProfile;
use bazaar_core::domain::user::UserId;
use bazaar_db::ConversationRepository;

use crate::errors::AgentError;
use crate::llm::ContextEntry;
use crate::orchestrator::ToolLogEntry;

const TOOL_INSTRUCTIONS: &str = "必要に応じて提供されたツールを呼び出して、\
    商品検索・おすすめ・残高確認・ガチャ・ページ移動などを手伝ってください。\
    ツールの結果にエラーが含まれる場合は、その内容を踏まえてユーザーに分かりやすく伝えてください。";

/// Per-user turn log: reads a bounded window, writes once per exchange.
#[derive(Clone)]
pub struct ConversationContext {
    conversations: Arc<dyn ConversationRepository>,
    history_window: usize,
    site_info: Option<String>,
}

impl ConversationContext {
    pub fn new(conversations: Arc<dyn ConversationRepository>, history_window: usize) -> Self {
        Self { conversations, history_window, site_info: None }
    }

    /// Appends the rendered site map to every system entry.
    pub fn with_site_map(mut self, site_map: &SiteMap) -> Self {
        self.site_info = render_site_map(site_map);
        self
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Input sequence for the next backend call.
    ///
    /// Order: persona voice, past chat turns oldest first, the latest guidance as
    /// model-authored context, page context, then the new message.
    pub async fn assemble(
        &self,
        user_id: UserId,
        persona: &PersonaProfile,
        message: &str,
        page_context: Option<&str>,
    ) -> Result<Vec<ContextEntry>, AgentError> {
        let history =
            self.conversations.recent(user_id, TurnKind::Chat, self.history_window).await?;
        let guidance = self.conversations.latest(user_id, TurnKind::Guidance).await?;

        let mut entries = Vec::with_capacity(history.len() + 4);
        let mut system = format!("{}\n\n{TOOL_INSTRUCTIONS}", persona.system_prompt);
        if let Some(site_info) = &self.site_info {
            system.push_str("\n\n");
            system.push_str(site_info);
        }
        entries.push(ContextEntry::system(system));
        entries.extend(history.iter().filter_map(history_entry));
        if let Some(guidance) = guidance.filter(|turn| !turn.content.trim().is_empty()) {
            entries.push(ContextEntry::assistant(guidance.content));
        }
        if let Some(page) = page_context.map(str::trim).filter(|page| !page.is_empty()) {
            entries.push(ContextEntry::system(format!("現在の画面の情報:\n{page}")));
        }
        entries.push(ContextEntry::user(message));
        Ok(entries)
    }

    /// The single terminal write of an exchange: the user turn, one hidden turn
    /// per tool call, then the agent reply.
    pub async fn record_exchange(
        &self,
        user_id: UserId,
        message: &str,
        tool_log: &[ToolLogEntry],
        reply: &str,
    ) -> Result<Vec<ConversationTurn>, AgentError> {
        let mut turns = Vec::with_capacity(tool_log.len() + 2);
        turns.push(NewTurn::user_chat(message));
        turns.extend(tool_log.iter().map(|entry| NewTurn::tool_log(entry.to_log_line())));
        turns.push(NewTurn::agent_chat(reply));

        Ok(self.conversations.append(user_id, turns).await?)
    }

    pub async fn add_guidance(
        &self,
        user_id: UserId,
        text: &str,
    ) -> Result<ConversationTurn, AgentError> {
        let mut appended = self.conversations.append(user_id, vec![NewTurn::guidance(text)]).await?;
        appended.pop().ok_or_else(|| {
            AgentError::InvalidInput("guidance append returned no turn".to_string())
        })
    }
}

fn render_site_map(site_map: &SiteMap) -> Option<String> {
    if site_map.is_empty() {
        return None;
    }
    let mut lines = vec!["[サイト情報] アプリの主要ページと用途:".to_string()];
    for route in site_map.routes.iter().filter(|route| !route.name.trim().is_empty()) {
        if route.purpose.trim().is_empty() {
            lines.push(format!("- {} ({})", route.name, route.path));
        } else {
            lines.push(format!("- {} ({}): {}", route.name, route.path, route.purpose));
        }
    }
    if !site_map.notes.is_empty() {
        lines.push("[注意事項]".to_string());
        lines.extend(site_map.notes.iter().map(|note| format!("- {note}")));
    }
    Some(lines.join("\n"))
}

fn history_entry(turn: &ConversationTurn) -> Option<ContextEntry> {
    if turn.content.trim().is_empty() {
        return None;
    }
    match turn.role {
        TurnRole::User => Some(ContextEntry::user(turn.content.clone())),
        TurnRole::Agent => Some(ContextEntry::assistant(turn.content.clone())),
        TurnRole::System => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use bazaar_core::config::{SiteMap, SiteRoute};
    use bazaar_core::domain::conversation::{NewTurn, TurnKind, TurnRole};
    use bazaar_core::domain::persona::PersonaProfile;
    use bazaar_core::domain::user::{UserAccount, UserId};
    use bazaar_db::{ConversationRepository, InMemoryMarketplace, UserRepository};

    use super::ConversationContext;
    use crate::llm::ContextEntry;
    use crate::orchestrator::ToolLogEntry;

    async fn store_with_user(user: UserId) -> Arc<InMemoryMarketplace> {
        let store = Arc::new(InMemoryMarketplace::default());
        UserRepository::save(&*store, UserAccount::new(user, "buyer", 0)).await.expect("save");
        store
    }

    #[tokio::test]
    async fn assembles_window_guidance_page_and_message_in_order() {
        let user = UserId(1);
        let store = store_with_user(user).await;
        store
            .append(
                user,
                vec![
                    NewTurn::user_chat("old question"),
                    NewTurn::agent_chat("old answer"),
                    NewTurn::user_chat("recent question"),
                    NewTurn::agent_chat("recent answer"),
                ],
            )
            .await
            .expect("append chat");
        store.append(user, vec![NewTurn::guidance("welcome to gacha")]).await.expect("guidance");
        let context = ConversationContext::new(store.clone(), 2);

        let entries = context
            .assemble(user, &PersonaProfile::builtin_fallback(), "hello", Some("【現在のページ】ガチャページ"))
            .await
            .expect("assemble");

        assert_eq!(entries.len(), 6);
        assert!(matches!(&entries[0], ContextEntry::System { content }
            if content.starts_with("You are a kind AI assistant")));
        assert_eq!(entries[1], ContextEntry::user("recent question"));
        assert_eq!(entries[2], ContextEntry::assistant("recent answer"));
        assert_eq!(entries[3], ContextEntry::assistant("welcome to gacha"));
        assert!(matches!(
            &entries[4],
            ContextEntry::System { content } if content.contains("ガチャページ")
        ));
        assert_eq!(entries[5], ContextEntry::user("hello"));
    }

    #[tokio::test]
    async fn site_map_is_rendered_into_the_system_entry_only_when_configured() {
        let user = UserId(4);
        let store = store_with_user(user).await;
        let site_map = SiteMap {
            routes: vec![
                SiteRoute {
                    path: "/gacha".to_string(),
                    name: "ガチャ".to_string(),
                    purpose: "ポイントでガチャを回す".to_string(),
                },
                SiteRoute {
                    path: "/items/:id".to_string(),
                    name: "商品詳細".to_string(),
                    purpose: String::new(),
                },
            ],
            notes: vec!["購入にはログインが必要です".to_string()],
        };
        let persona = PersonaProfile::builtin_fallback();

        let plain = ConversationContext::new(store.clone(), 10)
            .assemble(user, &persona, "hi", None)
            .await
            .expect("plain");
        let mapped = ConversationContext::new(store.clone(), 10)
            .with_site_map(&site_map)
            .assemble(user, &persona, "hi", None)
            .await
            .expect("mapped");

        assert!(matches!(&plain[0], ContextEntry::System { content }
            if !content.contains("[サイト情報]")));
        let ContextEntry::System { content } = &mapped[0] else {
            panic!("first entry should be the system entry");
        };
        assert!(content.contains("- ガチャ (/gacha): ポイントでガチャを回す"));
        assert!(content.contains("- 商品詳細 (/items/:id)\n"));
        assert!(content.ends_with("[注意事項]\n- 購入にはログインが必要です"));
        assert_eq!(mapped.len(), plain.len());
    }

    #[tokio::test]
    async fn record_exchange_writes_hidden_tool_logs_between_user_and_agent() {
        let user = UserId(2);
        let store = store_with_user(user).await;
        let context = ConversationContext::new(store.clone(), 50);
        let log = vec![ToolLogEntry {
            call_id: "c1".to_string(),
            tool: "check_balance".to_string(),
            arguments: json!({}),
            result: json!({"gacha_points": 300}),
            ok: true,
        }];

        let turns = context.record_exchange(user, "残高は？", &log, "300ポイントです").await.expect("write");

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].kind, TurnKind::ToolLog);
        assert!(!turns[1].visible);
        assert!(turns[1].content.contains("check_balance"));
        assert_eq!(turns[2].role, TurnRole::Agent);
        assert!(turns[0].created_at < turns[1].created_at);
        assert!(turns[1].created_at < turns[2].created_at);

        let history = store.recent(user, TurnKind::Chat, 10).await.expect("recent");
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn add_guidance_is_a_system_guidance_turn() {
        let user = UserId(3);
        let store = store_with_user(user).await;
        let context = ConversationContext::new(store.clone(), 50);

        let turn = context.add_guidance(user, "いらっしゃいませ").await.expect("guidance");

        assert_eq!(turn.role, TurnRole::System);
        assert_eq!(turn.kind, TurnKind::Guidance);
        assert!(turn.visible);
    }
}
