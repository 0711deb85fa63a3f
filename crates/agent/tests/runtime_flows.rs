use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use bazaar_agent::llm::{
    BackendReply, DisabledBackend, LlmBackend, ScriptStep, ScriptedBackend, ToolCallRequest,
};
use bazaar_agent::orchestrator::{LoopSettings, Termination};
use bazaar_agent::page_context::fallback_guidance;
use bazaar_agent::runtime::{AgentRuntime, AgentSettings, GuidanceRequest, RecommendMode};
use bazaar_agent::AgentError;
use bazaar_core::domain::conversation::{TurnKind, TurnRole};
use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus};
use bazaar_core::domain::persona::{PersonaId, PersonaProfile};
use bazaar_core::domain::user::{UserAccount, UserId};
use bazaar_db::{
    ConversationRepository, InMemoryMarketplace, ItemRepository, PersonaRepository, RepositorySet,
    UserRepository, WalletRepository,
};

fn persona(id: i64, name: &str) -> PersonaProfile {
    PersonaProfile {
        id: PersonaId(id),
        name: name.to_string(),
        description: String::new(),
        system_prompt: format!("あなたは{name}です。"),
        avatar_url: format!("/avatars/{id}.png"),
        theme_color: "default".to_string(),
        rarity: 1,
        fallback_line: Some(format!("{name}はいま少し休憩中です。")),
    }
}

fn item(id: i64, name: &str, description: &str, age_hours: i64) -> CatalogItem {
    CatalogItem {
        id: ItemId(id),
        seller_id: None,
        name: name.to_string(),
        description: description.to_string(),
        price: 8000,
        category: Some("ファッション".to_string()),
        condition: None,
        status: ItemStatus::OnSale,
        created_at: Utc::now() - ChronoDuration::hours(age_hours),
    }
}

async fn marketplace(points: i64) -> Arc<InMemoryMarketplace> {
    let store = Arc::new(InMemoryMarketplace::default());
    UserRepository::save(&*store, UserAccount::new(UserId(1), "hana", points))
        .await
        .expect("save user");
    for profile in [persona(1, "ミライ"), persona(2, "ソラ")] {
        PersonaRepository::save(&*store, profile).await.expect("save persona");
    }
    store.grant_persona(UserId(1), &persona(2, "ソラ")).await.expect("grant");
    for catalog_item in [
        item(1, "Nike Air Max 90", "white running sneakers", 5),
        item(2, "Nike Air Force 1", "classic sneakers", 4),
        item(3, "Leather Tote Bag", "brown leather bag", 3),
        item(4, "Wool Scarf", "warm winter scarf", 2),
    ] {
        ItemRepository::save(&*store, catalog_item).await.expect("save item");
    }
    store
}

fn runtime(store: &Arc<InMemoryMarketplace>, backend: Arc<dyn LlmBackend>) -> AgentRuntime {
    let settings = AgentSettings {
        loop_settings: LoopSettings { max_iterations: 3, call_timeout: Duration::from_secs(5) },
        ..AgentSettings::default()
    };
    AgentRuntime::new(RepositorySet::in_memory(store.clone()), backend, settings)
}

#[tokio::test]
async fn converse_replies_in_owned_persona_and_logs_the_exchange() {
    let store = marketplace(500).await;
    let backend = Arc::new(ScriptedBackend::replies(&["こんにちは！"]));
    let runtime = runtime(&store, backend.clone());

    let reply = runtime.converse(UserId(1), "やあ", None).await.expect("converse");

    assert_eq!(reply.reply, "こんにちは！");
    assert_eq!(reply.persona.name, "ソラ");
    assert_eq!(reply.termination, Termination::FinalText);

    let account = UserRepository::find_by_id(&*store, UserId(1)).await.expect("load");
    assert_eq!(account.and_then(|account| account.equipped_persona_id), Some(PersonaId(2)));

    let history = store.history(UserId(1)).await.expect("history");
    let chat: Vec<_> = history
        .iter()
        .filter(|turn| turn.kind == TurnKind::Chat)
        .map(|turn| (turn.role, turn.content.as_str()))
        .collect();
    assert_eq!(chat, vec![(TurnRole::User, "やあ"), (TurnRole::Agent, "こんにちは！")]);
}

#[tokio::test]
async fn converse_rejects_blank_message() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let result = runtime.converse(UserId(1), "   ", None).await;

    assert!(matches!(result, Err(AgentError::InvalidInput(_))));
    assert!(store.history(UserId(1)).await.expect("history").is_empty());
}

#[tokio::test]
async fn absent_user_gets_a_reply_but_nothing_is_persisted() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(ScriptedBackend::replies(&["はじめまして"])));

    let reply = runtime.converse(UserId(42), "hello", None).await.expect("converse");

    assert_eq!(reply.reply, "はじめまして");
    assert_eq!(reply.persona.name, "ミライ");
    assert!(store.history(UserId(42)).await.expect("history").is_empty());
    assert!(UserRepository::find_by_id(&*store, UserId(42)).await.expect("load").is_none());
}

#[tokio::test(start_paused = true)]
async fn hung_backend_falls_back_and_logs_the_user_turn_once() {
    let store = marketplace(500).await;
    let backend = Arc::new(ScriptedBackend::repeating(ScriptStep::Hang));
    let runtime = runtime(&store, backend.clone());

    let reply = runtime.converse(UserId(1), "おすすめある？", None).await.expect("converse");

    assert_eq!(reply.reply, "ソラはいま少し休憩中です。");
    assert!(matches!(reply.termination, Termination::BackendFailed { .. }));
    assert_eq!(backend.call_count(), 1);

    let history = store.history(UserId(1)).await.expect("history");
    let user_turns = history.iter().filter(|turn| turn.role == TurnRole::User).count();
    assert_eq!(user_turns, 1);
    assert_eq!(history.last().map(|turn| turn.content.as_str()), Some(reply.reply.as_str()));
}

#[tokio::test]
async fn insufficient_balance_draw_leaves_wallet_untouched() {
    let store = marketplace(30).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptStep::Reply(BackendReply::tool_calls(vec![ToolCallRequest {
            id: "call-1".to_string(),
            name: "draw_gacha".to_string(),
            arguments: json!({}),
        }])),
        ScriptStep::Reply(BackendReply::text("ポイントが足りないみたい")),
    ]));
    let runtime = runtime(&store, backend);

    let reply = runtime.converse(UserId(1), "ガチャ引いて", None).await.expect("converse");

    assert_eq!(reply.reply, "ポイントが足りないみたい");
    assert_eq!(reply.tool_calls.len(), 1);
    assert!(!reply.tool_calls[0].ok);
    assert_eq!(reply.tool_calls[0].result["error"], "insufficient_balance");

    let balance = store.balance(UserId(1)).await.expect("balance").expect("present");
    assert_eq!(balance.gacha_points, 30);

    let history = store.history(UserId(1)).await.expect("history");
    let kinds: Vec<_> = history.iter().map(|turn| turn.kind).collect();
    assert_eq!(kinds, vec![TurnKind::Chat, TurnKind::ToolLog, TurnKind::Chat]);
    assert!(!history[1].visible);
}

#[tokio::test]
async fn history_timestamps_increase_across_exchanges() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(ScriptedBackend::replies(&["one", "two"])));

    runtime.converse(UserId(1), "first", None).await.expect("first");
    runtime.converse(UserId(1), "second", None).await.expect("second");

    let history = store.history(UserId(1)).await.expect("history");
    assert_eq!(history.len(), 4);
    assert!(history.windows(2).all(|pair| pair[0].created_at < pair[1].created_at));
}

#[tokio::test]
async fn keyword_recommendation_drops_unrelated_items() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let reply = runtime
        .recommend(UserId(1), RecommendMode::Keyword("nike sneakers".to_string()), Some(5))
        .await
        .expect("recommend");

    assert!(reply.can_recommend);
    assert!(!reply.candidates.is_empty());
    assert!(reply.candidates.iter().all(|candidate| candidate.score > 0.0));
    assert!(reply.candidates.iter().all(|candidate| candidate.rationale.is_none()));
    assert!(matches!(reply.candidates[0].item_id, ItemId(1) | ItemId(2)));
}

#[tokio::test]
async fn seed_recommendation_excludes_the_seed() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let reply = runtime
        .recommend(UserId(1), RecommendMode::SeedItem(ItemId(1)), Some(2))
        .await
        .expect("recommend");

    assert_eq!(reply.candidates.len(), 2);
    assert_eq!(reply.candidates[0].item_id, ItemId(2));
    assert!(reply.candidates.iter().all(|candidate| candidate.item_id != ItemId(1)));
}

#[tokio::test]
async fn history_recommendation_seeds_from_the_latest_purchase() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let nothing_bought =
        runtime.recommend(UserId(1), RecommendMode::History, None).await.expect("recommend");
    assert!(!nothing_bought.can_recommend);

    store.record_purchase(ItemId(1), UserId(1), Utc::now()).await.expect("purchase");
    let reply =
        runtime.recommend(UserId(1), RecommendMode::History, Some(3)).await.expect("recommend");

    assert!(reply.can_recommend);
    assert_eq!(reply.candidates[0].item_id, ItemId(2));
    assert!(reply.candidates.iter().all(|candidate| candidate.item_id != ItemId(1)));
}

#[tokio::test]
async fn guidance_uses_path_fallback_when_backend_is_down() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let reply = runtime
        .page_guidance(GuidanceRequest {
            user_id: Some(UserId(1)),
            path: "/seller/items".to_string(),
            ..GuidanceRequest::default()
        })
        .await
        .expect("guidance");

    assert!(reply.fallback);
    assert_eq!(reply.message, fallback_guidance("/seller/items"));
    assert!(store.history(UserId(1)).await.expect("history").is_empty());
}

#[tokio::test]
async fn guidance_is_stored_and_fed_into_the_next_chat() {
    let store = marketplace(500).await;
    let backend = Arc::new(ScriptedBackend::replies(&["このスニーカー素敵ですね", "はい！"]));
    let runtime = runtime(&store, backend.clone());

    let guidance = runtime
        .page_guidance(GuidanceRequest {
            user_id: Some(UserId(1)),
            path: "/items/1".to_string(),
            ..GuidanceRequest::default()
        })
        .await
        .expect("guidance");
    assert!(!guidance.fallback);

    let prompt = serde_json::to_string(&backend.requests()[0]).expect("serialize");
    assert!(prompt.contains("Nike Air Max 90"));

    runtime.converse(UserId(1), "これどう？", None).await.expect("converse");

    let stored = store.latest(UserId(1), TurnKind::Guidance).await.expect("latest");
    assert_eq!(stored.map(|turn| turn.content), Some("このスニーカー素敵ですね".to_string()));
    let second = serde_json::to_string(&backend.requests()[1]).expect("serialize");
    assert!(second.contains("このスニーカー素敵ですね"));
}

#[tokio::test]
async fn guidance_requires_a_path() {
    let store = marketplace(500).await;
    let runtime = runtime(&store, Arc::new(DisabledBackend));

    let result = runtime.page_guidance(GuidanceRequest::default()).await;

    assert!(matches!(result, Err(AgentError::InvalidInput(_))));
}
