//! JSON API for the marketplace companion.
//!
//! - `POST /api/v1/chat`        - one chat exchange with the user's persona
//! - `POST /api/v1/recommend`   - seed-item, keyword or purchase-history recommendations
//! - `POST /api/v1/llm/context` - persona-voiced guidance for the page just opened

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bazaar_agent::{
    AgentError, AgentRuntime, ConverseReply, GuidanceReply, GuidanceRequest, PageContext,
    RecommendMode, RecommendReply,
};
use bazaar_core::domain::item::ItemId;
use bazaar_core::domain::user::UserId;
use bazaar_core::errors::{ApplicationError, DomainError, InterfaceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: i64,
    pub message: String,
    #[serde(default)]
    pub page_context: Option<PageContext>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendRequest {
    pub user_id: i64,
    pub mode: String,
    #[serde(default)]
    pub criterion: Value,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct GuidanceBody {
    #[serde(default)]
    pub uid: Option<i64>,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub page_context: Option<PageContext>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

/// Interface error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn new(error: impl Into<ApplicationError>, correlation_id: &str) -> Self {
        Self(error.into().into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(DomainError::InvalidInput(message.into()), correlation_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(
            event_name = "api.request.failed",
            correlation_id = %self.0.correlation_id(),
            status = status.as_u16(),
            error = %self.0,
            "request failed"
        );
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.user_message(),
            detail: self.0.to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/recommend", post(recommend))
        .route("/api/v1/llm/context", post(page_guidance))
        .with_state(ApiState { runtime })
}

async fn chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ConverseReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    info!(
        event_name = "api.chat.received",
        correlation_id = %correlation_id,
        user_id = request.user_id,
        "chat request received"
    );

    let reply = state
        .runtime
        .converse(UserId(request.user_id), &request.message, request.page_context.as_ref())
        .await
        .map_err(|error: AgentError| ApiError::new(error, &correlation_id))?;
    Ok(Json(reply))
}

async fn recommend(
    State(state): State<ApiState>,
    Json(request): Json<RecommendRequest>,
) -> Result<Json<RecommendReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let mode = parse_mode(&request.mode, &request.criterion)
        .map_err(|message| ApiError::bad_request(message, &correlation_id))?;
    info!(
        event_name = "api.recommend.received",
        correlation_id = %correlation_id,
        user_id = request.user_id,
        mode = %request.mode,
        "recommend request received"
    );

    let reply = state
        .runtime
        .recommend(UserId(request.user_id), mode, request.limit)
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;
    Ok(Json(reply))
}

async fn page_guidance(
    State(state): State<ApiState>,
    Json(body): Json<GuidanceBody>,
) -> Result<Json<GuidanceReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    info!(
        event_name = "api.guidance.received",
        correlation_id = %correlation_id,
        path = %body.path,
        "page guidance requested"
    );

    let reply = state
        .runtime
        .page_guidance(GuidanceRequest {
            user_id: body.uid.map(UserId),
            path: body.path,
            query: body.query,
            page_context: body.page_context,
        })
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;
    Ok(Json(reply))
}

fn parse_mode(mode: &str, criterion: &Value) -> Result<RecommendMode, String> {
    match mode {
        "seed_item" => {
            let seed = match criterion {
                Value::Number(number) => number.as_i64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            };
            seed.map(|id| RecommendMode::SeedItem(ItemId(id)))
                .ok_or_else(|| "seed_item mode needs a numeric item id as criterion".to_string())
        }
        "keyword" => match criterion.as_str().map(str::trim) {
            Some(keyword) if !keyword.is_empty() => Ok(RecommendMode::Keyword(keyword.to_string())),
            _ => Err("keyword mode needs a non-empty criterion".to_string()),
        },
        "history" => Ok(RecommendMode::History),
        other => Err(format!("unknown mode `{other}`; expected seed_item, keyword or history")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use bazaar_agent::llm::{DisabledBackend, LlmBackend, ScriptedBackend};
    use bazaar_agent::{AgentRuntime, AgentSettings};
    use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus};
    use bazaar_core::domain::persona::PersonaProfile;
    use bazaar_core::domain::user::{UserAccount, UserId};
    use bazaar_db::{
        ConversationRepository, InMemoryMarketplace, ItemRepository, PersonaRepository,
        RepositorySet, UserRepository,
    };
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{parse_mode, router};
    use bazaar_agent::RecommendMode;

    async fn app(backend: Arc<dyn LlmBackend>) -> (Arc<InMemoryMarketplace>, Router) {
        let store = Arc::new(InMemoryMarketplace::default());
        UserRepository::save(&*store, UserAccount::new(UserId(1), "hana", 300))
            .await
            .expect("save user");
        PersonaRepository::save(&*store, PersonaProfile::builtin_fallback())
            .await
            .expect("save persona");
        for (id, name) in [(1, "Nike Air Max"), (2, "Nike Air Force"), (3, "Wool Scarf")] {
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
            ItemRepository::save(&*store, item).await.expect("save item");
        }

        let runtime = AgentRuntime::new(
            RepositorySet::in_memory(store.clone()),
            backend,
            AgentSettings::default(),
        );
        (store, router(Arc::new(runtime)))
    }

    async fn post(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn chat_returns_reply_and_persona() {
        let (store, router) = app(Arc::new(ScriptedBackend::replies(&["いらっしゃいませ"]))).await;

        let (status, body) =
            post(router, "/api/v1/chat", json!({"user_id": 1, "message": "こんにちは"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "いらっしゃいませ");
        assert_eq!(body["persona"]["name"], PersonaProfile::builtin_fallback().name);
        assert_eq!(body["termination"]["state"], "final_text");
        assert_eq!(store.history(UserId(1)).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn blank_chat_message_is_a_bad_request() {
        let (_, router) = app(Arc::new(DisabledBackend)).await;

        let (status, body) =
            post(router, "/api/v1/chat", json!({"user_id": 1, "message": "  "})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        assert!(!body["correlation_id"].as_str().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn recommend_seed_item_excludes_seed() {
        let (_, router) = app(Arc::new(DisabledBackend)).await;

        let (status, body) = post(
            router,
            "/api/v1/recommend",
            json!({"user_id": 1, "mode": "seed_item", "criterion": "1", "limit": 1}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["can_recommend"], true);
        assert_eq!(body["candidates"][0]["item_id"], 2);
    }

    #[tokio::test]
    async fn recommend_rejects_unknown_mode() {
        let (_, router) = app(Arc::new(DisabledBackend)).await;

        let (status, body) = post(
            router,
            "/api/v1/recommend",
            json!({"user_id": 1, "mode": "popular", "criterion": "x"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("popular"));
    }

    #[tokio::test]
    async fn guidance_falls_back_when_backend_is_disabled() {
        let (_, router) = app(Arc::new(DisabledBackend)).await;

        let (status, body) =
            post(router, "/api/v1/llm/context", json!({"uid": 1, "path": "/gacha"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fallback"], true);
        assert_eq!(body["message"], "ガチャで新しいキャラクターをゲットしましょう！");
    }

    #[test]
    fn mode_parsing_accepts_numbers_and_strings() {
        assert_eq!(parse_mode("seed_item", &json!(7)), Ok(RecommendMode::SeedItem(ItemId(7))));
        assert_eq!(
            parse_mode("keyword", &json!(" bag ")),
            Ok(RecommendMode::Keyword("bag".to_string()))
        );
        assert!(parse_mode("keyword", &json!("")).is_err());
        assert!(parse_mode("seed_item", &json!("abc")).is_err());
        assert_eq!(parse_mode("history", &Value::Null), Ok(RecommendMode::History));
    }
}
