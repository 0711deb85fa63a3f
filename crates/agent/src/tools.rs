use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use bazaar_core::domain::item::{CatalogItem, ItemId, RecommendationCandidate};
use bazaar_core::domain::persona::{pick_rarity, PersonaProfile};
use bazaar_core::domain::user::{DrawOutcome, UserId};
use bazaar_core::recommend::CandidateRecommender;
use bazaar_db::{ItemQuery, RepositorySet};

use crate::errors::ToolError;
use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::llm::{ToolCallRequest, ToolSpec};
use crate::rationale::RationaleAnnotator;

const SEARCH_LIMIT: usize = 5;
const PRICE_SAMPLE_LIMIT: usize = 10;
const LISTING_PATH: &str = "/items/create";

/// Every operation the backend may invoke. Parsed once from `(name, args)`.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolCall {
    SearchItems { query: String, category: Option<String> },
    GetItemDetails { item_id: ItemId },
    NavigateToPage { page_name: String },
    DrawGacha,
    GetRecommendations { keyword: Option<String> },
    CheckBalance,
    SuggestPrice { name: String, category: Option<String>, condition: Option<String> },
    GenerateDescription { name: String, category: Option<String>, keywords: Option<String> },
    StartListing {
        name: String,
        price: Option<i64>,
        category: Option<String>,
        description: Option<String>,
    },
}

/// Models send ids and prices either as numbers or as numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberArg {
    Int(i64),
    Float(f64),
    Text(String),
}

impl NumberArg {
    fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            Self::Float(_) => None,
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
struct ItemArgs {
    item_id: NumberArg,
}

#[derive(Deserialize)]
struct NavigateArgs {
    page_name: String,
}

#[derive(Deserialize)]
struct RecommendArgs {
    #[serde(default)]
    keyword: Option<String>,
}

#[derive(Deserialize)]
struct PriceArgs {
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Deserialize)]
struct DescriptionArgs {
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    keywords: Option<String>,
}

#[derive(Deserialize)]
struct ListingArgs {
    name: String,
    #[serde(default)]
    price: Option<NumberArg>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}

fn required(tool: &str, field: &str, value: String) -> Result<String, ToolError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("`{field}` must not be empty"),
        });
    }
    Ok(value)
}

fn decode<T: for<'de> Deserialize<'de>>(tool: &str, args: &Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|error| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: error.to_string(),
    })
}

impl ToolCall {
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        let call = match name {
            "search_items" => {
                let args: SearchArgs = decode(name, args)?;
                Self::SearchItems {
                    query: args.query.trim().to_string(),
                    category: non_blank(args.category),
                }
            }
            "get_item_details" => {
                let args: ItemArgs = decode(name, args)?;
                let item_id = args.item_id.to_i64().ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: "`item_id` must be an integer".to_string(),
                })?;
                Self::GetItemDetails { item_id: ItemId(item_id) }
            }
            "navigate_to_page" => {
                let args: NavigateArgs = decode(name, args)?;
                Self::NavigateToPage { page_name: required(name, "page_name", args.page_name)? }
            }
            "draw_gacha" => Self::DrawGacha,
            "get_recommendations" => {
                let args: RecommendArgs = decode(name, args)?;
                Self::GetRecommendations { keyword: non_blank(args.keyword) }
            }
            "check_balance" => Self::CheckBalance,
            "suggest_price" => {
                let args: PriceArgs = decode(name, args)?;
                Self::SuggestPrice {
                    name: required(name, "name", args.name)?,
                    category: non_blank(args.category),
                    condition: non_blank(args.condition),
                }
            }
            "generate_description" => {
                let args: DescriptionArgs = decode(name, args)?;
                Self::GenerateDescription {
                    name: required(name, "name", args.name)?,
                    category: non_blank(args.category),
                    keywords: non_blank(args.keywords),
                }
            }
            "start_listing" => {
                let args: ListingArgs = decode(name, args)?;
                let price = match args.price {
                    Some(price) => Some(price.to_i64().ok_or_else(|| {
                        ToolError::InvalidArguments {
                            tool: name.to_string(),
                            message: "`price` must be an integer".to_string(),
                        }
                    })?),
                    None => None,
                };
                Self::StartListing {
                    name: required(name, "name", args.name)?,
                    price,
                    category: non_blank(args.category),
                    description: non_blank(args.description),
                }
            }
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchItems { .. } => "search_items",
            Self::GetItemDetails { .. } => "get_item_details",
            Self::NavigateToPage { .. } => "navigate_to_page",
            Self::DrawGacha => "draw_gacha",
            Self::GetRecommendations { .. } => "get_recommendations",
            Self::CheckBalance => "check_balance",
            Self::SuggestPrice { .. } => "suggest_price",
            Self::GenerateDescription { .. } => "generate_description",
            Self::StartListing { .. } => "start_listing",
        }
    }
}

/// Declarations sent to the backend with every tool-enabled call.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "search_items",
            description: "商品を検索する。ユーザーが「〜を探して」「〜ある？」と言った時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "検索キーワード（例: 青い服、バッグ、Nike）"},
                    "category": {"type": "string", "description": "カテゴリで絞り込む場合（任意）"}
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "get_item_details",
            description: "商品の詳細情報を取得する。ユーザーが商品について詳しく知りたい時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {"item_id": {"type": "integer", "description": "商品ID"}},
                "required": ["item_id"]
            }),
        },
        ToolSpec {
            name: "navigate_to_page",
            description: "指定したページに遷移する。ユーザーが「〜に行きたい」「〜を見せて」と言った時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "page_name": {
                        "type": "string",
                        "description": "ページ名: home, mypage, gacha, seller, buyer, persona-selection, items/create, mission"
                    }
                },
                "required": ["page_name"]
            }),
        },
        ToolSpec {
            name: "draw_gacha",
            description: "ガチャを引く。ユーザーが「ガチャ引いて」「くじ引いて」と言った時に使う。",
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "get_recommendations",
            description: "おすすめ商品を提案する。ユーザーが「おすすめある？」「何かいいのない？」と言った時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "keyword": {"type": "string", "description": "おすすめのヒントになるキーワード（任意）"}
                }
            }),
        },
        ToolSpec {
            name: "check_balance",
            description: "ガチャポイントとメモリーフラグメントの残高を確認する。",
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "suggest_price",
            description: "商品の適正価格を提案する。ユーザーが「いくらで売れる？」「相場は？」と言った時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "商品名"},
                    "category": {"type": "string", "description": "カテゴリ"},
                    "condition": {"type": "string", "description": "状態"}
                },
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: "generate_description",
            description: "商品説明文を生成する。出品フォームページにいる時は start_listing ではなくこちらを使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "商品名"},
                    "category": {"type": "string", "description": "カテゴリ"},
                    "keywords": {"type": "string", "description": "説明に含めたいキーワード（任意）"}
                },
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: "start_listing",
            description: "出品フォームに遷移して情報を自動入力する。ユーザーが「出品して」「売りたい」と言った時に使う。",
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "商品名"},
                    "price": {"type": "integer", "description": "価格"},
                    "category": {"type": "string", "description": "カテゴリ"},
                    "description": {"type": "string", "description": "商品説明"}
                },
                "required": ["name"]
            }),
        },
    ]
}

/// Maps a page name or alias to a client route.
pub fn page_path(page_name: &str) -> String {
    let trimmed = page_name.trim();
    let known = match trimmed.to_lowercase().as_str() {
        "home" | "ホーム" => Some("/"),
        "mypage" | "マイページ" => Some("/mypage"),
        "gacha" | "ガチャ" => Some("/gacha"),
        "seller" => Some("/seller"),
        "buyer" => Some("/buyer"),
        "persona-selection" => Some("/persona-selection"),
        "items/create" | "出品" => Some(LISTING_PATH),
        "mission" | "ミッション" => Some("/mission"),
        _ => None,
    };
    match known {
        Some(path) => path.to_string(),
        None => format!("/{}", trimmed.trim_start_matches('/')),
    }
}

/// Who a tool runs for, and in whose voice annotations are written.
#[derive(Clone, Copy, Debug)]
pub struct ToolScope<'a> {
    pub user_id: UserId,
    pub persona: &'a PersonaProfile,
}

/// Runs parsed tool calls against the stores.
///
/// Mutations are delegated to single repository calls so each one is atomic for
/// the acting user. Failures come back as [`ToolError`] values, never panics.
pub struct ToolExecutor {
    repos: RepositorySet,
    recommender: CandidateRecommender,
    annotator: Arc<RationaleAnnotator>,
    guardrails: GuardrailPolicy,
    gacha_cost: i64,
    rng: Mutex<StdRng>,
}

impl ToolExecutor {
    pub fn new(
        repos: RepositorySet,
        recommender: CandidateRecommender,
        annotator: Arc<RationaleAnnotator>,
        guardrails: GuardrailPolicy,
        gacha_cost: i64,
    ) -> Self {
        let rng = StdRng::from_entropy();
        Self::with_rng(repos, recommender, annotator, guardrails, gacha_cost, rng)
    }

    pub fn with_rng(
        repos: RepositorySet,
        recommender: CandidateRecommender,
        annotator: Arc<RationaleAnnotator>,
        guardrails: GuardrailPolicy,
        gacha_cost: i64,
        rng: StdRng,
    ) -> Self {
        Self { repos, recommender, annotator, guardrails, gacha_cost, rng: Mutex::new(rng) }
    }

    pub async fn execute(
        &self,
        scope: ToolScope<'_>,
        request: &ToolCallRequest,
    ) -> Result<Value, ToolError> {
        let result = self.parse_and_run(scope, request).await;
        match &result {
            Ok(_) => info!(
                event_name = "agent.tool.executed",
                user_id = %scope.user_id,
                call_id = %request.id,
                tool = %request.name,
                "tool call succeeded"
            ),
            Err(error) => warn!(
                event_name = "agent.tool.failed",
                user_id = %scope.user_id,
                call_id = %request.id,
                tool = %request.name,
                error_code = error.code(),
                error = %error,
                "tool call failed"
            ),
        }
        result
    }

    async fn parse_and_run(
        &self,
        scope: ToolScope<'_>,
        request: &ToolCallRequest,
    ) -> Result<Value, ToolError> {
        let call = ToolCall::parse(&request.name, &request.arguments)?;
        match self.guardrails.evaluate(&call) {
            GuardrailDecision::Allow => self.run(scope, call).await,
            GuardrailDecision::Deny { reason_code, user_message } => Err(ToolError::NotPermitted {
                tool: call.name().to_string(),
                reason: format!("{reason_code}: {user_message}"),
            }),
        }
    }

    pub async fn run(&self, scope: ToolScope<'_>, call: ToolCall) -> Result<Value, ToolError> {
        match call {
            ToolCall::SearchItems { query, category } => self.search_items(query, category).await,
            ToolCall::GetItemDetails { item_id } => self.item_details(item_id).await,
            ToolCall::NavigateToPage { page_name } => {
                Ok(json!({"action": "navigate", "path": page_path(&page_name)}))
            }
            ToolCall::DrawGacha => self.draw_gacha(scope.user_id).await,
            ToolCall::GetRecommendations { keyword } => self.recommendations(scope, keyword).await,
            ToolCall::CheckBalance => {
                let balance =
                    self.repos.wallet.balance(scope.user_id).await?.ok_or(ToolError::UserNotFound)?;
                Ok(json!({
                    "action": "check_balance",
                    "gacha_points": balance.gacha_points,
                    "memory_fragments": balance.memory_fragments,
                }))
            }
            ToolCall::SuggestPrice { name, category, condition } => {
                self.suggest_price(name, category, condition).await
            }
            ToolCall::GenerateDescription { name, category, keywords } => Ok(json!({
                "action": "generate_description",
                "name": name,
                "category": category,
                "keywords": keywords,
                "prompt": format!("{name}の魅力的な商品説明を生成してください。"),
            })),
            ToolCall::StartListing { name, price, category, description } => Ok(json!({
                "action": "start_listing",
                "path": LISTING_PATH,
                "prefill": {
                    "name": name,
                    "price": price,
                    "category": category,
                    "description": description,
                },
            })),
        }
    }

    async fn search_items(
        &self,
        query: String,
        category: Option<String>,
    ) -> Result<Value, ToolError> {
        let items = self
            .repos
            .items
            .search(&ItemQuery::available(query.clone(), SEARCH_LIMIT).with_category(category))
            .await?;
        Ok(json!({
            "action": "search_items",
            "query": query,
            "count": items.len(),
            "items": items.iter().map(item_summary).collect::<Vec<_>>(),
        }))
    }

    async fn item_details(&self, item_id: ItemId) -> Result<Value, ToolError> {
        let item =
            self.repos.items.find_by_id(item_id).await?.ok_or(ToolError::ItemNotFound(item_id.0))?;
        Ok(json!({
            "action": "get_item_details",
            "item": {
                "item_id": item.id,
                "name": item.name,
                "price": item.price,
                "description": item.description,
                "category": item.category,
                "condition": item.condition,
                "status": item.status.as_str(),
            },
        }))
    }

    async fn draw_gacha(&self, user_id: UserId) -> Result<Value, ToolError> {
        let mut catalog = self.repos.personas.list_catalog().await?;
        catalog.sort_by_key(|persona| persona.id);
        let persona = self.pick_persona(&catalog).ok_or(ToolError::EmptyCatalog)?;

        match self.repos.wallet.draw_persona(user_id, self.gacha_cost, &persona).await? {
            DrawOutcome::Drawn { receipt, remaining_points } => Ok(json!({
                "action": "draw_gacha",
                "result": {
                    "persona_id": persona.id,
                    "name": persona.name,
                    "rarity": persona.rarity,
                    "avatar_url": persona.avatar_url,
                    "is_new": receipt.is_new,
                    "stack_count": receipt.stack_count,
                    "fragments_earned": receipt.fragments_earned,
                },
                "cost_spent": self.gacha_cost,
                "remaining_gacha_points": remaining_points,
            })),
            DrawOutcome::InsufficientBalance { required, balance } => {
                Err(ToolError::InsufficientBalance { required, balance })
            }
            DrawOutcome::UserNotFound => Err(ToolError::UserNotFound),
        }
    }

    /// Rarity first, by weight over the tiers present; then uniform within the tier.
    fn pick_persona(&self, catalog: &[PersonaProfile]) -> Option<PersonaProfile> {
        let tiers: Vec<u8> = catalog.iter().map(|persona| persona.rarity).collect();
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tier = pick_rarity(&tiers, rng.gen::<f64>())?;
        let pool: Vec<&PersonaProfile> =
            catalog.iter().filter(|persona| persona.rarity == tier).collect();
        if pool.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..pool.len());
        pool.get(index).map(|persona| (*persona).clone())
    }

    /// Keyword matches first, then neighbours of the user's latest purchase, then
    /// the newest listings.
    async fn recommendations(
        &self,
        scope: ToolScope<'_>,
        keyword: Option<String>,
    ) -> Result<Value, ToolError> {
        let settings = self.recommender.settings();
        let corpus = self.repos.items.list_available(settings.max_corpus).await?;
        let mut candidates = Vec::new();
        let mut reason = "新着のおすすめ商品".to_string();

        if let Some(keyword) = &keyword {
            candidates = self.recommender.matching_keyword(&corpus, keyword, None);
            if !candidates.is_empty() {
                reason = format!("「{keyword}」に関連する商品");
            }
        }
        if candidates.is_empty() {
            if let Some(purchase) = self.repos.items.latest_purchase(scope.user_id).await? {
                candidates = self.recommender.similar_to_reference(&corpus, &purchase, None);
                if !candidates.is_empty() {
                    reason = format!("購入した「{}」に似た商品", purchase.name);
                }
            }
        }
        if candidates.is_empty() {
            candidates = corpus
                .iter()
                .take(settings.top_k)
                .map(|item| RecommendationCandidate::from_item(item, 0.0))
                .collect();
        }

        let candidates =
            self.annotator.annotate(scope.persona, candidates, keyword.as_deref()).await;
        Ok(json!({
            "action": "get_recommendations",
            "keyword": keyword,
            "reason": reason,
            "items": candidates
                .iter()
                .map(|candidate| json!({
                    "item_id": candidate.item_id,
                    "name": candidate.name,
                    "price": candidate.price,
                    "category": candidate.category,
                    "score": candidate.score,
                    "rationale": candidate.rationale,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn suggest_price(
        &self,
        name: String,
        category: Option<String>,
        condition: Option<String>,
    ) -> Result<Value, ToolError> {
        let query = ItemQuery {
            match_description: false,
            available_only: false,
            ..ItemQuery::available(name.clone(), PRICE_SAMPLE_LIMIT)
        }
        .with_category(category);
        let samples = self.repos.items.search(&query).await?;
        let prices: Vec<i64> =
            samples.iter().map(|item| item.price).filter(|price| *price > 0).collect();

        let (Some(min), Some(max)) = (prices.iter().min(), prices.iter().max()) else {
            return Ok(json!({
                "action": "suggest_price",
                "name": name,
                "condition": condition,
                "suggested_price": null,
                "message": "類似商品が見つかりませんでした。",
            }));
        };
        let average = prices.iter().sum::<i64>() / prices.len() as i64;

        Ok(json!({
            "action": "suggest_price",
            "name": name,
            "condition": condition,
            "suggested_price": average,
            "price_range": {"min": min, "max": max},
            "sample_count": samples.len(),
        }))
    }
}

fn item_summary(item: &CatalogItem) -> Value {
    json!({
        "item_id": item.id,
        "name": item.name,
        "price": item.price,
        "category": item.category,
    })
}
