//! What the user is looking at, as sent by the client, and its rendering into
//! prompt text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_VISIBLE_ITEMS: usize = 10;
const MAX_COMMENTS: usize = 5;
const DESCRIPTION_PREVIEW_CHARS: usize = 200;
const COMMENT_PREVIEW_CHARS: usize = 50;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentSnapshot {
    pub username: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: String,
    pub name: String,
    pub price: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub comments: Vec<CommentSnapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GachaResultSnapshot {
    pub persona_name: String,
    #[serde(default)]
    pub rarity_name: Option<String>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub stack_count: Option<u32>,
    #[serde(default)]
    pub fragments_earned: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub page_type: String,
    #[serde(default)]
    pub current_item: Option<ItemSnapshot>,
    #[serde(default)]
    pub visible_items: Vec<ItemSnapshot>,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub user_gacha_points: Option<i64>,
    #[serde(default)]
    pub owned_persona_names: Vec<String>,
    #[serde(default)]
    pub gacha_result: Option<GachaResultSnapshot>,
    #[serde(default)]
    pub additional_info: BTreeMap<String, Value>,
}

fn page_display_name(page_type: &str) -> &str {
    match page_type {
        "homepage" => "ホームページ",
        "item_detail" => "商品詳細ページ",
        "search" | "search_results" => "検索結果ページ",
        "mypage" | "my_page" => "マイページ",
        "gacha" => "ガチャページ",
        "gacha_result" => "ガチャ結果",
        "persona_selection" => "キャラクター選択ページ",
        "seller" | "seller_shipments" => "出品管理ページ",
        "buyer" | "buyer_deliveries" => "購入管理ページ",
        "mission" => "ミッションページ",
        "buy_confirmation" => "購入確認ページ",
        "listing_form" => "出品フォーム",
        other => other,
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Thousands-separated yen amount, e.g. `12,800`.
fn grouped(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}

impl PageContext {
    /// Human-readable block handed to the model as system context.
    pub fn build_context_text(&self) -> String {
        let mut lines = vec![format!("【現在のページ】{}", page_display_name(&self.page_type))];

        if let Some(result) = &self.gacha_result {
            lines.push(String::new());
            lines.push("【ガチャ結果】".to_string());
            lines.push(format!("  引いたキャラクター: {}", result.persona_name));
            if let Some(rarity) = &result.rarity_name {
                lines.push(format!("  レアリティ: {rarity}"));
            }
            if result.is_new {
                lines.push("  ★新規獲得！".to_string());
            } else {
                if let Some(stack) = result.stack_count {
                    lines.push(format!("  重複: {stack}体目"));
                }
                if let Some(fragments) = result.fragments_earned.filter(|value| *value > 0) {
                    lines.push(format!("  メモリーフラグメント獲得: +{fragments}"));
                }
            }
        }

        if let Some(query) = self.search_query.as_deref().filter(|query| !query.is_empty()) {
            lines.push(format!("【検索キーワード】「{query}」"));
        }

        if let Some(item) = &self.current_item {
            lines.push(String::new());
            lines.push("【現在見ている商品】".to_string());
            lines.push(format!("  商品名: {}", item.name));
            lines.push(format!("  価格: ¥{}", grouped(item.price)));
            if let Some(category) = &item.category {
                lines.push(format!("  カテゴリ: {category}"));
            }
            if let Some(condition) = &item.condition {
                lines.push(format!("  状態: {condition}"));
            }
            if let Some(description) = item.description.as_deref().filter(|d| !d.is_empty()) {
                lines.push(format!("  説明: {}", preview(description, DESCRIPTION_PREVIEW_CHARS)));
            }
            if let Some(seller) = &item.seller_name {
                lines.push(format!("  出品者: {seller}"));
            }
            lines.push(format!("  いいね数: {}", item.like_count));
            lines.push(format!("  コメント数: {}", item.comment_count));
            if !item.comments.is_empty() {
                lines.push("  最近のコメント:".to_string());
                for comment in item.comments.iter().take(MAX_COMMENTS) {
                    lines.push(format!(
                        "    - {}: 「{}」",
                        comment.username,
                        preview(&comment.content, COMMENT_PREVIEW_CHARS)
                    ));
                }
            }
        }

        if !self.visible_items.is_empty() {
            lines.push(String::new());
            lines.push(format!("【表示中の商品】({}件)", self.visible_items.len()));
            for (idx, item) in self.visible_items.iter().take(MAX_VISIBLE_ITEMS).enumerate() {
                lines.push(format!("  {}. {} - ¥{}", idx + 1, item.name, grouped(item.price)));
            }
        }

        if let Some(points) = self.user_gacha_points {
            lines.push(String::new());
            lines.push(format!("【ユーザーのガチャポイント残高】{}ポイント", grouped(points)));
        }

        if !self.owned_persona_names.is_empty() {
            lines.push(format!("【所有キャラクター】{}", self.owned_persona_names.join(", ")));
        }

        for (key, value) in &self.additional_info {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            lines.push(format!("【{key}】{rendered}"));
        }

        lines.join("\n")
    }

    /// Instruction for the one-line guidance the persona gives on page open.
    pub fn guidance_instruction(&self, path: &str) -> String {
        match self.page_type.as_str() {
            "gacha_result" => "ユーザーがガチャを引きました。引いたキャラクターの名前に触れて、\
                新規なら祝福し、重複なら再会を喜ぶ一言をキャラクターとして返してください。"
                .to_string(),
            "mypage" | "my_page" => "ユーザーがマイページを見ています。取引状況や活動に関する\
                一言を返してください。ガチャの話は避けてください。"
                .to_string(),
            "seller" => "ユーザーが出品管理ページを見ています。出品中の商品や発送待ちについて、\
                キャラクターとして応援やアドバイスをしてください。"
                .to_string(),
            "buyer" => "ユーザーが購入管理ページを見ています。配送状況や受け取り確認について、\
                キャラクターとして一言添えてください。"
                .to_string(),
            _ => default_guidance_instruction(path),
        }
    }
}

/// Page type for a client route, used when the client sent no page context.
pub fn page_type_for_path(path: &str) -> String {
    let route = path.split('?').next().unwrap_or_default().trim_end_matches('/');
    let first = route.trim_start_matches('/').split('/').next().unwrap_or_default();
    match first {
        "" => "homepage".to_string(),
        "items" if route.ends_with("/create") => "listing_form".to_string(),
        "items" => "item_detail".to_string(),
        "search" => "search".to_string(),
        "mypage" => "mypage".to_string(),
        "gacha" => "gacha".to_string(),
        "seller" => "seller".to_string(),
        "buyer" => "buyer".to_string(),
        "mission" => "mission".to_string(),
        "persona-selection" => "persona_selection".to_string(),
        other => other.to_string(),
    }
}

pub fn default_guidance_instruction(path: &str) -> String {
    format!(
        "ユーザーがページ「{path}」を開きました。上記の情報を踏まえて、\
         キャラクターとしてユーザーに寄り添う一言を返してください。"
    )
}

/// Fixed line shown when no persona-voiced guidance can be produced.
pub fn fallback_guidance(path: &str) -> &'static str {
    let path = path.to_lowercase();
    if path.contains("buyer") {
        "購入した商品の状況を確認できます。届いたら『受け取りました』で完了しましょう。"
    } else if path.contains("seller") {
        "出品中の商品一覧です。発送準備ができたらステータスを更新しましょう。"
    } else if path.contains("/items/") {
        "商品の詳細ページです。気になる点があれば質問してくださいね。"
    } else if path.contains("gacha") {
        "ガチャで新しいキャラクターをゲットしましょう！"
    } else if path.contains("mypage") {
        "マイページです。取引状況や設定を確認できます。"
    } else {
        "何かお探しですか？お手伝いしますよ。"
    }
}
