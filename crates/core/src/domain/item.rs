use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    OnSale,
    Sold,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSale => "on_sale",
            Self::Sold => "sold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on_sale" => Some(Self::OnSale),
            "sold" => Some(Self::Sold),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: ItemId,
    pub seller_id: Option<UserId>,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn is_available(&self) -> bool {
        self.status == ItemStatus::OnSale
    }

    /// Weighted feature text: the name repeated `name_weight` times, then category,
    /// condition and description.
    pub fn feature_text(&self, name_weight: usize) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(name_weight + 3);
        for _ in 0..name_weight.max(1) {
            parts.push(self.name.as_str());
        }
        if let Some(category) = self.category.as_deref() {
            parts.push(category);
        }
        if let Some(condition) = self.condition.as_deref() {
            parts.push(condition);
        }
        parts.push(self.description.as_str());
        parts.join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCandidate {
    pub item_id: ItemId,
    pub name: String,
    pub price: i64,
    pub category: Option<String>,
    pub score: f64,
    pub rationale: Option<String>,
    pub interested: Option<bool>,
}

impl RecommendationCandidate {
    pub fn from_item(item: &CatalogItem, score: f64) -> Self {
        Self {
            item_id: item.id,
            name: item.name.clone(),
            price: item.price,
            category: item.category.clone(),
            score: score.clamp(0.0, 1.0),
            rationale: None,
            interested: None,
        }
    }
}
