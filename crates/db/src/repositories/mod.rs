use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use bazaar_core::domain::conversation::{ConversationTurn, NewTurn, TurnKind};
use bazaar_core::domain::item::{CatalogItem, ItemId};
use bazaar_core::domain::persona::{PersonaId, PersonaProfile, UserPersonaState};
use bazaar_core::domain::user::{
    DeductOutcome, DrawOutcome, GrantReceipt, UserAccount, UserId, WalletBalance,
};

pub mod conversation;
pub mod item;
pub mod memory;
pub mod persona;
pub mod user;
pub mod wallet;

pub use conversation::SqlConversationRepository;
pub use item::SqlItemRepository;
pub use memory::InMemoryMarketplace;
pub use persona::SqlPersonaRepository;
pub use user::SqlUserRepository;
pub use wallet::SqlWalletRepository;

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Filter for catalog text search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemQuery {
    pub text: String,
    pub match_description: bool,
    pub category: Option<String>,
    pub available_only: bool,
    pub limit: usize,
}

impl ItemQuery {
    pub fn available(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            match_description: true,
            category: None,
            available_only: true,
            limit,
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category.filter(|value| !value.trim().is_empty());
        self
    }

    pub(crate) fn matches(&self, item: &CatalogItem) -> bool {
        if self.available_only && !item.is_available() {
            return false;
        }
        if let Some(category) = &self.category {
            if item.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }

        let needle = self.text.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        item.name.to_lowercase().contains(&needle)
            || (self.match_description && item.description.to_lowercase().contains(&needle))
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserAccount>, RepositoryError>;
    async fn save(&self, user: UserAccount) -> Result<(), RepositoryError>;
    /// Returns `false` when the user does not exist.
    async fn set_equipped_persona(
        &self,
        id: UserId,
        persona_id: PersonaId,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait PersonaRepository: Send + Sync {
    async fn find_by_id(&self, id: PersonaId) -> Result<Option<PersonaProfile>, RepositoryError>;
    async fn list_catalog(&self) -> Result<Vec<PersonaProfile>, RepositoryError>;
    async fn save(&self, persona: PersonaProfile) -> Result<(), RepositoryError>;
    /// `None` when the user record is absent.
    async fn persona_state(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserPersonaState>, RepositoryError>;
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn find_by_id(&self, id: ItemId) -> Result<Option<CatalogItem>, RepositoryError>;
    async fn save(&self, item: CatalogItem) -> Result<(), RepositoryError>;
    /// On-sale items, newest first.
    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogItem>, RepositoryError>;
    async fn search(&self, query: &ItemQuery) -> Result<Vec<CatalogItem>, RepositoryError>;
    /// Marks the item sold to `buyer_id`. Returns `false` when the item does not exist.
    async fn record_purchase(
        &self,
        id: ItemId,
        buyer_id: UserId,
        sold_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// The item `buyer_id` bought most recently.
    async fn latest_purchase(
        &self,
        buyer_id: UserId,
    ) -> Result<Option<CatalogItem>, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Appends all turns in one write with strictly increasing per-user timestamps.
    async fn append(
        &self,
        user_id: UserId,
        turns: Vec<NewTurn>,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;

    /// The newest `limit` turns of `kind`, returned oldest first.
    async fn recent(
        &self,
        user_id: UserId,
        kind: TurnKind,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;

    async fn latest(
        &self,
        user_id: UserId,
        kind: TurnKind,
    ) -> Result<Option<ConversationTurn>, RepositoryError>;

    /// Every turn for the user in creation order.
    async fn history(&self, user_id: UserId) -> Result<Vec<ConversationTurn>, RepositoryError>;
}

/// Balance mutations are atomic per user record.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn balance(&self, user_id: UserId) -> Result<Option<WalletBalance>, RepositoryError>;
    async fn deduct(&self, user_id: UserId, amount: i64) -> Result<DeductOutcome, RepositoryError>;
    /// `None` when the user record is absent.
    async fn grant_persona(
        &self,
        user_id: UserId,
        persona: &PersonaProfile,
    ) -> Result<Option<GrantReceipt>, RepositoryError>;
    /// Checks the balance, deducts `cost` and grants `persona` as one unit of work.
    async fn draw_persona(
        &self,
        user_id: UserId,
        cost: i64,
        persona: &PersonaProfile,
    ) -> Result<DrawOutcome, RepositoryError>;
}

/// One handle per repository concern, shared by the agent layer.
#[derive(Clone)]
pub struct RepositorySet {
    pub users: Arc<dyn UserRepository>,
    pub personas: Arc<dyn PersonaRepository>,
    pub items: Arc<dyn ItemRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub wallet: Arc<dyn WalletRepository>,
}

impl RepositorySet {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            users: Arc::new(SqlUserRepository::new(pool.clone())),
            personas: Arc::new(SqlPersonaRepository::new(pool.clone())),
            items: Arc::new(SqlItemRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            wallet: Arc::new(SqlWalletRepository::new(pool)),
        }
    }

    pub fn in_memory(store: Arc<InMemoryMarketplace>) -> Self {
        Self {
            users: store.clone(),
            personas: store.clone(),
            items: store.clone(),
            conversations: store.clone(),
            wallet: store,
        }
    }
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)).map_err(decode_error)
}
