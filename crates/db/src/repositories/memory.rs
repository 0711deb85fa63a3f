use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use bazaar_core::domain::conversation::{
    next_monotonic_timestamp, ConversationTurn, NewTurn, TurnKind,
};
use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus};
use bazaar_core::domain::persona::{
    duplicate_fragment_reward, OwnedPersona, PersonaId, PersonaProfile, UserPersonaState,
};
use bazaar_core::domain::user::{
    DeductOutcome, DrawOutcome, GrantReceipt, UserAccount, UserId, WalletBalance,
};

use super::{
    ConversationRepository, ItemQuery, ItemRepository, PersonaRepository, RepositoryError,
    UserRepository, WalletRepository,
};

#[derive(Default)]
struct MarketState {
    users: HashMap<UserId, UserAccount>,
    personas: BTreeMap<PersonaId, PersonaProfile>,
    owned: HashMap<UserId, Vec<OwnedPersona>>,
    items: BTreeMap<ItemId, CatalogItem>,
    purchases: HashMap<ItemId, (UserId, DateTime<Utc>)>,
    turns: HashMap<UserId, Vec<ConversationTurn>>,
    next_turn_id: i64,
}

impl MarketState {
    fn grant(
        &mut self,
        user_id: UserId,
        persona: &PersonaProfile,
    ) -> Result<GrantReceipt, RepositoryError> {
        let fragment_reward = duplicate_fragment_reward(persona.rarity)
            .map_err(|error| RepositoryError::Constraint(error.to_string()))?;
        let owned = self.owned.entry(user_id).or_default();

        let receipt = match owned.iter_mut().find(|entry| entry.persona_id == persona.id) {
            Some(entry) => {
                entry.stack_count += 1;
                GrantReceipt {
                    persona_id: persona.id,
                    is_new: false,
                    stack_count: entry.stack_count,
                    fragments_earned: fragment_reward,
                }
            }
            None => {
                owned.push(OwnedPersona {
                    persona_id: persona.id,
                    stack_count: 1,
                    level: 1,
                    obtained_at: Utc::now(),
                });
                GrantReceipt {
                    persona_id: persona.id,
                    is_new: true,
                    stack_count: 1,
                    fragments_earned: 0,
                }
            }
        };

        if let Some(user) = self.users.get_mut(&user_id) {
            user.memory_fragments += receipt.fragments_earned;
        }
        Ok(receipt)
    }
}

/// Process-local store implementing every repository trait behind one lock, so
/// multi-record operations such as a gacha draw are atomic.
#[derive(Default)]
pub struct InMemoryMarketplace {
    state: RwLock<MarketState>,
}

impl InMemoryMarketplace {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserRepository for InMemoryMarketplace {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserAccount>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.get(&id).cloned())
    }

    async fn save(&self, user: UserAccount) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.users.insert(user.id, user);
        Ok(())
    }

    async fn set_equipped_persona(
        &self,
        id: UserId,
        persona_id: PersonaId,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.personas.contains_key(&persona_id) {
            let message = format!("persona {} does not exist", persona_id.0);
            return Err(RepositoryError::Constraint(message));
        }
        match state.users.get_mut(&id) {
            Some(user) => {
                user.equipped_persona_id = Some(persona_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl PersonaRepository for InMemoryMarketplace {
    async fn find_by_id(&self, id: PersonaId) -> Result<Option<PersonaProfile>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.personas.get(&id).cloned())
    }

    async fn list_catalog(&self) -> Result<Vec<PersonaProfile>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.personas.values().cloned().collect())
    }

    async fn save(&self, persona: PersonaProfile) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.personas.insert(persona.id, persona);
        Ok(())
    }

    async fn persona_state(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserPersonaState>, RepositoryError> {
        let state = self.state.read().await;
        let Some(user) = state.users.get(&user_id) else {
            return Ok(None);
        };

        let mut owned = state.owned.get(&user_id).cloned().unwrap_or_default();
        owned.sort_by(|left, right| left.acquisition_order(right));
        Ok(Some(UserPersonaState { equipped: user.equipped_persona_id, owned }))
    }
}

#[async_trait::async_trait]
impl ItemRepository for InMemoryMarketplace {
    async fn find_by_id(&self, id: ItemId) -> Result<Option<CatalogItem>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.items.get(&id).cloned())
    }

    async fn save(&self, item: CatalogItem) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.items.insert(item.id, item);
        Ok(())
    }

    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogItem>, RepositoryError> {
        let state = self.state.read().await;
        let mut items: Vec<CatalogItem> =
            state.items.values().filter(|item| item.is_available()).cloned().collect();
        items.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn search(&self, query: &ItemQuery) -> Result<Vec<CatalogItem>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .items
            .values()
            .filter(|item| query.matches(item))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn record_purchase(
        &self,
        id: ItemId,
        buyer_id: UserId,
        sold_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(false);
        };
        item.status = ItemStatus::Sold;
        state.purchases.insert(id, (buyer_id, sold_at));
        Ok(true)
    }

    async fn latest_purchase(
        &self,
        buyer_id: UserId,
    ) -> Result<Option<CatalogItem>, RepositoryError> {
        let state = self.state.read().await;
        let latest = state
            .purchases
            .iter()
            .filter(|(_, (buyer, _))| *buyer == buyer_id)
            .max_by(|(left_id, (_, left_at)), (right_id, (_, right_at))| {
                left_at.cmp(right_at).then_with(|| left_id.cmp(right_id))
            })
            .map(|(id, _)| *id);
        Ok(latest.and_then(|id| state.items.get(&id).cloned()))
    }
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryMarketplace {
    async fn append(
        &self,
        user_id: UserId,
        turns: Vec<NewTurn>,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&user_id) {
            return Err(RepositoryError::Constraint(format!("user {user_id} does not exist")));
        }

        let mut last = state
            .turns
            .get(&user_id)
            .and_then(|log| log.last())
            .map(|turn| turn.created_at);
        let mut appended = Vec::with_capacity(turns.len());
        for turn in turns {
            state.next_turn_id += 1;
            let created_at = next_monotonic_timestamp(last, Utc::now());
            last = Some(created_at);
            appended.push(ConversationTurn {
                id: state.next_turn_id,
                user_id,
                role: turn.role,
                kind: turn.kind,
                content: turn.content,
                visible: turn.visible,
                created_at,
            });
        }

        state.turns.entry(user_id).or_default().extend(appended.iter().cloned());
        Ok(appended)
    }

    async fn recent(
        &self,
        user_id: UserId,
        kind: TurnKind,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let state = self.state.read().await;
        let Some(log) = state.turns.get(&user_id) else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<ConversationTurn> =
            log.iter().rev().filter(|turn| turn.kind == kind).take(limit).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    async fn latest(
        &self,
        user_id: UserId,
        kind: TurnKind,
    ) -> Result<Option<ConversationTurn>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .turns
            .get(&user_id)
            .and_then(|log| log.iter().rev().find(|turn| turn.kind == kind))
            .cloned())
    }

    async fn history(&self, user_id: UserId) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.turns.get(&user_id).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl WalletRepository for InMemoryMarketplace {
    async fn balance(&self, user_id: UserId) -> Result<Option<WalletBalance>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.get(&user_id).map(|user| WalletBalance {
            gacha_points: user.gacha_points,
            memory_fragments: user.memory_fragments,
        }))
    }

    async fn deduct(&self, user_id: UserId, amount: i64) -> Result<DeductOutcome, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(user) = state.users.get_mut(&user_id) else {
            return Ok(DeductOutcome::UserNotFound);
        };
        if user.gacha_points < amount {
            let balance = user.gacha_points;
            return Ok(DeductOutcome::InsufficientBalance { required: amount, balance });
        }
        user.gacha_points -= amount;
        Ok(DeductOutcome::Deducted { remaining: user.gacha_points })
    }

    async fn grant_persona(
        &self,
        user_id: UserId,
        persona: &PersonaProfile,
    ) -> Result<Option<GrantReceipt>, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&user_id) {
            return Ok(None);
        }
        state.grant(user_id, persona).map(Some)
    }

    async fn draw_persona(
        &self,
        user_id: UserId,
        cost: i64,
        persona: &PersonaProfile,
    ) -> Result<DrawOutcome, RepositoryError> {
        let mut state = self.state.write().await;
        let balance = match state.users.get(&user_id) {
            Some(user) => user.gacha_points,
            None => return Ok(DrawOutcome::UserNotFound),
        };
        if balance < cost {
            return Ok(DrawOutcome::InsufficientBalance { required: cost, balance });
        }

        // Validate the grant before touching the balance so a failure leaves nothing changed.
        duplicate_fragment_reward(persona.rarity)
            .map_err(|error| RepositoryError::Constraint(error.to_string()))?;

        if let Some(user) = state.users.get_mut(&user_id) {
            user.gacha_points -= cost;
        }
        let receipt = state.grant(user_id, persona)?;
        let remaining_points = balance - cost;

        Ok(DrawOutcome::Drawn { receipt, remaining_points })
    }
}

#[cfg(test)]
mod tests {
    use bazaar_core::domain::conversation::{NewTurn, TurnKind};
    use bazaar_core::domain::persona::{PersonaId, PersonaProfile};
    use bazaar_core::domain::user::{DeductOutcome, DrawOutcome, UserAccount, UserId};

    use crate::repositories::{
        ConversationRepository, InMemoryMarketplace, PersonaRepository, UserRepository,
        WalletRepository,
    };

    fn persona(id: i64, rarity: u8) -> PersonaProfile {
        PersonaProfile {
            id: PersonaId(id),
            name: format!("persona-{id}"),
            description: String::new(),
            system_prompt: "prompt".to_string(),
            avatar_url: format!("/avatars/{id}.png"),
            theme_color: "#000000".to_string(),
            rarity,
            fallback_line: None,
        }
    }

    async fn store_with_user(points: i64) -> InMemoryMarketplace {
        let store = InMemoryMarketplace::new();
        UserRepository::save(&store, UserAccount::new(UserId(1), "buyer", points))
            .await
            .expect("save user");
        PersonaRepository::save(&store, persona(2, 3)).await.expect("save persona");
        store
    }

    #[tokio::test]
    async fn draw_with_insufficient_balance_changes_nothing() {
        let store = store_with_user(40).await;

        let outcome = store.draw_persona(UserId(1), 100, &persona(2, 3)).await.expect("draw");
        assert_eq!(outcome, DrawOutcome::InsufficientBalance { required: 100, balance: 40 });

        let user =
            UserRepository::find_by_id(&store, UserId(1)).await.expect("find").expect("user");
        assert_eq!(user.gacha_points, 40);
        let state = store.persona_state(UserId(1)).await.expect("state").expect("exists");
        assert!(state.owned.is_empty());
    }

    #[tokio::test]
    async fn duplicate_draw_stacks_and_awards_fragments() {
        let store = store_with_user(250).await;

        let first = store.draw_persona(UserId(1), 100, &persona(2, 3)).await.expect("first draw");
        let second = store.draw_persona(UserId(1), 100, &persona(2, 3)).await.expect("second draw");

        let DrawOutcome::Drawn { receipt: first, .. } = first else {
            panic!("first draw should succeed: {first:?}");
        };
        let DrawOutcome::Drawn { receipt: second, remaining_points } = second else {
            panic!("second draw should succeed: {second:?}");
        };
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(second.stack_count, 2);
        assert_eq!(second.fragments_earned, 30);
        assert_eq!(remaining_points, 50);

        let balance = store.balance(UserId(1)).await.expect("balance").expect("exists");
        assert_eq!(balance.memory_fragments, 30);
    }

    #[tokio::test]
    async fn deduct_reports_missing_user_and_shortfall() {
        let store = store_with_user(10).await;

        assert_eq!(store.deduct(UserId(9), 5).await.expect("deduct"), DeductOutcome::UserNotFound);
        assert_eq!(
            store.deduct(UserId(1), 50).await.expect("deduct"),
            DeductOutcome::InsufficientBalance { required: 50, balance: 10 }
        );
        assert_eq!(
            store.deduct(UserId(1), 10).await.expect("deduct"),
            DeductOutcome::Deducted { remaining: 0 }
        );
    }

    #[tokio::test]
    async fn appended_turns_are_strictly_monotonic() {
        let store = store_with_user(0).await;

        for round in 0..20 {
            store
                .append(
                    UserId(1),
                    vec![
                        NewTurn::user_chat(format!("hello {round}")),
                        NewTurn::tool_log("{}"),
                        NewTurn::agent_chat("hi"),
                    ],
                )
                .await
                .expect("append");
        }

        let history = store.history(UserId(1)).await.expect("history");
        assert_eq!(history.len(), 60);
        assert!(history.windows(2).all(|pair| pair[0].created_at < pair[1].created_at));

        let recent = store.recent(UserId(1), TurnKind::Chat, 4).await.expect("recent");
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "hello 18");
        assert_eq!(recent[3].content, "hi");
    }

    #[tokio::test]
    async fn append_for_unknown_user_is_rejected() {
        let store = InMemoryMarketplace::new();
        let result = store.append(UserId(5), vec![NewTurn::user_chat("hi")]).await;
        assert!(result.is_err());
    }
}
