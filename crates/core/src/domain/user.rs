use serde::{Deserialize, Serialize};

use super::persona::PersonaId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub username: String,
    pub gacha_points: i64,
    pub memory_fragments: i64,
    pub equipped_persona_id: Option<PersonaId>,
}

impl UserAccount {
    pub fn new(id: UserId, username: impl Into<String>, gacha_points: i64) -> Self {
        Self {
            id,
            username: username.into(),
            gacha_points,
            memory_fragments: 0,
            equipped_persona_id: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub gacha_points: i64,
    pub memory_fragments: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeductOutcome {
    Deducted { remaining: i64 },
    InsufficientBalance { required: i64, balance: i64 },
    UserNotFound,
}

/// Result of adding a persona to a user's owned set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReceipt {
    pub persona_id: PersonaId,
    pub is_new: bool,
    pub stack_count: u32,
    pub fragments_earned: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrawOutcome {
    Drawn { receipt: GrantReceipt, remaining_points: i64 },
    InsufficientBalance { required: i64, balance: i64 },
    UserNotFound,
}
