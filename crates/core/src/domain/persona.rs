use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(pub i64);

/// Catalog default handed to users who own nothing.
pub const DEFAULT_PERSONA_ID: PersonaId = PersonaId(1);

/// Id reserved for the hardcoded voice used when the catalog cannot serve the default.
pub const BUILTIN_PERSONA_ID: PersonaId = PersonaId(0);

pub const MIN_RARITY: u8 = 1;
pub const MAX_RARITY: u8 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: PersonaId,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub avatar_url: String,
    pub theme_color: String,
    pub rarity: u8,
    pub fallback_line: Option<String>,
}

/// Client-visible projection of a persona.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaDescriptor {
    pub name: String,
    pub avatar_url: String,
    pub theme: String,
}

impl PersonaProfile {
    pub fn builtin_fallback() -> Self {
        Self {
            id: BUILTIN_PERSONA_ID,
            name: "AIアシスタント".to_string(),
            description: "Built-in assistant voice".to_string(),
            system_prompt: "You are a kind AI assistant".to_string(),
            avatar_url: "/avatars/default.png".to_string(),
            theme_color: "default".to_string(),
            rarity: MIN_RARITY,
            fallback_line: None,
        }
    }

    pub fn descriptor(&self) -> PersonaDescriptor {
        PersonaDescriptor {
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            theme: self.theme_color.clone(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == BUILTIN_PERSONA_ID
    }

    /// Line used when the text backend cannot produce a reply in this voice.
    pub fn fallback_text(&self) -> &str {
        self.fallback_line
            .as_deref()
            .unwrap_or("ごめんなさい、今はうまくお答えできません。少し時間をおいてもう一度話しかけてください。")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedPersona {
    pub persona_id: PersonaId,
    pub stack_count: u32,
    pub level: u32,
    pub obtained_at: DateTime<Utc>,
}

impl OwnedPersona {
    /// Earlier acquisition first; ties fall back to the lower persona id.
    pub fn acquisition_order(&self, other: &Self) -> Ordering {
        self.obtained_at
            .cmp(&other.obtained_at)
            .then_with(|| self.persona_id.cmp(&other.persona_id))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPersonaState {
    pub equipped: Option<PersonaId>,
    pub owned: Vec<OwnedPersona>,
}

impl UserPersonaState {
    pub fn owned_in_acquisition_order(&self) -> Vec<PersonaId> {
        let mut owned: Vec<&OwnedPersona> = self.owned.iter().collect();
        owned.sort_by(|left, right| left.acquisition_order(right));
        owned.into_iter().map(|entry| entry.persona_id).collect()
    }

    pub fn first_owned(&self) -> Option<PersonaId> {
        self.owned
            .iter()
            .min_by(|left, right| left.acquisition_order(right))
            .map(|owned| owned.persona_id)
    }

    pub fn owns(&self, persona_id: PersonaId) -> bool {
        self.owned.iter().any(|owned| owned.persona_id == persona_id)
    }
}

/// Draw weight of a rarity tier before renormalization over the tiers present.
pub fn rarity_weight(rarity: u8) -> Result<f64, DomainError> {
    match rarity {
        1 => Ok(0.40),
        2 => Ok(0.30),
        3 => Ok(0.15),
        4 => Ok(0.10),
        5 => Ok(0.05),
        other => Err(DomainError::InvalidRarity(other)),
    }
}

/// Memory fragments granted when a draw lands on an already-owned persona.
pub fn duplicate_fragment_reward(rarity: u8) -> Result<i64, DomainError> {
    match rarity {
        1 => Ok(5),
        2 => Ok(15),
        3 => Ok(30),
        4 => Ok(50),
        5 => Ok(100),
        other => Err(DomainError::InvalidRarity(other)),
    }
}

/// Picks a rarity tier given a roll in `[0, 1)`, renormalized over `present` tiers.
pub fn pick_rarity(present: &[u8], roll: f64) -> Option<u8> {
    let mut tiers: Vec<(u8, f64)> = present
        .iter()
        .copied()
        .filter_map(|tier| rarity_weight(tier).ok().map(|weight| (tier, weight)))
        .collect();
    tiers.sort_by_key(|(tier, _)| *tier);
    tiers.dedup_by_key(|(tier, _)| *tier);

    let total: f64 = tiers.iter().map(|(_, weight)| weight).sum();
    if tiers.is_empty() || total <= 0.0 {
        return None;
    }

    let target = roll.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    for (tier, weight) in &tiers {
        cumulative += weight;
        if target < cumulative {
            return Some(*tier);
        }
    }
    tiers.last().map(|(tier, _)| *tier)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{
        duplicate_fragment_reward, pick_rarity, rarity_weight, OwnedPersona, PersonaId,
        PersonaProfile, UserPersonaState,
    };

    #[test]
    fn first_owned_orders_by_acquisition_time() {
        let now = Utc::now();
        let state = UserPersonaState {
            equipped: None,
            owned: vec![
                OwnedPersona {
                    persona_id: PersonaId(3),
                    stack_count: 1,
                    level: 1,
                    obtained_at: now,
                },
                OwnedPersona {
                    persona_id: PersonaId(2),
                    stack_count: 1,
                    level: 1,
                    obtained_at: now - Duration::hours(1),
                },
            ],
        };

        assert_eq!(state.first_owned(), Some(PersonaId(2)));
        assert_eq!(state.owned_in_acquisition_order(), vec![PersonaId(2), PersonaId(3)]);
        assert!(state.owns(PersonaId(3)));
        assert!(!state.owns(PersonaId(1)));
    }

    #[test]
    fn simultaneous_acquisitions_order_by_persona_id() {
        let now = Utc::now();
        let owned = |id| OwnedPersona {
            persona_id: PersonaId(id),
            stack_count: 1,
            level: 1,
            obtained_at: now,
        };
        let state = UserPersonaState { equipped: None, owned: vec![owned(5), owned(4), owned(6)] };

        assert_eq!(
            state.owned_in_acquisition_order(),
            vec![PersonaId(4), PersonaId(5), PersonaId(6)]
        );
        assert_eq!(state.first_owned(), Some(PersonaId(4)));
    }

    #[test]
    fn builtin_fallback_descriptor_matches_default_voice() {
        let fallback = PersonaProfile::builtin_fallback();
        let descriptor = fallback.descriptor();

        assert!(fallback.is_builtin());
        assert_eq!(descriptor.name, "AIアシスタント");
        assert_eq!(descriptor.avatar_url, "/avatars/default.png");
        assert_eq!(descriptor.theme, "default");
        assert!(!fallback.fallback_text().is_empty());
    }

    #[test]
    fn rarity_tables_reject_out_of_range_tiers() {
        assert!(rarity_weight(0).is_err());
        assert!(duplicate_fragment_reward(6).is_err());
        assert_eq!(duplicate_fragment_reward(3), Ok(30));
    }

    #[test]
    fn pick_rarity_renormalizes_over_present_tiers() {
        // Only tiers 1 and 5 exist: 0.40 / 0.45 of the mass belongs to tier 1.
        assert_eq!(pick_rarity(&[5, 1], 0.0), Some(1));
        assert_eq!(pick_rarity(&[5, 1], 0.88), Some(1));
        assert_eq!(pick_rarity(&[5, 1], 0.90), Some(5));
        assert_eq!(pick_rarity(&[5, 1], 0.9999), Some(5));
        assert_eq!(pick_rarity(&[], 0.5), None);
    }
}
