use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use bazaar_core::domain::persona::{PersonaId, PersonaProfile, DEFAULT_PERSONA_ID};
use bazaar_core::domain::user::UserId;
use bazaar_db::{PersonaRepository, UserRepository};

use crate::errors::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Forced,
    Equipped,
    FirstOwned,
    CatalogDefault,
    BuiltinFallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPersona {
    pub profile: PersonaProfile,
    pub source: ResolutionSource,
}

impl ResolvedPersona {
    fn new(profile: PersonaProfile, source: ResolutionSource) -> Self {
        Self { profile, source }
    }
}

/// Picks the single persona that voices a reply.
///
/// Order: forced id, equipped persona, earliest owned persona, catalog default,
/// built-in voice. Store failures are logged and treated as "not found", so
/// [`PersonaResolver::resolve`] always yields a profile.
#[derive(Clone)]
pub struct PersonaResolver {
    personas: Arc<dyn PersonaRepository>,
    users: Arc<dyn UserRepository>,
}

impl PersonaResolver {
    pub fn new(personas: Arc<dyn PersonaRepository>, users: Arc<dyn UserRepository>) -> Self {
        Self { personas, users }
    }

    pub async fn resolve(
        &self,
        user_id: Option<UserId>,
        forced: Option<PersonaId>,
    ) -> ResolvedPersona {
        if let Some(forced) = forced {
            if let Some(profile) = self.lookup(forced).await {
                return ResolvedPersona::new(profile, ResolutionSource::Forced);
            }
        }

        if let Some(user_id) = user_id {
            if let Some(resolved) = self.resolve_for_user(user_id).await {
                return resolved;
            }
        }

        match self.lookup(DEFAULT_PERSONA_ID).await {
            Some(profile) => ResolvedPersona::new(profile, ResolutionSource::CatalogDefault),
            None => ResolvedPersona::new(
                PersonaProfile::builtin_fallback(),
                ResolutionSource::BuiltinFallback,
            ),
        }
    }

    /// Persists a first-owned resolution as the equipped persona.
    ///
    /// Returns `true` only when a write happened. Absent users are never written.
    pub async fn repair_equip_if_missing(
        &self,
        user_id: UserId,
        resolved: &ResolvedPersona,
    ) -> Result<bool, AgentError> {
        if resolved.source != ResolutionSource::FirstOwned {
            return Ok(false);
        }

        let updated = self.users.set_equipped_persona(user_id, resolved.profile.id).await?;
        if updated {
            info!(
                event_name = "agent.persona.equip_repaired",
                user_id = %user_id,
                persona_id = resolved.profile.id.0,
                "equipped first owned persona"
            );
        }
        Ok(updated)
    }

    async fn resolve_for_user(&self, user_id: UserId) -> Option<ResolvedPersona> {
        let state = match self.personas.persona_state(user_id).await {
            Ok(state) => state?,
            Err(error) => {
                warn!(
                    event_name = "agent.persona.state_lookup_failed",
                    user_id = %user_id,
                    error = %error,
                    "treating persona state as absent"
                );
                return None;
            }
        };

        if let Some(equipped) = state.equipped {
            if let Some(profile) = self.lookup(equipped).await {
                return Some(ResolvedPersona::new(profile, ResolutionSource::Equipped));
            }
        }

        for persona_id in state.owned_in_acquisition_order() {
            if let Some(profile) = self.lookup(persona_id).await {
                return Some(ResolvedPersona::new(profile, ResolutionSource::FirstOwned));
            }
        }
        None
    }

    async fn lookup(&self, id: PersonaId) -> Option<PersonaProfile> {
        match self.personas.find_by_id(id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(
                    event_name = "agent.persona.lookup_failed",
                    persona_id = id.0,
                    error = %error,
                    "treating persona as absent"
                );
                None
            }
        }
    }
}
