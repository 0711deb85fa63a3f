use sqlx::Row;

use bazaar_core::domain::persona::{OwnedPersona, PersonaId, PersonaProfile, UserPersonaState};
use bazaar_core::domain::user::UserId;

use super::{decode_error, parse_timestamp, PersonaRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPersonaRepository {
    pool: DbPool,
}

impl SqlPersonaRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const PERSONA_COLUMNS: &str =
    "id, name, description, system_prompt, avatar_url, theme_color, rarity, fallback_line";

fn row_to_persona(row: &sqlx::sqlite::SqliteRow) -> Result<PersonaProfile, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let rarity: i64 = row.try_get("rarity").map_err(decode_error)?;

    Ok(PersonaProfile {
        id: PersonaId(id),
        name: row.try_get("name").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        system_prompt: row.try_get("system_prompt").map_err(decode_error)?,
        avatar_url: row.try_get("avatar_url").map_err(decode_error)?,
        theme_color: row.try_get("theme_color").map_err(decode_error)?,
        rarity: u8::try_from(rarity).map_err(decode_error)?,
        fallback_line: row.try_get("fallback_line").map_err(decode_error)?,
    })
}

fn row_to_owned(row: &sqlx::sqlite::SqliteRow) -> Result<OwnedPersona, RepositoryError> {
    let persona_id: i64 = row.try_get("persona_id").map_err(decode_error)?;
    let stack_count: i64 = row.try_get("stack_count").map_err(decode_error)?;
    let level: i64 = row.try_get("level").map_err(decode_error)?;
    let obtained_at: String = row.try_get("obtained_at").map_err(decode_error)?;

    Ok(OwnedPersona {
        persona_id: PersonaId(persona_id),
        stack_count: u32::try_from(stack_count).map_err(decode_error)?,
        level: u32::try_from(level).map_err(decode_error)?,
        obtained_at: parse_timestamp(&obtained_at)?,
    })
}

#[async_trait::async_trait]
impl PersonaRepository for SqlPersonaRepository {
    async fn find_by_id(&self, id: PersonaId) -> Result<Option<PersonaProfile>, RepositoryError> {
        let sql = format!("SELECT {PERSONA_COLUMNS} FROM agent_personas WHERE id = ?");
        let row = sqlx::query(&sql).bind(id.0).fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_persona).transpose()
    }

    async fn list_catalog(&self) -> Result<Vec<PersonaProfile>, RepositoryError> {
        let sql = format!("SELECT {PERSONA_COLUMNS} FROM agent_personas ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_persona).collect()
    }

    async fn save(&self, persona: PersonaProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_personas (id, name, description, system_prompt, avatar_url,
                                         theme_color, rarity, fallback_line)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 system_prompt = excluded.system_prompt,
                 avatar_url = excluded.avatar_url,
                 theme_color = excluded.theme_color,
                 rarity = excluded.rarity,
                 fallback_line = excluded.fallback_line",
        )
        .bind(persona.id.0)
        .bind(&persona.name)
        .bind(&persona.description)
        .bind(&persona.system_prompt)
        .bind(&persona.avatar_url)
        .bind(&persona.theme_color)
        .bind(i64::from(persona.rarity))
        .bind(&persona.fallback_line)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persona_state(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserPersonaState>, RepositoryError> {
        let user_row = sqlx::query("SELECT current_persona_id FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(user_row) = user_row else {
            return Ok(None);
        };
        let equipped: Option<i64> = user_row.try_get("current_persona_id").map_err(decode_error)?;

        let owned_rows = sqlx::query(
            "SELECT persona_id, stack_count, level, obtained_at
             FROM user_personas WHERE user_id = ?
             ORDER BY obtained_at ASC, persona_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let owned = owned_rows.iter().map(row_to_owned).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(UserPersonaState { equipped: equipped.map(PersonaId), owned }))
    }
}
