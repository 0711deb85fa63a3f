use chrono::Utc;
use sqlx::Row;

use bazaar_core::domain::persona::{duplicate_fragment_reward, PersonaProfile};
use bazaar_core::domain::user::{DeductOutcome, DrawOutcome, GrantReceipt, UserId, WalletBalance};

use super::{decode_error, format_timestamp, RepositoryError, WalletRepository};
use crate::DbPool;

pub struct SqlWalletRepository {
    pool: DbPool,
}

impl SqlWalletRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn current_points(&self, user_id: UserId) -> Result<Option<i64>, RepositoryError> {
        let points: Option<i64> =
            sqlx::query_scalar("SELECT gacha_points FROM users WHERE id = ?")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(points)
    }
}

fn fragment_reward(persona: &PersonaProfile) -> Result<i64, RepositoryError> {
    duplicate_fragment_reward(persona.rarity)
        .map_err(|error| RepositoryError::Constraint(error.to_string()))
}

/// Inserts the persona or bumps its stack; `None` when the user row is absent.
async fn grant_on(
    conn: &mut sqlx::SqliteConnection,
    user_id: UserId,
    persona: &PersonaProfile,
    reward: i64,
) -> Result<Option<GrantReceipt>, RepositoryError> {
    let stack_count: Option<i64> = sqlx::query_scalar(
        "INSERT INTO user_personas (user_id, persona_id, stack_count, level, obtained_at)
         SELECT ?1, ?2, 1, 1, ?3 WHERE EXISTS (SELECT 1 FROM users WHERE id = ?1)
         ON CONFLICT(user_id, persona_id) DO UPDATE SET stack_count = stack_count + 1
         RETURNING stack_count",
    )
    .bind(user_id.0)
    .bind(persona.id.0)
    .bind(format_timestamp(Utc::now()))
    .fetch_optional(&mut *conn)
    .await?;

    let Some(stack_count) = stack_count else {
        return Ok(None);
    };
    let is_new = stack_count == 1;
    let fragments_earned = if is_new { 0 } else { reward };

    if fragments_earned > 0 {
        sqlx::query("UPDATE users SET memory_fragments = memory_fragments + ? WHERE id = ?")
            .bind(fragments_earned)
            .bind(user_id.0)
            .execute(&mut *conn)
            .await?;
    }

    Ok(Some(GrantReceipt {
        persona_id: persona.id,
        is_new,
        stack_count: u32::try_from(stack_count).map_err(decode_error)?,
        fragments_earned,
    }))
}

#[async_trait::async_trait]
impl WalletRepository for SqlWalletRepository {
    async fn balance(&self, user_id: UserId) -> Result<Option<WalletBalance>, RepositoryError> {
        let row = sqlx::query("SELECT gacha_points, memory_fragments FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(WalletBalance {
            gacha_points: row.try_get("gacha_points").map_err(decode_error)?,
            memory_fragments: row.try_get("memory_fragments").map_err(decode_error)?,
        }))
    }

    async fn deduct(&self, user_id: UserId, amount: i64) -> Result<DeductOutcome, RepositoryError> {
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET gacha_points = gacha_points - ?1
             WHERE id = ?2 AND gacha_points >= ?1
             RETURNING gacha_points",
        )
        .bind(amount)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(remaining) = remaining {
            return Ok(DeductOutcome::Deducted { remaining });
        }
        Ok(match self.current_points(user_id).await? {
            Some(balance) => DeductOutcome::InsufficientBalance { required: amount, balance },
            None => DeductOutcome::UserNotFound,
        })
    }

    async fn grant_persona(
        &self,
        user_id: UserId,
        persona: &PersonaProfile,
    ) -> Result<Option<GrantReceipt>, RepositoryError> {
        let reward = fragment_reward(persona)?;
        let mut tx = self.pool.begin().await?;
        let receipt = grant_on(&mut tx, user_id, persona, reward).await?;
        tx.commit().await?;
        Ok(receipt)
    }

    async fn draw_persona(
        &self,
        user_id: UserId,
        cost: i64,
        persona: &PersonaProfile,
    ) -> Result<DrawOutcome, RepositoryError> {
        let reward = fragment_reward(persona)?;
        let mut tx = self.pool.begin().await?;

        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET gacha_points = gacha_points - ?1
             WHERE id = ?2 AND gacha_points >= ?1
             RETURNING gacha_points",
        )
        .bind(cost)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(remaining_points) = remaining else {
            tx.rollback().await?;
            return Ok(match self.current_points(user_id).await? {
                Some(balance) => DrawOutcome::InsufficientBalance { required: cost, balance },
                None => DrawOutcome::UserNotFound,
            });
        };

        let Some(receipt) = grant_on(&mut tx, user_id, persona, reward).await? else {
            tx.rollback().await?;
            return Ok(DrawOutcome::UserNotFound);
        };

        tx.commit().await?;
        Ok(DrawOutcome::Drawn { receipt, remaining_points })
    }
}
