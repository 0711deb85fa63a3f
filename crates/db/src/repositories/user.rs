use sqlx::Row;

use bazaar_core::domain::persona::PersonaId;
use bazaar_core::domain::user::{UserAccount, UserId};

use super::{decode_error, RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<UserAccount, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let username: String = row.try_get("username").map_err(decode_error)?;
    let gacha_points: i64 = row.try_get("gacha_points").map_err(decode_error)?;
    let memory_fragments: i64 = row.try_get("memory_fragments").map_err(decode_error)?;
    let current_persona_id: Option<i64> =
        row.try_get("current_persona_id").map_err(decode_error)?;

    Ok(UserAccount {
        id: UserId(id),
        username,
        gacha_points,
        memory_fragments,
        equipped_persona_id: current_persona_id.map(PersonaId),
    })
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserAccount>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, username, gacha_points, memory_fragments, current_persona_id
             FROM users WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn save(&self, user: UserAccount) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, username, gacha_points, memory_fragments, current_persona_id)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 gacha_points = excluded.gacha_points,
                 memory_fragments = excluded.memory_fragments,
                 current_persona_id = excluded.current_persona_id",
        )
        .bind(user.id.0)
        .bind(&user.username)
        .bind(user.gacha_points)
        .bind(user.memory_fragments)
        .bind(user.equipped_persona_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_equipped_persona(
        &self,
        id: UserId,
        persona_id: PersonaId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE users SET current_persona_id = ? WHERE id = ?")
            .bind(persona_id.0)
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use bazaar_core::domain::persona::PersonaId;
    use bazaar_core::domain::user::{UserAccount, UserId};

    use super::SqlUserRepository;
    use crate::repositories::{PersonaRepository, SqlPersonaRepository, UserRepository};
    use crate::{connect_with_settings, fixtures, migrations, DbPool};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let repo = SqlUserRepository::new(setup().await);
        let user = UserAccount::new(UserId(10), "Seller A", 300);

        repo.save(user.clone()).await.expect("save");
        let found = repo.find_by_id(UserId(10)).await.expect("find");

        assert_eq!(found, Some(user));
        assert_eq!(repo.find_by_id(UserId(11)).await.expect("find missing"), None);
    }

    #[tokio::test]
    async fn set_equipped_persona_reports_missing_user() {
        let pool = setup().await;
        let personas = SqlPersonaRepository::new(pool.clone());
        for persona in fixtures::persona_catalog() {
            personas.save(persona).await.expect("save persona");
        }
        let repo = SqlUserRepository::new(pool);
        repo.save(UserAccount::new(UserId(1), "Buyer B", 0)).await.expect("save");

        assert!(repo.set_equipped_persona(UserId(1), PersonaId(2)).await.expect("equip"));
        assert!(!repo.set_equipped_persona(UserId(99), PersonaId(2)).await.expect("equip"));

        let found = repo.find_by_id(UserId(1)).await.expect("find").expect("user");
        assert_eq!(found.equipped_persona_id, Some(PersonaId(2)));
    }
}
