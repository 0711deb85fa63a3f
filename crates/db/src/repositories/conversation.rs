use chrono::{DateTime, Utc};
use sqlx::Row;

use bazaar_core::domain::conversation::{
    truncate_to_micros, ConversationTurn, NewTurn, TurnKind, TurnRole,
};
use bazaar_core::domain::user::UserId;

use super::{decode_error, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const TURN_COLUMNS: &str = "id, user_id, role, kind, content, visible, created_at";

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationTurn, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(decode_error)?;

    Ok(ConversationTurn {
        id: row.try_get("id").map_err(decode_error)?,
        user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
        role: TurnRole::parse(&role)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown turn role `{role}`")))?,
        kind: TurnKind::parse(&kind)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown turn kind `{kind}`")))?,
        content: row.try_get("content").map_err(decode_error)?,
        visible: row.try_get("visible").map_err(decode_error)?,
        created_at: DateTime::from_timestamp_micros(created_at).ok_or_else(|| {
            RepositoryError::Decode(format!("timestamp {created_at} is out of range"))
        })?,
    })
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn append(
        &self,
        user_id: UserId,
        turns: Vec<NewTurn>,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut appended = Vec::with_capacity(turns.len());

        // The insert reads the user's latest timestamp and writes in one statement,
        // so the value is strictly increasing even if the clock steps back.
        for turn in turns {
            let now = truncate_to_micros(Utc::now()).timestamp_micros();
            let row = sqlx::query(
                "INSERT INTO chat_messages (user_id, role, kind, content, visible, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, MAX(?6, COALESCE(MAX(created_at) + 1, ?6))
                 FROM chat_messages WHERE user_id = ?1
                 RETURNING id, created_at",
            )
            .bind(user_id.0)
            .bind(turn.role.as_str())
            .bind(turn.kind.as_str())
            .bind(&turn.content)
            .bind(turn.visible)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let id: i64 = row.try_get("id").map_err(decode_error)?;
            let created_at: i64 = row.try_get("created_at").map_err(decode_error)?;
            appended.push(ConversationTurn {
                id,
                user_id,
                role: turn.role,
                kind: turn.kind,
                content: turn.content,
                visible: turn.visible,
                created_at: DateTime::from_timestamp_micros(created_at).ok_or_else(|| {
                    RepositoryError::Decode(format!("timestamp {created_at} is out of range"))
                })?,
            });
        }

        tx.commit().await?;
        Ok(appended)
    }

    async fn recent(
        &self,
        user_id: UserId,
        kind: TurnKind,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM (
                 SELECT {TURN_COLUMNS} FROM chat_messages
                 WHERE user_id = ? AND kind = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?
             ) ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(kind.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn latest(
        &self,
        user_id: UserId,
        kind: TurnKind,
    ) -> Result<Option<ConversationTurn>, RepositoryError> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM chat_messages
             WHERE user_id = ? AND kind = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_turn).transpose()
    }

    async fn history(&self, user_id: UserId) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM chat_messages
             WHERE user_id = ?
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(user_id.0).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_turn).collect()
    }
}

#[cfg(test)]
mod tests {
    use bazaar_core::domain::conversation::{NewTurn, TurnKind, TurnRole};
    use bazaar_core::domain::user::{UserAccount, UserId};

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, SqlUserRepository, UserRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlUserRepository::new(pool.clone())
            .save(UserAccount::new(UserId(1), "Buyer B", 0))
            .await
            .expect("save user");
        pool
    }

    #[tokio::test]
    async fn append_preserves_call_order_with_monotonic_timestamps() {
        let repo = SqlConversationRepository::new(setup().await);

        for round in 0..10 {
            repo.append(
                UserId(1),
                vec![
                    NewTurn::user_chat(format!("question {round}")),
                    NewTurn::tool_log(r#"{"tool":"search_items"}"#),
                    NewTurn::agent_chat(format!("answer {round}")),
                ],
            )
            .await
            .expect("append");
        }

        let history = repo.history(UserId(1)).await.expect("history");
        assert_eq!(history.len(), 30);
        assert!(history.windows(2).all(|pair| pair[0].created_at < pair[1].created_at));
        assert_eq!(history[0].content, "question 0");
        assert_eq!(history[1].kind, TurnKind::ToolLog);
        assert!(!history[1].visible);
        assert_eq!(history[29].role, TurnRole::Agent);
    }

    #[tokio::test]
    async fn recent_returns_latest_window_oldest_first() {
        let repo = SqlConversationRepository::new(setup().await);
        for round in 0..5 {
            repo.append(UserId(1), vec![NewTurn::user_chat(format!("m{round}"))])
                .await
                .expect("append");
        }
        repo.append(UserId(1), vec![NewTurn::guidance("マイページです")]).await.expect("guide");

        let recent = repo.recent(UserId(1), TurnKind::Chat, 3).await.expect("recent");
        let contents: Vec<&str> = recent.iter().map(|turn| turn.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let guidance = repo.latest(UserId(1), TurnKind::Guidance).await.expect("latest");
        assert_eq!(guidance.map(|turn| turn.content), Some("マイページです".to_string()));
    }

    #[tokio::test]
    async fn append_for_unknown_user_fails_without_partial_write() {
        let repo = SqlConversationRepository::new(setup().await);

        let result = repo.append(UserId(42), vec![NewTurn::user_chat("hello")]).await;
        assert!(result.is_err());
        assert!(repo.history(UserId(42)).await.expect("history").is_empty());
    }
}
