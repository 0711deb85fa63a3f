use chrono::{DateTime, Utc};
use sqlx::Row;

use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus};
use bazaar_core::domain::user::UserId;

use super::{
    decode_error, format_timestamp, parse_timestamp, ItemQuery, ItemRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlItemRepository {
    pool: DbPool,
}

impl SqlItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ITEM_COLUMNS: &str =
    "id, seller_id, name, description, price, category, condition, status, created_at";

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<CatalogItem, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let seller_id: Option<i64> = row.try_get("seller_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;

    Ok(CatalogItem {
        id: ItemId(id),
        seller_id: seller_id.map(UserId),
        name: row.try_get("name").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        price: row.try_get("price").map_err(decode_error)?,
        category: row.try_get("category").map_err(decode_error)?,
        condition: row.try_get("condition").map_err(decode_error)?,
        status: ItemStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown item status `{status}`")))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

/// `%` and `_` in user text match literally.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[async_trait::async_trait]
impl ItemRepository for SqlItemRepository {
    async fn find_by_id(&self, id: ItemId) -> Result<Option<CatalogItem>, RepositoryError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?");
        let row = sqlx::query(&sql).bind(id.0).fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_item).transpose()
    }

    async fn save(&self, item: CatalogItem) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO items (id, seller_id, name, description, price, category, condition,
                                status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 seller_id = excluded.seller_id,
                 name = excluded.name,
                 description = excluded.description,
                 price = excluded.price,
                 category = excluded.category,
                 condition = excluded.condition,
                 status = excluded.status",
        )
        .bind(item.id.0)
        .bind(item.seller_id.map(|id| id.0))
        .bind(&item.name)
        .bind(&item.description)
        .bind(item.price)
        .bind(&item.category)
        .bind(&item.condition)
        .bind(item.status.as_str())
        .bind(format_timestamp(item.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogItem>, RepositoryError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE status = 'on_sale'
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn search(&self, query: &ItemQuery) -> Result<Vec<CatalogItem>, RepositoryError> {
        let text = query.text.trim();
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE (?1 = 0 OR status = 'on_sale')
               AND (?2 IS NULL OR category = ?2)
               AND (?3 = ''
                    OR name LIKE ?4 ESCAPE '\\'
                    OR (?5 = 1 AND description LIKE ?4 ESCAPE '\\'))
             ORDER BY id ASC
             LIMIT ?6"
        );
        let rows = sqlx::query(&sql)
            .bind(query.available_only)
            .bind(query.category.as_deref())
            .bind(text)
            .bind(like_pattern(text))
            .bind(query.match_description)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn record_purchase(
        &self,
        id: ItemId,
        buyer_id: UserId,
        sold_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE items SET status = 'sold', buyer_id = ?, sold_at = ? WHERE id = ?",
        )
        .bind(buyer_id.0)
        .bind(format_timestamp(sold_at))
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_purchase(
        &self,
        buyer_id: UserId,
    ) -> Result<Option<CatalogItem>, RepositoryError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE buyer_id = ? AND sold_at IS NOT NULL
             ORDER BY sold_at DESC, id DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(buyer_id.0).fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_item).transpose()
    }
}
