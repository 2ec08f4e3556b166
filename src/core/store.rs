use crate::core::model::{Category, SubscriptionEntry};
use crate::plugins::registry::{DeliveryHandle, QueuedMessage, SubscriptionStore, WebhookQueue};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{category} {external_id} is already subscribed")]
    Duplicate { category: Category, external_id: String },

    #[error("pop receipt for message {0} is stale or the message is gone")]
    ReceiptMismatch(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Subscriptions and the durable webhook queue, in one SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir().context("current_dir")?.join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first start
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private database that lives as long as the store. One connection, so
    /// every query sees the same data.
    #[cfg(test)]
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("connect in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
              category TEXT NOT NULL,
              external_id TEXT NOT NULL,
              media_key TEXT NOT NULL,
              title TEXT NOT NULL DEFAULT '',
              created_at INTEGER NOT NULL,
              PRIMARY KEY (category, external_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("migrate subscriptions")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              body TEXT NOT NULL,
              inserted_at INTEGER NOT NULL,
              visible_at INTEGER NOT NULL, -- epoch millis
              pop_receipt TEXT NULL,
              dequeue_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("migrate webhook_messages")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_webhook_visible
            ON webhook_messages(visible_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_millis() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Appends a raw webhook body; it becomes visible immediately.
    pub async fn push(&self, body: &str) -> Result<i64, StoreError> {
        let now = Self::now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO webhook_messages (body, inserted_at, visible_at, dequeue_count)
            VALUES (?, ?, ?, 0);
            "#,
        )
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn pending_messages(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(r#"SELECT COUNT(1) AS cnt FROM webhook_messages"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("cnt"))
    }
}

fn entry_from_row(r: &SqliteRow) -> anyhow::Result<SubscriptionEntry> {
    Ok(SubscriptionEntry {
        category: r.get::<String, _>("category").parse()?,
        external_id: r.get("external_id"),
        media_key: r.get("media_key"),
        title: r.get("title"),
    })
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn exists(&self, category: Category, external_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(r#"SELECT COUNT(1) AS cnt FROM subscriptions WHERE category = ? AND external_id = ?"#)
            .bind(category.as_str())
            .bind(external_id)
            .fetch_one(&self.pool)
            .await
            .context("check subscription")?;
        Ok(row.get::<i64, _>("cnt") > 0)
    }

    async fn get(&self, category: Category, external_id: &str) -> anyhow::Result<Option<SubscriptionEntry>> {
        let row = sqlx::query(
            r#"
            SELECT category, external_id, media_key, title
            FROM subscriptions
            WHERE category = ? AND external_id = ?;
            "#,
        )
        .bind(category.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch subscription")?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn add(&self, entry: &SubscriptionEntry) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO subscriptions (category, external_id, media_key, title, created_at)
            VALUES (?, ?, ?, ?, ?);
            "#,
        )
        .bind(entry.category.as_str())
        .bind(&entry.external_id)
        .bind(&entry.media_key)
        .bind(&entry.title)
        .bind(Self::now_millis() / 1000)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Duplicate {
                category: entry.category,
                external_id: entry.external_id.clone(),
            }
            .into()),
            Err(e) => Err(StoreError::Database(e).into()),
        }
    }

    async fn remove(&self, category: Category, external_id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM subscriptions WHERE category = ? AND external_id = ?"#)
            .bind(category.as_str())
            .bind(external_id)
            .execute(&self.pool)
            .await
            .context("delete subscription")?;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<SubscriptionEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT category, external_id, media_key, title
            FROM subscriptions
            ORDER BY category ASC, title ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list subscriptions")?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl WebhookQueue for SqliteStore {
    /// Claims up to `max_messages` visible messages and hides them for `visibility`.
    async fn poll(&self, max_messages: usize, visibility: Duration) -> anyhow::Result<Vec<QueuedMessage>> {
        let now = Self::now_millis();
        let hidden_until = now + visibility.as_millis() as i64;

        let mut tx = self.pool.begin().await.context("begin poll")?;
        let rows = sqlx::query(
            r#"
            SELECT id, body, dequeue_count
            FROM webhook_messages
            WHERE visible_at <= ?
            ORDER BY id ASC
            LIMIT ?;
            "#,
        )
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let id: i64 = r.get("id");
            let receipt = Uuid::new_v4().to_string();
            let dequeue_count = r.get::<i64, _>("dequeue_count") + 1;
            sqlx::query(
                r#"
                UPDATE webhook_messages
                SET visible_at = ?, pop_receipt = ?, dequeue_count = ?
                WHERE id = ?;
                "#,
            )
            .bind(hidden_until)
            .bind(&receipt)
            .bind(dequeue_count)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            out.push(QueuedMessage {
                handle: DeliveryHandle { message_id: id, pop_receipt: receipt },
                body: r.get("body"),
                dequeue_count,
            });
        }
        tx.commit().await.context("commit poll")?;
        Ok(out)
    }

    async fn delete(&self, handle: &DeliveryHandle) -> anyhow::Result<()> {
        let res = sqlx::query(r#"DELETE FROM webhook_messages WHERE id = ? AND pop_receipt = ?"#)
            .bind(handle.message_id)
            .bind(&handle.pop_receipt)
            .execute(&self.pool)
            .await
            .context("delete webhook message")?;
        if res.rows_affected() == 0 {
            return Err(StoreError::ReceiptMismatch(handle.message_id).into());
        }
        Ok(())
    }
}
