//! SQLite implementation of the AuthoritativeStore.
//!
//! Items are stored as JSON text keyed by their opaque key. Every write
//! runs inside a `BEGIN IMMEDIATE` transaction, which takes SQLite's write
//! lock up front so condition checks and writes cannot interleave with
//! another writer.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::domain::ports::{
    AuthoritativeStore, Condition, Item, StoreError, StoreResult, TransactionItem, WriteEffect,
};

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Authoritative store keeping each item as a JSON row in `coherence_items`.
#[derive(Clone)]
pub struct SqliteAuthoritativeStore {
    pool: SqlitePool,
}

impl SqliteAuthoritativeStore {
    /// Store over a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(conn: &mut SqliteConnection, key: &str) -> StoreResult<Option<Item>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT item FROM coherence_items WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        row.map(|(json,)| serde_json::from_str::<Item>(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn write(conn: &mut SqliteConnection, key: &str, item: &Item) -> StoreResult<()> {
        let json = serde_json::to_string(item)?;
        sqlx::query(
            "INSERT INTO coherence_items (key, item, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET item = excluded.item, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn remove(conn: &mut SqliteConnection, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM coherence_items WHERE key = ?1")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn apply_all(conn: &mut SqliteConnection, items: &[TransactionItem]) -> StoreResult<()> {
        for (idx, item) in items.iter().enumerate() {
            let current = Self::load(conn, item.key()).await?;
            if !item.is_satisfied(current.as_ref()) {
                return Err(StoreError::TransactionCanceled {
                    failed_index: idx,
                    key: item.key().to_string(),
                });
            }
            match item.apply(current.as_ref()) {
                WriteEffect::Write(next) => Self::write(conn, item.key(), &next).await?,
                WriteEffect::Remove => Self::remove(conn, item.key()).await?,
                WriteEffect::Unchanged => {}
            }
        }
        Ok(())
    }

    /// Run a single conditional item, reporting a failed condition against its key.
    async fn single(&self, item: TransactionItem) -> StoreResult<()> {
        self.transact(vec![item]).await.map_err(|e| match e {
            StoreError::TransactionCanceled { key, .. } => StoreError::ConditionFailed { key },
            other => other,
        })
    }
}

#[async_trait]
impl AuthoritativeStore for SqliteAuthoritativeStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Item>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        Self::load(&mut conn, key).await
    }

    async fn put(&self, key: &str, item: Item) -> StoreResult<()> {
        self.single(TransactionItem::put(key, item)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.single(TransactionItem::delete(key)).await
    }

    async fn conditional_put(&self, key: &str, item: Item, condition: Condition) -> StoreResult<()> {
        self.single(TransactionItem::put(key, item).when(condition)).await
    }

    async fn conditional_delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        self.single(TransactionItem::delete(key).when(condition)).await
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        let result = match Self::apply_all(&mut conn, &items).await {
            Ok(()) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map(|_| ())
                .map_err(map_sqlx_error),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!(error = %e, "Rollback failed; closing connection");
                // Never hand a connection with an open transaction back to the pool.
                let _ = conn.detach();
            }
        }
        result
    }
}

/// Busy/locked databases, pool exhaustion and I/O failures are transient.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) {
                StoreError::Transient(err.to_string())
            } else {
                StoreError::Backend(err.to_string())
            }
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
