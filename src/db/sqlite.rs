use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::debug;

use super::{StateDocument, StateStore};

/// State documents in SQLite, one row per session id.
pub struct SqliteStateStore {
    pool: SqlitePool,
    url: String,
}

/// Stored state row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredDocument {
    session_id: String,
    document: String,
    updated_at: String,
}

impl SqliteStateStore {
    /// Create a new store connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each connection to :memory: is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self {
            pool,
            url: database_url.to_string(),
        };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_documents (
                session_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                open_positions INTEGER NOT NULL DEFAULT 0,
                closed_trades INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_state_documents_updated ON state_documents(updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, session_id: &str) -> Result<Option<StateDocument>> {
        let row = sqlx::query_as::<_, StoredDocument>(
            "SELECT session_id, document, updated_at FROM state_documents WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load state document")?;

        let Some(row) = row else {
            return Ok(None);
        };
        debug!(session_id = %row.session_id, updated_at = %row.updated_at, "Loaded state");

        StateDocument::from_json(&row.document)
            .with_context(|| format!("Corrupt state document for session {}", row.session_id))
            .map(Some)
    }

    async fn save(&self, document: &StateDocument) -> Result<()> {
        let json = document.to_json().context("Failed to serialize state")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO state_documents
                (session_id, version, document, open_positions, closed_trades, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                version = excluded.version,
                document = excluded.document,
                open_positions = excluded.open_positions,
                closed_trades = excluded.closed_trades,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&document.session_id)
        .bind(document.version as i64)
        .bind(&json)
        .bind(document.positions.len() as i64)
        .bind(document.history.len() as i64)
        .bind(document.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to write state document")?;
        tx.commit().await.context("Failed to commit state")?;

        Ok(())
    }

    async fn session_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT session_id FROM state_documents ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list sessions")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
