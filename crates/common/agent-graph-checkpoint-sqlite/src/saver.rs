//! SQLite checkpoint saver.
//!
//! One database file holds every session. `put` runs in a single
//! transaction whose first statement is a write, so the head check, the
//! checkpoint insert and the session row update commit or roll back as one.

use std::str::FromStr;

use agent_graph_checkpoint::{
    BaseCheckpointSaver, Checkpoint, CheckpointConfig, CheckpointError, CheckpointId,
    CheckpointMetadata, CheckpointStream, CheckpointTuple, EncodedValue, ListOptions, ParentRef,
    PendingCheckpoint, Result, SerdeFormat,
};
use async_stream::stream;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use tracing::{debug, instrument, warn};

use crate::config::SqliteSaverConfig;

const SELECT_COLUMNS: &str = r#"
    SELECT session_id, checkpoint_id, parent_session_id, parent_checkpoint_id,
           state_format, state, writes_format, writes, metadata
    FROM checkpoints
"#;

/// Durable checkpoint saver backed by a single SQLite file.
///
/// The database runs in WAL mode with `synchronous=FULL`, so a checkpoint
/// is on disk once `put` returns.
#[derive(Debug, Clone)]
pub struct SqliteSaver {
    pool: SqlitePool,
    page_size: u32,
}

impl SqliteSaver {
    /// Open (or create) the database described by `config`.
    #[instrument(skip(config), fields(path = %config.path.display()), err)]
    pub async fn connect(config: &SqliteSaverConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::storage(None, "connect", e))?;

        debug!("connected to checkpoint database");
        Self::from_pool(pool, config.page_size).await
    }

    /// Open the database at `path` with default settings.
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::connect(&SqliteSaverConfig::new(path)).await
    }

    /// A private in-memory database, gone when the saver is dropped.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CheckpointError::storage(None, "in-memory options", e))?;

        // Every connection to :memory: is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::storage(None, "connect", e))?;

        Self::from_pool(pool, SqliteSaverConfig::default().page_size).await
    }

    /// Wrap an existing pool, running pending migrations first.
    pub async fn from_pool(pool: SqlitePool, page_size: u32) -> Result<Self> {
        Self::run_migrations(&pool)
            .await
            .map_err(|e| CheckpointError::storage(None, "migrate", e))?;

        Ok(Self {
            pool,
            page_size: page_size.max(1),
        })
    }

    async fn run_migrations(
        pool: &SqlitePool,
    ) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        let migrator = sqlx::migrate!("src/migrations");
        migrator.run(pool).await
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_one(
        &self,
        session_id: &str,
        checkpoint_id: Option<CheckpointId>,
    ) -> Result<Option<CheckpointTuple>> {
        let row = match checkpoint_id {
            Some(id) => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE session_id = ? AND checkpoint_id = ?"
                ))
                .bind(session_id)
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE session_id = ? ORDER BY checkpoint_id DESC LIMIT 1"
                ))
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| CheckpointError::storage(Some(session_id), "select checkpoint", e))?;

        row.as_ref().map(row_to_tuple).transpose()
    }

    async fn fetch_page(
        &self,
        session_id: &str,
        cursor: Option<CheckpointId>,
        limit: usize,
    ) -> Result<Vec<CheckpointTuple>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE session_id = ? AND checkpoint_id < ? \
                     ORDER BY checkpoint_id DESC LIMIT ?"
                ))
                .bind(session_id)
                .bind(cursor.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE session_id = ? ORDER BY checkpoint_id DESC LIMIT ?"
                ))
                .bind(session_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| CheckpointError::storage(Some(session_id), "list checkpoints", e))?;

        rows.iter().map(row_to_tuple).collect()
    }
}

#[async_trait]
impl BaseCheckpointSaver for SqliteSaver {
    #[instrument(skip(self, checkpoint, writes, metadata), err)]
    async fn put(
        &self,
        session_id: &str,
        checkpoint: PendingCheckpoint,
        writes: EncodedValue,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId> {
        CheckpointConfig::new(session_id).validate()?;
        checkpoint.validate_parent(session_id)?;

        let storage = |what: &'static str| {
            move |e: sqlx::Error| CheckpointError::storage(Some(session_id), what, e)
        };

        let id = CheckpointId::next_after(checkpoint.expected_head.as_ref());
        let now = Utc::now();
        let metadata_json = serde_json::to_string(&metadata)?;

        let mut tx = self.pool.begin().await.map_err(storage("tx begin"))?;

        // Claim the head first: a write takes the database lock up front.
        let claimed = match checkpoint.expected_head {
            Some(expected) => sqlx::query(
                r#"
                UPDATE sessions
                SET latest_checkpoint_id = ?, updated_at = ?
                WHERE session_id = ? AND latest_checkpoint_id = ?
                "#,
            )
            .bind(id.to_string())
            .bind(now)
            .bind(session_id)
            .bind(expected.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage("advance session"))?,
            None => sqlx::query(
                r#"
                INSERT INTO sessions (session_id, root_checkpoint_id, latest_checkpoint_id, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(session_id) DO NOTHING
                "#,
            )
            .bind(session_id)
            .bind(id.to_string())
            .bind(id.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage("create session"))?,
        };

        if claimed.rows_affected() != 1 {
            let found: Option<String> = sqlx::query_scalar(
                "SELECT latest_checkpoint_id FROM sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("read session head"))?;
            let found = found.as_deref().map(parse_id).transpose()?;

            warn!(expected = ?checkpoint.expected_head, ?found, "session head moved");
            return Err(CheckpointError::conflict(
                session_id,
                checkpoint.expected_head,
                found,
            ));
        }

        if let Some(parent) = &checkpoint.parent {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM checkpoints WHERE session_id = ? AND checkpoint_id = ?",
            )
            .bind(&parent.session_id)
            .bind(parent.checkpoint_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("check parent"))?;

            if exists.is_none() {
                return Err(CheckpointError::not_found(
                    parent.session_id.clone(),
                    parent.checkpoint_id,
                ));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                session_id, checkpoint_id, parent_session_id, parent_checkpoint_id,
                state_format, state, writes_format, writes, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(id.to_string())
        .bind(checkpoint.parent.as_ref().map(|p| p.session_id.clone()))
        .bind(checkpoint.parent.as_ref().map(|p| p.checkpoint_id.to_string()))
        .bind(checkpoint.state.format.as_str())
        .bind(&checkpoint.state.bytes)
        .bind(writes.format.as_str())
        .bind(&writes.bytes)
        .bind(&metadata_json)
        .bind(metadata.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage("insert checkpoint"))?;

        tx.commit().await.map_err(storage("tx commit"))?;

        debug!(%id, step = metadata.step, "committed checkpoint");
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let session_id = config.session_id()?;
        let tuple = self.fetch_one(session_id, config.checkpoint_id).await?;

        match (tuple, config.checkpoint_id) {
            (None, Some(id)) => Err(CheckpointError::not_found(session_id, id)),
            (tuple, _) => Ok(tuple),
        }
    }

    fn list<'a>(
        &'a self,
        config: &'a CheckpointConfig,
        options: ListOptions,
    ) -> CheckpointStream<'a> {
        Box::pin(stream! {
            let session_id = match config.session_id() {
                Ok(id) => id,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut cursor = options.before;
            let mut remaining = options.limit.unwrap_or(usize::MAX);

            while remaining > 0 {
                let page_len = remaining.min(self.page_size as usize);
                let page = match self.fetch_page(session_id, cursor, page_len).await {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let exhausted = page.len() < page_len;

                for tuple in page {
                    cursor = Some(tuple.id());
                    remaining -= 1;
                    yield Ok(tuple);
                }

                if exhausted {
                    break;
                }
            }
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_session(&self, session_id: &str) -> Result<()> {
        CheckpointConfig::new(session_id).validate()?;
        let storage = |what: &'static str| {
            move |e: sqlx::Error| CheckpointError::storage(Some(session_id), what, e)
        };

        let mut tx = self.pool.begin().await.map_err(storage("tx begin"))?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("delete session"))?;
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("delete checkpoints"))?;
        tx.commit().await.map_err(storage("tx commit"))?;

        debug!("deleted session");
        Ok(())
    }
}

fn parse_id(raw: &str) -> Result<CheckpointId> {
    CheckpointId::from_str(raw)
        .map_err(|e| CheckpointError::Serialization(format!("bad checkpoint id '{raw}': {e}")))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| CheckpointError::storage(None, format!("read column {name}"), e))
}

fn row_to_tuple(row: &SqliteRow) -> Result<CheckpointTuple> {
    let session_id: String = column(row, "session_id")?;
    let id = parse_id(&column::<String>(row, "checkpoint_id")?)?;

    let parent_session: Option<String> = column(row, "parent_session_id")?;
    let parent_id: Option<String> = column(row, "parent_checkpoint_id")?;
    let parent = match (parent_session, parent_id) {
        (Some(parent_session), Some(parent_id)) => {
            Some(ParentRef::new(parent_session, parse_id(&parent_id)?))
        }
        _ => None,
    };

    let state = EncodedValue::new(
        SerdeFormat::parse(&column::<String>(row, "state_format")?)?,
        column(row, "state")?,
    );
    let writes = EncodedValue::new(
        SerdeFormat::parse(&column::<String>(row, "writes_format")?)?,
        column(row, "writes")?,
    );
    let metadata: CheckpointMetadata =
        serde_json::from_str(&column::<String>(row, "metadata")?)?;

    Ok(CheckpointTuple::new(Checkpoint {
        id,
        session_id,
        parent,
        state,
        writes,
        metadata,
    }))
}
