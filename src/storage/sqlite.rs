use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{
    ChainState, ChainStatus, ChainStore, ChainSummary, LastError, StageRecord, StatusUpdate,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Optimistic writes re-read and re-apply this many times before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// SQLite-backed chain store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at the configured path
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Private in-memory database, for tests.
    ///
    /// Pinned to a single long-lived connection because every SQLite
    /// `:memory:` connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Read-modify-write with a version guard.
    ///
    /// `apply` returns `Ok(false)` when it made no change, in which case
    /// nothing is written. A concurrent writer bumping the version between
    /// our read and write makes the `UPDATE` match zero rows; the state is
    /// then re-read and `apply` re-run against it.
    async fn mutate<F>(&self, id: &str, mut apply: F) -> StorageResult<ChainState>
    where
        F: FnMut(&mut ChainState) -> StorageResult<bool> + Send,
    {
        let mut expected = 0;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut state = self.load_required(id).await?;
            expected = state.version;

            if !apply(&mut state)? {
                return Ok(state);
            }

            state.version = expected + 1;
            state.updated_at = Utc::now();

            if self.write_guarded(&state, expected).await? {
                return Ok(state);
            }

            warn!(
                instance_id = %id,
                attempt,
                expected_version = expected,
                "Concurrent chain state write, retrying"
            );
        }

        Err(StorageError::Conflict {
            instance_id: id.to_string(),
            expected,
        })
    }

    /// Single-statement guarded update; `false` when the version moved.
    async fn write_guarded(&self, state: &ChainState, expected: i64) -> StorageResult<bool> {
        let completed_steps = to_json(&state.completed_steps)?;
        let outputs = to_json(&state.outputs)?;
        let clarifications = to_json(&state.clarifications)?;
        let (error_kind, error_message, error_stage, error_at) = match &state.last_error {
            Some(e) => (
                Some(e.kind.as_str().to_string()),
                Some(e.message.clone()),
                e.stage_id.clone(),
                Some(e.occurred_at.to_rfc3339()),
            ),
            None => (None, None, None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE chain_states
            SET status = ?, current_stage = ?, completed_steps = ?, outputs = ?,
                clarifications = ?, last_error_kind = ?, last_error_message = ?,
                last_error_stage = ?, last_error_at = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(state.status.as_str())
        .bind(&state.current_stage)
        .bind(&completed_steps)
        .bind(&outputs)
        .bind(&clarifications)
        .bind(&error_kind)
        .bind(&error_message)
        .bind(&error_stage)
        .bind(&error_at)
        .bind(state.version)
        .bind(state.updated_at.to_rfc3339())
        .bind(&state.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ChainStore for SqliteStorage {
    async fn load(&self, id: &str) -> StorageResult<Option<ChainState>> {
        let row: Option<ChainRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, input, status, current_stage, completed_steps, outputs,
                   clarifications, last_error_kind, last_error_message, last_error_stage,
                   last_error_at, version, created_at, updated_at
            FROM chain_states
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChainState::try_from).transpose()
    }

    async fn create_if_absent(
        &self,
        id: &str,
        owner_id: &str,
        input: &str,
    ) -> StorageResult<ChainState> {
        let state = ChainState::new(id, owner_id, input);

        let result = sqlx::query(
            r#"
            INSERT INTO chain_states (id, owner_id, input, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&state.id)
        .bind(&state.owner_id)
        .bind(&state.input)
        .bind(state.status.as_str())
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(instance_id = %id, "Chain state already exists");
        }

        self.load_required(id).await
    }

    async fn append_stage_result(
        &self,
        id: &str,
        stage_id: &str,
        record: StageRecord,
    ) -> StorageResult<ChainState> {
        let state = self
            .mutate(id, |state| state.apply_stage_record(stage_id, record.clone()))
            .await?;

        debug!(
            instance_id = %id,
            stage = %stage_id,
            version = state.version,
            "Stage checkpointed"
        );
        Ok(state)
    }

    async fn transition(&self, id: &str, update: StatusUpdate) -> StorageResult<ChainState> {
        self.mutate(id, |state| {
            state.apply_status_update(update.clone())?;
            Ok(true)
        })
        .await
    }

    async fn pause_for_clarification(
        &self,
        id: &str,
        stage_id: &str,
        question: &str,
    ) -> StorageResult<ChainState> {
        self.mutate(id, |state| {
            state.apply_pause(stage_id, question)?;
            Ok(true)
        })
        .await
    }

    async fn resume_with_answer(&self, id: &str, answer: &str) -> StorageResult<ChainState> {
        self.mutate(id, |state| {
            state.apply_answer(answer)?;
            Ok(true)
        })
        .await
    }

    async fn list_by_status(&self, status: ChainStatus) -> StorageResult<Vec<ChainSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, status, current_stage, updated_at
            FROM chain_states
            WHERE status = ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChainSummary::try_from).collect()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization {
        message: format!("column {}: {}", column, e),
    })
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("invalid timestamp '{}': {}", raw, e),
        })
}

fn parse_status(raw: &str) -> StorageResult<ChainStatus> {
    raw.parse()
        .map_err(|message| StorageError::Serialization { message })
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct ChainRow {
    id: String,
    owner_id: String,
    input: String,
    status: String,
    current_stage: Option<String>,
    completed_steps: String,
    outputs: String,
    clarifications: String,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
    last_error_stage: Option<String>,
    last_error_at: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ChainRow> for ChainState {
    type Error = StorageError;

    fn try_from(row: ChainRow) -> Result<Self, Self::Error> {
        let last_error = match row.last_error_kind {
            Some(kind) => Some(LastError {
                kind: kind
                    .parse()
                    .map_err(|message| StorageError::Serialization { message })?,
                message: row.last_error_message.unwrap_or_default(),
                stage_id: row.last_error_stage,
                occurred_at: row
                    .last_error_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?
                    .unwrap_or_else(Utc::now),
            }),
            None => None,
        };

        Ok(Self {
            id: row.id,
            owner_id: row.owner_id,
            input: row.input,
            status: parse_status(&row.status)?,
            current_stage: row.current_stage,
            completed_steps: from_json("completed_steps", &row.completed_steps)?,
            outputs: from_json("outputs", &row.outputs)?,
            last_error,
            clarifications: from_json("clarifications", &row.clarifications)?,
            version: row.version,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    owner_id: String,
    status: String,
    current_stage: Option<String>,
    updated_at: String,
}

impl TryFrom<SummaryRow> for ChainSummary {
    type Error = StorageError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            owner_id: row.owner_id,
            status: parse_status(&row.status)?,
            current_stage: row.current_stage,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}
