//! Pipeline/execution storage (`SPEC_FULL.md` §2.1, §6): the tables backing
//! saved pipelines, run records, per-run execution logs, user notifications,
//! and per-user memory snapshots. Distinct from [`crate::registry`], which
//! owns only block definitions.
//!
//! Memory writes are per-user-serialized at this layer (`SPEC_FULL.md` §5):
//! concurrent `save_memory` calls for the same user queue behind a per-user
//! `tokio::sync::Mutex` so a load-modify-store round trip from one run never
//! clobbers another's.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::info;

use crate::types::{LogRecord, PipelineEdge, PipelineJson, PipelineNode, RunState};

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A pipeline or run id was looked up and not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored JSON or timestamp could not be decoded.
    #[error("corrupt record: {0}")]
    Decode(String),
}

/// A run's terminal status, as recorded in the `runs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The run has been created but has not yet completed.
    Running,
    /// The run completed; every node produced a result.
    Completed,
    /// The run was cancelled or aborted before completion.
    Failed,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// A stored run: the final [`RunState`] snapshot plus bookkeeping fields.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline this run executed.
    pub pipeline_id: String,
    /// User the run was performed for.
    pub user_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Accumulated run state at completion (empty `results`/`log` while running).
    pub state: RunState,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status, if it has.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A notification queued for a user (e.g. "your report is ready").
#[derive(Debug, Clone)]
pub struct Notification {
    /// Row id.
    pub id: i64,
    /// Recipient.
    pub user_id: String,
    /// The run this notification concerns.
    pub run_id: String,
    /// Message body.
    pub message: String,
    /// When it was created.
    pub created_at: DateTime<Utc>,
    /// Whether the user has acknowledged it.
    pub read: bool,
}

/// Parse a SQLite `datetime('now')`-formatted or RFC3339 timestamp.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| StoreError::Decode(format!("timestamp '{raw}': {e}")))
}

fn parse_timestamp_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_timestamp(&s)).transpose()
}

/// The sole gateway to pipeline, run, notification, and memory tables.
pub struct Store {
    db: SqlitePool,
    memory_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

type PipelineRow = (String, String, String, String, String, String);
type RunRow = (String, String, String, String, String, String, String, Option<String>);
type NotificationRow = (i64, String, String, String, String, i64);

impl Store {
    /// Open (creating if needed) the SQLite database at `db_path` and run
    /// migrations. Safe to point at the same file the block registry uses —
    /// the tables are disjoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(db_path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&url).await?;
        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    /// Build a store from an already-open pool (used by tests with an
    /// in-memory database).
    pub fn from_pool(db: SqlitePool) -> Self {
        info!("execution store initialised");
        Self {
            db,
            memory_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist (insert or overwrite) a pipeline definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn save_pipeline(&self, pipeline: &PipelineJson, user_id: &str) -> Result<(), StoreError> {
        let nodes = serde_json::to_string(&pipeline.nodes).map_err(|e| StoreError::Decode(e.to_string()))?;
        let edges = serde_json::to_string(&pipeline.edges).map_err(|e| StoreError::Decode(e.to_string()))?;
        let memory_keys =
            serde_json::to_string(&pipeline.memory_keys).map_err(|e| StoreError::Decode(e.to_string()))?;

        sqlx::query(
            "INSERT INTO pipelines (id, name, user_prompt, nodes, edges, memory_keys, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                user_prompt = excluded.user_prompt,
                nodes = excluded.nodes,
                edges = excluded.edges,
                memory_keys = excluded.memory_keys,
                user_id = excluded.user_id",
        )
        .bind(&pipeline.id)
        .bind(&pipeline.name)
        .bind(&pipeline.user_prompt)
        .bind(&nodes)
        .bind(&edges)
        .bind(&memory_keys)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Fetch a pipeline by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pipeline has that id.
    pub async fn get_pipeline(&self, id: &str) -> Result<PipelineJson, StoreError> {
        let row: Option<PipelineRow> =
            sqlx::query_as("SELECT id, name, user_prompt, nodes, edges, memory_keys FROM pipelines WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        let row = row.ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        pipeline_from_row(row)
    }

    /// List every pipeline saved for a user, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_pipelines_by_user(&self, user_id: &str) -> Result<Vec<PipelineJson>, StoreError> {
        let rows: Vec<PipelineRow> = sqlx::query_as(
            "SELECT id, name, user_prompt, nodes, edges, memory_keys FROM pipelines
             WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(pipeline_from_row).collect()
    }

    /// Delete a pipeline by id. No-op if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn delete_pipeline(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pipelines WHERE id = ?1").bind(id).execute(&self.db).await?;
        Ok(())
    }

    /// Record the start of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn create_run(&self, run_id: &str, pipeline_id: &str, user_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runs (id, pipeline_id, user_id, status, results, log, started_at, completed_at)
             VALUES (?1, ?2, ?3, 'running', '{}', '[]', datetime('now'), NULL)",
        )
        .bind(run_id)
        .bind(pipeline_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Record a run's terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn complete_run(&self, run_id: &str, state: &RunState, status: RunStatus) -> Result<(), StoreError> {
        let results = serde_json::to_string(&state.results).map_err(|e| StoreError::Decode(e.to_string()))?;
        let log = serde_json::to_string(&state.log).map_err(|e| StoreError::Decode(e.to_string()))?;

        sqlx::query(
            "UPDATE runs SET status = ?1, results = ?2, log = ?3, completed_at = datetime('now')
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(&results)
        .bind(&log)
        .bind(run_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Fetch a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no run has that id.
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, pipeline_id, user_id, status, results, log, started_at, completed_at
             FROM runs WHERE id = ?1",
        )
        .bind(run_id)
        .fetch_optional(&self.db)
        .await?;
        let row = row.ok_or_else(|| StoreError::NotFound(run_id.to_owned()))?;
        run_from_row(row)
    }

    /// List every run for a user, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_runs_by_user(&self, user_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT id, pipeline_id, user_id, status, results, log, started_at, completed_at
             FROM runs WHERE user_id = ?1 ORDER BY started_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    /// List every run in a given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT id, pipeline_id, user_id, status, results, log, started_at, completed_at
             FROM runs WHERE status = ?1 ORDER BY started_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    /// Append a batch of node/stage log records for a run in a single
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn insert_execution_log_batch(&self, run_id: &str, records: &[LogRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for record in records {
            let duration_ms: i64 = record.duration_ms.try_into().unwrap_or(i64::MAX);
            sqlx::query(
                "INSERT INTO execution_log (run_id, subject, status, error, duration_ms, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            )
            .bind(run_id)
            .bind(&record.subject)
            .bind(&record.status)
            .bind(&record.error)
            .bind(duration_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Queue a notification for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn notify(&self, user_id: &str, run_id: &str, message: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (user_id, run_id, message, created_at, read)
             VALUES (?1, ?2, ?3, datetime('now'), 0)",
        )
        .bind(user_id)
        .bind(run_id)
        .bind(message)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// List a user's notifications, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_notifications(&self, user_id: &str, unread_only: bool) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<NotificationRow> = if unread_only {
            sqlx::query_as(
                "SELECT id, user_id, run_id, message, created_at, read FROM notifications
                 WHERE user_id = ?1 AND read = 0 ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(&self.db)
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, user_id, run_id, message, created_at, read FROM notifications
                 WHERE user_id = ?1 ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(&self.db)
            .await?
        };
        rows.into_iter().map(notification_from_row).collect()
    }

    /// Mark a notification as read.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn mark_notification_read(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Load a user's memory snapshot, defaulting to empty when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn load_memory(&self, user_id: &str) -> Result<HashMap<String, Value>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM memory WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some((data,)) => serde_json::from_str(&data).map_err(|e| StoreError::Decode(e.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    /// Persist a user's memory snapshot, annotated with the pipeline id and a
    /// snapshot of the run's results (`SPEC_FULL.md` §4.F memory lifecycle).
    ///
    /// Concurrent calls for the same `user_id` are serialized: the lock for
    /// that user is held for the full write, so two runs finishing at once
    /// never interleave their updates.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn save_memory(
        &self,
        user_id: &str,
        memory: &HashMap<String, Value>,
        pipeline_id: &str,
        results_snapshot: &Value,
    ) -> Result<(), StoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let data = serde_json::to_string(memory).map_err(|e| StoreError::Decode(e.to_string()))?;
        let annotation = serde_json::json!({
            "pipeline_id": pipeline_id,
            "results": results_snapshot,
        })
        .to_string();

        sqlx::query(
            "INSERT INTO memory (user_id, data, last_pipeline_id, last_results, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(user_id) DO UPDATE SET
                data = excluded.data,
                last_pipeline_id = excluded.last_pipeline_id,
                last_results = excluded.last_results,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&data)
        .bind(pipeline_id)
        .bind(&annotation)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.memory_locks.lock().await;
        locks.entry(user_id.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

fn pipeline_from_row(row: PipelineRow) -> Result<PipelineJson, StoreError> {
    let (id, name, user_prompt, nodes, edges, memory_keys) = row;
    let nodes: Vec<PipelineNode> =
        serde_json::from_str(&nodes).map_err(|e| StoreError::Decode(format!("nodes: {e}")))?;
    let edges: Vec<PipelineEdge> =
        serde_json::from_str(&edges).map_err(|e| StoreError::Decode(format!("edges: {e}")))?;
    let memory_keys: Vec<String> =
        serde_json::from_str(&memory_keys).map_err(|e| StoreError::Decode(format!("memory_keys: {e}")))?;
    Ok(PipelineJson { id, name, user_prompt, nodes, edges, memory_keys })
}

fn run_from_row(row: RunRow) -> Result<RunRecord, StoreError> {
    let (run_id, pipeline_id, user_id, status, results, log, started_at, completed_at) = row;
    let results = serde_json::from_str(&results).map_err(|e| StoreError::Decode(format!("results: {e}")))?;
    let log = serde_json::from_str(&log).map_err(|e| StoreError::Decode(format!("log: {e}")))?;

    Ok(RunRecord {
        state: RunState {
            pipeline_id: pipeline_id.clone(),
            run_id: run_id.clone(),
            results,
            log,
            ..RunState::default()
        },
        status: RunStatus::parse(&status),
        started_at: parse_timestamp(&started_at)?,
        completed_at: parse_timestamp_opt(completed_at)?,
        run_id,
        pipeline_id,
        user_id,
    })
}

fn notification_from_row(row: NotificationRow) -> Result<Notification, StoreError> {
    let (id, user_id, run_id, message, created_at, read) = row;
    Ok(Notification {
        id,
        user_id,
        run_id,
        message,
        created_at: parse_timestamp(&created_at)?,
        read: read != 0,
    })
}

/// Create tables if they don't already exist.
async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pipelines (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            user_prompt TEXT NOT NULL,
            nodes TEXT NOT NULL,
            edges TEXT NOT NULL,
            memory_keys TEXT NOT NULL DEFAULT '[]',
            user_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS pipelines_user_idx ON pipelines(user_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            pipeline_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            results TEXT NOT NULL DEFAULT '{}',
            log TEXT NOT NULL DEFAULT '[]',
            started_at TEXT NOT NULL,
            completed_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS runs_user_idx ON runs(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS runs_status_idx ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            duration_ms INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS execution_log_run_idx ON execution_log(run_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS notifications_user_idx ON notifications(user_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS memory (
            user_id TEXT PRIMARY KEY,
            data TEXT NOT NULL DEFAULT '{}',
            last_pipeline_id TEXT,
            last_results TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeResult;
    use serde_json::json;

    async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        run_migrations(&pool).await.expect("migrate");
        Store::from_pool(pool)
    }

    fn sample_pipeline(id: &str) -> PipelineJson {
        PipelineJson {
            id: id.to_owned(),
            name: "demo".to_owned(),
            user_prompt: "summarize my inbox".to_owned(),
            nodes: vec![PipelineNode {
                id: "n1".to_owned(),
                block_id: "web_search".to_owned(),
                inputs: HashMap::new(),
            }],
            edges: vec![],
            memory_keys: vec!["last_summary".to_owned()],
        }
    }

    #[tokio::test]
    async fn test_save_then_get_pipeline_round_trip() {
        let store = test_store().await;
        store.save_pipeline(&sample_pipeline("p1"), "alice").await.expect("save");
        let fetched = store.get_pipeline("p1").await.expect("get");
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.memory_keys, vec!["last_summary".to_owned()]);
    }

    #[tokio::test]
    async fn test_get_missing_pipeline_is_not_found() {
        let store = test_store().await;
        let result = store.get_pipeline("missing").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_pipelines_by_user_filters_by_owner() {
        let store = test_store().await;
        store.save_pipeline(&sample_pipeline("p1"), "alice").await.expect("save");
        store.save_pipeline(&sample_pipeline("p2"), "bob").await.expect("save");

        let alice_pipelines = store.list_pipelines_by_user("alice").await.expect("list");
        assert_eq!(alice_pipelines.len(), 1);
        assert_eq!(alice_pipelines[0].id, "p1");
    }

    #[tokio::test]
    async fn test_create_then_complete_run() {
        let store = test_store().await;
        store.save_pipeline(&sample_pipeline("p1"), "alice").await.expect("save pipeline");
        store.create_run("r1", "p1", "alice").await.expect("create run");

        let mut state = RunState {
            pipeline_id: "p1".to_owned(),
            run_id: "r1".to_owned(),
            ..RunState::default()
        };
        state.results.insert("n1".to_owned(), NodeResult::Success { output: json!({"ok": true}) });

        store.complete_run("r1", &state, RunStatus::Completed).await.expect("complete");

        let record = store.get_run("r1").await.expect("get run");
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.state.results.contains_key("n1"));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_runs_by_status_filters_running() {
        let store = test_store().await;
        store.save_pipeline(&sample_pipeline("p1"), "alice").await.expect("save pipeline");
        store.create_run("r1", "p1", "alice").await.expect("create run");
        store.create_run("r2", "p1", "alice").await.expect("create run");
        store
            .complete_run("r2", &RunState::default(), RunStatus::Completed)
            .await
            .expect("complete");

        let running = store.list_runs_by_status(RunStatus::Running).await.expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, "r1");
    }

    #[tokio::test]
    async fn test_insert_execution_log_batch_then_visible_via_direct_query() {
        let store = test_store().await;
        store.save_pipeline(&sample_pipeline("p1"), "alice").await.expect("save pipeline");
        store.create_run("r1", "p1", "alice").await.expect("create run");

        let records = vec![
            LogRecord { subject: "n1".to_owned(), status: "success".to_owned(), error: None, duration_ms: 12 },
            LogRecord {
                subject: "n2".to_owned(),
                status: "failure".to_owned(),
                error: Some("boom".to_owned()),
                duration_ms: 3,
            },
        ];
        store.insert_execution_log_batch("r1", &records).await.expect("batch insert");

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT subject, status FROM execution_log WHERE run_id = 'r1' ORDER BY id")
                .fetch_all(&store.db)
                .await
                .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "n1");
        assert_eq!(rows[1].1, "failure");
    }

    #[tokio::test]
    async fn test_notify_then_list_unread() {
        let store = test_store().await;
        store.notify("alice", "r1", "your report is ready").await.expect("notify");

        let unread = store.list_notifications("alice", true).await.expect("list");
        assert_eq!(unread.len(), 1);
        assert!(!unread[0].read);

        store.mark_notification_read(unread[0].id).await.expect("mark read");
        let unread_after = store.list_notifications("alice", true).await.expect("list");
        assert!(unread_after.is_empty());
    }

    #[tokio::test]
    async fn test_load_memory_defaults_to_empty() {
        let store = test_store().await;
        let memory = store.load_memory("nobody").await.expect("load");
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_memory_round_trip() {
        let store = test_store().await;
        let mut memory = HashMap::new();
        memory.insert("last_summary".to_owned(), json!("inbox is quiet"));

        store
            .save_memory("alice", &memory, "p1", &json!({"n1": {"ok": true}}))
            .await
            .expect("save memory");

        let loaded = store.load_memory("alice").await.expect("load memory");
        assert_eq!(loaded.get("last_summary"), Some(&json!("inbox is quiet")));
    }
}
