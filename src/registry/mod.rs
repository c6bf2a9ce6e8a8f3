//! Block Registry — durable storage and hybrid search over block
//! definitions (`SPEC_FULL.md` §4.A).
//!
//! All reads go through the connection pool directly (concurrent, served
//! from an in-process TTL cache when possible). All writes go through a
//! single-writer actor backed by an [`mpsc`] channel, so concurrent
//! `save()` calls from the planner and synthesizer never contend for
//! SQLite's single writer lock.

pub mod search;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::capability::LanguageCapability;
use crate::config::RegistryConfig;
use crate::sandbox::{ExecOptions, Executor as Sandbox};
use crate::types::{BlockDefinition, ExecutionType};

use self::writer::WriteOp;

/// Writer channel capacity — bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Database operation failed.
    #[error("registry database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Write channel is closed (writer actor stopped).
    #[error("registry writer channel closed")]
    WriterClosed,
    /// A block id was looked up and not found.
    #[error("block not found: {0}")]
    NotFound(String),
    /// A block definition failed the §3 shape invariants.
    #[error("invalid block definition: {0}")]
    Invalid(String),
    /// A python block's `source_code` failed to compile.
    #[error("block {0} source_code failed to compile: {1}")]
    SourceCompile(String, String),
    /// Stored JSON could not be decoded.
    #[error("corrupt block record: {0}")]
    Decode(String),
}

impl BlockDefinition {
    fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::Invalid("id must not be empty".to_owned()));
        }
        if !self.input_schema.required_is_subset_of_properties() {
            return Err(RegistryError::Invalid(format!(
                "{}: input_schema.required is not a subset of input_schema.properties",
                self.id
            )));
        }
        if !self.output_schema.required_is_subset_of_properties() {
            return Err(RegistryError::Invalid(format!(
                "{}: output_schema.required is not a subset of output_schema.properties",
                self.id
            )));
        }
        Ok(())
    }
}

/// TTL-bounded cache over the registry's full block list and per-id lookups.
///
/// Mirrors the reference registry's module-level `_cache`/`_cache_all`
/// dictionaries, but owned by the struct instead of living in process
/// globals, so multiple registries (e.g. in tests) don't share state.
struct RegistryCache {
    ttl: Duration,
    by_id: Mutex<HashMap<String, (Instant, BlockDefinition)>>,
    all: Mutex<Option<(Instant, Vec<BlockDefinition>)>>,
}

impl RegistryCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_id: Mutex::new(HashMap::new()),
            all: Mutex::new(None),
        }
    }

    async fn get(&self, id: &str) -> Option<BlockDefinition> {
        let cache = self.by_id.lock().await;
        cache
            .get(id)
            .filter(|(fetched, _)| fetched.elapsed() < self.ttl)
            .map(|(_, block)| block.clone())
    }

    async fn put(&self, block: BlockDefinition) {
        let mut cache = self.by_id.lock().await;
        cache.insert(block.id.clone(), (Instant::now(), block));
    }

    async fn get_all(&self) -> Option<Vec<BlockDefinition>> {
        let cache = self.all.lock().await;
        cache
            .as_ref()
            .filter(|(fetched, _)| fetched.elapsed() < self.ttl)
            .map(|(_, blocks)| blocks.clone())
    }

    async fn put_all(&self, blocks: Vec<BlockDefinition>) {
        let mut cache = self.all.lock().await;
        *cache = Some((Instant::now(), blocks));
    }

    /// Drop both caches — called after any write.
    async fn invalidate(&self) {
        self.all.lock().await.take();
    }
}

/// The sole gateway to the block definitions database.
pub struct BlockRegistry {
    db: SqlitePool,
    writer_tx: mpsc::Sender<WriteOp>,
    writer_handle: tokio::task::JoinHandle<()>,
    capability: Option<Arc<dyn LanguageCapability>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    cache: RegistryCache,
    config: RegistryConfig,
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("has_capability", &self.capability.is_some())
            .field("has_sandbox", &self.sandbox.is_some())
            .finish_non_exhaustive()
    }
}

impl BlockRegistry {
    /// Open (creating if needed) the SQLite database at `db_path`, run
    /// migrations, and spawn the single-writer actor.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(
        db_path: &std::path::Path,
        config: RegistryConfig,
        capability: Option<Arc<dyn LanguageCapability>>,
        sandbox: Option<Arc<dyn Sandbox>>,
    ) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&url).await?;
        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool, config, capability, sandbox))
    }

    /// Build a registry from an already-open pool (used by tests with an
    /// in-memory database).
    pub fn from_pool(
        db: SqlitePool,
        config: RegistryConfig,
        capability: Option<Arc<dyn LanguageCapability>>,
        sandbox: Option<Arc<dyn Sandbox>>,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(writer::run_writer(db.clone(), writer_rx));
        info!(
            has_capability = capability.is_some(),
            has_sandbox = sandbox.is_some(),
            "block registry initialised"
        );
        Self {
            db,
            writer_tx,
            writer_handle,
            capability,
            sandbox,
            cache: RegistryCache::new(Duration::from_secs(config.cache_ttl_secs)),
            config,
        }
    }

    /// Fetch a block by id, serving from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no block has that id.
    pub async fn get(&self, id: &str) -> Result<BlockDefinition, RegistryError> {
        if let Some(cached) = self.cache.get(id).await {
            return Ok(cached);
        }
        let row = search::fetch_by_id(&self.db, id).await?;
        let block = row.ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        self.cache.put(block.clone()).await;
        Ok(block)
    }

    /// List every block, serving from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_all(&self) -> Result<Vec<BlockDefinition>, RegistryError> {
        if let Some(cached) = self.cache.get_all().await {
            return Ok(cached);
        }
        let blocks = search::fetch_all(&self.db).await?;
        self.cache.put_all(blocks.clone()).await;
        Ok(blocks)
    }

    /// Save (insert or overwrite) a block definition.
    ///
    /// Generates an embedding over [`BlockDefinition::search_text`] when a
    /// capability is configured, degrading gracefully (and logging a
    /// warning) if generation fails — the block is still saved and remains
    /// discoverable through text search.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Invalid`] if the block fails the §3 shape
    /// invariants, [`RegistryError::SourceCompile`] if a python block's
    /// source fails to compile, or [`RegistryError::WriterClosed`] if the
    /// writer actor has stopped.
    pub async fn save(&self, mut block: BlockDefinition) -> Result<(), RegistryError> {
        block.validate()?;
        self.compile_check(&block).await?;

        if let Some(capability) = &self.capability {
            match capability.embed(&block.search_text()).await {
                Ok(embedding) => block.embedding = Some(embedding),
                Err(err) => {
                    tracing::warn!(block_id = %block.id, error = %err, "embedding generation failed; saving without embedding");
                }
            }
        }

        self.cache.put(block.clone()).await;
        self.cache.invalidate().await;

        self.writer_tx
            .send(WriteOp::SaveBlock(Box::new(block)))
            .await
            .map_err(|_| RegistryError::WriterClosed)
    }

    /// Reject a python block whose `source_code` fails to compile
    /// (`SPEC_FULL.md` §4.A save step 1, §4.C.1): the source is handed to
    /// the sandbox backend to run `python3 -m py_compile` against it, never
    /// loaded into this process (forbidden by §9).
    ///
    /// A no-op for non-python blocks, and degrades silently (like the
    /// embedding step does on capability failure) when no sandbox is
    /// configured — tests construct registries without one.
    async fn compile_check(&self, block: &BlockDefinition) -> Result<(), RegistryError> {
        if block.execution_type != ExecutionType::Python {
            return Ok(());
        }
        let (Some(sandbox), Some(source)) = (&self.sandbox, block.source_code.as_deref()) else {
            return Ok(());
        };

        let check_path = sandbox
            .scripts_dir()
            .join(format!("_compile_check_{}.py", uuid::Uuid::new_v4()));
        std::fs::write(&check_path, source).map_err(|e| {
            RegistryError::SourceCompile(block.id.clone(), format!("could not stage source for compile check: {e}"))
        })?;

        let result = sandbox
            .execute(
                &format!("python3 -m py_compile {}", check_path.display()),
                ExecOptions {
                    timeout: Duration::from_secs(10),
                    ..Default::default()
                },
            )
            .await;

        let _ = std::fs::remove_file(&check_path);

        match result {
            Ok(exec) if exec.success() => Ok(()),
            Ok(exec) => Err(RegistryError::SourceCompile(block.id.clone(), exec.output())),
            Err(err) => Err(RegistryError::SourceCompile(block.id.clone(), err.to_string())),
        }
    }

    /// Hybrid search over block descriptions/tags/embeddings
    /// (`SPEC_FULL.md` §4.A): combines full-text rank and cosine
    /// similarity using `config.registry`'s configured weights, falling
    /// back to a case-insensitive substring scan when neither produces a
    /// match.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<BlockDefinition>, RegistryError> {
        let query_embedding = match &self.capability {
            Some(capability) if !query.trim().is_empty() => capability.embed(query).await.ok(),
            _ => None,
        };

        search::hybrid_search(
            &self.db,
            query,
            query_embedding.as_deref(),
            self.config.text_weight,
            self.config.vector_weight,
            limit,
        )
        .await
    }

    /// List blocks by category.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<BlockDefinition>, RegistryError> {
        search::fetch_by_category(&self.db, category).await
    }

    /// Gracefully shut down the writer actor, draining any queued saves.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
        info!("block registry shut down");
    }
}

/// Create tables and the FTS5 index if they don't already exist.
async fn run_migrations(pool: &SqlitePool) -> Result<(), RegistryError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS blocks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            execution_type TEXT NOT NULL,
            input_schema TEXT NOT NULL,
            output_schema TEXT NOT NULL,
            source_code TEXT,
            prompt_template TEXT,
            use_when TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            examples TEXT NOT NULL DEFAULT '[]',
            embedding TEXT,
            created_by TEXT NOT NULL,
            needs_network INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(
            id UNINDEXED, name, description, use_when, tags
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS blocks_category_idx ON blocks(category)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockCategory, CreatedBy, ExecutionType, Schema};

    fn sample_block(id: &str, description: &str, tags: Vec<&str>) -> BlockDefinition {
        BlockDefinition {
            id: id.to_owned(),
            name: id.to_owned(),
            description: description.to_owned(),
            category: BlockCategory::Process,
            execution_type: ExecutionType::Python,
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            source_code: Some("def execute(inputs, context):\n    return {}".to_owned()),
            prompt_template: None,
            use_when: None,
            tags: tags.into_iter().map(ToOwned::to_owned).collect(),
            examples: Vec::new(),
            embedding: None,
            created_by: CreatedBy::System,
            needs_network: false,
            created_at: None,
            updated_at: None,
        }
    }

    async fn test_registry() -> BlockRegistry {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        run_migrations(&pool).await.expect("migrate");
        BlockRegistry::from_pool(pool, RegistryConfig::default(), None, None)
    }

    #[tokio::test]
    async fn test_save_then_get_round_trip() {
        let registry = test_registry().await;
        registry
            .save(sample_block("web_search", "Search the web", vec!["search"]))
            .await
            .expect("save");

        // The writer actor is async; give it a beat to drain, then rely on
        // the write-through cache for the immediate read.
        let fetched = registry.get("web_search").await.expect("get");
        assert_eq!(fetched.id, "web_search");
    }

    #[tokio::test]
    async fn test_get_missing_block_is_not_found() {
        let registry = test_registry().await;
        let result = registry.get("does_not_exist").await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_schema() {
        let registry = test_registry().await;
        let mut block = sample_block("bad", "bad block", vec![]);
        block.input_schema.required = vec!["missing".to_owned()];
        let result = registry.save(block).await;
        assert!(matches!(result, Err(RegistryError::Invalid(_))));
    }
}
