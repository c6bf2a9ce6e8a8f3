//! Single-writer actor for serialized SQLite writes.
//!
//! All mutations to `blocks`/`blocks_fts` flow through this actor via an
//! [`mpsc`](tokio::sync::mpsc) channel, preventing write contention while
//! [`super::BlockRegistry`]'s reads stay concurrent through the pool.

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::types::BlockDefinition;

/// Operations that can be sent to the write actor.
pub enum WriteOp {
    /// Insert or overwrite a block definition.
    SaveBlock(Box<BlockDefinition>),
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveBlock(block) => f.debug_tuple("SaveBlock").field(&block.id).finish(),
        }
    }
}

/// Run the single-writer actor loop until the sender half is dropped.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        if let Err(err) = handle_op(&db, &op).await {
            error!(?op, error = %err, "registry write failed");
        }
    }
    trace!("registry writer actor stopped");
}

async fn handle_op(db: &SqlitePool, op: &WriteOp) -> Result<(), sqlx::Error> {
    match op {
        WriteOp::SaveBlock(block) => save_block(db, block).await,
    }
}

async fn save_block(db: &SqlitePool, block: &BlockDefinition) -> Result<(), sqlx::Error> {
    let input_schema = serde_json::to_string(&block.input_schema).unwrap_or_default();
    let output_schema = serde_json::to_string(&block.output_schema).unwrap_or_default();
    let tags = serde_json::to_string(&block.tags).unwrap_or_default();
    let examples = serde_json::to_string(&block.examples).unwrap_or_default();
    let embedding = block.embedding.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default());
    let category = format!("{:?}", block.category).to_lowercase();
    let execution_type = match block.execution_type {
        crate::types::ExecutionType::Python => "python",
        crate::types::ExecutionType::TextGeneration => "text_generation",
    };
    let created_by = format!("{:?}", block.created_by).to_lowercase();

    let mut tx = db.begin().await?;

    sqlx::query(
        "INSERT INTO blocks (
            id, name, description, category, execution_type,
            input_schema, output_schema, source_code, prompt_template,
            use_when, tags, examples, embedding, created_by, needs_network,
            updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, datetime('now'))
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            category = excluded.category,
            execution_type = excluded.execution_type,
            input_schema = excluded.input_schema,
            output_schema = excluded.output_schema,
            source_code = excluded.source_code,
            prompt_template = excluded.prompt_template,
            use_when = excluded.use_when,
            tags = excluded.tags,
            examples = excluded.examples,
            embedding = excluded.embedding,
            created_by = excluded.created_by,
            needs_network = excluded.needs_network,
            updated_at = datetime('now')",
    )
    .bind(&block.id)
    .bind(&block.name)
    .bind(&block.description)
    .bind(&category)
    .bind(execution_type)
    .bind(&input_schema)
    .bind(&output_schema)
    .bind(&block.source_code)
    .bind(&block.prompt_template)
    .bind(&block.use_when)
    .bind(&tags)
    .bind(&examples)
    .bind(&embedding)
    .bind(&created_by)
    .bind(block.needs_network)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM blocks_fts WHERE id = ?1")
        .bind(&block.id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO blocks_fts (id, name, description, use_when, tags) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&block.id)
    .bind(&block.name)
    .bind(&block.description)
    .bind(block.use_when.as_deref().unwrap_or_default())
    .bind(&tags)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    trace!(block_id = %block.id, "block saved");
    Ok(())
}
