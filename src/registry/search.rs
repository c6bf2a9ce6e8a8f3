//! Hybrid full-text + vector search over block definitions.
//!
//! When no query embedding is available, search falls back to FTS5 text
//! rank alone; when FTS5 finds nothing either, a case-insensitive
//! substring scan across id/name/description/tags is used as a last
//! resort (mirrors the reference registry's `_text_search` fallback).

use sqlx::SqlitePool;

use crate::types::{
    BlockCategory, BlockDefinition, BlockExample, CreatedBy, ExecutionType, Schema,
};

use super::RegistryError;

/// Raw row shape shared by every `SELECT * FROM blocks` query.
#[derive(sqlx::FromRow)]
struct BlockRow {
    id: String,
    name: String,
    description: String,
    category: String,
    execution_type: String,
    input_schema: String,
    output_schema: String,
    source_code: Option<String>,
    prompt_template: Option<String>,
    use_when: Option<String>,
    tags: String,
    examples: String,
    embedding: Option<String>,
    created_by: String,
    needs_network: bool,
    created_at: String,
    updated_at: String,
}

const SELECT_COLUMNS: &str = "id, name, description, category, execution_type, \
     input_schema, output_schema, source_code, prompt_template, use_when, \
     tags, examples, embedding, created_by, needs_network, created_at, updated_at";

/// Fetch a single block by id.
pub(super) async fn fetch_by_id(
    db: &SqlitePool,
    id: &str,
) -> Result<Option<BlockDefinition>, RegistryError> {
    let row: Option<BlockRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM blocks WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.map(row_to_block).transpose()
}

/// Fetch every block.
pub(super) async fn fetch_all(db: &SqlitePool) -> Result<Vec<BlockDefinition>, RegistryError> {
    let rows: Vec<BlockRow> =
        sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM blocks ORDER BY id"))
            .fetch_all(db)
            .await?;
    rows.into_iter().map(row_to_block).collect()
}

/// Fetch every block in a category.
pub(super) async fn fetch_by_category(
    db: &SqlitePool,
    category: &str,
) -> Result<Vec<BlockDefinition>, RegistryError> {
    let rows: Vec<BlockRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM blocks WHERE category = ?1 ORDER BY id"
    ))
    .bind(category)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(row_to_block).collect()
}

/// Combine FTS5 text rank and cosine similarity into one ranked list
/// (`SPEC_FULL.md` §4.A default weights: 0.4 text, 0.6 vector).
pub(super) async fn hybrid_search(
    db: &SqlitePool,
    query: &str,
    query_embedding: Option<&[f32]>,
    text_weight: f32,
    vector_weight: f32,
    limit: usize,
) -> Result<Vec<BlockDefinition>, RegistryError> {
    let text_hits = fts5_search(db, query, limit.saturating_mul(4).max(20)).await?;

    let mut scores: std::collections::HashMap<String, (f32, BlockDefinition)> =
        std::collections::HashMap::new();

    let text_count = text_hits.len();
    for (rank, block) in text_hits.into_iter().enumerate() {
        // FTS5 returns results already ranked; turn position into a
        // 0..1 relevance score, best match first.
        let score = text_weight * (1.0 - (rank as f32 / text_count.max(1) as f32));
        scores.insert(block.id.clone(), (score, block));
    }

    if let Some(query_vec) = query_embedding {
        let all = fetch_all(db).await?;
        for block in all {
            let Some(block_vec) = block.embedding.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(query_vec, block_vec);
            let contribution = vector_weight * similarity.max(0.0);
            scores
                .entry(block.id.clone())
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, block));
        }
    }

    if scores.is_empty() {
        return substring_search(db, query, limit).await;
    }

    let mut ranked: Vec<(f32, BlockDefinition)> = scores.into_values().collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked.into_iter().take(limit).map(|(_, b)| b).collect())
}

/// Cosine similarity between two equal-length vectors; `0.0` on mismatch.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Full-text search via FTS5 MATCH, joined back to `blocks`.
async fn fts5_search(
    db: &SqlitePool,
    query: &str,
    limit: usize,
) -> Result<Vec<BlockDefinition>, RegistryError> {
    let sanitized = sanitise_fts5_query(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }

    let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
    let columns = SELECT_COLUMNS
        .split(", ")
        .map(|c| format!("b.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    let rows: Vec<BlockRow> = sqlx::query_as(&format!(
        "SELECT {columns} \
         FROM blocks_fts f \
         JOIN blocks b ON f.id = b.id \
         WHERE blocks_fts MATCH ?1 \
         ORDER BY f.rank \
         LIMIT ?2"
    ))
    .bind(&sanitized)
    .bind(limit_i64)
    .fetch_all(db)
    .await?;

    rows.into_iter().map(row_to_block).collect()
}

/// Case-insensitive substring scan across id/name/description/tags — the
/// last-resort path when FTS5 and vector search both find nothing.
async fn substring_search(
    db: &SqlitePool,
    query: &str,
    limit: usize,
) -> Result<Vec<BlockDefinition>, RegistryError> {
    let needle = format!("%{}%", query.trim().to_lowercase());
    if needle == "%%" {
        return Ok(Vec::new());
    }
    let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<BlockRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM blocks \
         WHERE lower(id) LIKE ?1 OR lower(name) LIKE ?1 \
            OR lower(description) LIKE ?1 OR lower(tags) LIKE ?1 \
         ORDER BY id LIMIT ?2"
    ))
    .bind(&needle)
    .bind(limit_i64)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(row_to_block).collect()
}

/// Strip FTS5 operator characters/keywords so free-text queries never
/// trigger a MATCH syntax error.
fn sanitise_fts5_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' || c == '_' { c } else { ' ' })
        .collect();

    const FTS5_KEYWORDS: &[&str] = &["OR", "NOT", "AND", "NEAR"];
    let tokens: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|t| !FTS5_KEYWORDS.contains(t))
        .collect();
    tokens.join(" ")
}

fn row_to_block(row: BlockRow) -> Result<BlockDefinition, RegistryError> {
    let BlockRow {
        id,
        name,
        description,
        category,
        execution_type,
        input_schema,
        output_schema,
        source_code,
        prompt_template,
        use_when,
        tags,
        examples,
        embedding,
        created_by,
        needs_network,
        created_at,
        updated_at,
    } = row;

    let category = match category.as_str() {
        "input" => BlockCategory::Input,
        "process" => BlockCategory::Process,
        "action" => BlockCategory::Action,
        "memory" => BlockCategory::Memory,
        "trigger" => BlockCategory::Trigger,
        "control" => BlockCategory::Control,
        other => return Err(RegistryError::Decode(format!("unknown category: {other}"))),
    };

    let execution_type = ExecutionType::from_legacy(&execution_type)
        .ok_or_else(|| RegistryError::Decode(format!("unknown execution_type: {execution_type}")))?;

    let created_by = match created_by.as_str() {
        "system" => CreatedBy::System,
        "planner" => CreatedBy::Planner,
        "synthesizer" => CreatedBy::Synthesizer,
        "user" => CreatedBy::User,
        other => return Err(RegistryError::Decode(format!("unknown created_by: {other}"))),
    };

    let input_schema: Schema = serde_json::from_str(&input_schema)
        .map_err(|e| RegistryError::Decode(format!("input_schema: {e}")))?;
    let output_schema: Schema = serde_json::from_str(&output_schema)
        .map_err(|e| RegistryError::Decode(format!("output_schema: {e}")))?;
    let tags: Vec<String> =
        serde_json::from_str(&tags).map_err(|e| RegistryError::Decode(format!("tags: {e}")))?;
    let examples: Vec<BlockExample> = serde_json::from_str(&examples)
        .map_err(|e| RegistryError::Decode(format!("examples: {e}")))?;
    let embedding = embedding
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| RegistryError::Decode(format!("embedding: {e}")))?;

    Ok(BlockDefinition {
        id,
        name,
        description,
        category,
        execution_type,
        input_schema,
        output_schema,
        source_code,
        prompt_template,
        use_when,
        tags,
        examples,
        embedding,
        created_by,
        needs_network,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(&updated_at, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_sanitise_fts5_query_strips_keywords_and_operators() {
        let sanitized = sanitise_fts5_query("search OR \"web\" NEAR delete");
        assert_eq!(sanitized, "search web delete");
    }
}
