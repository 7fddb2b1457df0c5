//! Chunk store: content units with embeddings and derived full-text rows.
//!
//! Chunks are immutable after ingestion apart from embedding backfill.
//! `batch_create` is transactional so a crash mid-embedding never leaves a
//! partially-visible batch. The FTS index row for each chunk is written by
//! database triggers on insert and delete, never here.

use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{KbError, Result};
use crate::models::{parse_metadata, parse_uuid, Chunk, NewChunk};

/// SHA-256 of chunk content, hex-encoded. Stable under re-extraction of
/// identical text.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_chunk(config: &Config, new: NewChunk) -> Result<Chunk> {
    if new.content.trim().is_empty() {
        return Err(KbError::Validation("chunk content must be non-empty".to_string()));
    }
    if let Some(embedding) = &new.embedding {
        validate_dims(config, embedding)?;
    }

    let hash = new
        .content_hash
        .unwrap_or_else(|| content_hash(&new.content));

    Ok(Chunk {
        id: Uuid::new_v4(),
        source_id: new.source_id,
        content: new.content,
        content_hash: hash,
        location: new.location,
        page_start: new.page_start,
        page_end: new.page_end,
        embedding: new.embedding,
        metadata: new.metadata,
        created_at: chrono::Utc::now().timestamp(),
    })
}

fn validate_dims(config: &Config, embedding: &[f32]) -> Result<()> {
    if embedding.len() != config.embedding.dims {
        return Err(KbError::Validation(format!(
            "embedding must be {} dimensions, got {}",
            config.embedding.dims,
            embedding.len()
        )));
    }
    Ok(())
}

pub async fn create(pool: &SqlitePool, config: &Config, new: NewChunk) -> Result<Chunk> {
    let chunk = build_chunk(config, new)?;

    sqlx::query(
        r#"
        INSERT INTO chunks (
            id, source_id, content, content_hash, location,
            page_start, page_end, embedding, metadata, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(chunk.id.to_string())
    .bind(chunk.source_id.to_string())
    .bind(&chunk.content)
    .bind(&chunk.content_hash)
    .bind(&chunk.location)
    .bind(chunk.page_start)
    .bind(chunk.page_end)
    .bind(chunk.embedding.as_deref().map(vec_to_blob))
    .bind(serde_json::to_string(&chunk.metadata)?)
    .bind(chunk.created_at)
    .execute(pool)
    .await?;

    info!(
        chunk_id = %chunk.id,
        source_id = %chunk.source_id,
        content_length = chunk.content.len(),
        has_embedding = chunk.embedding.is_some(),
        "chunk created"
    );
    Ok(chunk)
}

/// Insert a batch of chunks inside a single transaction.
///
/// Either every chunk is persisted or none are — readers never observe a
/// torn batch.
pub async fn batch_create(
    pool: &SqlitePool,
    config: &Config,
    new_chunks: Vec<NewChunk>,
) -> Result<Vec<Chunk>> {
    if new_chunks.is_empty() {
        return Ok(Vec::new());
    }

    // Validate before opening the transaction
    let chunks: Vec<Chunk> = new_chunks
        .into_iter()
        .map(|new| build_chunk(config, new))
        .collect::<Result<_>>()?;

    let mut tx = pool.begin().await?;

    for chunk in &chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                id, source_id, content, content_hash, location,
                page_start, page_end, embedding, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.id.to_string())
        .bind(chunk.source_id.to_string())
        .bind(&chunk.content)
        .bind(&chunk.content_hash)
        .bind(&chunk.location)
        .bind(chunk.page_start)
        .bind(chunk.page_end)
        .bind(chunk.embedding.as_deref().map(vec_to_blob))
        .bind(serde_json::to_string(&chunk.metadata)?)
        .bind(chunk.created_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(count = chunks.len(), "chunk batch created");
    Ok(chunks)
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Chunk>> {
    let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_chunk).transpose()
}

pub async fn list_by_source(pool: &SqlitePool, source_id: Uuid) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE source_id = ? ORDER BY created_at ASC, id ASC")
        .bind(source_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_chunk).collect()
}

pub async fn count_by_source(pool: &SqlitePool, source_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source_id = ?")
        .bind(source_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Backfill or replace a chunk's embedding vector.
pub async fn update_embedding(
    pool: &SqlitePool,
    config: &Config,
    id: Uuid,
    embedding: &[f32],
) -> Result<()> {
    validate_dims(config, embedding)?;

    let result = sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
        .bind(vec_to_blob(embedding))
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(KbError::NotFound {
            entity: "chunk",
            id: id.to_string(),
        });
    }
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.get("id");
    let source_id: String = row.get("source_id");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let metadata: String = row.get("metadata");

    Ok(Chunk {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source_id)?,
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        location: row.get("location"),
        page_start: row.get("page_start"),
        page_end: row.get("page_end"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        metadata: parse_metadata(&metadata)?,
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash("the backdoor criterion");
        let b = content_hash("the backdoor criterion");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_hash_differs() {
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }
}
