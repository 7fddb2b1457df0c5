//! Chunk-to-concept mention links.
//!
//! The composite key (chunk, concept, mention_type) permits multiple
//! mention types per pair but not duplicates of the same type. The batched
//! `concept_ids_for_chunks` lookup is what keeps graph-boosted search to
//! one query for a whole candidate set.

use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{KbError, Result};
use crate::models::{parse_uuid, ChunkConcept, MentionType};

pub async fn create(
    pool: &SqlitePool,
    chunk_id: Uuid,
    concept_id: Uuid,
    mention_type: MentionType,
    relevance_score: Option<f64>,
) -> Result<ChunkConcept> {
    if let Some(score) = relevance_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(KbError::Validation(format!(
                "relevance_score must be in [0, 1], got {}",
                score
            )));
        }
    }

    let link = ChunkConcept {
        chunk_id,
        concept_id,
        mention_type,
        relevance_score,
        created_at: chrono::Utc::now().timestamp(),
    };

    sqlx::query(
        r#"
        INSERT INTO chunk_concepts (chunk_id, concept_id, mention_type, relevance_score, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (chunk_id, concept_id, mention_type) DO UPDATE SET
            relevance_score = excluded.relevance_score
        "#,
    )
    .bind(link.chunk_id.to_string())
    .bind(link.concept_id.to_string())
    .bind(link.mention_type.as_str())
    .bind(link.relevance_score)
    .bind(link.created_at)
    .execute(pool)
    .await?;

    debug!(chunk_id = %chunk_id, concept_id = %concept_id, "chunk-concept link created");
    Ok(link)
}

pub async fn list_for_chunk(pool: &SqlitePool, chunk_id: Uuid) -> Result<Vec<ChunkConcept>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM chunk_concepts
        WHERE chunk_id = ?
        ORDER BY relevance_score DESC, concept_id ASC
        "#,
    )
    .bind(chunk_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_chunk_concept).collect()
}

pub async fn list_for_concept(pool: &SqlitePool, concept_id: Uuid) -> Result<Vec<ChunkConcept>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM chunk_concepts
        WHERE concept_id = ?
        ORDER BY relevance_score DESC, chunk_id ASC
        "#,
    )
    .bind(concept_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_chunk_concept).collect()
}

pub async fn count_for_concept(pool: &SqlitePool, concept_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_concepts WHERE concept_id = ?")
        .bind(concept_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete(
    pool: &SqlitePool,
    chunk_id: Uuid,
    concept_id: Uuid,
    mention_type: MentionType,
) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM chunk_concepts WHERE chunk_id = ? AND concept_id = ? AND mention_type = ?",
    )
    .bind(chunk_id.to_string())
    .bind(concept_id.to_string())
    .bind(mention_type.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Concept ids for a whole set of chunks in one round-trip.
///
/// Chunks without links are absent from the map.
pub async fn concept_ids_for_chunks(
    pool: &SqlitePool,
    chunk_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<Uuid>>> {
    if chunk_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; chunk_ids.len()].join(", ");
    let sql = format!(
        "SELECT DISTINCT chunk_id, concept_id FROM chunk_concepts WHERE chunk_id IN ({}) ORDER BY chunk_id, concept_id",
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for id in chunk_ids {
        query = query.bind(id.to_string());
    }

    let rows = query.fetch_all(pool).await?;

    let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for row in &rows {
        let chunk_id: String = row.get("chunk_id");
        let concept_id: String = row.get("concept_id");
        map.entry(parse_uuid(&chunk_id)?)
            .or_default()
            .push(parse_uuid(&concept_id)?);
    }
    Ok(map)
}

fn row_to_chunk_concept(row: &SqliteRow) -> Result<ChunkConcept> {
    let chunk_id: String = row.get("chunk_id");
    let concept_id: String = row.get("concept_id");
    let mention: String = row.get("mention_type");

    Ok(ChunkConcept {
        chunk_id: parse_uuid(&chunk_id)?,
        concept_id: parse_uuid(&concept_id)?,
        mention_type: MentionType::parse(&mention).ok_or_else(|| {
            KbError::Validation(format!("unknown mention_type '{}'", mention))
        })?,
        relevance_score: row.get("relevance_score"),
        created_at: row.get("created_at"),
    })
}
