//! Source store: CRUD and idempotent ingestion for source documents.
//!
//! `file_hash` is the idempotency key. `create` treats a duplicate hash as
//! a conflict; `create_or_get` is the lookup-and-return-existing variant
//! the ingestion pipeline uses, so re-ingesting an identical file never
//! produces a second row.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{is_unique_violation, KbError, Result};
use crate::models::{parse_metadata, parse_string_list, parse_uuid, Metadata, NewSource, Source, SourceType};

pub async fn create(pool: &SqlitePool, new: NewSource) -> Result<Source> {
    if new.file_hash.trim().is_empty() {
        return Err(KbError::Validation("file_hash must be non-empty".to_string()));
    }
    if new.title.trim().is_empty() {
        return Err(KbError::Validation("title must be non-empty".to_string()));
    }

    let source = Source {
        id: Uuid::new_v4(),
        source_type: new.source_type,
        title: new.title,
        authors: new.authors,
        year: new.year,
        file_path: new.file_path,
        file_hash: new.file_hash,
        citation_authority: 0.0,
        metadata: new.metadata,
        created_at: chrono::Utc::now().timestamp(),
        updated_at: chrono::Utc::now().timestamp(),
    };

    let insert = sqlx::query(
        r#"
        INSERT INTO sources (
            id, source_type, title, authors, year,
            file_path, file_hash, citation_authority, metadata,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source.id.to_string())
    .bind(source.source_type.as_str())
    .bind(&source.title)
    .bind(serde_json::to_string(&source.authors)?)
    .bind(source.year)
    .bind(&source.file_path)
    .bind(&source.file_hash)
    .bind(source.citation_authority)
    .bind(serde_json::to_string(&source.metadata)?)
    .bind(source.created_at)
    .bind(source.updated_at)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {
            info!(source_id = %source.id, title = %source.title, "source created");
            Ok(source)
        }
        Err(e) if is_unique_violation(&e) => Err(KbError::Duplicate {
            entity: "source",
            key: "file_hash",
            value: source.file_hash,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Idempotent create: returns the existing source when the file hash is
/// already known. The boolean is true when a new row was inserted.
pub async fn create_or_get(pool: &SqlitePool, new: NewSource) -> Result<(Source, bool)> {
    if let Some(existing) = get_by_file_hash(pool, &new.file_hash).await? {
        info!(source_id = %existing.id, file_hash = %existing.file_hash, "source already ingested");
        return Ok((existing, false));
    }

    match create(pool, new.clone()).await {
        Ok(source) => Ok((source, true)),
        // Lost a race against a concurrent ingest of the same file
        Err(KbError::Duplicate { .. }) => {
            let existing = get_by_file_hash(pool, &new.file_hash)
                .await?
                .ok_or_else(|| KbError::NotFound {
                    entity: "source",
                    id: new.file_hash.clone(),
                })?;
            Ok((existing, false))
        }
        Err(e) => Err(e),
    }
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Source>> {
    let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_source).transpose()
}

pub async fn get_by_file_hash(pool: &SqlitePool, file_hash: &str) -> Result<Option<Source>> {
    let row = sqlx::query("SELECT * FROM sources WHERE file_hash = ?")
        .bind(file_hash)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_source).transpose()
}

/// Merge a metadata patch into the stored map and bump `updated_at`.
pub async fn update_metadata(pool: &SqlitePool, id: Uuid, patch: Metadata) -> Result<Source> {
    let mut source = get_by_id(pool, id).await?.ok_or_else(|| KbError::NotFound {
        entity: "source",
        id: id.to_string(),
    })?;

    for (key, value) in patch {
        source.metadata.insert(key, value);
    }
    source.updated_at = chrono::Utc::now().timestamp();

    sqlx::query("UPDATE sources SET metadata = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(&source.metadata)?)
        .bind(source.updated_at)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    info!(source_id = %id, "source metadata updated");
    Ok(source)
}

pub async fn set_citation_authority(pool: &SqlitePool, id: Uuid, score: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&score) {
        return Err(KbError::Validation(format!(
            "citation_authority must be in [0, 1], got {}",
            score
        )));
    }

    let result = sqlx::query("UPDATE sources SET citation_authority = ? WHERE id = ?")
        .bind(score)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(KbError::NotFound {
            entity: "source",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Delete a source and everything it owns.
///
/// Chunks are deleted directly (not via the foreign-key cascade) so the
/// FTS maintenance triggers fire; citations and citation edges cascade.
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE source_id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM sources WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let deleted = result.rows_affected() > 0;
    if deleted {
        info!(source_id = %id, "source deleted");
    } else {
        warn!(source_id = %id, "source not found for delete");
    }
    Ok(deleted)
}

pub async fn list(
    pool: &SqlitePool,
    source_type: Option<SourceType>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Source>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM sources
        WHERE (?1 IS NULL OR source_type = ?1)
        ORDER BY created_at DESC, id ASC
        LIMIT ?2 OFFSET ?3
        "#,
    )
    .bind(source_type.map(|t| t.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_source).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub(crate) fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let id: String = row.get("id");
    let type_str: String = row.get("source_type");
    let authors: String = row.get("authors");
    let metadata: String = row.get("metadata");

    Ok(Source {
        id: parse_uuid(&id)?,
        source_type: SourceType::parse(&type_str).ok_or_else(|| {
            KbError::Validation(format!("unknown source_type '{}'", type_str))
        })?,
        title: row.get("title"),
        authors: parse_string_list(&authors)?,
        year: row.get("year"),
        file_path: row.get("file_path"),
        file_hash: row.get("file_hash"),
        citation_authority: row.get("citation_authority"),
        metadata: parse_metadata(&metadata)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
