//! Relationship store: directed, typed edges between concepts.
//!
//! Edges are unique on (source, target, type). Self-loops are rejected at
//! this boundary. `create_or_ignore` gives the ingestion pipeline
//! insert-or-ignore semantics: a re-extracted edge is a no-op rather than
//! a failure.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{is_unique_violation, KbError, Result};
use crate::models::{
    parse_uuid, parse_uuid_list, uuid_list_to_json, ConceptRelationship, NewRelationship,
    RelationshipType,
};

fn validate(new: &NewRelationship) -> Result<()> {
    if new.source_concept_id == new.target_concept_id {
        return Err(KbError::Validation(format!(
            "self-loop relationship rejected for concept {}",
            new.source_concept_id
        )));
    }
    if !(0.0..=1.0).contains(&new.strength) {
        return Err(KbError::Validation(format!(
            "strength must be in [0, 1], got {}",
            new.strength
        )));
    }
    if let Some(score) = new.confidence_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(KbError::Validation(format!(
                "confidence_score must be in [0, 1], got {}",
                score
            )));
        }
    }
    Ok(())
}

pub async fn create(pool: &SqlitePool, new: NewRelationship) -> Result<ConceptRelationship> {
    validate(&new)?;

    let rel = ConceptRelationship {
        id: Uuid::new_v4(),
        source_concept_id: new.source_concept_id,
        target_concept_id: new.target_concept_id,
        relationship_type: new.relationship_type,
        is_directed: new.is_directed,
        strength: new.strength,
        confidence_score: new.confidence_score,
        evidence_chunk_ids: new.evidence_chunk_ids,
        created_at: chrono::Utc::now().timestamp(),
    };

    let insert = sqlx::query(
        r#"
        INSERT INTO concept_relationships (
            id, source_concept_id, target_concept_id, relationship_type,
            is_directed, strength, confidence_score, evidence_chunk_ids, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rel.id.to_string())
    .bind(rel.source_concept_id.to_string())
    .bind(rel.target_concept_id.to_string())
    .bind(rel.relationship_type.as_str())
    .bind(rel.is_directed)
    .bind(rel.strength)
    .bind(rel.confidence_score)
    .bind(uuid_list_to_json(&rel.evidence_chunk_ids)?)
    .bind(rel.created_at)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {
            info!(
                relationship_id = %rel.id,
                source = %rel.source_concept_id,
                target = %rel.target_concept_id,
                relationship_type = rel.relationship_type.as_str(),
                "relationship created"
            );
            Ok(rel)
        }
        Err(e) if is_unique_violation(&e) => Err(KbError::Duplicate {
            entity: "relationship",
            key: "(source, target, type)",
            value: format!(
                "{} -[{}]-> {}",
                rel.source_concept_id,
                rel.relationship_type.as_str(),
                rel.target_concept_id
            ),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Insert-or-ignore variant: an existing (source, target, type) edge makes
/// this a no-op and returns `None`.
pub async fn create_or_ignore(
    pool: &SqlitePool,
    new: NewRelationship,
) -> Result<Option<ConceptRelationship>> {
    match create(pool, new).await {
        Ok(rel) => Ok(Some(rel)),
        Err(KbError::Duplicate { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<ConceptRelationship>> {
    let row = sqlx::query("SELECT * FROM concept_relationships WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_relationship).transpose()
}

pub async fn get_between(
    pool: &SqlitePool,
    source_concept_id: Uuid,
    target_concept_id: Uuid,
    relationship_type: Option<RelationshipType>,
) -> Result<Option<ConceptRelationship>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM concept_relationships
        WHERE source_concept_id = ?1
          AND target_concept_id = ?2
          AND (?3 IS NULL OR relationship_type = ?3)
        ORDER BY relationship_type ASC
        LIMIT 1
        "#,
    )
    .bind(source_concept_id.to_string())
    .bind(target_concept_id.to_string())
    .bind(relationship_type.map(|t| t.as_str()))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_relationship).transpose()
}

/// Outgoing edges from a concept, strongest first.
pub async fn list_from(
    pool: &SqlitePool,
    concept_id: Uuid,
    relationship_type: Option<RelationshipType>,
    limit: i64,
) -> Result<Vec<ConceptRelationship>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM concept_relationships
        WHERE source_concept_id = ?1
          AND (?2 IS NULL OR relationship_type = ?2)
        ORDER BY strength DESC, id ASC
        LIMIT ?3
        "#,
    )
    .bind(concept_id.to_string())
    .bind(relationship_type.map(|t| t.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_relationship).collect()
}

/// Incoming edges to a concept, strongest first.
pub async fn list_to(
    pool: &SqlitePool,
    concept_id: Uuid,
    relationship_type: Option<RelationshipType>,
    limit: i64,
) -> Result<Vec<ConceptRelationship>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM concept_relationships
        WHERE target_concept_id = ?1
          AND (?2 IS NULL OR relationship_type = ?2)
        ORDER BY strength DESC, id ASC
        LIMIT ?3
        "#,
    )
    .bind(concept_id.to_string())
    .bind(relationship_type.map(|t| t.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_relationship).collect()
}

/// All edges a traversal from this concept may follow: outgoing edges plus
/// undirected incoming ones.
pub async fn list_for_concept(
    pool: &SqlitePool,
    concept_id: Uuid,
    limit: i64,
) -> Result<Vec<ConceptRelationship>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM concept_relationships
        WHERE source_concept_id = ?1
           OR (target_concept_id = ?1 AND is_directed = 0)
        ORDER BY strength DESC, id ASC
        LIMIT ?2
        "#,
    )
    .bind(concept_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_relationship).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concept_relationships")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM concept_relationships WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    let deleted = result.rows_affected() > 0;
    if deleted {
        info!(relationship_id = %id, "relationship deleted");
    } else {
        warn!(relationship_id = %id, "relationship not found for delete");
    }
    Ok(deleted)
}

pub(crate) fn row_to_relationship(row: &SqliteRow) -> Result<ConceptRelationship> {
    let id: String = row.get("id");
    let source: String = row.get("source_concept_id");
    let target: String = row.get("target_concept_id");
    let type_str: String = row.get("relationship_type");
    let evidence: String = row.get("evidence_chunk_ids");

    Ok(ConceptRelationship {
        id: parse_uuid(&id)?,
        source_concept_id: parse_uuid(&source)?,
        target_concept_id: parse_uuid(&target)?,
        relationship_type: RelationshipType::parse(&type_str).ok_or_else(|| {
            KbError::Validation(format!("unknown relationship_type '{}'", type_str))
        })?,
        is_directed: row.get("is_directed"),
        strength: row.get("strength"),
        confidence_score: row.get("confidence_score"),
        evidence_chunk_ids: parse_uuid_list(&evidence)?,
        created_at: row.get("created_at"),
    })
}
