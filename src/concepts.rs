//! Concept store: CRUD, canonical-name upserts, and lookup paths.
//!
//! `canonical_name` is the merge key: `upsert` folds repeated extractions
//! of the same concept into one row (alias union, best definition, max
//! confidence) instead of creating duplicates. Lookup is by id, canonical
//! name, alias, fuzzy similarity, or embedding similarity.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::embedding::{blob_to_vec, cosine_similarity, similarity_to_unit, vec_to_blob};
use crate::error::{is_unique_violation, KbError, Result};
use crate::models::{
    parse_metadata, parse_string_list, parse_uuid, Concept, ConceptType, NewConcept,
};

fn validate(new: &NewConcept) -> Result<()> {
    if new.name.trim().is_empty() {
        return Err(KbError::Validation("concept name must be non-empty".to_string()));
    }
    if new.canonical_name.trim().is_empty() {
        return Err(KbError::Validation(
            "canonical_name must be non-empty".to_string(),
        ));
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

pub async fn create(pool: &SqlitePool, new: NewConcept) -> Result<Concept> {
    validate(&new)?;

    let concept = Concept {
        id: Uuid::new_v4(),
        name: new.name,
        canonical_name: new.canonical_name,
        aliases: new.aliases,
        concept_type: new.concept_type,
        category: new.category,
        definition: new.definition,
        embedding: new.embedding,
        extraction_method: new.extraction_method,
        confidence_score: new.confidence_score,
        validated: new.validated,
        metadata: new.metadata,
        created_at: chrono::Utc::now().timestamp(),
    };

    let insert = sqlx::query(
        r#"
        INSERT INTO concepts (
            id, name, canonical_name, aliases, concept_type,
            category, definition, embedding, extraction_method,
            confidence_score, validated, metadata, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(concept.id.to_string())
    .bind(&concept.name)
    .bind(&concept.canonical_name)
    .bind(serde_json::to_string(&concept.aliases)?)
    .bind(concept.concept_type.as_str())
    .bind(&concept.category)
    .bind(&concept.definition)
    .bind(concept.embedding.as_deref().map(vec_to_blob))
    .bind(&concept.extraction_method)
    .bind(concept.confidence_score)
    .bind(concept.validated)
    .bind(serde_json::to_string(&concept.metadata)?)
    .bind(concept.created_at)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {
            info!(
                concept_id = %concept.id,
                canonical_name = %concept.canonical_name,
                concept_type = concept.concept_type.as_str(),
                "concept created"
            );
            Ok(concept)
        }
        Err(e) if is_unique_violation(&e) => Err(KbError::Duplicate {
            entity: "concept",
            key: "canonical_name",
            value: concept.canonical_name,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Create the concept or merge into the existing row with the same
/// canonical name. The boolean is true when a new row was inserted.
///
/// Merge rules: aliases are unioned (the incoming display name becomes an
/// alias when it differs), the longest non-empty definition wins,
/// confidence takes the maximum, validation is sticky, metadata patches
/// key-by-key, and an embedding is only adopted when none is stored.
pub async fn upsert(pool: &SqlitePool, new: NewConcept) -> Result<(Concept, bool)> {
    validate(&new)?;

    let existing = get_by_canonical_name(pool, &new.canonical_name).await?;
    let Some(mut concept) = existing else {
        return match create(pool, new.clone()).await {
            Ok(created) => Ok((created, true)),
            // Lost a race against a concurrent upsert of the same name
            Err(KbError::Duplicate { .. }) => {
                let refetched = get_by_canonical_name(pool, &new.canonical_name)
                    .await?
                    .ok_or_else(|| KbError::NotFound {
                        entity: "concept",
                        id: new.canonical_name.clone(),
                    })?;
                merge_into(pool, refetched, new).await.map(|c| (c, false))
            }
            Err(e) => Err(e),
        };
    };

    concept = merge_into(pool, concept, new).await?;
    Ok((concept, false))
}

async fn merge_into(pool: &SqlitePool, mut concept: Concept, new: NewConcept) -> Result<Concept> {
    let mut aliases: std::collections::BTreeSet<String> =
        concept.aliases.iter().cloned().collect();
    aliases.extend(new.aliases.iter().cloned());
    if new.name != concept.name {
        aliases.insert(new.name.clone());
    }
    aliases.remove(&concept.name);
    concept.aliases = aliases.into_iter().collect();

    let current_len = concept.definition.as_deref().map_or(0, str::len);
    if let Some(def) = new.definition {
        if def.len() > current_len {
            concept.definition = Some(def);
        }
    }

    concept.confidence_score = match (concept.confidence_score, new.confidence_score) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    concept.validated = concept.validated || new.validated;

    if concept.embedding.is_none() {
        concept.embedding = new.embedding;
    }
    if concept.category.is_none() {
        concept.category = new.category;
    }
    for (key, value) in new.metadata {
        concept.metadata.insert(key, value);
    }

    sqlx::query(
        r#"
        UPDATE concepts
        SET aliases = ?, definition = ?, embedding = ?, category = ?,
            confidence_score = ?, validated = ?, metadata = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(&concept.aliases)?)
    .bind(&concept.definition)
    .bind(concept.embedding.as_deref().map(vec_to_blob))
    .bind(&concept.category)
    .bind(concept.confidence_score)
    .bind(concept.validated)
    .bind(serde_json::to_string(&concept.metadata)?)
    .bind(concept.id.to_string())
    .execute(pool)
    .await?;

    debug!(
        concept_id = %concept.id,
        canonical_name = %concept.canonical_name,
        "concept merged"
    );
    Ok(concept)
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Concept>> {
    let row = sqlx::query("SELECT * FROM concepts WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_concept).transpose()
}

pub async fn get_by_canonical_name(pool: &SqlitePool, canonical_name: &str) -> Result<Option<Concept>> {
    let row = sqlx::query("SELECT * FROM concepts WHERE canonical_name = ?")
        .bind(canonical_name)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_concept).transpose()
}

/// Look up a concept whose alias set contains the given canonical form.
pub async fn find_by_alias(pool: &SqlitePool, alias: &str) -> Result<Option<Concept>> {
    let row = sqlx::query(
        r#"
        SELECT c.* FROM concepts c
        WHERE EXISTS (
            SELECT 1 FROM json_each(c.aliases)
            WHERE lower(json_each.value) = lower(?)
        )
        ORDER BY c.canonical_name ASC
        LIMIT 1
        "#,
    )
    .bind(alias)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_concept).transpose()
}

/// Resolve a free-form name: canonical match, then alias match, then the
/// best fuzzy match at or above the deduplicator's threshold.
pub async fn resolve_name(
    pool: &SqlitePool,
    dedup: &Deduplicator,
    name: &str,
) -> Result<Option<Concept>> {
    let canonical = dedup.to_canonical_name(name);

    if let Some(concept) = get_by_canonical_name(pool, &canonical).await? {
        return Ok(Some(concept));
    }
    if let Some(concept) = find_by_alias(pool, &canonical).await? {
        return Ok(Some(concept));
    }

    let mut best: Option<(Concept, f64)> = None;
    for concept in list(pool, 1000, 0).await? {
        let sim = dedup.similarity(&canonical, &concept.canonical_name);
        if dedup.are_duplicates(&canonical, &concept.canonical_name)
            && best.as_ref().map_or(true, |(_, s)| sim > *s)
        {
            best = Some((concept, sim));
        }
    }
    Ok(best.map(|(c, _)| c))
}

/// Find concepts whose embeddings are similar to the query embedding.
/// Returns (concept, similarity) pairs, similarity in [0, 1], best first.
pub async fn find_similar(
    pool: &SqlitePool,
    embedding: &[f32],
    threshold: f64,
    limit: usize,
) -> Result<Vec<(Concept, f64)>> {
    let rows = sqlx::query("SELECT * FROM concepts WHERE embedding IS NOT NULL")
        .fetch_all(pool)
        .await?;

    let mut scored: Vec<(Concept, f64)> = Vec::new();
    for row in &rows {
        let concept = row_to_concept(row)?;
        if let Some(stored) = concept.embedding.as_deref() {
            let sim = similarity_to_unit(cosine_similarity(embedding, stored));
            if sim >= threshold {
                scored.push((concept, sim));
            }
        }
    }

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    scored.truncate(limit);
    Ok(scored)
}

/// Extract ids of known concepts mentioned in a piece of query text.
///
/// Case-insensitive containment of canonical names and aliases; aliases of
/// three characters or fewer require word boundaries so "ate" does not
/// fire inside "treatment". Returns an empty list rather than erroring —
/// graph enrichment must never break a search.
pub async fn match_in_text(pool: &SqlitePool, text: &str, max: usize) -> Result<Vec<Uuid>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let query_lower = text.to_lowercase();
    let concepts = list(pool, 1000, 0).await?;

    let mut matched: Vec<(String, Uuid)> = Vec::new();

    for concept in &concepts {
        if query_lower.contains(&concept.canonical_name) {
            matched.push((concept.canonical_name.clone(), concept.id));
            debug!(
                concept_id = %concept.id,
                canonical_name = %concept.canonical_name,
                match_type = "canonical_name",
                "query concept matched"
            );
            continue;
        }

        for alias in &concept.aliases {
            let alias_lower = alias.to_lowercase();
            if alias_lower.is_empty() {
                continue;
            }
            let hit = if alias_lower.len() <= 3 {
                match regex::Regex::new(&format!(r"\b{}\b", regex::escape(&alias_lower))) {
                    Ok(re) => re.is_match(&query_lower),
                    Err(_) => false,
                }
            } else {
                query_lower.contains(&alias_lower)
            };
            if hit {
                matched.push((concept.canonical_name.clone(), concept.id));
                debug!(
                    concept_id = %concept.id,
                    alias = %alias,
                    match_type = "alias",
                    "query concept matched"
                );
                break;
            }
        }
    }

    matched.sort();
    matched.dedup_by_key(|(_, id)| *id);
    matched.truncate(max);
    Ok(matched.into_iter().map(|(_, id)| id).collect())
}

pub async fn list(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Concept>> {
    let rows = sqlx::query("SELECT * FROM concepts ORDER BY canonical_name ASC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_concept).collect()
}

pub async fn list_by_type(
    pool: &SqlitePool,
    concept_type: ConceptType,
    limit: i64,
    offset: i64,
) -> Result<Vec<Concept>> {
    let rows = sqlx::query(
        "SELECT * FROM concepts WHERE concept_type = ? ORDER BY canonical_name ASC LIMIT ? OFFSET ?",
    )
    .bind(concept_type.as_str())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_concept).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concepts")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn set_validated(pool: &SqlitePool, id: Uuid, validated: bool) -> Result<()> {
    let result = sqlx::query("UPDATE concepts SET validated = ? WHERE id = ?")
        .bind(validated)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(KbError::NotFound {
            entity: "concept",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Delete a concept; relationships and chunk links cascade.
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM concepts WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    let deleted = result.rows_affected() > 0;
    if deleted {
        info!(concept_id = %id, "concept deleted");
    } else {
        warn!(concept_id = %id, "concept not found for delete");
    }
    Ok(deleted)
}

// ============ CLI commands ============

/// `rkb concepts list`: print concepts, optionally filtered by type.
pub async fn run_list(
    config: &crate::config::Config,
    concept_type: Option<&str>,
    limit: i64,
) -> anyhow::Result<()> {
    let filter = match concept_type {
        Some(raw) => Some(ConceptType::parse(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown concept type: {}. Use method, assumption, problem, definition, or theorem.",
                raw
            )
        })?),
        None => None,
    };

    let pool = crate::db::connect(config).await?;
    let listed = match filter {
        Some(concept_type) => list_by_type(&pool, concept_type, limit, 0).await?,
        None => list(&pool, limit, 0).await?,
    };

    if listed.is_empty() {
        println!("No concepts.");
    } else {
        for concept in &listed {
            let marker = if concept.validated { "*" } else { " " };
            println!(
                "{} [{:<10}] {}",
                marker,
                concept.concept_type.as_str(),
                concept.canonical_name
            );
        }
        println!();
        println!("{} concepts", listed.len());
    }

    pool.close().await;
    Ok(())
}

/// `rkb concepts show`: print one concept with its aliases and edges.
pub async fn run_show(config: &crate::config::Config, name: &str) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let dedup = Deduplicator::new(&config.dedup);

    let Some(concept) = resolve_name(&pool, &dedup, name).await? else {
        println!("Unknown concept: {}", name);
        pool.close().await;
        return Ok(());
    };

    println!("{}", concept.name);
    println!("  id:         {}", concept.id);
    println!("  canonical:  {}", concept.canonical_name);
    println!("  type:       {}", concept.concept_type.as_str());
    if let Some(category) = &concept.category {
        println!("  category:   {}", category);
    }
    if !concept.aliases.is_empty() {
        println!("  aliases:    {}", concept.aliases.join(", "));
    }
    if let Some(confidence) = concept.confidence_score {
        println!("  confidence: {:.2}", confidence);
    }
    println!("  validated:  {}", concept.validated);
    if let Some(definition) = &concept.definition {
        println!("  definition: {}", definition);
    }

    let outgoing = crate::relationships::list_from(&pool, concept.id, None, 50).await?;
    if !outgoing.is_empty() {
        println!("  relationships:");
        for rel in &outgoing {
            let target = get_by_id(&pool, rel.target_concept_id).await?;
            let target_name = target
                .map(|c| c.name)
                .unwrap_or_else(|| rel.target_concept_id.to_string());
            println!(
                "    --[{}]--> {}",
                rel.relationship_type.as_str(),
                target_name
            );
        }
    }

    let mentions = crate::chunk_concepts::count_for_concept(&pool, concept.id).await?;
    println!("  mentioned in {} chunks", mentions);

    pool.close().await;
    Ok(())
}

pub(crate) fn row_to_concept(row: &SqliteRow) -> Result<Concept> {
    let id: String = row.get("id");
    let type_str: String = row.get("concept_type");
    let aliases: String = row.get("aliases");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let metadata: String = row.get("metadata");

    Ok(Concept {
        id: parse_uuid(&id)?,
        name: row.get("name"),
        canonical_name: row.get("canonical_name"),
        aliases: parse_string_list(&aliases)?,
        concept_type: ConceptType::parse(&type_str).ok_or_else(|| {
            KbError::Validation(format!("unknown concept_type '{}'", type_str))
        })?,
        category: row.get("category"),
        definition: row.get("definition"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        extraction_method: row.get("extraction_method"),
        confidence_score: row.get("confidence_score"),
        validated: row.get("validated"),
        metadata: parse_metadata(&metadata)?,
        created_at: row.get("created_at"),
    })
}
