//! Bulk ingestion entry points.
//!
//! Consumes already-extracted inputs — chunk bundles from the PDF/text
//! extractor and concept/relationship candidates from the extraction
//! provider — and runs the store-and-dedup pipeline. Source ingestion is
//! idempotent on file hash; concept ingestion canonicalizes names, merges
//! into existing rows, and applies insert-or-ignore semantics to
//! relationship edges. Nothing here calls an extractor or an LLM.

use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk_concepts;
use crate::chunks;
use crate::citations;
use crate::concepts;
use crate::config::Config;
use crate::db;
use crate::dedup::Deduplicator;
use crate::error::Result;
use crate::migrate;
use crate::models::{
    ConceptType, MentionType, Metadata, NewChunk, NewCitation, NewConcept, NewRelationship,
    NewSource, RelationshipType, Source,
};
use crate::relationships;
use crate::sources;

/// A source document with its extracted chunks and citations, as produced
/// by the external extraction pipeline.
#[derive(Debug, Deserialize)]
pub struct SourceBundle {
    pub source: NewSource,
    #[serde(default)]
    pub chunks: Vec<BundleChunk>,
    #[serde(default)]
    pub citations: Vec<BundleCitation>,
}

#[derive(Debug, Deserialize)]
pub struct BundleChunk {
    pub content: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub page_start: Option<i64>,
    #[serde(default)]
    pub page_end: Option<i64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct BundleCitation {
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
    pub raw_string: String,
    #[serde(default)]
    pub extraction_method: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

/// Outcome of ingesting a source bundle.
#[derive(Debug)]
pub struct SourceIngest {
    pub source: Source,
    /// False when the file hash was already known and nothing was written.
    pub created: bool,
    pub chunks_created: usize,
    pub citations_created: usize,
}

/// Ingest a source with its chunks and citations.
///
/// Re-ingesting a file with a known hash returns the existing source and
/// writes nothing — the second call is a lookup, never a duplicate row.
/// Chunk and citation batches are transactional.
pub async fn ingest_source(
    pool: &SqlitePool,
    config: &Config,
    bundle: SourceBundle,
) -> Result<SourceIngest> {
    let (source, created) = sources::create_or_get(pool, bundle.source).await?;

    if !created {
        info!(source_id = %source.id, "source already ingested; skipping chunks");
        return Ok(SourceIngest {
            source,
            created: false,
            chunks_created: 0,
            citations_created: 0,
        });
    }

    let new_chunks: Vec<NewChunk> = bundle
        .chunks
        .into_iter()
        .map(|chunk| NewChunk {
            source_id: source.id,
            content: chunk.content,
            content_hash: None,
            location: chunk.location,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            embedding: chunk.embedding,
            metadata: chunk.metadata,
        })
        .collect();
    let stored_chunks = chunks::batch_create(pool, config, new_chunks).await?;

    let new_citations: Vec<NewCitation> = bundle
        .citations
        .into_iter()
        .map(|citation| NewCitation {
            source_id: source.id,
            authors: citation.authors,
            title: citation.title,
            year: citation.year,
            venue: citation.venue,
            doi: citation.doi,
            arxiv_id: citation.arxiv_id,
            raw_string: citation.raw_string,
            bibtex: None,
            extraction_method: citation.extraction_method,
            confidence_score: citation.confidence_score,
            metadata: Metadata::new(),
        })
        .collect();
    let stored_citations = citations::batch_create(pool, new_citations).await?;

    info!(
        source_id = %source.id,
        chunks = stored_chunks.len(),
        citations = stored_citations.len(),
        "source ingested"
    );

    Ok(SourceIngest {
        source,
        created: true,
        chunks_created: stored_chunks.len(),
        citations_created: stored_citations.len(),
    })
}

/// A concept candidate from the extraction provider.
#[derive(Debug, Deserialize)]
pub struct ExtractedConcept {
    pub name: String,
    pub concept_type: ConceptType,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub extraction_method: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    /// Chunk this mention came from, for chunk-concept linking.
    #[serde(default)]
    pub chunk_id: Option<Uuid>,
    #[serde(default)]
    pub mention_type: Option<MentionType>,
    #[serde(default)]
    pub relevance_score: Option<f64>,
}

/// A relationship candidate; endpoints are concept names, resolved through
/// the deduplicator at ingest time.
#[derive(Debug, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    #[serde(default = "default_directed")]
    pub is_directed: bool,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub evidence_chunk_ids: Vec<Uuid>,
}

fn default_directed() -> bool {
    true
}

fn default_strength() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Default)]
pub struct ConceptBundle {
    #[serde(default)]
    pub concepts: Vec<ExtractedConcept>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// A pair of concepts whose embeddings look the same but whose names do
/// not: left for a human, not auto-merged.
#[derive(Debug, Clone)]
pub struct ReviewCandidate {
    pub concept_id: Uuid,
    pub similar_to: Uuid,
    pub similarity: f64,
}

/// Outcome of ingesting a concept bundle.
#[derive(Debug, Default)]
pub struct ConceptIngest {
    pub concepts_created: usize,
    pub concepts_merged: usize,
    pub relationships_created: usize,
    pub relationships_skipped: usize,
    pub links_created: usize,
    pub review_candidates: Vec<ReviewCandidate>,
}

/// Run the store-and-dedup pipeline over extracted concepts and
/// relationships.
///
/// Names are canonicalized and upserted on canonical name, so repeated
/// extraction of the same concept merges instead of duplicating.
/// Self-loop relationships and edges with unresolvable endpoints are
/// skipped with a warning rather than failing the batch.
pub async fn ingest_concepts(
    pool: &SqlitePool,
    config: &Config,
    bundle: ConceptBundle,
) -> Result<ConceptIngest> {
    let dedup = Deduplicator::new(&config.dedup);
    let mut report = ConceptIngest::default();
    let mut by_canonical: HashMap<String, Uuid> = HashMap::new();

    // The semantic threshold is specified on raw cosine; find_similar
    // works on the unit interval.
    let unit_threshold = (1.0 + config.dedup.semantic_threshold) / 2.0;

    for extracted in bundle.concepts {
        let canonical = dedup.to_canonical_name(&extracted.name);
        if canonical.is_empty() {
            warn!(name = %extracted.name, "concept name canonicalizes to nothing; skipped");
            continue;
        }

        let known = by_canonical.contains_key(&canonical)
            || concepts::get_by_canonical_name(pool, &canonical).await?.is_some();

        // Semantic escalation: a brand-new name whose embedding nearly
        // coincides with an existing concept gets flagged for review.
        let mut similar_existing: Option<(Uuid, f64)> = None;
        if !known {
            if let Some(embedding) = &extracted.embedding {
                if let Some((similar, sim)) =
                    concepts::find_similar(pool, embedding, unit_threshold, 1)
                        .await?
                        .into_iter()
                        .next()
                {
                    if !dedup.are_duplicates(&canonical, &similar.canonical_name) {
                        similar_existing = Some((similar.id, sim));
                    }
                }
            }
        }

        let aliases = extracted
            .aliases
            .iter()
            .map(|alias| dedup.to_canonical_name(alias))
            .filter(|alias| !alias.is_empty() && *alias != canonical)
            .collect();

        let (concept, created) = concepts::upsert(
            pool,
            NewConcept {
                name: extracted.name,
                canonical_name: canonical.clone(),
                aliases,
                concept_type: extracted.concept_type,
                category: extracted.category,
                definition: extracted.definition,
                embedding: extracted.embedding,
                extraction_method: extracted.extraction_method,
                confidence_score: extracted.confidence_score,
                validated: false,
                metadata: Metadata::new(),
            },
        )
        .await?;

        if created {
            report.concepts_created += 1;
        } else {
            report.concepts_merged += 1;
        }
        by_canonical.insert(canonical, concept.id);

        if let Some((similar_to, similarity)) = similar_existing {
            warn!(
                concept_id = %concept.id,
                similar_to = %similar_to,
                similarity,
                "embedding-similar concept pair flagged for review"
            );
            report.review_candidates.push(ReviewCandidate {
                concept_id: concept.id,
                similar_to,
                similarity,
            });
        }

        if let Some(chunk_id) = extracted.chunk_id {
            chunk_concepts::create(
                pool,
                chunk_id,
                concept.id,
                extracted.mention_type.unwrap_or(MentionType::Reference),
                extracted.relevance_score,
            )
            .await?;
            report.links_created += 1;
        }
    }

    for rel in bundle.relationships {
        let source_id = resolve_endpoint(pool, &dedup, &by_canonical, &rel.source).await?;
        let target_id = resolve_endpoint(pool, &dedup, &by_canonical, &rel.target).await?;

        let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
            warn!(
                source = %rel.source,
                target = %rel.target,
                "relationship endpoint not found; skipped"
            );
            report.relationships_skipped += 1;
            continue;
        };

        if source_id == target_id {
            warn!(
                source = %rel.source,
                target = %rel.target,
                "self-loop relationship skipped"
            );
            report.relationships_skipped += 1;
            continue;
        }

        let created = relationships::create_or_ignore(
            pool,
            NewRelationship {
                source_concept_id: source_id,
                target_concept_id: target_id,
                relationship_type: rel.relationship_type,
                is_directed: rel.is_directed,
                strength: rel.strength,
                confidence_score: rel.confidence_score,
                evidence_chunk_ids: rel.evidence_chunk_ids,
            },
        )
        .await?;

        if created.is_some() {
            report.relationships_created += 1;
        } else {
            report.relationships_skipped += 1;
        }
    }

    info!(
        created = report.concepts_created,
        merged = report.concepts_merged,
        relationships = report.relationships_created,
        skipped = report.relationships_skipped,
        links = report.links_created,
        review = report.review_candidates.len(),
        "concept ingestion complete"
    );
    Ok(report)
}

async fn resolve_endpoint(
    pool: &SqlitePool,
    dedup: &Deduplicator,
    by_canonical: &HashMap<String, Uuid>,
    name: &str,
) -> Result<Option<Uuid>> {
    let canonical = dedup.to_canonical_name(name);
    if let Some(id) = by_canonical.get(&canonical) {
        return Ok(Some(*id));
    }
    Ok(concepts::resolve_name(pool, dedup, name).await?.map(|c| c.id))
}

// ============ CLI commands ============

/// `rkb ingest`: load a source bundle JSON file and ingest it.
pub async fn run_ingest(config: &Config, bundle_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(bundle_path)?;
    let bundle: SourceBundle = serde_json::from_str(&content)?;

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let result = ingest_source(&pool, config, bundle).await?;

    println!("ingest {}", bundle_path.display());
    if result.created {
        println!("  source: {} ({})", result.source.title, result.source.id);
        println!("  chunks written: {}", result.chunks_created);
        println!("  citations written: {}", result.citations_created);
    } else {
        println!(
            "  source already ingested: {} ({})",
            result.source.title, result.source.id
        );
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `rkb concepts ingest`: load a concept bundle JSON file and run the
/// dedup pipeline.
pub async fn run_ingest_concepts(config: &Config, bundle_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(bundle_path)?;
    let bundle: ConceptBundle = serde_json::from_str(&content)?;

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let report = ingest_concepts(&pool, config, bundle).await?;

    println!("concepts ingest {}", bundle_path.display());
    println!("  concepts created: {}", report.concepts_created);
    println!("  concepts merged: {}", report.concepts_merged);
    println!("  relationships created: {}", report.relationships_created);
    println!("  relationships skipped: {}", report.relationships_skipped);
    println!("  chunk links created: {}", report.links_created);
    if !report.review_candidates.is_empty() {
        println!("  review candidates:");
        for candidate in &report.review_candidates {
            println!(
                "    {} ~ {} (similarity {:.3})",
                candidate.concept_id, candidate.similar_to, candidate.similarity
            );
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
