//! Hybrid search: full-text rank, vector similarity, and graph proximity
//! combined into one ranked list.
//!
//! Score semantics:
//! - `fts_score`: higher = better keyword match (negated bm25 rank,
//!   unbounded). Normalized against the candidate-set maximum before
//!   weighting.
//! - `vector_score`: cosine similarity mapped onto [0, 1]; raw distance
//!   never reaches callers.
//! - `graph_score`: concept-graph proximity in [0, 1].
//! - `combined_score`: weighted sum, higher = better. Ordering is strictly
//!   by combined score with chunk id as the deterministic tie-break, so
//!   pagination is repeatable.
//!
//! Graph enrichment is additive, never a hard dependency: when no concepts
//! are indexed or none match the query, the graph term is dropped and the
//! degradation is reported through `SearchResponse::warnings`.

use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk_concepts;
use crate::chunks;
use crate::concepts;
use crate::config::{Config, SearchWeights};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, similarity_to_unit};
use crate::error::{KbError, Result};
use crate::graph;
use crate::models::{parse_uuid, SearchResponse, SearchResult, SourceType};
use crate::sources;

/// Hybrid search query configuration.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Query text for the full-text signal (and query-concept matching).
    pub text: Option<String>,
    /// Query embedding for the vector signal.
    pub embedding: Option<Vec<f32>>,
    pub fts_weight: f64,
    pub vector_weight: f64,
    pub graph_weight: f64,
    /// Explicit opt-in for graph-boosted scoring.
    pub use_graph: bool,
    /// Traversal bound for graph scoring.
    pub max_hops: u32,
    pub limit: i64,
    /// Optional source-type restriction. Unset means no restriction.
    pub source_filter: Option<SourceType>,
}

impl SearchQuery {
    pub fn new(text: Option<String>, embedding: Option<Vec<f32>>) -> Self {
        SearchQuery {
            text,
            embedding,
            fts_weight: 0.3,
            vector_weight: 0.7,
            graph_weight: 0.0,
            use_graph: false,
            max_hops: 2,
            limit: 10,
            source_filter: None,
        }
    }

    /// Apply a named weight configuration (see `[search.presets]` in config).
    pub fn with_weights(mut self, weights: SearchWeights) -> Self {
        self.fts_weight = weights.fts;
        self.vector_weight = weights.vector;
        self.graph_weight = weights.graph;
        self
    }

    pub fn with_graph(mut self, use_graph: bool) -> Self {
        self.use_graph = use_graph;
        self
    }

    /// Validate the query and normalize weights to sum to 1.
    ///
    /// Three-way normalization when graph scoring is enabled, two-way
    /// otherwise, so combined scores stay comparable across modes.
    pub fn validate_and_normalize(&mut self, embedding_dims: usize) -> Result<()> {
        let has_text = self.text.as_deref().map_or(false, |t| !t.trim().is_empty());
        let has_embedding = self.embedding.is_some();

        if !has_text && !has_embedding {
            return Err(KbError::Validation(
                "must provide at least one of: text, embedding".to_string(),
            ));
        }

        if let Some(embedding) = &self.embedding {
            if embedding.len() != embedding_dims {
                return Err(KbError::Validation(format!(
                    "embedding must be {} dimensions, got {}",
                    embedding_dims,
                    embedding.len()
                )));
            }
        }

        if self.fts_weight < 0.0 || self.vector_weight < 0.0 || self.graph_weight < 0.0 {
            return Err(KbError::Validation("weights must be non-negative".to_string()));
        }

        if self.limit < 1 {
            return Err(KbError::Validation("limit must be >= 1".to_string()));
        }

        if !(1..=5).contains(&self.max_hops) {
            return Err(KbError::Validation("max_hops must be in 1..=5".to_string()));
        }

        let total = if self.use_graph {
            self.fts_weight + self.vector_weight + self.graph_weight
        } else {
            self.fts_weight + self.vector_weight
        };
        if total <= 0.0 {
            return Err(KbError::Validation(
                "at least one signal weight must be positive".to_string(),
            ));
        }

        self.fts_weight /= total;
        self.vector_weight /= total;
        if self.use_graph {
            self.graph_weight /= total;
        } else {
            self.graph_weight = 0.0;
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ScoredChunk {
    chunk_id: String,
    fts_raw: Option<f64>,
    vector: Option<f64>,
    graph: Option<f64>,
    combined: f64,
}

/// Execute a hybrid search.
pub async fn run(pool: &SqlitePool, config: &Config, mut query: SearchQuery) -> Result<SearchResponse> {
    query.validate_and_normalize(config.embedding.dims)?;

    let mut warnings = Vec::new();

    // Full-text candidates
    let fts_hits: Vec<(String, f64)> = match query.text.as_deref() {
        Some(text) => {
            let match_expr = build_match_query(text);
            if match_expr.is_empty() {
                Vec::new()
            } else {
                fts_candidates(
                    pool,
                    &match_expr,
                    query.source_filter,
                    config.search.candidate_k_fts,
                )
                .await?
            }
        }
        None => Vec::new(),
    };

    // Vector similarities for every embedded chunk passing the filter
    let vector_all: HashMap<String, f64> = match query.embedding.as_deref() {
        Some(embedding) => vector_scores(pool, embedding, query.source_filter).await?,
        None => HashMap::new(),
    };

    let mut vector_top: Vec<(String, f64)> = vector_all
        .iter()
        .map(|(id, score)| (id.clone(), *score))
        .collect();
    vector_top.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    vector_top.truncate(config.search.candidate_k_vector as usize);

    // Outer-merge candidate sets
    let mut candidate_ids: BTreeSet<String> = BTreeSet::new();
    candidate_ids.extend(fts_hits.iter().map(|(id, _)| id.clone()));
    candidate_ids.extend(vector_top.iter().map(|(id, _)| id.clone()));

    if candidate_ids.is_empty() {
        return Ok(SearchResponse {
            results: Vec::new(),
            warnings,
        });
    }

    // Graph signal (opt-in, degrades gracefully)
    let mut graph_scores: Option<HashMap<String, f64>> = None;
    if query.use_graph && query.graph_weight > 0.0 {
        graph_scores =
            compute_graph_scores(pool, config, &query, &candidate_ids, &mut warnings).await?;
    }

    let fts_map: HashMap<&str, f64> = fts_hits.iter().map(|(id, s)| (id.as_str(), *s)).collect();
    let max_fts = fts_hits
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut scored: Vec<ScoredChunk> = candidate_ids
        .iter()
        .map(|chunk_id| {
            let fts_raw = fts_map.get(chunk_id.as_str()).copied();
            let fts_norm = match fts_raw {
                Some(raw) if max_fts > 0.0 => raw / max_fts,
                _ => 0.0,
            };
            let vector = query
                .embedding
                .as_ref()
                .map(|_| vector_all.get(chunk_id).copied().unwrap_or(0.0));
            let graph = graph_scores
                .as_ref()
                .map(|scores| scores.get(chunk_id).copied().unwrap_or(0.0));

            let combined = query.fts_weight * fts_norm
                + query.vector_weight * vector.unwrap_or(0.0)
                + query.graph_weight * graph.unwrap_or(0.0);

            ScoredChunk {
                chunk_id: chunk_id.clone(),
                fts_raw,
                vector,
                graph,
                combined,
            }
        })
        .collect();

    rank_candidates(&mut scored);
    scored.truncate(query.limit as usize);

    // Hydrate chunks and owning sources
    let mut results = Vec::with_capacity(scored.len());
    for (index, candidate) in scored.iter().enumerate() {
        let chunk_id = parse_uuid(&candidate.chunk_id)?;
        let chunk = chunks::get_by_id(pool, chunk_id)
            .await?
            .ok_or_else(|| KbError::NotFound {
                entity: "chunk",
                id: candidate.chunk_id.clone(),
            })?;
        let source = sources::get_by_id(pool, chunk.source_id)
            .await?
            .ok_or_else(|| KbError::NotFound {
                entity: "source",
                id: chunk.source_id.to_string(),
            })?;

        results.push(SearchResult {
            chunk,
            source,
            fts_score: candidate.fts_raw,
            vector_score: candidate.vector,
            graph_score: candidate.graph,
            combined_score: candidate.combined,
            rank: index + 1,
        });
    }

    info!(
        result_count = results.len(),
        degraded = !warnings.is_empty(),
        "search completed"
    );

    Ok(SearchResponse { results, warnings })
}

/// Sort by combined score descending, chunk id ascending on ties.
fn rank_candidates(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

async fn compute_graph_scores(
    pool: &SqlitePool,
    config: &Config,
    query: &SearchQuery,
    candidate_ids: &BTreeSet<String>,
    warnings: &mut Vec<String>,
) -> Result<Option<HashMap<String, f64>>> {
    if concepts::count(pool).await? == 0 {
        warn!("graph scoring requested but no concepts are indexed");
        warnings.push(
            "graph scoring requested but no concepts are indexed; ranking by full-text and vector signals only"
                .to_string(),
        );
        return Ok(None);
    }

    let text = query.text.as_deref().unwrap_or_default();
    let query_concepts =
        concepts::match_in_text(pool, text, config.graph.max_query_concepts).await?;

    if query_concepts.is_empty() {
        warn!("no indexed concepts matched the query text");
        warnings.push(
            "no indexed concepts matched the query; ranking by full-text and vector signals only"
                .to_string(),
        );
        return Ok(None);
    }

    // One traversal per query concept, shared across all candidates
    let mut maps = Vec::with_capacity(query_concepts.len());
    for concept_id in &query_concepts {
        maps.push(graph::distance_map(pool, *concept_id, query.max_hops, None).await?);
    }

    let chunk_uuids: Vec<Uuid> = candidate_ids
        .iter()
        .map(|id| parse_uuid(id))
        .collect::<Result<_>>()?;
    let links = chunk_concepts::concept_ids_for_chunks(pool, &chunk_uuids).await?;

    let mut scores = HashMap::with_capacity(candidate_ids.len());
    for chunk_id in candidate_ids {
        let uuid = parse_uuid(chunk_id)?;
        let concept_ids = links.get(&uuid).map(Vec::as_slice).unwrap_or(&[]);
        let score = graph::score_from_distances(
            &maps,
            concept_ids,
            config.graph.decay,
            query.max_hops,
        );
        scores.insert(chunk_id.clone(), score);
    }

    Ok(Some(scores))
}

/// Build an FTS5 MATCH expression from free-form query text.
///
/// Each token is quoted so user input cannot inject FTS operators;
/// multiple tokens require all to match, like `plainto`-style web search.
fn build_match_query(text: &str) -> String {
    text.split_whitespace()
        .map(|token| token.replace('"', ""))
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fetch full-text candidates with negated bm25 scores (higher = better).
///
/// The location field is weighted above the content body. The source-type
/// filter is a NULL-safe predicate: an unset filter restricts nothing.
async fn fts_candidates(
    pool: &SqlitePool,
    match_expr: &str,
    source_filter: Option<SourceType>,
    candidate_k: i64,
) -> Result<Vec<(String, f64)>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, -bm25(chunks_fts, 2.0, 1.0) AS fts_score
        FROM chunks_fts
        JOIN chunks c ON c.rowid = chunks_fts.rowid
        JOIN sources s ON s.id = c.source_id
        WHERE chunks_fts MATCH ?1
          AND (?2 IS NULL OR s.source_type = ?2)
        ORDER BY bm25(chunks_fts, 2.0, 1.0)
        LIMIT ?3
        "#,
    )
    .bind(match_expr)
    .bind(source_filter.map(|t| t.as_str()))
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("chunk_id"), row.get("fts_score")))
        .collect())
}

/// Cosine similarity (mapped onto [0, 1]) for every embedded chunk that
/// passes the NULL-safe source-type filter.
async fn vector_scores(
    pool: &SqlitePool,
    query_embedding: &[f32],
    source_filter: Option<SourceType>,
) -> Result<HashMap<String, f64>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.embedding AS embedding
        FROM chunks c
        JOIN sources s ON s.id = c.source_id
        WHERE c.embedding IS NOT NULL
          AND (?1 IS NULL OR s.source_type = ?1)
        "#,
    )
    .bind(source_filter.map(|t| t.as_str()))
    .fetch_all(pool)
    .await?;

    let mut scores = HashMap::with_capacity(rows.len());
    for row in &rows {
        let chunk_id: String = row.get("chunk_id");
        let blob: Vec<u8> = row.get("embedding");
        let stored = blob_to_vec(&blob);
        let similarity = similarity_to_unit(cosine_similarity(query_embedding, &stored));
        scores.insert(chunk_id, similarity);
    }
    Ok(scores)
}

// ============ CLI command ============

/// `rkb search`: text-only hybrid search from the command line.
#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    config: &Config,
    query_text: &str,
    preset: Option<&str>,
    fts_weight: Option<f64>,
    vector_weight: Option<f64>,
    graph_weight: Option<f64>,
    use_graph: bool,
    source_type: Option<&str>,
    limit: Option<i64>,
) -> anyhow::Result<()> {
    if query_text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let source_filter = match source_type {
        Some(raw) => Some(SourceType::parse(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown source type: {}. Use textbook, paper, or code_repo.",
                raw
            )
        })?),
        None => None,
    };

    let preset_name = preset.unwrap_or(config.search.default_preset.as_str());
    let weights = config
        .search
        .preset(preset_name)
        .ok_or_else(|| anyhow::anyhow!("Unknown search preset: {}", preset_name))?;

    let mut query = SearchQuery::new(Some(query_text.to_string()), None)
        .with_weights(weights)
        .with_graph(use_graph);
    if let Some(w) = fts_weight {
        query.fts_weight = w;
    }
    if let Some(w) = vector_weight {
        query.vector_weight = w;
    }
    if let Some(w) = graph_weight {
        query.graph_weight = w;
    }
    query.max_hops = config.graph.max_hops;
    query.limit = limit.unwrap_or(config.search.default_limit);
    query.source_filter = source_filter;

    let pool = db::connect(config).await?;
    let response = run(&pool, config, query).await?;

    for warning in &response.warnings {
        println!("warning: {}", warning);
    }

    if response.results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for result in &response.results {
        let location = result.chunk.location.as_deref().unwrap_or("(no location)");
        println!(
            "{}. [{:.3}] {} / {}",
            result.rank, result.combined_score, result.source.title, location
        );
        let mut parts: Vec<String> = Vec::new();
        if let Some(fts) = result.fts_score {
            parts.push(format!("fts {:.3}", fts));
        }
        if let Some(vector) = result.vector_score {
            parts.push(format!("vector {:.3}", vector));
        }
        if let Some(graph) = result.graph_score {
            parts.push(format!("graph {:.3}", graph));
        }
        if !parts.is_empty() {
            println!("    scores: {}", parts.join(", "));
        }

        let excerpt: String = result.chunk.content.chars().take(200).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
        println!("    chunk: {}", result.chunk.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_match_query_quotes_tokens() {
        assert_eq!(build_match_query("backdoor criterion"), "\"backdoor\" \"criterion\"");
        assert_eq!(build_match_query("  iv  "), "\"iv\"");
        assert_eq!(build_match_query(""), "");
    }

    #[test]
    fn test_build_match_query_strips_operators() {
        // Embedded quotes cannot escape the phrase token
        assert_eq!(build_match_query("a\"b"), "\"ab\"");
        // FTS operators become quoted literals
        assert_eq!(build_match_query("iv OR dag"), "\"iv\" \"OR\" \"dag\"");
    }

    #[test]
    fn test_validate_requires_text_or_embedding() {
        let mut query = SearchQuery::new(None, None);
        assert!(query.validate_and_normalize(4).is_err());

        let mut query = SearchQuery::new(Some("   ".to_string()), None);
        assert!(query.validate_and_normalize(4).is_err());
    }

    #[test]
    fn test_validate_checks_embedding_dims() {
        let mut query = SearchQuery::new(None, Some(vec![0.1, 0.2]));
        assert!(query.validate_and_normalize(4).is_err());

        let mut query = SearchQuery::new(None, Some(vec![0.1, 0.2, 0.3, 0.4]));
        assert!(query.validate_and_normalize(4).is_ok());
    }

    #[test]
    fn test_two_way_weight_normalization() {
        let mut query = SearchQuery::new(Some("iv".to_string()), None);
        query.fts_weight = 1.0;
        query.vector_weight = 1.0;
        query.graph_weight = 5.0; // ignored without use_graph
        query.validate_and_normalize(4).unwrap();

        assert!((query.fts_weight - 0.5).abs() < 1e-9);
        assert!((query.vector_weight - 0.5).abs() < 1e-9);
        assert_eq!(query.graph_weight, 0.0);
    }

    #[test]
    fn test_three_way_weight_normalization() {
        let mut query = SearchQuery::new(Some("iv".to_string()), None).with_graph(true);
        query.fts_weight = 0.2;
        query.vector_weight = 0.5;
        query.graph_weight = 0.3;
        query.validate_and_normalize(4).unwrap();

        let total = query.fts_weight + query.vector_weight + query.graph_weight;
        assert!((total - 1.0).abs() < 1e-9);
        assert!((query.graph_weight - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_negative_weights_rejected() {
        let mut query = SearchQuery::new(Some("iv".to_string()), None);
        query.fts_weight = -0.1;
        assert!(query.validate_and_normalize(4).is_err());
    }

    #[test]
    fn test_zero_weights_rejected() {
        let mut query = SearchQuery::new(Some("iv".to_string()), None);
        query.fts_weight = 0.0;
        query.vector_weight = 0.0;
        assert!(query.validate_and_normalize(4).is_err());
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let mut scored = vec![
            ScoredChunk {
                chunk_id: "b".to_string(),
                fts_raw: None,
                vector: None,
                graph: None,
                combined: 0.5,
            },
            ScoredChunk {
                chunk_id: "a".to_string(),
                fts_raw: None,
                vector: None,
                graph: None,
                combined: 0.5,
            },
            ScoredChunk {
                chunk_id: "c".to_string(),
                fts_raw: None,
                vector: None,
                graph: None,
                combined: 0.9,
            },
        ];
        rank_candidates(&mut scored);

        let order: Vec<&str> = scored.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_is_strictly_monotonic_in_score() {
        let mut scored = vec![
            ScoredChunk {
                chunk_id: "x".to_string(),
                fts_raw: None,
                vector: None,
                graph: None,
                combined: 0.1,
            },
            ScoredChunk {
                chunk_id: "y".to_string(),
                fts_raw: None,
                vector: None,
                graph: None,
                combined: 0.7,
            },
        ];
        rank_candidates(&mut scored);
        for pair in scored.windows(2) {
            assert!(pair[0].combined >= pair[1].combined);
        }
    }
}
