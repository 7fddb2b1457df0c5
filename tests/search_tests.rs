//! Hybrid search integration tests: ranking, score bounds, NULL-safe
//! filtering, deterministic ordering, and graph fallback.

use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use research_kb::config::Config;
use research_kb::models::{
    ConceptType, MentionType, Metadata, NewChunk, NewConcept, NewRelationship, NewSource,
    RelationshipType, SourceType,
};
use research_kb::search::{self, SearchQuery};
use research_kb::{chunk_concepts, chunks, concepts, db, migrate, relationships, sources};

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    config.embedding.dims = 4;
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, config, pool)
}

async fn add_source(pool: &SqlitePool, source_type: SourceType, title: &str, hash: &str) -> Uuid {
    sources::create(
        pool,
        NewSource {
            source_type,
            title: title.to_string(),
            authors: vec![],
            year: Some(2009),
            file_path: None,
            file_hash: hash.to_string(),
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap()
    .id
}

async fn add_chunk(
    pool: &SqlitePool,
    config: &Config,
    source_id: Uuid,
    content: &str,
    embedding: Option<Vec<f32>>,
) -> Uuid {
    chunks::create(
        pool,
        config,
        NewChunk {
            source_id,
            content: content.to_string(),
            content_hash: None,
            location: Some("p. 1".to_string()),
            page_start: None,
            page_end: None,
            embedding,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn test_fts_search_finds_keyword_matches() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "IV Paper", "h1").await;

    add_chunk(&pool, &config, source, "instrumental variables address endogeneity", None).await;
    add_chunk(&pool, &config, source, "random forests grow many decision trees", None).await;

    let query = SearchQuery::new(Some("instrumental variables".to_string()), None);
    let response = search::run(&pool, &config, query).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert!(response.results[0]
        .chunk
        .content
        .contains("instrumental variables"));
    assert!(response.results[0].fts_score.unwrap() > 0.0);
    assert!(response.warnings.is_empty());
}

#[tokio::test]
async fn test_no_match_returns_empty_not_error() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Paper", "h1").await;
    add_chunk(&pool, &config, source, "matching on observables", None).await;

    let query = SearchQuery::new(Some("quasiexperimental kolmogorov".to_string()), None);
    let response = search::run(&pool, &config, query).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_query_without_signals_is_rejected() {
    let (_tmp, config, pool) = setup().await;
    let query = SearchQuery::new(None, None);
    let err = search::run(&pool, &config, query).await.unwrap_err();
    assert!(matches!(err, research_kb::error::KbError::Validation(_)));
}

#[tokio::test]
async fn test_vector_score_bounds() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Vectors", "h1").await;

    let identical = add_chunk(
        &pool,
        &config,
        source,
        "identical direction",
        Some(vec![1.0, 0.0, 0.0, 0.0]),
    )
    .await;
    let opposite = add_chunk(
        &pool,
        &config,
        source,
        "opposite direction",
        Some(vec![-1.0, 0.0, 0.0, 0.0]),
    )
    .await;

    let query = SearchQuery::new(None, Some(vec![1.0, 0.0, 0.0, 0.0]));
    let response = search::run(&pool, &config, query).await.unwrap();
    assert_eq!(response.results.len(), 2);

    for result in &response.results {
        let score = result.vector_score.unwrap();
        assert!((0.0..=1.0).contains(&score), "vector score {} out of bounds", score);
    }

    let first = &response.results[0];
    let second = &response.results[1];
    assert_eq!(first.chunk.id, identical);
    assert!((first.vector_score.unwrap() - 1.0).abs() < 1e-6);
    assert_eq!(second.chunk.id, opposite);
    assert!(second.vector_score.unwrap().abs() < 1e-6);
}

#[tokio::test]
async fn test_ranking_is_monotonic_in_combined_score() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Ranked", "h1").await;

    add_chunk(&pool, &config, source, "treatment effect", Some(vec![1.0, 0.0, 0.0, 0.0])).await;
    add_chunk(&pool, &config, source, "treatment effect estimation", Some(vec![0.5, 0.5, 0.0, 0.0])).await;
    add_chunk(&pool, &config, source, "average treatment effect bounds", Some(vec![0.0, 1.0, 0.0, 0.0])).await;

    let query = SearchQuery::new(
        Some("treatment effect".to_string()),
        Some(vec![1.0, 0.0, 0.0, 0.0]),
    );
    let response = search::run(&pool, &config, query).await.unwrap();
    assert!(response.results.len() >= 2);

    for pair in response.results.windows(2) {
        assert!(pair[0].combined_score >= pair[1].combined_score);
    }
    for (i, result) in response.results.iter().enumerate() {
        assert_eq!(result.rank, i + 1);
    }
}

#[tokio::test]
async fn test_tie_break_is_deterministic() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Ties", "h1").await;

    // Identical content produces identical scores on every signal
    let a = add_chunk(&pool, &config, source, "difference-in-differences design", None).await;
    let b = add_chunk(&pool, &config, source, "difference-in-differences design", None).await;

    let run_once = || async {
        let query = SearchQuery::new(Some("difference-in-differences".to_string()), None);
        search::run(&pool, &config, query)
            .await
            .unwrap()
            .results
            .iter()
            .map(|r| r.chunk.id)
            .collect::<Vec<_>>()
    };

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);

    // Ties resolve by ascending chunk id
    let expected = if a.to_string() < b.to_string() { vec![a, b] } else { vec![b, a] };
    assert_eq!(first, expected);
}

#[tokio::test]
async fn test_source_filter_is_null_safe_and_applied() {
    let (_tmp, config, pool) = setup().await;

    let paper = add_source(&pool, SourceType::Paper, "Paper", "h1").await;
    let textbook = add_source(&pool, SourceType::Textbook, "Textbook", "h2").await;
    add_chunk(&pool, &config, paper, "propensity score matching estimator", None).await;
    add_chunk(&pool, &config, textbook, "propensity score matching chapter", None).await;

    // Unset filter restricts nothing
    let unfiltered = SearchQuery::new(Some("propensity score".to_string()), None);
    let all = search::run(&pool, &config, unfiltered).await.unwrap();
    assert_eq!(all.results.len(), 2);

    // Set filter actually restricts (the accepted-but-ignored bug class)
    let mut filtered = SearchQuery::new(Some("propensity score".to_string()), None);
    filtered.source_filter = Some(SourceType::Textbook);
    let textbooks_only = search::run(&pool, &config, filtered).await.unwrap();
    assert_eq!(textbooks_only.results.len(), 1);
    assert_eq!(textbooks_only.results[0].source.source_type, SourceType::Textbook);
}

#[tokio::test]
async fn test_limit_truncates_results() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Many", "h1").await;

    for i in 0..5 {
        add_chunk(&pool, &config, source, &format!("causal inference note {}", i), None).await;
    }

    let mut query = SearchQuery::new(Some("causal inference".to_string()), None);
    query.limit = 2;
    let response = search::run(&pool, &config, query).await.unwrap();
    assert_eq!(response.results.len(), 2);
}

#[tokio::test]
async fn test_graph_fallback_on_concept_free_database() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "No Concepts", "h1").await;
    add_chunk(&pool, &config, source, "instrumental variables estimation", None).await;
    add_chunk(&pool, &config, source, "instrumental variables critique", None).await;

    // Graph requested against a concept-free database: never raises
    let mut boosted = SearchQuery::new(Some("instrumental variables".to_string()), None);
    boosted.graph_weight = 0.3;
    boosted = boosted.with_graph(true);
    let degraded = search::run(&pool, &config, boosted).await.unwrap();

    assert!(!degraded.warnings.is_empty(), "degradation must be surfaced");

    // Results are equivalent to the same query without the graph term
    let plain = SearchQuery::new(Some("instrumental variables".to_string()), None);
    let baseline = search::run(&pool, &config, plain).await.unwrap();

    let degraded_ids: Vec<Uuid> = degraded.results.iter().map(|r| r.chunk.id).collect();
    let baseline_ids: Vec<Uuid> = baseline.results.iter().map(|r| r.chunk.id).collect();
    assert_eq!(degraded_ids, baseline_ids);
}

#[tokio::test]
async fn test_graph_fallback_when_no_query_concepts_match() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Some Concepts", "h1").await;
    add_chunk(&pool, &config, source, "bootstrap standard errors", None).await;

    // A concept exists, but the query mentions none of them
    concepts::create(
        &pool,
        NewConcept {
            name: "instrumental variables".to_string(),
            canonical_name: "instrumental variables".to_string(),
            aliases: vec![],
            concept_type: ConceptType::Method,
            category: None,
            definition: None,
            embedding: None,
            extraction_method: None,
            confidence_score: None,
            validated: false,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap();

    let mut query = SearchQuery::new(Some("bootstrap standard errors".to_string()), None);
    query.graph_weight = 0.3;
    query = query.with_graph(true);
    let response = search::run(&pool, &config, query).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert!(!response.warnings.is_empty());
    assert!(response.results[0].graph_score.is_none());
}

#[tokio::test]
async fn test_graph_boost_ranks_connected_chunk_first() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Boosted", "h1").await;

    // Two textually identical chunks; only one is linked into the graph
    let linked = add_chunk(&pool, &config, source, "instrumental variables identification strategy", None).await;
    let unlinked = add_chunk(&pool, &config, source, "instrumental variables identification strategy", None).await;

    let iv = concepts::create(
        &pool,
        NewConcept {
            name: "instrumental variables".to_string(),
            canonical_name: "instrumental variables".to_string(),
            aliases: vec!["iv".to_string()],
            concept_type: ConceptType::Method,
            category: None,
            definition: None,
            embedding: None,
            extraction_method: None,
            confidence_score: None,
            validated: true,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap();
    let endogeneity = concepts::create(
        &pool,
        NewConcept {
            name: "endogeneity".to_string(),
            canonical_name: "endogeneity".to_string(),
            aliases: vec![],
            concept_type: ConceptType::Problem,
            category: None,
            definition: None,
            embedding: None,
            extraction_method: None,
            confidence_score: None,
            validated: true,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap();

    relationships::create(
        &pool,
        NewRelationship {
            source_concept_id: iv.id,
            target_concept_id: endogeneity.id,
            relationship_type: RelationshipType::Addresses,
            is_directed: true,
            strength: 1.0,
            confidence_score: Some(0.9),
            evidence_chunk_ids: vec![],
        },
    )
    .await
    .unwrap();

    chunk_concepts::create(&pool, linked, endogeneity.id, MentionType::Reference, Some(0.9))
        .await
        .unwrap();

    let mut query = SearchQuery::new(Some("instrumental variables".to_string()), None);
    query.graph_weight = 0.3;
    query = query.with_graph(true);
    let response = search::run(&pool, &config, query).await.unwrap();

    assert_eq!(response.results.len(), 2);
    assert!(response.warnings.is_empty());

    let first = &response.results[0];
    let second = &response.results[1];
    assert_eq!(first.chunk.id, linked, "graph-connected chunk should rank first");
    assert_eq!(second.chunk.id, unlinked);
    assert!(first.graph_score.unwrap() > 0.0);
    assert_eq!(second.graph_score.unwrap(), 0.0);
    assert!(first.combined_score > second.combined_score);
}

#[tokio::test]
async fn test_chunks_without_embeddings_are_excluded_from_vector_search() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Paper, "Partial", "h1").await;

    add_chunk(&pool, &config, source, "no vector here", None).await;
    let embedded = add_chunk(&pool, &config, source, "vector here", Some(vec![0.0, 1.0, 0.0, 0.0])).await;

    let query = SearchQuery::new(None, Some(vec![0.0, 1.0, 0.0, 0.0]));
    let response = search::run(&pool, &config, query).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].chunk.id, embedded);
}

#[tokio::test]
async fn test_location_matches_rank_above_body_matches() {
    let (_tmp, config, pool) = setup().await;
    let source = add_source(&pool, SourceType::Textbook, "Weighted FTS", "h1").await;

    // One chunk mentions the term only in its body, the other in its location
    chunks::create(
        &pool,
        &config,
        NewChunk {
            source_id: source,
            content: "a section that discusses confounding at length".to_string(),
            content_hash: None,
            location: Some("Chapter 1".to_string()),
            page_start: None,
            page_end: None,
            embedding: None,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap();
    let in_location = chunks::create(
        &pool,
        &config,
        NewChunk {
            source_id: source,
            content: "a section that discusses confounding at length".to_string(),
            content_hash: None,
            location: Some("Chapter 2: Confounding".to_string()),
            page_start: None,
            page_end: None,
            embedding: None,
            metadata: Metadata::new(),
        },
    )
    .await
    .unwrap();

    let query = SearchQuery::new(Some("confounding".to_string()), None);
    let response = search::run(&pool, &config, query).await.unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].chunk.id, in_location.id);
}
