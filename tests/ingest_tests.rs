//! Ingestion pipeline integration tests: idempotent source bundles and
//! the concept store-and-dedup flow.

use sqlx::SqlitePool;
use tempfile::TempDir;

use research_kb::config::Config;
use research_kb::ingest::{
    self, BundleChunk, BundleCitation, ConceptBundle, ExtractedConcept, ExtractedRelationship,
    SourceBundle,
};
use research_kb::models::{ConceptType, MentionType, Metadata, NewSource, RelationshipType, SourceType};
use research_kb::{chunk_concepts, chunks, concepts, db, migrate, relationships};

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    config.embedding.dims = 4;
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, config, pool)
}

fn bundle(hash: &str) -> SourceBundle {
    SourceBundle {
        source: NewSource {
            source_type: SourceType::Paper,
            title: "Identification and Estimation of Local Average Treatment Effects".to_string(),
            authors: vec!["Imbens, Guido".to_string(), "Angrist, Joshua".to_string()],
            year: Some(1994),
            file_path: Some("/corpus/late.pdf".to_string()),
            file_hash: hash.to_string(),
            metadata: Metadata::new(),
        },
        chunks: vec![
            BundleChunk {
                content: "The instrumental variables estimand identifies a local average treatment effect."
                    .to_string(),
                location: Some("Section 1, p. 2".to_string()),
                page_start: Some(2),
                page_end: Some(2),
                embedding: None,
                metadata: Metadata::new(),
            },
            BundleChunk {
                content: "IV estimation requires instrument relevance and the exclusion restriction."
                    .to_string(),
                location: Some("Section 2, p. 5".to_string()),
                page_start: Some(5),
                page_end: Some(5),
                embedding: None,
                metadata: Metadata::new(),
            },
        ],
        citations: vec![BundleCitation {
            authors: vec!["Rubin, Donald".to_string()],
            title: Some("Bayesian inference for causal effects".to_string()),
            year: Some(1978),
            venue: Some("Annals of Statistics".to_string()),
            doi: None,
            arxiv_id: None,
            raw_string: "Rubin (1978). Bayesian inference for causal effects.".to_string(),
            extraction_method: Some("grobid".to_string()),
            confidence_score: Some(0.92),
        }],
    }
}

#[tokio::test]
async fn test_ingest_source_bundle() {
    let (_tmp, config, pool) = setup().await;

    let result = ingest::ingest_source(&pool, &config, bundle("late-hash")).await.unwrap();
    assert!(result.created);
    assert_eq!(result.chunks_created, 2);
    assert_eq!(result.citations_created, 1);

    assert_eq!(
        chunks::count_by_source(&pool, result.source.id).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_reingest_is_a_noop() {
    let (_tmp, config, pool) = setup().await;

    let first = ingest::ingest_source(&pool, &config, bundle("late-hash")).await.unwrap();
    let second = ingest::ingest_source(&pool, &config, bundle("late-hash")).await.unwrap();

    assert!(!second.created);
    assert_eq!(second.source.id, first.source.id);
    assert_eq!(second.chunks_created, 0);
    assert_eq!(
        chunks::count_by_source(&pool, first.source.id).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_concept_mentions_canonicalize_to_one_row() {
    let (_tmp, config, pool) = setup().await;

    let ingested = ingest::ingest_source(&pool, &config, bundle("late-hash")).await.unwrap();
    let stored_chunks = chunks::list_by_source(&pool, ingested.source.id).await.unwrap();

    // One chunk mentions "Instrumental Variables", the other "IV":
    // the abbreviation table resolves both to the same canonical name
    let concept_bundle = ConceptBundle {
        concepts: vec![
            ExtractedConcept {
                name: "Instrumental Variables".to_string(),
                concept_type: ConceptType::Method,
                aliases: vec![],
                category: Some("identification".to_string()),
                definition: Some("Estimation using instruments uncorrelated with the error.".to_string()),
                embedding: None,
                extraction_method: Some("llm".to_string()),
                confidence_score: Some(0.8),
                chunk_id: Some(stored_chunks[0].id),
                mention_type: Some(MentionType::Defines),
                relevance_score: Some(0.95),
            },
            ExtractedConcept {
                name: "IV".to_string(),
                concept_type: ConceptType::Method,
                aliases: vec![],
                category: None,
                definition: None,
                embedding: None,
                extraction_method: Some("llm".to_string()),
                confidence_score: Some(0.7),
                chunk_id: Some(stored_chunks[1].id),
                mention_type: Some(MentionType::Reference),
                relevance_score: Some(0.8),
            },
        ],
        relationships: vec![],
    };

    let report = ingest::ingest_concepts(&pool, &config, concept_bundle).await.unwrap();
    assert_eq!(report.concepts_created, 1);
    assert_eq!(report.concepts_merged, 1);
    assert_eq!(report.links_created, 2);

    let concept = concepts::get_by_canonical_name(&pool, "instrumental variables")
        .await
        .unwrap()
        .expect("both mentions should resolve to one canonical row");
    assert_eq!(concepts::count(&pool).await.unwrap(), 1);
    assert_eq!(
        chunk_concepts::count_for_concept(&pool, concept.id).await.unwrap(),
        2
    );
    // Repeated extraction kept the best confidence
    assert_eq!(concept.confidence_score, Some(0.8));
}

#[tokio::test]
async fn test_relationships_resolve_through_canonical_names() {
    let (_tmp, config, pool) = setup().await;

    let concept_bundle = ConceptBundle {
        concepts: vec![
            ExtractedConcept {
                name: "Instrumental Variables".to_string(),
                concept_type: ConceptType::Method,
                aliases: vec![],
                category: None,
                definition: None,
                embedding: None,
                extraction_method: None,
                confidence_score: Some(0.9),
                chunk_id: None,
                mention_type: None,
                relevance_score: None,
            },
            ExtractedConcept {
                name: "endogeneity".to_string(),
                concept_type: ConceptType::Problem,
                aliases: vec![],
                category: None,
                definition: None,
                embedding: None,
                extraction_method: None,
                confidence_score: Some(0.9),
                chunk_id: None,
                mention_type: None,
                relevance_score: None,
            },
        ],
        relationships: vec![
            // Endpoint named by abbreviation resolves to the same concept
            ExtractedRelationship {
                source: "IV".to_string(),
                target: "endogeneity".to_string(),
                relationship_type: RelationshipType::Addresses,
                is_directed: true,
                strength: 0.9,
                confidence_score: Some(0.85),
                evidence_chunk_ids: vec![],
            },
            // Duplicate of the edge above, ignored
            ExtractedRelationship {
                source: "instrumental variables".to_string(),
                target: "endogeneity".to_string(),
                relationship_type: RelationshipType::Addresses,
                is_directed: true,
                strength: 0.9,
                confidence_score: Some(0.85),
                evidence_chunk_ids: vec![],
            },
            // Both endpoints canonicalize to the same concept: self-loop, skipped
            ExtractedRelationship {
                source: "IV".to_string(),
                target: "Instrumental Variables".to_string(),
                relationship_type: RelationshipType::Extends,
                is_directed: true,
                strength: 1.0,
                confidence_score: None,
                evidence_chunk_ids: vec![],
            },
            // Unknown endpoint, skipped
            ExtractedRelationship {
                source: "IV".to_string(),
                target: "synthetic control".to_string(),
                relationship_type: RelationshipType::AlternativeTo,
                is_directed: false,
                strength: 0.5,
                confidence_score: None,
                evidence_chunk_ids: vec![],
            },
        ],
    };

    let report = ingest::ingest_concepts(&pool, &config, concept_bundle).await.unwrap();
    assert_eq!(report.concepts_created, 2);
    assert_eq!(report.relationships_created, 1);
    assert_eq!(report.relationships_skipped, 3);
    assert_eq!(relationships::count(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_semantic_near_duplicates_escalate_to_review() {
    let (_tmp, config, pool) = setup().await;

    let first = ConceptBundle {
        concepts: vec![ExtractedConcept {
            name: "backdoor criterion".to_string(),
            concept_type: ConceptType::Definition,
            aliases: vec![],
            category: None,
            definition: Some("A graphical condition for adjustment sets.".to_string()),
            embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
            extraction_method: None,
            confidence_score: Some(0.9),
            chunk_id: None,
            mention_type: None,
            relevance_score: None,
        }],
        relationships: vec![],
    };
    ingest::ingest_concepts(&pool, &config, first).await.unwrap();

    // Different name, nearly identical embedding: created, but flagged
    let second = ConceptBundle {
        concepts: vec![ExtractedConcept {
            name: "adjustment criterion".to_string(),
            concept_type: ConceptType::Definition,
            aliases: vec![],
            category: None,
            definition: None,
            embedding: Some(vec![0.999, 0.01, 0.0, 0.0]),
            extraction_method: None,
            confidence_score: Some(0.7),
            chunk_id: None,
            mention_type: None,
            relevance_score: None,
        }],
        relationships: vec![],
    };
    let report = ingest::ingest_concepts(&pool, &config, second).await.unwrap();

    assert_eq!(report.concepts_created, 1);
    assert_eq!(report.review_candidates.len(), 1);
    assert!(report.review_candidates[0].similarity > 0.95);

    // No automatic merge happened
    assert_eq!(concepts::count(&pool).await.unwrap(), 2);
}
