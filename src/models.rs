//! Core data models for the research knowledge base.
//!
//! These types mirror the relational schema in [`crate::migrate`] and are
//! the contract between the stores, the search engine, and callers. IDs are
//! UUIDs stored as TEXT; timestamps are Unix seconds; free-form metadata is
//! a typed JSON map rather than an opaque blob.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form metadata attached to sources, chunks, citations, and concepts.
///
/// The schema does not enforce keys, but producers follow conventions:
/// - source metadata: `doi`, `arxiv_id`, `isbn`, `git_url`, `importance_tier`
/// - chunk metadata: `section`, `heading_level`, `chunk_type`
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Source document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Textbook,
    Paper,
    CodeRepo,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Textbook => "textbook",
            SourceType::Paper => "paper",
            SourceType::CodeRepo => "code_repo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "textbook" => Some(SourceType::Textbook),
            "paper" => Some(SourceType::Paper),
            "code_repo" => Some(SourceType::CodeRepo),
            _ => None,
        }
    }
}

/// Concept classification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptType {
    Method,
    Assumption,
    Problem,
    Definition,
    Theorem,
}

impl ConceptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Method => "method",
            ConceptType::Assumption => "assumption",
            ConceptType::Problem => "problem",
            ConceptType::Definition => "definition",
            ConceptType::Theorem => "theorem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "method" => Some(ConceptType::Method),
            "assumption" => Some(ConceptType::Assumption),
            "problem" => Some(ConceptType::Problem),
            "definition" => Some(ConceptType::Definition),
            "theorem" => Some(ConceptType::Theorem),
            _ => None,
        }
    }
}

/// Typed edges between concepts in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Method requires assumption.
    Requires,
    /// Method uses technique.
    Uses,
    /// Method solves problem.
    Addresses,
    /// Broader concept.
    Generalizes,
    /// Narrower concept.
    Specializes,
    /// Competing approaches.
    AlternativeTo,
    /// Builds upon.
    Extends,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Requires => "REQUIRES",
            RelationshipType::Uses => "USES",
            RelationshipType::Addresses => "ADDRESSES",
            RelationshipType::Generalizes => "GENERALIZES",
            RelationshipType::Specializes => "SPECIALIZES",
            RelationshipType::AlternativeTo => "ALTERNATIVE_TO",
            RelationshipType::Extends => "EXTENDS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REQUIRES" => Some(RelationshipType::Requires),
            "USES" => Some(RelationshipType::Uses),
            "ADDRESSES" => Some(RelationshipType::Addresses),
            "GENERALIZES" => Some(RelationshipType::Generalizes),
            "SPECIALIZES" => Some(RelationshipType::Specializes),
            "ALTERNATIVE_TO" => Some(RelationshipType::AlternativeTo),
            "EXTENDS" => Some(RelationshipType::Extends),
            _ => None,
        }
    }
}

/// How a concept appears in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionType {
    Defines,
    Reference,
    Example,
}

impl MentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MentionType::Defines => "defines",
            MentionType::Reference => "reference",
            MentionType::Example => "example",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defines" => Some(MentionType::Defines),
            "reference" => Some(MentionType::Reference),
            "example" => Some(MentionType::Example),
            _ => None,
        }
    }
}

/// A source document (textbook, paper, or code repository).
///
/// `file_hash` is unique and enforces idempotent ingestion;
/// `citation_authority` is a precomputed PageRank-style score in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: Uuid,
    pub source_type: SourceType,
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i64>,
    pub file_path: Option<String>,
    pub file_hash: String,
    pub citation_authority: f64,
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for creating a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub source_type: SourceType,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub file_hash: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A unit of extracted text owned by exactly one source.
///
/// Immutable after ingestion, except for embedding backfill. The derived
/// full-text index row is maintained by database triggers, never by
/// application code.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub source_id: Uuid,
    pub content: String,
    pub content_hash: String,
    pub location: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
    pub created_at: i64,
}

/// Fields for creating a new chunk.
///
/// When `content_hash` is absent the store computes a SHA-256 of the
/// content, so identical text always hashes identically across
/// re-extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChunk {
    pub source_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub content_hash: Option<String>,
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

/// A bibliographic reference extracted from a source document.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub id: Uuid,
    pub source_id: Uuid,
    pub authors: Vec<String>,
    pub title: Option<String>,
    pub year: Option<i64>,
    pub venue: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub raw_string: String,
    pub bibtex: Option<String>,
    pub extraction_method: Option<String>,
    pub confidence_score: Option<f64>,
    pub metadata: Metadata,
    pub created_at: i64,
}

impl Citation {
    /// Generate a BibTeX citation key: `firstauthor` + year + first title word,
    /// e.g. `pearl2009causality`.
    pub fn bibtex_key(&self) -> String {
        let first_author = self
            .authors
            .first()
            .and_then(|a| a.split_whitespace().last())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let year = self
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "0000".to_string());
        let first_word: String = self
            .title
            .as_deref()
            .and_then(|t| t.split_whitespace().next())
            .unwrap_or("untitled")
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        format!("{}{}{}", first_author, year, first_word)
    }
}

/// Fields for creating a new citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCitation {
    pub source_id: Uuid,
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
    pub bibtex: Option<String>,
    #[serde(default)]
    pub extraction_method: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Citation-graph edge linking a citing source to a cited source.
///
/// `cited_source_id` is NULL for citations that reference works outside
/// the corpus. One edge per (citing source, citation) pair.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCitation {
    pub id: Uuid,
    pub citing_source_id: Uuid,
    pub cited_source_id: Option<Uuid>,
    pub citation_id: Uuid,
    pub created_at: i64,
}

/// A knowledge entity extracted from the corpus.
///
/// `canonical_name` is the deduplication key: two concepts resolving to the
/// same canonical name are the same row.
#[derive(Debug, Clone, Serialize)]
pub struct Concept {
    pub id: Uuid,
    pub name: String,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub concept_type: ConceptType,
    pub category: Option<String>,
    pub definition: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub extraction_method: Option<String>,
    pub confidence_score: Option<f64>,
    pub validated: bool,
    pub metadata: Metadata,
    pub created_at: i64,
}

/// Fields for creating or upserting a concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConcept {
    pub name: String,
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub concept_type: ConceptType,
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
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A directed, typed edge between two concepts.
///
/// Unique on (source, target, type). Edges with `is_directed = false` are
/// traversable in both directions.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptRelationship {
    pub id: Uuid,
    pub source_concept_id: Uuid,
    pub target_concept_id: Uuid,
    pub relationship_type: RelationshipType,
    pub is_directed: bool,
    pub strength: f64,
    pub confidence_score: Option<f64>,
    pub evidence_chunk_ids: Vec<Uuid>,
    pub created_at: i64,
}

/// Fields for creating a new relationship edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelationship {
    pub source_concept_id: Uuid,
    pub target_concept_id: Uuid,
    pub relationship_type: RelationshipType,
    #[serde(default = "default_true")]
    pub is_directed: bool,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub evidence_chunk_ids: Vec<Uuid>,
}

fn default_true() -> bool {
    true
}

fn default_strength() -> f64 {
    1.0
}

/// A chunk-to-concept mention link.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkConcept {
    pub chunk_id: Uuid,
    pub concept_id: Uuid,
    pub mention_type: MentionType,
    pub relevance_score: Option<f64>,
    pub created_at: i64,
}

/// One hop in a graph path: the concept reached and the edge that led to it.
///
/// The first hop of a path carries no relationship (it is the start node).
#[derive(Debug, Clone)]
pub struct PathHop {
    pub concept: Concept,
    pub relationship: Option<ConceptRelationship>,
}

/// An ordered path through the concept graph.
#[derive(Debug, Clone)]
pub struct GraphPath {
    pub hops: Vec<PathHop>,
}

impl GraphPath {
    /// Number of edges in the path (0 for a single-node path).
    pub fn len(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// A concept in an N-hop neighborhood, with its minimum distance from the
/// center and one shortest path of concept ids leading to it.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub concept: Concept,
    pub distance: u32,
    pub path: Vec<Uuid>,
}

/// A ranked hybrid-search result.
///
/// `fts_score` is an unbounded higher-is-better rank statistic;
/// `vector_score` and `graph_score` are unit-interval similarities
/// (1 = identical / directly connected). `combined_score` is the weighted
/// combination used for ranking.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub source: Source,
    pub fts_score: Option<f64>,
    pub vector_score: Option<f64>,
    pub graph_score: Option<f64>,
    pub combined_score: f64,
    pub rank: usize,
}

/// Search results plus any non-fatal degradation warnings.
///
/// A search that drops the graph signal (no concepts indexed, or no query
/// concepts matched) reports it here instead of failing.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub warnings: Vec<String>,
}

// ============ Row decoding helpers ============
//
// Shared by the store modules when mapping TEXT columns back onto typed
// fields. Decode failures indicate corrupted rows and surface as errors
// rather than being papered over.

pub(crate) fn parse_uuid(value: &str) -> crate::error::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        crate::error::KbError::Validation(format!("invalid uuid '{}': {}", value, e))
    })
}

pub(crate) fn parse_string_list(value: &str) -> crate::error::Result<Vec<String>> {
    Ok(serde_json::from_str(value)?)
}

pub(crate) fn parse_uuid_list(value: &str) -> crate::error::Result<Vec<Uuid>> {
    let raw: Vec<String> = serde_json::from_str(value)?;
    raw.iter().map(|s| parse_uuid(s)).collect()
}

pub(crate) fn parse_metadata(value: &str) -> crate::error::Result<Metadata> {
    Ok(serde_json::from_str(value)?)
}

pub(crate) fn uuid_list_to_json(ids: &[Uuid]) -> crate::error::Result<String> {
    let raw: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    Ok(serde_json::to_string(&raw)?)
}
