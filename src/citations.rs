//! Citation store and citation graph.
//!
//! Citations are bibliography entries extracted from sources. The graph
//! half matches each citation to a corpus source (DOI first, then arXiv
//! id, then fuzzy title + year), records source-to-source edges, and
//! computes PageRank-style authority scores persisted on sources.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::error::{KbError, Result};
use crate::models::{
    parse_metadata, parse_string_list, parse_uuid, Citation, NewCitation, Source, SourceCitation,
};
use crate::sources::row_to_source;

pub async fn create(pool: &SqlitePool, new: NewCitation) -> Result<Citation> {
    if new.raw_string.trim().is_empty() {
        return Err(KbError::Validation("raw_string must be non-empty".to_string()));
    }
    if let Some(score) = new.confidence_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(KbError::Validation(format!(
                "confidence_score must be in [0, 1], got {}",
                score
            )));
        }
    }

    let citation = Citation {
        id: Uuid::new_v4(),
        source_id: new.source_id,
        authors: new.authors,
        title: new.title,
        year: new.year,
        venue: new.venue,
        doi: new.doi,
        arxiv_id: new.arxiv_id,
        raw_string: new.raw_string,
        bibtex: new.bibtex,
        extraction_method: new.extraction_method,
        confidence_score: new.confidence_score,
        metadata: new.metadata,
        created_at: chrono::Utc::now().timestamp(),
    };

    insert_citation(pool, &citation).await?;
    info!(citation_id = %citation.id, source_id = %citation.source_id, "citation created");
    Ok(citation)
}

async fn insert_citation<'e, E>(executor: E, citation: &Citation) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO citations (
            id, source_id, authors, title, year, venue, doi, arxiv_id,
            raw_string, bibtex, extraction_method, confidence_score,
            metadata, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(citation.id.to_string())
    .bind(citation.source_id.to_string())
    .bind(serde_json::to_string(&citation.authors)?)
    .bind(&citation.title)
    .bind(citation.year)
    .bind(&citation.venue)
    .bind(&citation.doi)
    .bind(&citation.arxiv_id)
    .bind(&citation.raw_string)
    .bind(&citation.bibtex)
    .bind(&citation.extraction_method)
    .bind(citation.confidence_score)
    .bind(serde_json::to_string(&citation.metadata)?)
    .bind(citation.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Insert a batch of citations in a single transaction.
pub async fn batch_create(pool: &SqlitePool, new_citations: Vec<NewCitation>) -> Result<Vec<Citation>> {
    if new_citations.is_empty() {
        return Ok(Vec::new());
    }

    let now = chrono::Utc::now().timestamp();
    let citations: Vec<Citation> = new_citations
        .into_iter()
        .map(|new| Citation {
            id: Uuid::new_v4(),
            source_id: new.source_id,
            authors: new.authors,
            title: new.title,
            year: new.year,
            venue: new.venue,
            doi: new.doi,
            arxiv_id: new.arxiv_id,
            raw_string: new.raw_string,
            bibtex: new.bibtex,
            extraction_method: new.extraction_method,
            confidence_score: new.confidence_score,
            metadata: new.metadata,
            created_at: now,
        })
        .collect();

    for citation in &citations {
        if citation.raw_string.trim().is_empty() {
            return Err(KbError::Validation("raw_string must be non-empty".to_string()));
        }
    }

    let mut tx = pool.begin().await?;
    for citation in &citations {
        insert_citation(&mut *tx, citation).await?;
    }
    tx.commit().await?;

    info!(count = citations.len(), "citation batch created");
    Ok(citations)
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Citation>> {
    let row = sqlx::query("SELECT * FROM citations WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_citation).transpose()
}

pub async fn list_by_source(pool: &SqlitePool, source_id: Uuid) -> Result<Vec<Citation>> {
    let rows = sqlx::query("SELECT * FROM citations WHERE source_id = ? ORDER BY created_at ASC, id ASC")
        .bind(source_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_citation).collect()
}

pub async fn count_by_source(pool: &SqlitePool, source_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM citations WHERE source_id = ?")
        .bind(source_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn find_by_doi(pool: &SqlitePool, doi: &str) -> Result<Option<Citation>> {
    let row = sqlx::query("SELECT * FROM citations WHERE doi = ? ORDER BY created_at ASC LIMIT 1")
        .bind(doi)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_citation).transpose()
}

pub async fn find_by_arxiv(pool: &SqlitePool, arxiv_id: &str) -> Result<Option<Citation>> {
    let row = sqlx::query("SELECT * FROM citations WHERE arxiv_id = ? ORDER BY created_at ASC LIMIT 1")
        .bind(arxiv_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_citation).transpose()
}

pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM citations WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// ============ Citation graph ============

/// Outcome of a `link_citations` pass.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub processed: u64,
    pub matched: u64,
    pub unmatched: u64,
}

/// Match a citation against the corpus: DOI exact, then arXiv id exact,
/// then fuzzy title similarity with agreeing years.
async fn match_citation_to_source(
    pool: &SqlitePool,
    dedup: &Deduplicator,
    citation: &Citation,
    candidates: &[(Uuid, String, Option<i64>)],
) -> Result<Option<Uuid>> {
    if let Some(doi) = &citation.doi {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT id FROM sources WHERE json_extract(metadata, '$.doi') = ? LIMIT 1",
        )
        .bind(doi)
        .fetch_optional(pool)
        .await?;
        if let Some(id) = row {
            return Ok(Some(parse_uuid(&id)?));
        }
    }

    if let Some(arxiv_id) = &citation.arxiv_id {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT id FROM sources WHERE json_extract(metadata, '$.arxiv_id') = ? LIMIT 1",
        )
        .bind(arxiv_id)
        .fetch_optional(pool)
        .await?;
        if let Some(id) = row {
            return Ok(Some(parse_uuid(&id)?));
        }
    }

    let Some(title) = &citation.title else {
        return Ok(None);
    };

    let mut best: Option<(Uuid, f64)> = None;
    for (id, candidate_title, candidate_year) in candidates {
        if let (Some(cy), Some(sy)) = (citation.year, candidate_year) {
            if cy != *sy {
                continue;
            }
        }
        let sim = dedup.similarity(title, candidate_title);
        if sim >= 0.85 && best.map_or(true, |(_, s)| sim > s) {
            best = Some((*id, sim));
        }
    }
    Ok(best.map(|(id, _)| id))
}

/// Build source-to-source citation edges from the extracted citations.
///
/// One edge per (citing source, citation) pair; re-running is a no-op for
/// edges that already exist. Citations that match nothing in the corpus
/// get an edge with a NULL target so external references stay countable.
pub async fn link_citations(pool: &SqlitePool, dedup: &Deduplicator) -> Result<LinkStats> {
    let citation_rows = sqlx::query("SELECT * FROM citations ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;

    let candidate_rows = sqlx::query("SELECT id, title, year FROM sources")
        .fetch_all(pool)
        .await?;
    let mut candidates: Vec<(Uuid, String, Option<i64>)> = Vec::with_capacity(candidate_rows.len());
    for row in &candidate_rows {
        let id: String = row.get("id");
        candidates.push((parse_uuid(&id)?, row.get("title"), row.get("year")));
    }

    let mut stats = LinkStats::default();

    for row in &citation_rows {
        let citation = row_to_citation(row)?;
        stats.processed += 1;

        let cited = match_citation_to_source(pool, dedup, &citation, &candidates).await?;

        // A citation cannot resolve to the document that cites it
        let cited = cited.filter(|id| *id != citation.source_id);

        let result = sqlx::query(
            r#"
            INSERT INTO source_citations (id, citing_source_id, cited_source_id, citation_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (citing_source_id, citation_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(citation.source_id.to_string())
        .bind(cited.map(|id| id.to_string()))
        .bind(citation.id.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(citation_id = %citation.id, "citation edge already linked");
        }

        if cited.is_some() {
            stats.matched += 1;
        } else {
            stats.unmatched += 1;
        }
    }

    info!(
        processed = stats.processed,
        matched = stats.matched,
        unmatched = stats.unmatched,
        "citation graph linked"
    );
    Ok(stats)
}

/// Summary of a `compute_authority` pass.
#[derive(Debug, Clone)]
pub struct AuthorityStats {
    pub sources: usize,
    pub min_score: f64,
    pub max_score: f64,
    pub mean_score: f64,
}

/// Compute PageRank-style citation authority and persist it on sources.
///
/// Scores are normalized by the maximum so the most-cited source sits at
/// 1.0; isolated sources settle near the damping floor.
pub async fn compute_authority(
    pool: &SqlitePool,
    iterations: u32,
    damping: f64,
) -> Result<AuthorityStats> {
    if !(0.0..1.0).contains(&damping) {
        return Err(KbError::Validation(format!(
            "damping must be in [0, 1), got {}",
            damping
        )));
    }

    let source_rows = sqlx::query("SELECT id FROM sources").fetch_all(pool).await?;
    let mut source_ids: Vec<Uuid> = Vec::with_capacity(source_rows.len());
    for row in &source_rows {
        let id: String = row.get("id");
        source_ids.push(parse_uuid(&id)?);
    }

    let n = source_ids.len();
    if n == 0 {
        return Err(KbError::Validation(
            "no sources to compute authority over".to_string(),
        ));
    }

    let edge_rows = sqlx::query(
        "SELECT citing_source_id, cited_source_id FROM source_citations WHERE cited_source_id IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut incoming: HashMap<Uuid, Vec<Uuid>> = source_ids.iter().map(|id| (*id, Vec::new())).collect();
    let mut out_degree: HashMap<Uuid, usize> = source_ids.iter().map(|id| (*id, 0)).collect();

    for row in &edge_rows {
        let citing: String = row.get("citing_source_id");
        let cited: String = row.get("cited_source_id");
        let citing = parse_uuid(&citing)?;
        let cited = parse_uuid(&cited)?;
        if let (Some(inc), Some(out)) = (incoming.get_mut(&cited), out_degree.get_mut(&citing)) {
            inc.push(citing);
            *out += 1;
        }
    }

    let mut scores: HashMap<Uuid, f64> = source_ids.iter().map(|id| (*id, 1.0 / n as f64)).collect();

    for _ in 0..iterations {
        let mut next: HashMap<Uuid, f64> = HashMap::with_capacity(n);
        for id in &source_ids {
            let mut incoming_score = 0.0;
            for citing in &incoming[id] {
                let degree = out_degree[citing];
                if degree > 0 {
                    incoming_score += scores[citing] / degree as f64;
                }
            }
            next.insert(*id, (1.0 - damping) / n as f64 + damping * incoming_score);
        }
        scores = next;
    }

    let max_score = scores.values().cloned().fold(f64::MIN, f64::max);
    if max_score > 0.0 {
        for score in scores.values_mut() {
            *score /= max_score;
        }
    }

    let mut tx = pool.begin().await?;
    for (id, score) in &scores {
        sqlx::query("UPDATE sources SET citation_authority = ? WHERE id = ?")
            .bind(score)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    let values: Vec<f64> = scores.values().cloned().collect();
    let stats = AuthorityStats {
        sources: n,
        min_score: values.iter().cloned().fold(f64::MAX, f64::min),
        max_score: values.iter().cloned().fold(f64::MIN, f64::max),
        mean_score: values.iter().sum::<f64>() / n as f64,
    };

    info!(
        sources = stats.sources,
        min_score = stats.min_score,
        max_score = stats.max_score,
        "citation authority computed"
    );
    Ok(stats)
}

/// Sources ordered by how often the corpus cites them.
pub async fn most_cited(pool: &SqlitePool, limit: i64) -> Result<Vec<(Source, i64)>> {
    let rows = sqlx::query(
        r#"
        SELECT s.*, COUNT(sc.id) AS cited_count
        FROM sources s
        JOIN source_citations sc ON sc.cited_source_id = s.id
        GROUP BY s.id
        ORDER BY cited_count DESC, s.id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let source = row_to_source(row)?;
        let cited_count: i64 = row.get("cited_count");
        results.push((source, cited_count));
    }
    Ok(results)
}

/// Citation edges owned by a source (its outgoing references).
pub async fn edges_for_source(pool: &SqlitePool, source_id: Uuid) -> Result<Vec<SourceCitation>> {
    let rows = sqlx::query(
        "SELECT * FROM source_citations WHERE citing_source_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(source_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut edges = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        let citing: String = row.get("citing_source_id");
        let cited: Option<String> = row.get("cited_source_id");
        let citation_id: String = row.get("citation_id");
        edges.push(SourceCitation {
            id: parse_uuid(&id)?,
            citing_source_id: parse_uuid(&citing)?,
            cited_source_id: cited.as_deref().map(parse_uuid).transpose()?,
            citation_id: parse_uuid(&citation_id)?,
            created_at: row.get("created_at"),
        });
    }
    Ok(edges)
}

/// Sources that cite the given source.
pub async fn citing_sources(pool: &SqlitePool, source_id: Uuid) -> Result<Vec<Source>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT s.* FROM sources s
        JOIN source_citations sc ON sc.citing_source_id = s.id
        WHERE sc.cited_source_id = ?
        ORDER BY s.id ASC
        "#,
    )
    .bind(source_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_source).collect()
}

// ============ CLI commands ============

/// `rkb citations link`: build the citation graph.
pub async fn run_link(config: &crate::config::Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let dedup = Deduplicator::new(&config.dedup);

    let stats = link_citations(&pool, &dedup).await?;

    println!("citations link");
    println!("  processed: {}", stats.processed);
    println!("  matched: {}", stats.matched);
    println!("  unmatched (external): {}", stats.unmatched);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `rkb citations authority`: compute and persist authority scores.
pub async fn run_authority(
    config: &crate::config::Config,
    iterations: u32,
    damping: f64,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let stats = compute_authority(&pool, iterations, damping).await?;

    println!("citations authority");
    println!("  sources: {}", stats.sources);
    println!("  min: {:.4}", stats.min_score);
    println!("  max: {:.4}", stats.max_score);
    println!("  mean: {:.4}", stats.mean_score);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `rkb citations top`: print the most-cited sources.
pub async fn run_top(config: &crate::config::Config, limit: i64) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let top = most_cited(&pool, limit).await?;
    if top.is_empty() {
        println!("No resolved citations yet. Run `rkb citations link` first.");
    } else {
        for (i, (source, cited_count)) in top.iter().enumerate() {
            println!(
                "{}. {} ({} citations, authority {:.3})",
                i + 1,
                source.title,
                cited_count,
                source.citation_authority
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn row_to_citation(row: &SqliteRow) -> Result<Citation> {
    let id: String = row.get("id");
    let source_id: String = row.get("source_id");
    let authors: String = row.get("authors");
    let metadata: String = row.get("metadata");

    Ok(Citation {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source_id)?,
        authors: parse_string_list(&authors)?,
        title: row.get("title"),
        year: row.get("year"),
        venue: row.get("venue"),
        doi: row.get("doi"),
        arxiv_id: row.get("arxiv_id"),
        raw_string: row.get("raw_string"),
        bibtex: row.get("bibtex"),
        extraction_method: row.get("extraction_method"),
        confidence_score: row.get("confidence_score"),
        metadata: parse_metadata(&metadata)?,
        created_at: row.get("created_at"),
    })
}
