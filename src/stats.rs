//! Corpus statistics and health overview.
//!
//! A quick summary of what's indexed: source, chunk, and concept counts,
//! embedding coverage, graph size, and per-source-type breakdowns. Used by
//! `rkb stats` to confirm ingestion and extraction are keeping up.

use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::Result;

struct TypeStats {
    source_type: String,
    source_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    let value: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(value)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    let total_sources = count(&pool, "SELECT COUNT(*) FROM sources").await?;
    let total_chunks = count(&pool, "SELECT COUNT(*) FROM chunks").await?;
    let total_embedded =
        count(&pool, "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL").await?;
    let total_concepts = count(&pool, "SELECT COUNT(*) FROM concepts").await?;
    let total_validated = count(&pool, "SELECT COUNT(*) FROM concepts WHERE validated = 1").await?;
    let total_relationships = count(&pool, "SELECT COUNT(*) FROM concept_relationships").await?;
    let total_links = count(&pool, "SELECT COUNT(*) FROM chunk_concepts").await?;
    let total_citations = count(&pool, "SELECT COUNT(*) FROM citations").await?;
    let total_edges = count(
        &pool,
        "SELECT COUNT(*) FROM source_citations WHERE cited_source_id IS NOT NULL",
    )
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("research-kb — Corpus Stats");
    println!("==========================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Sources:        {}", total_sources);
    println!(
        "  Chunks:         {} ({} embedded, {}%)",
        total_chunks,
        total_embedded,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!(
        "  Concepts:       {} ({} validated)",
        total_concepts, total_validated
    );
    println!("  Relationships:  {}", total_relationships);
    println!("  Chunk links:    {}", total_links);
    println!(
        "  Citations:      {} ({} resolved to corpus sources)",
        total_citations, total_edges
    );

    let type_rows = sqlx::query(
        r#"
        SELECT
            s.source_type,
            COUNT(DISTINCT s.id) AS source_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT CASE WHEN c.embedding IS NOT NULL THEN c.id END) AS embedded_count
        FROM sources s
        LEFT JOIN chunks c ON c.source_id = s.id
        GROUP BY s.source_type
        ORDER BY source_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let type_stats: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            source_type: row.get("source_type"),
            source_count: row.get("source_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !type_stats.is_empty() {
        println!();
        println!("  By source type:");
        println!(
            "  {:<12} {:>8} {:>8} {:>10}",
            "TYPE", "SOURCES", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(42));
        for stats in &type_stats {
            println!(
                "  {:<12} {:>8} {:>8} {:>10}",
                stats.source_type, stats.source_count, stats.chunk_count, stats.embedded_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
