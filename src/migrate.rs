//! Schema migrations.
//!
//! Creates the seven core tables, the FTS5 index over chunks, and the
//! traversal indexes. Running migrations repeatedly is safe.
//!
//! The full-text index is an external-content FTS5 table maintained by
//! AFTER INSERT / AFTER DELETE triggers on `chunks` — the derived search
//! vector is computed by the database, never by application code. Ranking
//! weights the location field above the content body.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL CHECK (source_type IN ('textbook', 'paper', 'code_repo')),
            title TEXT NOT NULL,
            authors TEXT NOT NULL DEFAULT '[]',
            year INTEGER,
            file_path TEXT,
            file_hash TEXT NOT NULL UNIQUE,
            citation_authority REAL NOT NULL DEFAULT 0.0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            location TEXT,
            page_start INTEGER,
            page_end INTEGER,
            embedding BLOB,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS citations (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            authors TEXT NOT NULL DEFAULT '[]',
            title TEXT,
            year INTEGER,
            venue TEXT,
            doi TEXT,
            arxiv_id TEXT,
            raw_string TEXT NOT NULL,
            bibtex TEXT,
            extraction_method TEXT,
            confidence_score REAL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_citations (
            id TEXT PRIMARY KEY,
            citing_source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            cited_source_id TEXT REFERENCES sources(id) ON DELETE SET NULL,
            citation_id TEXT NOT NULL REFERENCES citations(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            UNIQUE (citing_source_id, citation_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            canonical_name TEXT NOT NULL UNIQUE,
            aliases TEXT NOT NULL DEFAULT '[]',
            concept_type TEXT NOT NULL CHECK (
                concept_type IN ('method', 'assumption', 'problem', 'definition', 'theorem')
            ),
            category TEXT,
            definition TEXT,
            embedding BLOB,
            extraction_method TEXT,
            confidence_score REAL,
            validated INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concept_relationships (
            id TEXT PRIMARY KEY,
            source_concept_id TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
            target_concept_id TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
            relationship_type TEXT NOT NULL CHECK (
                relationship_type IN (
                    'REQUIRES', 'USES', 'ADDRESSES', 'GENERALIZES',
                    'SPECIALIZES', 'ALTERNATIVE_TO', 'EXTENDS'
                )
            ),
            is_directed INTEGER NOT NULL DEFAULT 1,
            strength REAL NOT NULL DEFAULT 1.0,
            confidence_score REAL,
            evidence_chunk_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            UNIQUE (source_concept_id, target_concept_id, relationship_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_concepts (
            chunk_id TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
            concept_id TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
            mention_type TEXT NOT NULL DEFAULT 'reference' CHECK (
                mention_type IN ('defines', 'reference', 'example')
            ),
            relevance_score REAL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, concept_id, mention_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                location,
                content,
                content='chunks',
                content_rowid='rowid'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_fts_after_insert
        AFTER INSERT ON chunks
        BEGIN
            INSERT INTO chunks_fts(rowid, location, content)
            VALUES (new.rowid, coalesce(new.location, ''), new.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_fts_after_delete
        AFTER DELETE ON chunks
        BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, location, content)
            VALUES ('delete', old.rowid, coalesce(old.location, ''), old.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    // Edge-direction indexes on both endpoints keep bounded neighborhood
    // traversal off full edge-table scans.
    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_content_hash ON chunks(content_hash)",
        "CREATE INDEX IF NOT EXISTS idx_citations_source_id ON citations(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_citations_doi ON citations(doi)",
        "CREATE INDEX IF NOT EXISTS idx_source_citations_cited ON source_citations(cited_source_id)",
        "CREATE INDEX IF NOT EXISTS idx_concepts_type ON concepts(concept_type)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_source ON concept_relationships(source_concept_id)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON concept_relationships(target_concept_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunk_concepts_concept ON chunk_concepts(concept_id)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
