//! Graph queries over the concept relationship graph.
//!
//! Shortest-path search, N-hop neighborhood expansion, and the
//! graph-proximity score consumed by hybrid search. Traversal runs as a
//! recursive CTE against the edge-direction indexes, so bounded
//! neighborhood queries stay index-backed instead of scanning the edge
//! table. Directed edges are walked in their stored direction; undirected
//! edges are walked both ways. The CTE carries the visited path and
//! excludes revisits explicitly, so cyclic graphs terminate without
//! leaning on the hop bound.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::concepts;
use crate::config::{Config, DecayCurve, GraphConfig};
use crate::db;
use crate::dedup::Deduplicator;
use crate::error::{KbError, Result};
use crate::models::{parse_uuid, GraphPath, Neighbor, PathHop, RelationshipType};
use crate::relationships;

/// Neighborhood expansion is bounded to keep latency predictable.
const MAX_NEIGHBORHOOD_HOPS: u32 = 3;

/// Find one shortest path between two concepts within `max_hops` edges.
///
/// Returns `Ok(None)` when the target is unreachable within the bound —
/// a valid no-result outcome, not an error. When several shortest paths
/// exist, the one with the lexicographically smallest id sequence is
/// returned; callers may only rely on the length being minimal.
pub async fn find_shortest_path(
    pool: &SqlitePool,
    start: Uuid,
    end: Uuid,
    max_hops: u32,
) -> Result<Option<GraphPath>> {
    let row = sqlx::query(
        r#"
        WITH RECURSIVE walk(concept_id, depth, path, rel_path) AS (
            SELECT ?1, 0, ?1, ''

            UNION ALL

            SELECT
                CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END,
                prev.depth + 1,
                prev.path || ',' || CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END,
                prev.rel_path || CASE WHEN prev.rel_path = '' THEN '' ELSE ',' END || r.id
            FROM walk prev
            JOIN concept_relationships r ON (
                r.source_concept_id = prev.concept_id
                OR (r.target_concept_id = prev.concept_id AND r.is_directed = 0)
            )
            WHERE prev.depth < ?2
              AND instr(prev.path, CASE WHEN r.source_concept_id = prev.concept_id
                    THEN r.target_concept_id ELSE r.source_concept_id END) = 0
        )
        SELECT path, rel_path, depth
        FROM walk
        WHERE concept_id = ?3
        ORDER BY depth ASC, path ASC
        LIMIT 1
        "#,
    )
    .bind(start.to_string())
    .bind(max_hops as i64)
    .bind(end.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let path: String = row.get("path");
    let rel_path: String = row.get("rel_path");

    let concept_ids: Vec<Uuid> = path
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_uuid)
        .collect::<Result<_>>()?;
    let rel_ids: Vec<Uuid> = rel_path
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_uuid)
        .collect::<Result<_>>()?;

    let mut hops = Vec::with_capacity(concept_ids.len());
    for (i, concept_id) in concept_ids.iter().enumerate() {
        let concept = concepts::get_by_id(pool, *concept_id)
            .await?
            .ok_or_else(|| KbError::NotFound {
                entity: "concept",
                id: concept_id.to_string(),
            })?;

        let relationship = if i == 0 {
            None
        } else {
            relationships::get_by_id(pool, rel_ids[i - 1]).await?
        };

        hops.push(PathHop {
            concept,
            relationship,
        });
    }

    debug!(start = %start, end = %end, hops = hops.len() - 1, "shortest path found");
    Ok(Some(GraphPath { hops }))
}

/// Minimum hop distance from `start` to every concept reachable within
/// `max_hops`, including `start` itself at distance 0.
///
/// This is the light-weight primitive behind graph scoring: one traversal
/// per query concept, reused across every candidate chunk.
pub async fn distance_map(
    pool: &SqlitePool,
    start: Uuid,
    max_hops: u32,
    relationship_type: Option<RelationshipType>,
) -> Result<HashMap<Uuid, u32>> {
    let type_filter = if relationship_type.is_some() {
        "AND r.relationship_type = ?3"
    } else {
        ""
    };

    let sql = format!(
        r#"
        WITH RECURSIVE reachable(concept_id, depth, path) AS (
            SELECT ?1, 0, ?1

            UNION ALL

            SELECT
                CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END,
                prev.depth + 1,
                prev.path || ',' || CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END
            FROM reachable prev
            JOIN concept_relationships r ON (
                r.source_concept_id = prev.concept_id
                OR (r.target_concept_id = prev.concept_id AND r.is_directed = 0)
            )
            WHERE prev.depth < ?2
              AND instr(prev.path, CASE WHEN r.source_concept_id = prev.concept_id
                    THEN r.target_concept_id ELSE r.source_concept_id END) = 0
              {type_filter}
        )
        SELECT concept_id, MIN(depth) AS distance
        FROM reachable
        GROUP BY concept_id
        "#
    );

    let mut query = sqlx::query(&sql)
        .bind(start.to_string())
        .bind(max_hops as i64);
    if let Some(t) = relationship_type {
        query = query.bind(t.as_str());
    }

    let rows = query.fetch_all(pool).await?;

    let mut distances = HashMap::with_capacity(rows.len());
    for row in &rows {
        let concept_id: String = row.get("concept_id");
        let distance: i64 = row.get("distance");
        distances.insert(parse_uuid(&concept_id)?, distance as u32);
    }
    Ok(distances)
}

/// Expand the N-hop neighborhood of a concept.
///
/// The center itself is excluded. Concepts reachable by several routes are
/// reported once at their minimum distance, ordered by distance and then
/// canonical name. `hops` is clamped to 1–3.
pub async fn neighborhood(
    pool: &SqlitePool,
    concept_id: Uuid,
    hops: u32,
    relationship_type: Option<RelationshipType>,
) -> Result<Vec<Neighbor>> {
    let hops = hops.clamp(1, MAX_NEIGHBORHOOD_HOPS);

    if concepts::get_by_id(pool, concept_id).await?.is_none() {
        return Err(KbError::NotFound {
            entity: "concept",
            id: concept_id.to_string(),
        });
    }

    let type_filter = if relationship_type.is_some() {
        "AND r.relationship_type = ?3"
    } else {
        ""
    };

    let sql = format!(
        r#"
        WITH RECURSIVE reachable(concept_id, depth, path) AS (
            SELECT ?1, 0, ?1

            UNION ALL

            SELECT
                CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END,
                prev.depth + 1,
                prev.path || ',' || CASE WHEN r.source_concept_id = prev.concept_id
                     THEN r.target_concept_id ELSE r.source_concept_id END
            FROM reachable prev
            JOIN concept_relationships r ON (
                r.source_concept_id = prev.concept_id
                OR (r.target_concept_id = prev.concept_id AND r.is_directed = 0)
            )
            WHERE prev.depth < ?2
              AND instr(prev.path, CASE WHEN r.source_concept_id = prev.concept_id
                    THEN r.target_concept_id ELSE r.source_concept_id END) = 0
              {type_filter}
        )
        SELECT
            concept_id,
            MIN(depth) AS distance,
            (SELECT path FROM reachable r2
             WHERE r2.concept_id = reachable.concept_id
             ORDER BY r2.depth ASC, r2.path ASC
             LIMIT 1) AS path
        FROM reachable
        WHERE concept_id != ?1
        GROUP BY concept_id
        "#
    );

    let mut query = sqlx::query(&sql)
        .bind(concept_id.to_string())
        .bind(hops as i64);
    if let Some(t) = relationship_type {
        query = query.bind(t.as_str());
    }

    let rows = query.fetch_all(pool).await?;

    let mut neighbors = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("concept_id");
        let distance: i64 = row.get("distance");
        let path: String = row.get("path");

        let id = parse_uuid(&id)?;
        let concept = concepts::get_by_id(pool, id).await?.ok_or_else(|| KbError::NotFound {
            entity: "concept",
            id: id.to_string(),
        })?;

        neighbors.push(Neighbor {
            concept,
            distance: distance as u32,
            path: path
                .split(',')
                .filter(|s| !s.is_empty())
                .map(parse_uuid)
                .collect::<Result<_>>()?,
        });
    }

    neighbors.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.concept.canonical_name.cmp(&b.concept.canonical_name))
    });
    Ok(neighbors)
}

/// Weight contributed by a connection at hop distance `d`.
pub fn decay(curve: DecayCurve, distance: u32, max_hops: u32) -> f64 {
    match curve {
        DecayCurve::Inverse => 1.0 / (distance as f64 + 1.0),
        DecayCurve::Exponential => 0.5f64.powi(distance as i32),
        DecayCurve::Linear => (1.0 - distance as f64 / (max_hops as f64 + 1.0)).max(0.0),
    }
}

/// Score graph proximity given precomputed per-query-concept distance maps.
///
/// Sum of decayed distances over connected (query concept, chunk concept)
/// pairs, normalized by the number of pairs and clamped to [0, 1]. Zero
/// when either side is empty or nothing is reachable.
pub fn score_from_distances(
    maps: &[HashMap<Uuid, u32>],
    chunk_concepts: &[Uuid],
    curve: DecayCurve,
    max_hops: u32,
) -> f64 {
    if maps.is_empty() || chunk_concepts.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    for distances in maps {
        for concept_id in chunk_concepts {
            if let Some(d) = distances.get(concept_id) {
                total += decay(curve, *d, max_hops);
            }
        }
    }

    let pairs = (maps.len() * chunk_concepts.len()) as f64;
    (total / pairs).min(1.0)
}

/// Graph relevance between query concepts and a chunk's concepts, in [0, 1].
pub async fn graph_score(
    pool: &SqlitePool,
    query_concepts: &[Uuid],
    chunk_concepts: &[Uuid],
    config: &GraphConfig,
) -> Result<f64> {
    if query_concepts.is_empty() || chunk_concepts.is_empty() {
        return Ok(0.0);
    }

    let mut maps = Vec::with_capacity(query_concepts.len());
    for query_id in query_concepts {
        maps.push(distance_map(pool, *query_id, config.max_hops, None).await?);
    }

    Ok(score_from_distances(
        &maps,
        chunk_concepts,
        config.decay,
        config.max_hops,
    ))
}

// ============ CLI commands ============

/// `rkb graph path`: resolve two concept names and print the path between them.
pub async fn run_path(config: &Config, from: &str, to: &str, max_hops: u32) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let dedup = Deduplicator::new(&config.dedup);

    let start = concepts::resolve_name(&pool, &dedup, from)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown concept: {}", from))?;
    let end = concepts::resolve_name(&pool, &dedup, to)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown concept: {}", to))?;

    match find_shortest_path(&pool, start.id, end.id, max_hops).await? {
        Some(path) => {
            println!("Path ({} hops):", path.len());
            for hop in &path.hops {
                match &hop.relationship {
                    Some(rel) => println!(
                        "  --[{}]--> {}",
                        rel.relationship_type.as_str(),
                        hop.concept.name
                    ),
                    None => println!("  {}", hop.concept.name),
                }
            }
        }
        None => println!(
            "No path from '{}' to '{}' within {} hops.",
            start.name, end.name, max_hops
        ),
    }

    pool.close().await;
    Ok(())
}

/// `rkb graph neighbors`: print the N-hop neighborhood of a concept.
pub async fn run_neighbors(
    config: &Config,
    name: &str,
    hops: u32,
    relationship_type: Option<&str>,
) -> anyhow::Result<()> {
    let rel_type = match relationship_type {
        Some(raw) => Some(RelationshipType::parse(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown relationship type: {}. Use REQUIRES, USES, ADDRESSES, GENERALIZES, SPECIALIZES, ALTERNATIVE_TO, or EXTENDS.",
                raw
            )
        })?),
        None => None,
    };

    let pool = db::connect(config).await?;
    let dedup = Deduplicator::new(&config.dedup);

    let center = concepts::resolve_name(&pool, &dedup, name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown concept: {}", name))?;

    let neighbors = neighborhood(&pool, center.id, hops, rel_type).await?;

    if neighbors.is_empty() {
        println!("No neighbors within {} hops of '{}'.", hops, center.name);
    } else {
        println!("Neighborhood of '{}' ({} hops):", center.name, hops);
        for neighbor in &neighbors {
            println!(
                "  [{}] {} ({})",
                neighbor.distance,
                neighbor.concept.name,
                neighbor.concept.concept_type.as_str()
            );
        }
    }

    pool.close().await;
    Ok(())
}
