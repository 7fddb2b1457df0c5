use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Config {
    /// Build a config with defaults around an explicit database path.
    /// Used by tests and as the CLI fallback when no config file exists.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Config {
            db: DbConfig {
                path: path.into(),
                min_connections: default_min_connections(),
                max_connections: default_max_connections(),
                acquire_timeout_secs: default_acquire_timeout(),
            },
            search: SearchConfig::default(),
            graph: GraphConfig::default(),
            dedup: DedupConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_min_connections() -> u32 {
    2
}
fn default_max_connections() -> u32 {
    10
}
fn default_acquire_timeout() -> u64 {
    30
}

/// Weights for the three hybrid-search signals.
///
/// By convention the weights sum to 1.0 so combined scores stay
/// interpretable; the engine renormalizes at query time either way.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct SearchWeights {
    pub fts: f64,
    pub vector: f64,
    pub graph: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_preset_name")]
    pub default_preset: String,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_fts: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    /// Named weight configurations for context types. The defaults cover
    /// "building" (broad semantic exploration), "auditing" (precise term
    /// matching), and "balanced".
    #[serde(default = "default_presets")]
    pub presets: BTreeMap<String, SearchWeights>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            default_preset: default_preset_name(),
            candidate_k_fts: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            default_limit: default_limit(),
            presets: default_presets(),
        }
    }
}

impl SearchConfig {
    pub fn preset(&self, name: &str) -> Option<SearchWeights> {
        self.presets.get(name).copied()
    }
}

fn default_preset_name() -> String {
    "balanced".to_string()
}
fn default_candidate_k() -> i64 {
    80
}
fn default_limit() -> i64 {
    10
}

fn default_presets() -> BTreeMap<String, SearchWeights> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "building".to_string(),
        SearchWeights {
            fts: 0.2,
            vector: 0.7,
            graph: 0.1,
        },
    );
    presets.insert(
        "auditing".to_string(),
        SearchWeights {
            fts: 0.45,
            vector: 0.45,
            graph: 0.1,
        },
    );
    presets.insert(
        "balanced".to_string(),
        SearchWeights {
            fts: 0.3,
            vector: 0.6,
            graph: 0.1,
        },
    );
    presets
}

/// Decay curve applied to hop distances when scoring graph proximity.
/// The curve is a tunable parameter, not a contract.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecayCurve {
    /// 1 / (d + 1): direct link 1.0, 1 hop 0.5, 2 hops 0.33.
    Inverse,
    /// 2^-d: direct link 1.0, 1 hop 0.5, 2 hops 0.25.
    Exponential,
    /// 1 - d / (max_hops + 1), floored at 0.
    Linear,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_decay")]
    pub decay: DecayCurve,
    /// Maximum concepts matched from a query for graph scoring.
    #[serde(default = "default_max_query_concepts")]
    pub max_query_concepts: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            max_hops: default_max_hops(),
            decay: default_decay(),
            max_query_concepts: default_max_query_concepts(),
        }
    }
}

fn default_max_hops() -> u32 {
    2
}
fn default_decay() -> DecayCurve {
    DecayCurve::Inverse
}
fn default_max_query_concepts() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Token-set similarity at or above which two names are duplicates.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Embedding cosine similarity above which two concepts are flagged
    /// for manual review (never auto-merged on this signal alone).
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            fuzzy_threshold: default_fuzzy_threshold(),
            semantic_threshold: default_semantic_threshold(),
        }
    }
}

fn default_fuzzy_threshold() -> f64 {
    0.85
}
fn default_semantic_threshold() -> f64 {
    0.95
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1024
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }
    if config.db.min_connections > config.db.max_connections {
        anyhow::bail!("db.min_connections must not exceed db.max_connections");
    }

    if config.search.default_limit < 1 {
        anyhow::bail!("search.default_limit must be >= 1");
    }
    if !config.search.presets.contains_key(&config.search.default_preset) {
        anyhow::bail!(
            "search.default_preset '{}' is not a configured preset",
            config.search.default_preset
        );
    }
    for (name, w) in &config.search.presets {
        if w.fts < 0.0 || w.vector < 0.0 || w.graph < 0.0 {
            anyhow::bail!("search.presets.{}: weights must be non-negative", name);
        }
        if w.fts + w.vector + w.graph <= 0.0 {
            anyhow::bail!("search.presets.{}: at least one weight must be positive", name);
        }
    }

    if !(1..=5).contains(&config.graph.max_hops) {
        anyhow::bail!("graph.max_hops must be in 1..=5");
    }

    if !(0.0..=1.0).contains(&config.dedup.fuzzy_threshold) {
        anyhow::bail!("dedup.fuzzy_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.dedup.semantic_threshold) {
        anyhow::bail!("dedup.semantic_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_presets_present() {
        let config = Config::with_db_path("/tmp/kb.sqlite");
        let balanced = config.search.preset("balanced").unwrap();
        assert_eq!(balanced.fts, 0.3);
        assert_eq!(balanced.vector, 0.6);
        assert_eq!(balanced.graph, 0.1);

        let building = config.search.preset("building").unwrap();
        assert!(building.vector > building.fts);

        let auditing = config.search.preset("auditing").unwrap();
        assert_eq!(auditing.fts, auditing.vector);
    }

    #[test]
    fn test_unknown_preset_is_none() {
        let config = Config::with_db_path("/tmp/kb.sqlite");
        assert!(config.search.preset("exploratory").is_none());
    }

    #[test]
    fn test_defaults() {
        let config = Config::with_db_path("/tmp/kb.sqlite");
        assert_eq!(config.db.min_connections, 2);
        assert_eq!(config.db.max_connections, 10);
        assert_eq!(config.graph.max_hops, 2);
        assert_eq!(config.graph.decay, DecayCurve::Inverse);
        assert_eq!(config.dedup.semantic_threshold, 0.95);
        assert_eq!(config.embedding.dims, 1024);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let parsed: Config = toml::from_str(
            r#"
            [db]
            path = "data/kb.sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.search.default_preset, "balanced");
        assert_eq!(parsed.search.presets.len(), 3);
    }

    #[test]
    fn test_parse_decay_curve() {
        let parsed: Config = toml::from_str(
            r#"
            [db]
            path = "data/kb.sqlite"

            [graph]
            decay = "exponential"
            max_hops = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.graph.decay, DecayCurve::Exponential);
        assert_eq!(parsed.graph.max_hops, 3);
    }
}
