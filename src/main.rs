//! # research-kb CLI (`rkb`)
//!
//! The `rkb` binary is the primary interface to the knowledge base. It
//! covers database initialization, bulk ingestion of extracted bundles,
//! hybrid search, concept-graph exploration, and citation-graph
//! maintenance.
//!
//! ## Usage
//!
//! ```bash
//! rkb --config ./config/rkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rkb init` | Create the SQLite database and run schema migrations |
//! | `rkb ingest <bundle>` | Ingest a source bundle (chunks + citations) |
//! | `rkb search "<query>"` | Hybrid search over indexed chunks |
//! | `rkb concepts ingest <bundle>` | Run the concept dedup pipeline |
//! | `rkb concepts list` | List indexed concepts |
//! | `rkb concepts show <name>` | Show a concept with aliases and edges |
//! | `rkb graph path <a> <b>` | Shortest path between two concepts |
//! | `rkb graph neighbors <name>` | N-hop neighborhood of a concept |
//! | `rkb citations link` | Build source-to-source citation edges |
//! | `rkb citations authority` | Compute citation authority scores |
//! | `rkb citations top` | Most-cited sources |
//! | `rkb stats` | Corpus overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use research_kb::{citations, concepts, config, db, graph, ingest, migrate, search, stats};

/// research-kb — a hybrid retrieval knowledge base for causal-inference
/// literature.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rkb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rkb",
    about = "research-kb — hybrid full-text, vector, and graph search over a research corpus",
    version,
    long_about = "research-kb stores extracted document chunks, citations, and a concept \
    knowledge graph in SQLite, and ranks query results by a weighted combination of \
    full-text rank, vector similarity, and concept-graph proximity."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, all tables, the full-text index,
    /// and the graph traversal indexes. Idempotent.
    Init,

    /// Ingest a source bundle (JSON with source metadata, extracted
    /// chunks, and citations).
    ///
    /// Re-ingesting a file with a known content hash is a no-op.
    Ingest {
        /// Path to the bundle JSON file.
        bundle: PathBuf,
    },

    /// Search indexed chunks.
    ///
    /// Ranks by a weighted combination of full-text rank and (when
    /// embeddings and concepts are available) vector and graph signals.
    Search {
        /// The search query string.
        query: String,

        /// Weight preset: `building`, `auditing`, or `balanced`.
        #[arg(long)]
        preset: Option<String>,

        /// Override the full-text weight.
        #[arg(long)]
        fts_weight: Option<f64>,

        /// Override the vector weight.
        #[arg(long)]
        vector_weight: Option<f64>,

        /// Override the graph weight.
        #[arg(long)]
        graph_weight: Option<f64>,

        /// Enable graph-boosted scoring (requires extracted concepts).
        #[arg(long)]
        graph: bool,

        /// Filter results by source type: `textbook`, `paper`, or `code_repo`.
        #[arg(long)]
        source_type: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Concept store commands.
    Concepts {
        #[command(subcommand)]
        action: ConceptsAction,
    },

    /// Concept graph exploration.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Citation graph maintenance and queries.
    Citations {
        #[command(subcommand)]
        action: CitationsAction,
    },

    /// Print corpus statistics.
    Stats,
}

/// Concept subcommands.
#[derive(Subcommand)]
enum ConceptsAction {
    /// Ingest a concept bundle (JSON with extracted concepts and
    /// relationships) through the dedup pipeline.
    Ingest {
        /// Path to the bundle JSON file.
        bundle: PathBuf,
    },

    /// List concepts.
    List {
        /// Filter by concept type: `method`, `assumption`, `problem`,
        /// `definition`, or `theorem`.
        #[arg(long = "type")]
        concept_type: Option<String>,

        /// Maximum number of concepts to list.
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Show one concept (resolves abbreviations and aliases).
    Show {
        /// Concept name, alias, or abbreviation.
        name: String,
    },
}

/// Graph subcommands.
#[derive(Subcommand)]
enum GraphAction {
    /// Find the shortest path between two concepts.
    Path {
        /// Starting concept name, alias, or abbreviation.
        from: String,
        /// Target concept name, alias, or abbreviation.
        to: String,
        /// Maximum path length to search.
        #[arg(long, default_value_t = 5)]
        max_hops: u32,
    },

    /// Expand the N-hop neighborhood of a concept.
    Neighbors {
        /// Center concept name, alias, or abbreviation.
        name: String,
        /// Number of hops to expand (1–3).
        #[arg(long, default_value_t = 1)]
        hops: u32,
        /// Filter by relationship type (e.g. `REQUIRES`, `ADDRESSES`).
        #[arg(long = "type")]
        relationship_type: Option<String>,
    },
}

/// Citation subcommands.
#[derive(Subcommand)]
enum CitationsAction {
    /// Match extracted citations to corpus sources and build edges.
    Link,

    /// Compute PageRank-style authority scores and persist them.
    Authority {
        /// Number of PageRank iterations.
        #[arg(long, default_value_t = 20)]
        iterations: u32,
        /// Damping factor.
        #[arg(long, default_value_t = 0.85)]
        damping: f64,
    },

    /// Show the most-cited sources.
    Top {
        /// Maximum number of sources to show.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { bundle } => {
            ingest::run_ingest(&cfg, &bundle).await?;
        }
        Commands::Search {
            query,
            preset,
            fts_weight,
            vector_weight,
            graph_weight,
            graph,
            source_type,
            limit,
        } => {
            search::run_search(
                &cfg,
                &query,
                preset.as_deref(),
                fts_weight,
                vector_weight,
                graph_weight,
                graph,
                source_type.as_deref(),
                limit,
            )
            .await?;
        }
        Commands::Concepts { action } => match action {
            ConceptsAction::Ingest { bundle } => {
                ingest::run_ingest_concepts(&cfg, &bundle).await?;
            }
            ConceptsAction::List {
                concept_type,
                limit,
            } => {
                concepts::run_list(&cfg, concept_type.as_deref(), limit).await?;
            }
            ConceptsAction::Show { name } => {
                concepts::run_show(&cfg, &name).await?;
            }
        },
        Commands::Graph { action } => match action {
            GraphAction::Path { from, to, max_hops } => {
                graph::run_path(&cfg, &from, &to, max_hops).await?;
            }
            GraphAction::Neighbors {
                name,
                hops,
                relationship_type,
            } => {
                graph::run_neighbors(&cfg, &name, hops, relationship_type.as_deref()).await?;
            }
        },
        Commands::Citations { action } => match action {
            CitationsAction::Link => {
                citations::run_link(&cfg).await?;
            }
            CitationsAction::Authority {
                iterations,
                damping,
            } => {
                citations::run_authority(&cfg, iterations, damping).await?;
            }
            CitationsAction::Top { limit } => {
                citations::run_top(&cfg, limit).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
