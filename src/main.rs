//! # Sentinel KB CLI (`skb`)
//!
//! The `skb` binary is the operator interface to the knowledge store. It
//! provides commands for database initialization, document lifecycle
//! management, semantic queries, and health/statistics inspection.
//!
//! ## Usage
//!
//! ```bash
//! skb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `skb init` | Create the SQLite database and run schema migrations |
//! | `skb add` | Add a document (embeds and stores it) |
//! | `skb get <id>` | Print a document and its metadata |
//! | `skb update <id>` | Patch a document's content or metadata |
//! | `skb delete <id>` | Soft-delete a document (`--hard` to remove it) |
//! | `skb list` | List documents with filters and pagination |
//! | `skb query "<text>"` | Semantic query with assembled context |
//! | `skb stats` | Corpus, query, and cache statistics |
//! | `skb health` | Component health report |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! skb init --config ./config/kb.toml
//!
//! # Add a playbook, superseding any older active version
//! skb add --file playbooks/phishing.md --source playbooks/phishing.md \
//!         --source-id playbook-phishing --version 2026-08-01 --tag playbook
//!
//! # Query with a tag filter
//! skb query "how do I contain a phishing incident?" --tag playbook
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sentinel_kb::config::{self, Config};
use sentinel_kb::models::{DocumentFilter, DocumentInput, MetadataPatch};
use sentinel_kb::service::Engine;

/// Sentinel KB CLI — a versioned knowledge store and semantic retrieval
/// engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "skb",
    about = "Sentinel KB — a versioned knowledge store and semantic retrieval engine",
    version,
    long_about = "Sentinel KB stores text documents together with their embedding vectors, \
    tracks version supersession per logical document, and answers natural-language queries \
    with vector search, optional re-ranking, and a semantic cache."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`. Database, embedding, retrieval,
    /// cache, and reranker settings are read from this file.
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, document_vectors). Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Add a document to the store.
    ///
    /// Embeds the content and persists it. By default any older active
    /// version with the same `--source-id` is deactivated, so the new
    /// document becomes the sole active version.
    Add {
        /// Document content. Mutually exclusive with `--file`.
        content: Option<String>,

        /// Read content from this file instead of the command line.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,

        /// Human-readable origin (file path, URL, module name).
        #[arg(long)]
        source: String,

        /// Logical identifier grouping all versions of the same document.
        #[arg(long)]
        source_id: String,

        /// Version label (e.g. `v1.0.0`, an ISO date, a commit hash).
        #[arg(long)]
        version: String,

        /// Tag to attach; repeat for multiple tags.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Store the document as inactive (excluded from queries).
        #[arg(long)]
        inactive: bool,

        /// Keep older versions with the same source-id active.
        #[arg(long)]
        no_supersede: bool,

        /// Custom metadata as `key=value` pairs; repeat for multiple.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Print a document by id.
    Get {
        /// Document id (`doc_...`).
        id: String,
    },

    /// Patch a document's content or metadata.
    ///
    /// Only the provided fields change; the document id is preserved and
    /// content is re-embedded only when it actually changed.
    Update {
        /// Document id (`doc_...`).
        id: String,

        /// Replacement content.
        #[arg(long)]
        content: Option<String>,

        /// New source label.
        #[arg(long)]
        source: Option<String>,

        /// New version label.
        #[arg(long)]
        version: Option<String>,

        /// Set the active flag.
        #[arg(long)]
        active: Option<bool>,

        /// Replace the tag set; repeat for multiple tags.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Custom metadata to merge as `key=value` pairs.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Delete a document.
    ///
    /// Soft-deletes by default (the document stays readable by id but is
    /// excluded from queries). `--hard` removes it permanently.
    Delete {
        /// Document id (`doc_...`).
        id: String,

        /// Remove the document and its vector permanently.
        #[arg(long)]
        hard: bool,
    },

    /// List documents with filters and pagination.
    List {
        /// Filter by source label.
        #[arg(long)]
        source: Option<String>,

        /// Filter by logical document id.
        #[arg(long)]
        source_id: Option<String>,

        /// Filter by version label.
        #[arg(long)]
        version: Option<String>,

        /// Filter by active state (`true` or `false`). Omit for both.
        #[arg(long)]
        active: Option<bool>,

        /// Require this tag; repeat to require several (AND semantics).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Page number (1-indexed).
        #[arg(long, default_value_t = 1)]
        page: u64,

        /// Documents per page.
        #[arg(long, default_value_t = 20)]
        page_size: u64,
    },

    /// Answer a natural-language query.
    ///
    /// Embeds the query, searches active documents by vector similarity,
    /// optionally re-ranks, and prints the ranked hits, assembled context,
    /// and source list.
    Query {
        /// The query text.
        text: String,

        /// Number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Filter candidates by source label.
        #[arg(long)]
        source: Option<String>,

        /// Require this tag on candidates; repeat for AND semantics.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Print the raw response as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },

    /// Print corpus, query, and cache statistics as JSON.
    Stats,

    /// Probe storage and embedding health.
    ///
    /// Exits non-zero when storage is unreachable.
    Health,
}

/// Parse a `key=value` pair for `--meta` arguments.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn meta_map(
    pairs: Vec<(String, String)>,
) -> std::collections::BTreeMap<String, serde_json::Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg: Config = config::load_config(&cli.config)?;
    let engine = Engine::init(&cfg).await?;

    let outcome = run_command(&engine, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn run_command(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            // Engine::init already ran the migrations.
            println!("Database initialized successfully.");
        }

        Commands::Add {
            content,
            file,
            source,
            source_id,
            version,
            tags,
            inactive,
            no_supersede,
            meta,
        } => {
            let content = match (content, file) {
                (Some(c), None) => c,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => bail!("Provide content as an argument or via --file"),
                (Some(_), Some(_)) => unreachable!(),
            };

            let mut input = DocumentInput::new(content, source, source_id, version).with_tags(tags);
            if inactive {
                input = input.inactive();
            }
            input.custom = meta_map(meta);

            let id = engine.repository().add(input, !no_supersede).await?;
            println!("Added document {}", id);
        }

        Commands::Get { id } => {
            let doc = engine.repository().get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }

        Commands::Update {
            id,
            content,
            source,
            version,
            active,
            tags,
            meta,
        } => {
            let patch = MetadataPatch {
                source,
                source_id: None,
                version,
                is_active: active,
                tags: if tags.is_empty() { None } else { Some(tags) },
                custom: if meta.is_empty() {
                    None
                } else {
                    Some(meta_map(meta))
                },
            };
            if content.is_none() && patch.is_empty() {
                bail!("Nothing to update — provide --content or a metadata field");
            }
            engine.repository().update(&id, content, patch).await?;
            println!("Updated document {}", id);
        }

        Commands::Delete { id, hard } => {
            if hard {
                engine.repository().hard_delete(&id).await?;
                println!("Deleted document {} permanently", id);
            } else {
                engine.repository().soft_delete(&id).await?;
                println!("Deactivated document {}", id);
            }
        }

        Commands::List {
            source,
            source_id,
            version,
            active,
            tags,
            page,
            page_size,
        } => {
            let filter = DocumentFilter {
                source,
                source_id,
                version,
                is_active: active,
                tags,
            };
            let result = engine.repository().list(&filter, page, page_size).await?;

            if result.documents.is_empty() {
                println!("No documents found.");
            } else {
                for doc in &result.documents {
                    let state = if doc.metadata.is_active {
                        "active"
                    } else {
                        "inactive"
                    };
                    println!(
                        "{}  {}  {}  [{}]  {}",
                        doc.id,
                        doc.metadata.source_id,
                        doc.metadata.version,
                        state,
                        doc.metadata.tags.join(",")
                    );
                }
            }
            println!(
                "\nPage {}/{} ({} documents total)",
                result.page,
                result.total_pages.max(1),
                result.total
            );
        }

        Commands::Query {
            text,
            top_k,
            source,
            tags,
            json,
        } => {
            let filter = DocumentFilter {
                source,
                tags,
                ..Default::default()
            };
            let response = engine.query(&text, top_k, &filter).await?;

            if json {
                let value = serde_json::json!({
                    "hits": response.hits.iter().map(|h| serde_json::json!({
                        "id": h.document.id,
                        "score": h.score,
                        "source": h.document.metadata.source,
                        "version": h.document.metadata.version,
                    })).collect::<Vec<_>>(),
                    "context": response.context,
                    "sources": response.sources,
                    "cached": response.cached,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                if response.cached {
                    println!("(served from semantic cache)\n");
                }
                for (i, hit) in response.hits.iter().enumerate() {
                    println!(
                        "{}. [{:.4}] {} ({} {})",
                        i + 1,
                        hit.score,
                        hit.document.metadata.source,
                        hit.document.metadata.source_id,
                        hit.document.metadata.version
                    );
                }
                println!("\n{}", response.context);
                if !response.sources.is_empty() {
                    println!("\nSources: {}", response.sources.join(", "));
                }
            }
        }

        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Health => {
            let report = engine.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
