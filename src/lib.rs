//! # Sentinel KB
//!
//! A versioned knowledge store and semantic retrieval engine.
//!
//! Sentinel KB persists text documents (security documentation, network
//! topology, playbooks) together with their embedding vectors in SQLite,
//! tracks version supersession per logical document, and answers
//! natural-language queries with a two-stage ranking pipeline (vector
//! similarity, then optional cross-encoder re-ranking) plus a semantic
//! cache that serves paraphrased repeats of the same question.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Embedder  │──▶│  Repository  │──▶│  SQLite   │
//! │ OpenAI/…  │   │ CRUD + vecs  │   │ docs+vecs │
//! └───────────┘   └──────┬───────┘   └───────────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌───────────┐  ┌──────────┐
//!    │ Semantic │  │ Re-ranker │  │ Context  │
//!    │  Cache   │  │  (HTTP)   │  │ Builder  │
//!    └──────────┘  └───────────┘  └──────────┘
//!          └─────────────┼─────────────┘
//!                        ▼
//!                  ┌──────────┐
//!                  │  Engine  │
//!                  │ (query)  │
//!                  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! skb init                                   # create database
//! skb add --file guide.md --source docs/guide.md \
//!         --source-id guide --version v1.0.0
//! skb query "how do I triage a wazuh alert?"
//! skb stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error taxonomy |
//! | [`models`] | Core data types |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`repository`] | Document CRUD, lifecycle, and vector search |
//! | [`rerank`] | Cross-encoder re-ranking stage |
//! | [`cache`] | Semantic query cache |
//! | [`rank`] | Relevance filtering and duplicate pruning |
//! | [`context`] | Bounded context assembly |
//! | [`service`] | Retrieval engine orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod migrate;
pub mod models;
pub mod rank;
pub mod repository;
pub mod rerank;
pub mod service;
