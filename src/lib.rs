//! # similar-issues
//!
//! Incremental per-repository issue indexing and similar-issue retrieval.
//!
//! Given a pull/merge request, the engine finds the most similar historical
//! issues (and optionally their comments) of the same repository. Each
//! repository is indexed into its own partition of one shared vector
//! collection, on demand, embedding every item at most once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ ItemSource  │──▶│ IndexBuilder │──▶│   VectorStore    │
//! │ GH/GL/Jira  │   │ cold / warm  │   │ sqlite/qdrant/pc │
//! └─────────────┘   └──────┬───────┘   └────────┬─────────┘
//!                          │ markers            │ top-K
//!                          ▼                    ▼
//!                   ┌──────────────┐   ┌──────────────────┐
//!                   │ StateTracker │   │ RetrievalService │◀── trigger
//!                   └──────────────┘   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! simi init                                   # create database
//! simi index acme/widgets                     # build or refresh the index
//! simi similar acme/widgets --title "Login fails" --body "Fixes #12"
//! simi status acme/widgets
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`embedding`] | Embedding client |
//! | [`store`] | Vector store trait and backends |
//! | [`state`] | Per-partition index markers |
//! | [`sources`] | Issue/ticket source trait |
//! | [`builder`] | Cold and warm indexing passes |
//! | [`query`] | Query text and cross-reference resolution |
//! | [`retrieval`] | End-to-end retrieval service |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod builder;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod http;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retrieval;
pub mod source_github;
pub mod source_gitlab;
pub mod source_jira;
pub mod sources;
pub mod state;
pub mod store;
