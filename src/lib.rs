//! # CBAM Intake
//!
//! Spreadsheet intake for CBAM (Carbon Border Adjustment Mechanism)
//! reporting. Heterogeneous spreadsheet rows are mapped onto a fixed set of
//! canonical columns, their values coerced into typed cells, and every
//! material description classified against a controlled label set that
//! learns from user corrections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ JSON rows    │──▶│ Orchestrator                 │──▶│  SQLite  │
//! │ (HTTP / CLI) │   │ headers → cells → classifier │   │ records  │
//! └──────────────┘   └──────────────┬───────────────┘   └──────────┘
//!                                   │ progress events
//!                      ┌────────────┴───────┐
//!                      ▼                    ▼
//!                 ┌──────────┐        ┌──────────┐
//!                 │   CLI    │        │ HTTP SSE │
//!                 │ (intake) │        │  (axum)  │
//!                 └──────────┘        └──────────┘
//! ```
//!
//! Pure pipeline logic lives in the `cbam-intake-core` crate; this crate
//! provides configuration, I/O adapters, and the two front ends.
//!
//! ## Quick Start
//!
//! ```bash
//! intake init                          # create database
//! intake normalize ./march.json        # normalize + classify a sheet
//! intake feedback --text "휘발유" --label gasoline
//! intake serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`embedding`] | Embedding providers and cache |
//! | [`pipeline`] | Streaming orchestrator and persist operation |
//! | [`services`] | Wiring of corpus, classifier, and stores |
//! | [`feedback_log`] | JSONL feedback log |
//! | [`sqlite_store`] | SQLite record store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`row_file`] | JSON rows file loader |
//! | [`progress`] | CLI progress reporters |
//! | [`server`] | HTTP server |

pub mod config;
pub mod db;
pub mod embedding;
pub mod feedback_log;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod row_file;
pub mod server;
pub mod services;
pub mod sqlite_store;
