//! # Buildhub Records
//!
//! Turns a storage inventory of the Mozilla archive into structured build
//! records, enriched with the build metadata published next to each artifact.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Inventory  │──▶│ Group+Dedup  │──▶│   Batches    │──▶│ RecordSink │
//! │ CSV rows   │   │ per folder   │   │ merge+check  │   │ JSON lines │
//! └────────────┘   └──────────────┘   └──────┬───────┘   └────────────┘
//!                                            │ concurrent lookups
//!                        ┌───────────────────┼───────────────────┐
//!                        ▼                   ▼                   ▼
//!                  ┌──────────┐       ┌────────────┐      ┌────────────┐
//!                  │ Metadata │       │ Candidate  │      │  Archive   │
//!                  │  Cache   │       │   Index    │      │ HTTP+retry │
//!                  └──────────┘       └────────────┘      └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! zcat inventory.csv.gz | inventory-to-records > records.jsonl
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Build records and metadata documents |
//! | [`inventory`] | CSV inventory reader |
//! | [`grouping`] | Folder grouping and deduplication |
//! | [`archive`] | Archive URL conventions and record skeletons |
//! | [`http`] | Archive client with timeout-only retry |
//! | [`cache`] | Single-flight metadata cache and persistence |
//! | [`candidates`] | Latest candidate build folder per version |
//! | [`metadata`] | Nightly, release candidate and release lookups |
//! | [`merge`] | Metadata merge and record validation |
//! | [`pipeline`] | Batch orchestration |
//! | [`traits`] | `Transport`, `MetadataResolver` and `RecordSink` |
//! | [`progress`] | Progress reporting on stderr |
//! | [`stats`] | Run summary counters |

pub mod archive;
pub mod cache;
pub mod candidates;
pub mod config;
pub mod grouping;
pub mod http;
pub mod inventory;
pub mod merge;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod traits;
