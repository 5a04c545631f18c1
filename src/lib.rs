//! # Evidence Harness
//!
//! An ingestion pipeline for forensic case evidence.
//!
//! Evidence Harness pulls evidence files from an upstream case-management
//! API, extracts text from heterogeneous formats (PDF, DOCX, HTML, plain
//! text), splits it into overlapping token-bounded chunks, embeds each chunk,
//! and persists everything in SQLite under a per-case, per-document,
//! per-chunk hierarchy. Byte-identical evidence is deduplicated globally by
//! content fingerprint, and every sync run is tracked as an auditable job
//! with per-item error records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌──────────┐
//! │  CaseSource  │──▶│     SyncOrchestrator       │──▶│  SQLite   │
//! │ cases/files  │   │ extract → chunk → embed    │   │ docs +    │
//! └──────────────┘   └───────────────────────────┘   │ vectors   │
//!                                                     └────┬─────┘
//!                                                          ▼
//!                                                    ┌──────────┐
//!                                                    │   CLI    │
//!                                                    │ (evsync) │
//!                                                    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! evsync init                   # create database
//! evsync sync 7                 # ingest all evidence for case 7
//! evsync status <job-id>        # inspect a sync job
//! evsync jobs --case-id 7       # list recent jobs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Case-management API client |
//! | [`extract`] | Multi-format text extraction |
//! | [`chunk`] | Token-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`fingerprint`] | Content hashing for dedup |
//! | [`store`] | SQLite persistence |
//! | [`sync`] | Job orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod migrate;
pub mod models;
pub mod source;
pub mod store;
pub mod sync;
