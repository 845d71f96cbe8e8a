//! # Kiln Core
//!
//! Core library for the Kiln generation service: the job ledger that tracks
//! long-running provider jobs, the realtime fan-out of ledger changes, artifact
//! persistence, and ingestion of large uploads.
//!
//! ## Overview
//!
//! - **Job Ledger**: one mutation entry point per job with an explicit
//!   transition table, so late or reordered provider updates never move a
//!   finished job backwards
//! - **Realtime Fan-out**: per-owner subscriber registry with bounded,
//!   non-blocking delivery
//! - **Artifacts**: inline storage for small results, object store references
//!   for large ones, deduplicated by file identity
//! - **Uploads**: out-of-order chunk reassembly and object store multipart
//!   uploads, both registering the result against a job
//! - **Provider ingestion**: webhook callbacks and history polling
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL repositories and embedded migrations (SQLx)
//! - `shared-sessions`: Redis-backed upload session stores
//! - `image-probe`: sniff image formats and dimensions of persisted artifacts
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kiln_core::{
//!     ledger::{JobLedger, LedgerConfig},
//!     persistence::InMemoryJobRepository,
//!     realtime::FanoutHub,
//!     types::{JobCategory, JobId, JobPatch, JobStatus, OwnerId},
//! };
//!
//! async fn track() -> kiln_core::error::Result<()> {
//!     let hub = FanoutHub::default();
//!     let ledger = JobLedger::new(
//!         Arc::new(InMemoryJobRepository::new()),
//!         hub.clone(),
//!         LedgerConfig::default(),
//!     );
//!     let owner = OwnerId::parse("user-1")?;
//!     let mut feed = hub.subscribe(owner.clone(), None);
//!
//!     let job_id = JobId::parse("job-1")?;
//!     ledger
//!         .upsert(
//!             &owner,
//!             &job_id,
//!             Some(JobCategory::TextToImage),
//!             JobPatch::default().with_status(JobStatus::Processing),
//!         )
//!         .await?;
//!     let _event = feed.recv().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Artifact persistence decisions (inline vs. object store reference)
pub mod artifacts;

/// Error types shared by every component
pub mod error;

/// Provider callback ingestion and history reconciliation
pub mod ingest;

/// The generation job ledger and its transition rules
pub mod ledger;

/// Job and artifact repositories
pub mod persistence;

/// Compute provider client
pub mod provider;

/// Owner-partitioned realtime fan-out
pub mod realtime;

/// Retry and timeout policy for outbound calls
pub mod retry;

/// Object store seam and the on-disk implementation
pub mod storage;

pub mod submission;

/// Domain types
pub mod types;

/// Chunked and multipart upload ingestion
pub mod uploads;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{KilnError, Result};
