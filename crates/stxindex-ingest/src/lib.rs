//! stxindex-ingest — the ingestion side of the sidecar.
//!
//! [`indexer::Indexer`] turns decoded batches into committed store
//! transactions (including reorg repair); [`notifier::Notifier`] fans
//! committed updates out to in-process subscribers.

pub mod config;
pub mod indexer;
pub mod notifier;

pub use config::{Config, ConfigError, PgConfig};
pub use indexer::{Indexer, IndexerOptions, IngestOutcome, IngestSummary};
pub use notifier::{IndexUpdate, Notifier, OverflowPolicy};
