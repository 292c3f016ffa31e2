//! stxindex-storage — storage backends for the indexing sidecar.
//!
//! Backends implement the `IndexStore` / `StoreWriter` traits from
//! `stxindex-core`:
//! - [`postgres::PostgresStore`] — the production backend (`sqlx`).
//! - [`memory::MemoryStore`] — in-process backend for tests and
//!   ephemeral runs.

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::MemoryStore;
pub use migrations::Environment;
pub use postgres::{PostgresOptions, PostgresStore};
