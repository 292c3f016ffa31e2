//! stxindex-core — domain types, transaction decoding, and storage traits
//! for the chain-indexing sidecar.
//!
//! This crate is I/O-free: the decoder is a pure function over node
//! messages, and the store traits are implemented by the backends in
//! `stxindex-storage`.

pub mod address;
pub mod decoder;
pub mod error;
pub mod store;
pub mod types;

pub use decoder::{compute_event_id, decode_block_message, decode_raw_tx};
pub use error::{DecodeError, IngestError, StoreError, ValidationError};
pub use store::{check_limit, IndexStore, Page, StoreWriter, UpdatedCounts, MAX_PAGE_LIMIT};
pub use types::{Block, BlockBatch, ChainTip, Tx, TxEvent};
