//! Error types for the stxindex pipeline.

use thiserror::Error;

/// Errors raised while decoding a node message or a raw transaction.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unexpected end of input at byte {offset}: needed {needed} more")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("Unknown payload type id {type_id} at byte {offset}")]
    UnknownPayloadType { type_id: u8, offset: usize },

    #[error("Unknown authorization type {auth_type} at byte {offset}")]
    UnknownAuthType { auth_type: u8, offset: usize },

    #[error("Unknown origin hash mode {hash_mode} at byte {offset}")]
    UnknownHashMode { hash_mode: u8, offset: usize },

    #[error("Invalid address version {version}")]
    InvalidAddressVersion { version: u8 },

    #[error("Malformed {field} at byte {offset}: {reason}")]
    MalformedField {
        field: &'static str,
        offset: usize,
        reason: String,
    },

    #[error("Invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration '{name}' failed: {reason}")]
    Migration { name: String, reason: String },

    #[error("Down-migrations are disabled in a production environment")]
    DownMigrationForbidden,

    #[error("Block not found for index block hash {index_block_hash}")]
    BlockNotFound { index_block_hash: String },

    #[error("Expected one row for index block hash {index_block_hash}, found {found}")]
    DuplicateRows {
        index_block_hash: String,
        found: usize,
    },
}

impl StoreError {
    /// Returns `true` for failures worth retrying (connection-level I/O).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Errors surfaced by the ingestion path.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transient store failure: {0}")]
    Transient(StoreError),

    #[error("Parent block {parent_index_block_hash} at height {height} not found")]
    ParentMissing {
        parent_index_block_hash: String,
        height: u64,
    },

    #[error("Schema corruption: {found} rows for index block hash {index_block_hash} at height {height}")]
    SchemaCorruption {
        index_block_hash: String,
        height: u64,
        found: usize,
    },

    #[error("Store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Transient(err)
        } else {
            Self::Store(err)
        }
    }
}

impl IngestError {
    /// Returns `true` if the batch may be retried after a rollback.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` for errors that must halt ingestion for operator
    /// intervention rather than being retried or replayed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaCorruption { .. })
    }
}

/// Rejected read-path inputs (the API layer maps these to 4xx).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Limit {limit} exceeds maximum {max}")]
    LimitTooLarge { limit: u32, max: u32 },
}
