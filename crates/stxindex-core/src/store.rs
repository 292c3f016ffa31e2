//! Store abstraction.
//!
//! The traits live here so backends (Postgres, in-memory) can be swapped
//! under the indexer. `IndexStore` serves pooled reads and opens writers;
//! `StoreWriter` scopes one ingestion transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, ValidationError};
use crate::types::{
    Block, ChainTip, FtEvent, NftEvent, SmartContract, SmartContractLog, StxEvent, Tx, TxEvent,
    TxTypeId,
};

// ─── Result shapes ───────────────────────────────────────────────────────────

/// Per-table row counts touched by a canonicality flip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedCounts {
    pub blocks: u64,
    pub txs: u64,
    pub stx_events: u64,
    pub ft_events: u64,
    pub nft_events: u64,
    pub contract_logs: u64,
    pub smart_contracts: u64,
}

impl UpdatedCounts {
    pub fn total(&self) -> u64 {
        self.blocks
            + self.txs
            + self.stx_events
            + self.ft_events
            + self.nft_events
            + self.contract_logs
            + self.smart_contracts
    }

    pub fn add(&mut self, other: &UpdatedCounts) {
        self.blocks += other.blocks;
        self.txs += other.txs;
        self.stx_events += other.stx_events;
        self.ft_events += other.ft_events;
        self.nft_events += other.nft_events;
        self.contract_logs += other.contract_logs;
        self.smart_contracts += other.smart_contracts;
    }
}

/// STX balance aggregate for one address over canonical events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StxBalance {
    /// `total_received - total_sent`.
    pub balance: i128,
    pub total_sent: u128,
    pub total_received: u128,
}

/// Fungible-token balance aggregate per asset identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtBalance {
    pub balance: i128,
    pub total_sent: u128,
    pub total_received: u128,
}

/// Non-fungible holdings per asset identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftHoldings {
    /// `total_received - total_sent`.
    pub count: i64,
    pub total_sent: u64,
    pub total_received: u64,
}

/// A page of rows plus the total count of rows matching the filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total: u64,
}

/// Largest page the read API hands out in one request.
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Guard for caller-supplied page limits; the API layer maps the error
/// to a 4xx response.
pub fn check_limit(limit: u32) -> Result<u32, ValidationError> {
    if limit == 0 {
        return Err(ValidationError::Invalid {
            field: "limit",
            reason: "must be at least 1".into(),
        });
    }
    if limit > MAX_PAGE_LIMIT {
        return Err(ValidationError::LimitTooLarge {
            limit,
            max: MAX_PAGE_LIMIT,
        });
    }
    Ok(limit)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Read side of a storage backend plus the entry point for write
/// transactions. Read queries consider canonical rows only.
#[async_trait]
pub trait IndexStore: Send + Sync {
    type Writer: StoreWriter;

    /// Open a write transaction. The ingestion task holds exactly one of
    /// these at a time.
    async fn begin(&self) -> Result<Self::Writer, StoreError>;

    async fn get_block_by_hash(&self, block_hash: &[u8]) -> Result<Option<Block>, StoreError>;

    async fn list_blocks(&self, limit: u32, offset: u64) -> Result<Page<Block>, StoreError>;

    /// Transaction ids of one block, in `tx_index` order.
    async fn get_block_tx_ids(
        &self,
        index_block_hash: &[u8],
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn get_tx_by_id(&self, tx_id: &[u8]) -> Result<Option<Tx>, StoreError>;

    async fn list_txs(
        &self,
        limit: u32,
        offset: u64,
        type_filter: Option<&[TxTypeId]>,
    ) -> Result<Page<Tx>, StoreError>;

    /// All four event kinds for one transaction, merged and sorted by
    /// `event_index`.
    async fn get_tx_events(
        &self,
        tx_id: &[u8],
        index_block_hash: &[u8],
    ) -> Result<Vec<TxEvent>, StoreError>;

    async fn get_stx_balance(&self, address: &str) -> Result<StxBalance, StoreError>;

    async fn get_ft_balances(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, FtBalance>, StoreError>;

    async fn get_nft_counts(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, NftHoldings>, StoreError>;

    /// Canonical transactions where the address is the sender or the
    /// token-transfer recipient, newest first.
    async fn get_address_txs(
        &self,
        address: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Page<Tx>, StoreError>;
}

/// One ingestion transaction. Inserts are idempotent: a conflicting row
/// is left untouched and the insert reports zero rows affected.
#[async_trait]
pub trait StoreWriter: Send {
    /// The canonical chain tip, or `None` on an empty store.
    async fn chain_tip(&mut self) -> Result<Option<ChainTip>, StoreError>;

    /// All blocks at the given height with the given `index_block_hash`.
    /// More than one row signals schema corruption to the caller.
    async fn blocks_at(
        &mut self,
        block_height: u64,
        index_block_hash: &[u8],
    ) -> Result<Vec<Block>, StoreError>;

    async fn insert_block(&mut self, block: &Block) -> Result<u64, StoreError>;
    async fn insert_tx(&mut self, tx: &Tx) -> Result<u64, StoreError>;
    async fn insert_stx_event(&mut self, event: &StxEvent) -> Result<u64, StoreError>;
    async fn insert_ft_event(&mut self, event: &FtEvent) -> Result<u64, StoreError>;
    async fn insert_nft_event(&mut self, event: &NftEvent) -> Result<u64, StoreError>;
    async fn insert_contract_log(&mut self, log: &SmartContractLog) -> Result<u64, StoreError>;
    async fn insert_smart_contract(
        &mut self,
        contract: &SmartContract,
    ) -> Result<u64, StoreError>;

    /// Align every entity (txs, events, logs, contracts) sharing
    /// `index_block_hash` to the given flag. The block row itself is
    /// flipped by the reorg walk. Rows already carrying the flag are left
    /// alone, so the returned counts reflect actual flips.
    async fn mark_entities_canonical(
        &mut self,
        index_block_hash: &[u8],
        canonical: bool,
    ) -> Result<UpdatedCounts, StoreError>;

    /// Restore a previously orphaned chain ending at `index_block_hash`:
    /// make that block canonical, orphan any competing block at its
    /// height, flip both blocks' entities, then walk to the parent and
    /// repeat while the parent is also orphaned.
    async fn restore_orphaned_chain(
        &mut self,
        index_block_hash: &[u8],
    ) -> Result<UpdatedCounts, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}
