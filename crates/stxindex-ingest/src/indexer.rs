//! The ingestion orchestrator.
//!
//! One decoded batch becomes one store transaction: read the chain tip,
//! repair the canonical chain if the batch extends an orphaned fork,
//! write the block and its entities idempotently, commit, then notify.
//! Batches are processed strictly in arrival order by a single task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use stxindex_core::error::IngestError;
use stxindex_core::store::{IndexStore, StoreWriter, UpdatedCounts};
use stxindex_core::types::{Block, BlockBatch, ChainTip, TxEvent};

use crate::notifier::Notifier;

/// Tuning knobs for the ingestion loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerOptions {
    /// Attempts per batch before a transient failure becomes fatal.
    pub max_attempts: u32,
    /// Base backoff in milliseconds; doubles per retry.
    pub backoff_base_ms: u64,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
        }
    }
}

/// What one `ingest` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Committed(IngestSummary),
    /// The block was already stored; the call committed nothing and no
    /// notifications were emitted.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub block_height: u64,
    pub tx_count: usize,
    pub event_count: usize,
    /// Rows flipped by chain restoration, if a reorg was repaired.
    pub restored: Option<UpdatedCounts>,
}

/// Drives ingestion over any store backend.
pub struct Indexer<S: IndexStore> {
    store: S,
    notifier: Arc<Notifier>,
    options: IndexerOptions,
}

impl<S: IndexStore> Indexer<S> {
    pub fn new(store: S, notifier: Arc<Notifier>) -> Self {
        Self::with_options(store, notifier, IndexerOptions::default())
    }

    pub fn with_options(store: S, notifier: Arc<Notifier>, options: IndexerOptions) -> Self {
        Self {
            store,
            notifier,
            options,
        }
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Ingest one batch, retrying rolled-back transient failures with
    /// exponential backoff before surfacing them.
    pub async fn ingest(&self, batch: BlockBatch) -> Result<IngestOutcome, IngestError> {
        let mut attempt = 0u32;
        loop {
            match self.ingest_once(batch.clone()).await {
                Err(err) if err.is_retryable() && attempt + 1 < self.options.max_attempts => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(self.options.backoff_base_ms * 2u64.pow(attempt));
                    warn!(
                        height = batch.block.block_height,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient ingest failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn ingest_once(&self, mut batch: BlockBatch) -> Result<IngestOutcome, IngestError> {
        let mut writer = self.store.begin().await?;

        let outcome = match self.write_batch(&mut writer, &mut batch).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback_err) = writer.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed batch also failed");
                }
                return Err(err);
            }
        };

        writer.commit().await?;

        if let IngestOutcome::Committed(summary) = &outcome {
            // Post-commit only: block first, then txs in tx_index order.
            self.notifier.block_update(&batch.block);
            for entry in &batch.txs {
                self.notifier.tx_update(&entry.tx);
            }
            debug!(
                height = summary.block_height,
                txs = summary.tx_count,
                events = summary.event_count,
                "Batch committed"
            );
        }
        Ok(outcome)
    }

    async fn write_batch(
        &self,
        writer: &mut S::Writer,
        batch: &mut BlockBatch,
    ) -> Result<IngestOutcome, IngestError> {
        let tip = writer.chain_tip().await?;

        let restored = self.handle_reorg(writer, &batch.block, tip.as_ref()).await?;

        // A block at or below the tip is a sibling of existing history and
        // lands orphaned; everything above the tip is the new canonical tip.
        let canonical = tip
            .as_ref()
            .map_or(true, |tip| batch.block.block_height > tip.block_height);
        batch.set_canonical(canonical);

        if writer.insert_block(&batch.block).await? == 0 {
            return Ok(IngestOutcome::Duplicate);
        }

        let mut event_count = 0usize;
        for entry in &batch.txs {
            writer.insert_tx(&entry.tx).await?;
            for event in &entry.events {
                event_count += 1;
                match event {
                    TxEvent::Stx(e) => writer.insert_stx_event(e).await?,
                    TxEvent::Ft(e) => writer.insert_ft_event(e).await?,
                    TxEvent::Nft(e) => writer.insert_nft_event(e).await?,
                    TxEvent::Log(e) => writer.insert_contract_log(e).await?,
                };
            }
            for contract in &entry.contracts {
                writer.insert_smart_contract(contract).await?;
            }
        }

        Ok(IngestOutcome::Committed(IngestSummary {
            block_height: batch.block.block_height,
            tx_count: batch.txs.len(),
            event_count,
            restored,
        }))
    }

    /// Decide whether the incoming block needs chain restoration.
    ///
    /// The parent must exist (else the delivery was out of order). A
    /// canonical parent needs nothing. An orphaned parent is restored
    /// only when the incoming block out-grows the current tip; otherwise
    /// the incoming block is stored as a sibling.
    async fn handle_reorg(
        &self,
        writer: &mut S::Writer,
        block: &Block,
        tip: Option<&ChainTip>,
    ) -> Result<Option<UpdatedCounts>, IngestError> {
        if block.block_height <= 1 {
            return Ok(None);
        }

        let parent_height = block.block_height - 1;
        let parents = writer
            .blocks_at(parent_height, &block.parent_index_block_hash)
            .await?;
        let parent = match parents.len() {
            0 => {
                return Err(IngestError::ParentMissing {
                    parent_index_block_hash: hex::encode(&block.parent_index_block_hash),
                    height: parent_height,
                })
            }
            1 => &parents[0],
            found => {
                return Err(IngestError::SchemaCorruption {
                    index_block_hash: hex::encode(&block.parent_index_block_hash),
                    height: parent_height,
                    found,
                })
            }
        };

        if parent.canonical {
            return Ok(None);
        }

        let tip_height = tip.map_or(0, |tip| tip.block_height);
        if block.block_height <= tip_height {
            // The fork is not longer than the canonical chain yet.
            return Ok(None);
        }

        let counts = writer
            .restore_orphaned_chain(&parent.index_block_hash)
            .await?;
        info!(
            height = block.block_height,
            blocks = counts.blocks,
            txs = counts.txs,
            stx_events = counts.stx_events,
            ft_events = counts.ft_events,
            nft_events = counts.nft_events,
            contract_logs = counts.contract_logs,
            smart_contracts = counts.smart_contracts,
            "Restored orphaned chain"
        );
        Ok(Some(counts))
    }

    /// Consume decoded batches until the channel closes. FIFO: batch N's
    /// notifications are emitted before batch N+1 is read.
    pub async fn run(&self, mut batches: mpsc::Receiver<BlockBatch>) -> Result<(), IngestError> {
        while let Some(batch) = batches.recv().await {
            let height = batch.block.block_height;
            match self.ingest(batch).await {
                Ok(IngestOutcome::Committed(summary)) => {
                    info!(
                        height,
                        txs = summary.tx_count,
                        events = summary.event_count,
                        restored = summary.restored.map(|c| c.total()).unwrap_or(0),
                        "Block ingested"
                    );
                }
                Ok(IngestOutcome::Duplicate) => {
                    debug!(height, "Duplicate block delivery ignored");
                }
                Err(err @ IngestError::ParentMissing { .. }) => {
                    // Out-of-order delivery: drop the batch and let the
                    // upstream replay it once the parent has arrived.
                    warn!(height, error = %err, "Parent missing, dropping batch");
                }
                Err(err) => {
                    error!(height, error = %err, "Ingestion halted");
                    self.notifier.close();
                    return Err(err);
                }
            }
        }
        self.notifier.close();
        Ok(())
    }
}
