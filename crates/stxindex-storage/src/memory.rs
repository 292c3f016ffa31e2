//! In-memory storage backend.
//!
//! Implements the same store traits as the Postgres backend over
//! in-process state, with copy-on-begin / swap-on-commit transaction
//! semantics. Useful for tests and short-lived ephemeral indexers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stxindex_core::error::StoreError;
use stxindex_core::store::{
    FtBalance, IndexStore, NftHoldings, Page, StoreWriter, StxBalance, UpdatedCounts,
};
use stxindex_core::types::{
    Block, ChainTip, FtEvent, NftEvent, SmartContract, SmartContractLog, StxEvent, Tx,
    TxEvent, TxTypeId,
};

#[derive(Debug, Default, Clone)]
struct MemState {
    blocks: Vec<Block>,
    txs: Vec<Tx>,
    stx_events: Vec<StxEvent>,
    ft_events: Vec<FtEvent>,
    nft_events: Vec<NftEvent>,
    contract_logs: Vec<SmartContractLog>,
    smart_contracts: Vec<SmartContract>,
}

/// In-memory store. All data is lost when the process exits.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> MemState {
        self.state.lock().expect("state lock").clone()
    }
}

/// A staged copy of the store; committed by swapping it back in.
pub struct MemoryWriter {
    shared: Arc<Mutex<MemState>>,
    staged: MemState,
}

// ─── Read side ───────────────────────────────────────────────────────────────

#[async_trait]
impl IndexStore for MemoryStore {
    type Writer = MemoryWriter;

    async fn begin(&self) -> Result<MemoryWriter, StoreError> {
        Ok(MemoryWriter {
            shared: Arc::clone(&self.state),
            staged: self.snapshot(),
        })
    }

    async fn get_block_by_hash(&self, block_hash: &[u8]) -> Result<Option<Block>, StoreError> {
        Ok(self
            .snapshot()
            .blocks
            .iter()
            .find(|b| b.block_hash == block_hash && b.canonical)
            .cloned())
    }

    async fn list_blocks(&self, limit: u32, offset: u64) -> Result<Page<Block>, StoreError> {
        let mut blocks: Vec<Block> = self
            .snapshot()
            .blocks
            .iter()
            .filter(|b| b.canonical)
            .cloned()
            .collect();
        blocks.sort_by(|a, b| b.block_height.cmp(&a.block_height));
        let total = blocks.len() as u64;
        let rows = blocks
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { rows, total })
    }

    async fn get_block_tx_ids(
        &self,
        index_block_hash: &[u8],
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut txs: Vec<(u32, Vec<u8>)> = self
            .snapshot()
            .txs
            .iter()
            .filter(|t| t.index_block_hash == index_block_hash && t.canonical)
            .map(|t| (t.tx_index, t.tx_id.clone()))
            .collect();
        txs.sort_by_key(|(tx_index, _)| *tx_index);
        Ok(txs.into_iter().map(|(_, tx_id)| tx_id).collect())
    }

    async fn get_tx_by_id(&self, tx_id: &[u8]) -> Result<Option<Tx>, StoreError> {
        Ok(self
            .snapshot()
            .txs
            .iter()
            .find(|t| t.tx_id == tx_id && t.canonical)
            .cloned())
    }

    async fn list_txs(
        &self,
        limit: u32,
        offset: u64,
        type_filter: Option<&[TxTypeId]>,
    ) -> Result<Page<Tx>, StoreError> {
        let mut txs: Vec<Tx> = self
            .snapshot()
            .txs
            .iter()
            .filter(|t| t.canonical)
            .filter(|t| type_filter.map_or(true, |types| types.contains(&t.type_id())))
            .cloned()
            .collect();
        txs.sort_by(|a, b| {
            b.block_height
                .cmp(&a.block_height)
                .then(b.tx_index.cmp(&a.tx_index))
        });
        let total = txs.len() as u64;
        let rows = txs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { rows, total })
    }

    async fn get_tx_events(
        &self,
        tx_id: &[u8],
        index_block_hash: &[u8],
    ) -> Result<Vec<TxEvent>, StoreError> {
        let state = self.snapshot();
        let mut events: Vec<TxEvent> = Vec::new();
        events.extend(
            state
                .stx_events
                .iter()
                .filter(|e| e.tx_id == tx_id && e.index_block_hash == index_block_hash && e.canonical)
                .cloned()
                .map(TxEvent::Stx),
        );
        events.extend(
            state
                .ft_events
                .iter()
                .filter(|e| e.tx_id == tx_id && e.index_block_hash == index_block_hash && e.canonical)
                .cloned()
                .map(TxEvent::Ft),
        );
        events.extend(
            state
                .nft_events
                .iter()
                .filter(|e| e.tx_id == tx_id && e.index_block_hash == index_block_hash && e.canonical)
                .cloned()
                .map(TxEvent::Nft),
        );
        events.extend(
            state
                .contract_logs
                .iter()
                .filter(|e| e.tx_id == tx_id && e.index_block_hash == index_block_hash && e.canonical)
                .cloned()
                .map(TxEvent::Log),
        );
        events.sort_by_key(TxEvent::event_index);
        Ok(events)
    }

    async fn get_stx_balance(&self, address: &str) -> Result<StxBalance, StoreError> {
        let state = self.snapshot();
        let mut total_sent: u128 = 0;
        let mut total_received: u128 = 0;
        for event in state.stx_events.iter().filter(|e| e.canonical) {
            if event.sender.as_deref() == Some(address) {
                total_sent += event.amount as u128;
            }
            if event.recipient.as_deref() == Some(address) {
                total_received += event.amount as u128;
            }
        }
        Ok(StxBalance {
            balance: total_received as i128 - total_sent as i128,
            total_sent,
            total_received,
        })
    }

    async fn get_ft_balances(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, FtBalance>, StoreError> {
        let state = self.snapshot();
        let mut balances: BTreeMap<String, FtBalance> = BTreeMap::new();
        for event in state.ft_events.iter().filter(|e| e.canonical) {
            let sent = event.sender.as_deref() == Some(address);
            let received = event.recipient.as_deref() == Some(address);
            if !sent && !received {
                continue;
            }
            let entry = balances.entry(event.asset_identifier.clone()).or_default();
            if sent {
                entry.total_sent += event.amount;
            }
            if received {
                entry.total_received += event.amount;
            }
            entry.balance = entry.total_received as i128 - entry.total_sent as i128;
        }
        Ok(balances)
    }

    async fn get_nft_counts(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, NftHoldings>, StoreError> {
        let state = self.snapshot();
        let mut counts: BTreeMap<String, NftHoldings> = BTreeMap::new();
        for event in state.nft_events.iter().filter(|e| e.canonical) {
            let sent = event.sender.as_deref() == Some(address);
            let received = event.recipient.as_deref() == Some(address);
            if !sent && !received {
                continue;
            }
            let entry = counts.entry(event.asset_identifier.clone()).or_default();
            if sent {
                entry.total_sent += 1;
            }
            if received {
                entry.total_received += 1;
            }
            entry.count = entry.total_received as i64 - entry.total_sent as i64;
        }
        Ok(counts)
    }

    async fn get_address_txs(
        &self,
        address: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Page<Tx>, StoreError> {
        let mut txs: Vec<Tx> = self
            .snapshot()
            .txs
            .iter()
            .filter(|t| t.canonical)
            .filter(|t| {
                t.sender_address == address
                    || t.payload.token_transfer_recipient() == Some(address)
            })
            .cloned()
            .collect();
        txs.sort_by(|a, b| {
            b.block_height
                .cmp(&a.block_height)
                .then(b.tx_index.cmp(&a.tx_index))
        });
        let total = txs.len() as u64;
        let rows = txs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { rows, total })
    }
}

// ─── Write side ──────────────────────────────────────────────────────────────

#[async_trait]
impl StoreWriter for MemoryWriter {
    async fn chain_tip(&mut self) -> Result<Option<ChainTip>, StoreError> {
        Ok(self
            .staged
            .blocks
            .iter()
            .filter(|b| b.canonical)
            .max_by_key(|b| b.block_height)
            .map(|b| ChainTip {
                block_height: b.block_height,
                block_hash: b.block_hash.clone(),
                index_block_hash: b.index_block_hash.clone(),
            }))
    }

    async fn blocks_at(
        &mut self,
        block_height: u64,
        index_block_hash: &[u8],
    ) -> Result<Vec<Block>, StoreError> {
        Ok(self
            .staged
            .blocks
            .iter()
            .filter(|b| b.block_height == block_height && b.index_block_hash == index_block_hash)
            .cloned()
            .collect())
    }

    async fn insert_block(&mut self, block: &Block) -> Result<u64, StoreError> {
        if self
            .staged
            .blocks
            .iter()
            .any(|b| b.index_block_hash == block.index_block_hash)
        {
            return Ok(0);
        }
        self.staged.blocks.push(block.clone());
        Ok(1)
    }

    async fn insert_tx(&mut self, tx: &Tx) -> Result<u64, StoreError> {
        if self
            .staged
            .txs
            .iter()
            .any(|t| t.tx_id == tx.tx_id && t.index_block_hash == tx.index_block_hash)
        {
            return Ok(0);
        }
        self.staged.txs.push(tx.clone());
        Ok(1)
    }

    async fn insert_stx_event(&mut self, event: &StxEvent) -> Result<u64, StoreError> {
        if self.staged.stx_events.iter().any(|e| {
            e.event_index == event.event_index
                && e.tx_id == event.tx_id
                && e.index_block_hash == event.index_block_hash
        }) {
            return Ok(0);
        }
        self.staged.stx_events.push(event.clone());
        Ok(1)
    }

    async fn insert_ft_event(&mut self, event: &FtEvent) -> Result<u64, StoreError> {
        if self.staged.ft_events.iter().any(|e| {
            e.event_index == event.event_index
                && e.tx_id == event.tx_id
                && e.index_block_hash == event.index_block_hash
        }) {
            return Ok(0);
        }
        self.staged.ft_events.push(event.clone());
        Ok(1)
    }

    async fn insert_nft_event(&mut self, event: &NftEvent) -> Result<u64, StoreError> {
        if self.staged.nft_events.iter().any(|e| {
            e.event_index == event.event_index
                && e.tx_id == event.tx_id
                && e.index_block_hash == event.index_block_hash
        }) {
            return Ok(0);
        }
        self.staged.nft_events.push(event.clone());
        Ok(1)
    }

    async fn insert_contract_log(&mut self, log: &SmartContractLog) -> Result<u64, StoreError> {
        if self.staged.contract_logs.iter().any(|e| {
            e.event_index == log.event_index
                && e.tx_id == log.tx_id
                && e.index_block_hash == log.index_block_hash
        }) {
            return Ok(0);
        }
        self.staged.contract_logs.push(log.clone());
        Ok(1)
    }

    async fn insert_smart_contract(
        &mut self,
        contract: &SmartContract,
    ) -> Result<u64, StoreError> {
        if self.staged.smart_contracts.iter().any(|c| {
            c.tx_id == contract.tx_id
                && c.index_block_hash == contract.index_block_hash
                && c.contract_id == contract.contract_id
        }) {
            return Ok(0);
        }
        self.staged.smart_contracts.push(contract.clone());
        Ok(1)
    }

    async fn mark_entities_canonical(
        &mut self,
        index_block_hash: &[u8],
        canonical: bool,
    ) -> Result<UpdatedCounts, StoreError> {
        let mut counts = UpdatedCounts::default();
        for tx in &mut self.staged.txs {
            if tx.index_block_hash == index_block_hash && tx.canonical != canonical {
                tx.canonical = canonical;
                counts.txs += 1;
            }
        }
        for event in &mut self.staged.stx_events {
            if event.index_block_hash == index_block_hash && event.canonical != canonical {
                event.canonical = canonical;
                counts.stx_events += 1;
            }
        }
        for event in &mut self.staged.ft_events {
            if event.index_block_hash == index_block_hash && event.canonical != canonical {
                event.canonical = canonical;
                counts.ft_events += 1;
            }
        }
        for event in &mut self.staged.nft_events {
            if event.index_block_hash == index_block_hash && event.canonical != canonical {
                event.canonical = canonical;
                counts.nft_events += 1;
            }
        }
        for log in &mut self.staged.contract_logs {
            if log.index_block_hash == index_block_hash && log.canonical != canonical {
                log.canonical = canonical;
                counts.contract_logs += 1;
            }
        }
        for contract in &mut self.staged.smart_contracts {
            if contract.index_block_hash == index_block_hash && contract.canonical != canonical {
                contract.canonical = canonical;
                counts.smart_contracts += 1;
            }
        }
        Ok(counts)
    }

    async fn restore_orphaned_chain(
        &mut self,
        index_block_hash: &[u8],
    ) -> Result<UpdatedCounts, StoreError> {
        let mut totals = UpdatedCounts::default();
        let mut current = index_block_hash.to_vec();

        loop {
            let matching: Vec<Block> = self
                .staged
                .blocks
                .iter()
                .filter(|b| b.index_block_hash == current)
                .cloned()
                .collect();
            let block = match matching.len() {
                0 => {
                    return Err(StoreError::BlockNotFound {
                        index_block_hash: hex::encode(&current),
                    })
                }
                1 => matching.into_iter().next().expect("one row"),
                found => {
                    return Err(StoreError::DuplicateRows {
                        index_block_hash: hex::encode(&current),
                        found,
                    })
                }
            };

            let orphans: Vec<Vec<u8>> = self
                .staged
                .blocks
                .iter()
                .filter(|b| {
                    b.block_height == block.block_height
                        && b.canonical
                        && b.index_block_hash != current
                })
                .map(|b| b.index_block_hash.clone())
                .collect();

            for staged in &mut self.staged.blocks {
                if staged.index_block_hash == current && !staged.canonical {
                    staged.canonical = true;
                    totals.blocks += 1;
                }
            }
            for orphan in &orphans {
                for staged in &mut self.staged.blocks {
                    if &staged.index_block_hash == orphan {
                        staged.canonical = false;
                        totals.blocks += 1;
                    }
                }
                let counts = self.mark_entities_canonical(orphan, false).await?;
                totals.add(&counts);
            }

            let counts = self.mark_entities_canonical(&current, true).await?;
            totals.add(&counts);

            let parent = self
                .staged
                .blocks
                .iter()
                .find(|b| {
                    b.block_height + 1 == block.block_height
                        && b.index_block_hash == block.parent_index_block_hash
                })
                .cloned();
            match parent {
                Some(parent) if !parent.canonical => current = parent.index_block_hash,
                _ => break,
            }
        }

        Ok(totals)
    }

    async fn commit(self) -> Result<(), StoreError> {
        *self.shared.lock().expect("state lock") = self.staged;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stxindex_core::types::{AssetEventType, TxPayload, TxStatus};

    fn block(height: u64, seed: u8, parent_seed: u8, canonical: bool) -> Block {
        Block {
            block_hash: vec![seed; 32],
            index_block_hash: vec![seed + 100; 32],
            parent_index_block_hash: vec![parent_seed + 100; 32],
            parent_block_hash: vec![parent_seed; 32],
            parent_microblock: vec![0; 32],
            block_height: height,
            burn_block_time: 1_700_000_000 + height,
            canonical,
        }
    }

    fn stx_transfer(seed: u8, block: &Block, from: &str, to: &str, amount: u64) -> StxEvent {
        StxEvent {
            event_index: 0,
            tx_id: vec![seed; 32],
            tx_index: 0,
            block_height: block.block_height,
            index_block_hash: block.index_block_hash.clone(),
            canonical: block.canonical,
            event_type: AssetEventType::Transfer,
            sender: Some(from.into()),
            recipient: Some(to.into()),
            amount,
        }
    }

    fn coinbase_tx(seed: u8, block: &Block, sender: &str) -> Tx {
        Tx {
            tx_id: vec![seed; 32],
            tx_index: 0,
            index_block_hash: block.index_block_hash.clone(),
            block_hash: block.block_hash.clone(),
            block_height: block.block_height,
            burn_block_time: block.burn_block_time,
            status: TxStatus::Success,
            canonical: block.canonical,
            post_conditions: vec![],
            fee_rate: 0,
            sender_address: sender.into(),
            sponsored: false,
            origin_hash_mode: 0,
            payload: TxPayload::Coinbase { payload: vec![0; 32] },
        }
    }

    #[tokio::test]
    async fn inserts_are_idempotent() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();
        let b = block(1, 1, 0, true);
        assert_eq!(writer.insert_block(&b).await.unwrap(), 1);
        assert_eq!(writer.insert_block(&b).await.unwrap(), 0);
        writer.commit().await.unwrap();

        let page = store.list_blocks(10, 0).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();
        writer.insert_block(&block(1, 1, 0, true)).await.unwrap();
        writer.rollback().await.unwrap();
        assert_eq!(store.list_blocks(10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn mark_entities_counts_only_flips() {
        let store = MemoryStore::new();
        let b = block(1, 1, 0, true);
        let mut writer = store.begin().await.unwrap();
        writer.insert_block(&b).await.unwrap();
        writer.insert_tx(&coinbase_tx(5, &b, "SP1")).await.unwrap();
        writer
            .insert_stx_event(&stx_transfer(5, &b, "SP1", "SP2", 10))
            .await
            .unwrap();

        let counts = writer
            .mark_entities_canonical(&b.index_block_hash, false)
            .await
            .unwrap();
        assert_eq!(counts.txs, 1);
        assert_eq!(counts.stx_events, 1);

        // Already non-canonical; nothing left to flip.
        let counts = writer
            .mark_entities_canonical(&b.index_block_hash, false)
            .await
            .unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn restore_walks_orphaned_ancestors() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();

        // Canonical chain 1-2-3; orphaned fork 2'-3' hanging off block 1.
        let b1 = block(1, 1, 0, true);
        let b2 = block(2, 2, 1, true);
        let b3 = block(3, 3, 2, true);
        let b2f = block(2, 12, 1, false);
        let mut b3f = block(3, 13, 12, false);
        b3f.parent_index_block_hash = b2f.index_block_hash.clone();
        for b in [&b1, &b2, &b3, &b2f, &b3f] {
            writer.insert_block(b).await.unwrap();
        }
        writer.insert_tx(&coinbase_tx(22, &b2, "SP1")).await.unwrap();
        writer.insert_tx(&coinbase_tx(32, &b2f, "SP2")).await.unwrap();

        let counts = writer
            .restore_orphaned_chain(&b3f.index_block_hash)
            .await
            .unwrap();
        // Restored 2' and 3', orphaned 2 and 3.
        assert_eq!(counts.blocks, 4);
        assert_eq!(counts.txs, 2);
        writer.commit().await.unwrap();

        let tip = {
            let mut w = store.begin().await.unwrap();
            w.chain_tip().await.unwrap().unwrap()
        };
        assert_eq!(tip.index_block_hash, b3f.index_block_hash);
    }

    #[tokio::test]
    async fn restore_unknown_block_fails() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();
        assert!(matches!(
            writer.restore_orphaned_chain(&[9u8; 32]).await,
            Err(StoreError::BlockNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stx_balance_ignores_non_canonical_events() {
        let store = MemoryStore::new();
        let b1 = block(1, 1, 0, true);
        let orphan = block(1, 11, 0, false);
        let mut writer = store.begin().await.unwrap();
        writer.insert_block(&b1).await.unwrap();
        writer.insert_block(&orphan).await.unwrap();
        writer
            .insert_stx_event(&stx_transfer(1, &b1, "SP1", "SP2", 100))
            .await
            .unwrap();
        writer
            .insert_stx_event(&stx_transfer(2, &orphan, "SP1", "SP2", 999))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        let balance = store.get_stx_balance("SP2").await.unwrap();
        assert_eq!(balance.balance, 100);
        assert_eq!(balance.total_received, 100);
        assert_eq!(balance.total_sent, 0);

        let sender = store.get_stx_balance("SP1").await.unwrap();
        assert_eq!(sender.balance, -100);
    }

    #[tokio::test]
    async fn address_txs_include_transfer_recipients() {
        let store = MemoryStore::new();
        let b1 = block(1, 1, 0, true);
        let mut tx = coinbase_tx(7, &b1, "SP1");
        tx.payload = TxPayload::TokenTransfer {
            recipient: "SP2".into(),
            amount: 5,
            memo: vec![],
        };
        let mut writer = store.begin().await.unwrap();
        writer.insert_block(&b1).await.unwrap();
        writer.insert_tx(&tx).await.unwrap();
        writer.commit().await.unwrap();

        let page = store.get_address_txs("SP2", 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].tx_id, vec![7u8; 32]);
        assert_eq!(store.get_address_txs("SP3", 10, 0).await.unwrap().total, 0);
    }
}
