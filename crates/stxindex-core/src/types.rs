//! Shared record types for the indexing pipeline.
//!
//! Every row the store persists is modelled here, together with the
//! decoded-batch shapes the indexer carries between decode and commit.

use serde::{Deserialize, Serialize};

// ─── Blocks ──────────────────────────────────────────────────────────────────

/// One block row. `index_block_hash` is the chain-position-unique key;
/// `block_hash` can repeat across fork siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_hash: Vec<u8>,
    pub index_block_hash: Vec<u8>,
    pub parent_index_block_hash: Vec<u8>,
    pub parent_block_hash: Vec<u8>,
    pub parent_microblock: Vec<u8>,
    pub block_height: u64,
    pub burn_block_time: u64,
    pub canonical: bool,
}

/// The current canonical chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub block_height: u64,
    pub block_hash: Vec<u8>,
    pub index_block_hash: Vec<u8>,
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Transaction kind discriminator, stored as a `smallint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxTypeId {
    TokenTransfer = 0,
    SmartContract = 1,
    ContractCall = 2,
    PoisonMicroblock = 3,
    Coinbase = 4,
}

impl TxTypeId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::TokenTransfer),
            1 => Some(Self::SmartContract),
            2 => Some(Self::ContractCall),
            3 => Some(Self::PoisonMicroblock),
            4 => Some(Self::Coinbase),
            _ => None,
        }
    }
}

/// Execution status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxStatus {
    Pending = 0,
    Success = 1,
    Failed = 2,
}

impl TxStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Success),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The type-discriminated payload of a transaction.
///
/// The SQL layer flattens this into nullable columns gated by `type_id`;
/// in memory it is a single tagged sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    TokenTransfer {
        recipient: String,
        amount: u64,
        /// Arbitrary bytes, at most 34.
        memo: Vec<u8>,
    },
    SmartContract {
        contract_id: String,
        source_code: String,
    },
    ContractCall {
        contract_id: String,
        function_name: String,
        /// Serialized argument values, captured verbatim.
        function_args: Vec<u8>,
    },
    PoisonMicroblock {
        header_1: Vec<u8>,
        header_2: Vec<u8>,
    },
    Coinbase {
        /// 32-byte coinbase payload.
        payload: Vec<u8>,
    },
}

impl TxPayload {
    pub fn type_id(&self) -> TxTypeId {
        match self {
            Self::TokenTransfer { .. } => TxTypeId::TokenTransfer,
            Self::SmartContract { .. } => TxTypeId::SmartContract,
            Self::ContractCall { .. } => TxTypeId::ContractCall,
            Self::PoisonMicroblock { .. } => TxTypeId::PoisonMicroblock,
            Self::Coinbase { .. } => TxTypeId::Coinbase,
        }
    }

    /// Recipient address for token transfers, `None` otherwise.
    pub fn token_transfer_recipient(&self) -> Option<&str> {
        match self {
            Self::TokenTransfer { recipient, .. } => Some(recipient),
            _ => None,
        }
    }
}

/// One transaction row. Unique on (`tx_id`, `index_block_hash`) so fork
/// siblings can hold the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub tx_id: Vec<u8>,
    pub tx_index: u32,
    pub index_block_hash: Vec<u8>,
    pub block_hash: Vec<u8>,
    pub block_height: u64,
    pub burn_block_time: u64,
    pub status: TxStatus,
    pub canonical: bool,
    pub post_conditions: Vec<u8>,
    pub fee_rate: u64,
    pub sender_address: String,
    pub sponsored: bool,
    pub origin_hash_mode: u8,
    pub payload: TxPayload,
}

impl Tx {
    pub fn type_id(&self) -> TxTypeId {
        self.payload.type_id()
    }
}

// ─── Asset events ────────────────────────────────────────────────────────────

/// Transfer / mint / burn discriminator shared by the three asset tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssetEventType {
    Transfer = 1,
    Mint = 2,
    Burn = 3,
}

impl AssetEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Transfer),
            2 => Some(Self::Mint),
            3 => Some(Self::Burn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StxEvent {
    pub event_index: u32,
    pub tx_id: Vec<u8>,
    pub tx_index: u32,
    pub block_height: u64,
    pub index_block_hash: Vec<u8>,
    pub canonical: bool,
    pub event_type: AssetEventType,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtEvent {
    pub event_index: u32,
    pub tx_id: Vec<u8>,
    pub tx_index: u32,
    pub block_height: u64,
    pub index_block_hash: Vec<u8>,
    pub canonical: bool,
    pub event_type: AssetEventType,
    pub asset_identifier: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftEvent {
    pub event_index: u32,
    pub tx_id: Vec<u8>,
    pub tx_index: u32,
    pub block_height: u64,
    pub index_block_hash: Vec<u8>,
    pub canonical: bool,
    pub event_type: AssetEventType,
    pub asset_identifier: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    /// Raw serialized value identifying the token instance.
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContractLog {
    pub event_index: u32,
    pub tx_id: Vec<u8>,
    pub tx_index: u32,
    pub block_height: u64,
    pub index_block_hash: Vec<u8>,
    pub canonical: bool,
    pub contract_identifier: String,
    pub topic: String,
    pub value: Vec<u8>,
}

/// A deployed contract row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub tx_id: Vec<u8>,
    pub contract_id: String,
    pub block_height: u64,
    pub index_block_hash: Vec<u8>,
    pub source_code: String,
    pub abi: Option<String>,
    pub canonical: bool,
}

// ─── Event envelope ──────────────────────────────────────────────────────────

/// The four event kinds behind one sealed envelope, ordered by
/// `event_index` within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxEvent {
    Stx(StxEvent),
    Ft(FtEvent),
    Nft(NftEvent),
    Log(SmartContractLog),
}

impl TxEvent {
    pub fn event_index(&self) -> u32 {
        match self {
            Self::Stx(e) => e.event_index,
            Self::Ft(e) => e.event_index,
            Self::Nft(e) => e.event_index,
            Self::Log(e) => e.event_index,
        }
    }

    pub fn tx_id(&self) -> &[u8] {
        match self {
            Self::Stx(e) => &e.tx_id,
            Self::Ft(e) => &e.tx_id,
            Self::Nft(e) => &e.tx_id,
            Self::Log(e) => &e.tx_id,
        }
    }

    /// Stable 16-byte fingerprint for this event, derived from its index
    /// and owning transaction.
    pub fn event_id(&self) -> [u8; 16] {
        crate::decoder::compute_event_id(self.event_index(), self.tx_id())
    }

    /// Flip the canonical flag in place (reorg handling in the memory store).
    pub fn set_canonical(&mut self, canonical: bool) {
        match self {
            Self::Stx(e) => e.canonical = canonical,
            Self::Ft(e) => e.canonical = canonical,
            Self::Nft(e) => e.canonical = canonical,
            Self::Log(e) => e.canonical = canonical,
        }
    }
}

// ─── Decoded batches ─────────────────────────────────────────────────────────

/// One transaction with everything its execution produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    pub tx: Tx,
    pub events: Vec<TxEvent>,
    pub contracts: Vec<SmartContract>,
}

/// The decoder's output for one node message: the block plus its
/// transactions in `tx_index` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBatch {
    pub block: Block,
    pub txs: Vec<TxEntry>,
}

impl BlockBatch {
    /// Force every entity in the batch to the given canonical flag.
    /// Used when the incoming block is a sibling of existing history.
    pub fn set_canonical(&mut self, canonical: bool) {
        self.block.canonical = canonical;
        for entry in &mut self.txs {
            entry.tx.canonical = canonical;
            for event in &mut entry.events {
                event.set_canonical(canonical);
            }
            for contract in &mut entry.contracts {
                contract.canonical = canonical;
            }
        }
    }

    /// Total number of events across all transactions.
    pub fn event_count(&self) -> usize {
        self.txs.iter().map(|t| t.events.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_type_id_roundtrip() {
        for id in [0u8, 1, 2, 3, 4] {
            let type_id = TxTypeId::from_u8(id).unwrap();
            assert_eq!(type_id as u8, id);
        }
        assert!(TxTypeId::from_u8(5).is_none());
    }

    #[test]
    fn asset_event_type_rejects_zero() {
        assert!(AssetEventType::from_u8(0).is_none());
        assert_eq!(AssetEventType::from_u8(2), Some(AssetEventType::Mint));
    }

    #[test]
    fn payload_type_id_matches_variant() {
        let payload = TxPayload::Coinbase { payload: vec![0; 32] };
        assert_eq!(payload.type_id(), TxTypeId::Coinbase);
        assert!(payload.token_transfer_recipient().is_none());

        let transfer = TxPayload::TokenTransfer {
            recipient: "SP000000000000000000002Q6VF78".into(),
            amount: 100,
            memo: vec![],
        };
        assert_eq!(
            transfer.token_transfer_recipient(),
            Some("SP000000000000000000002Q6VF78")
        );
    }

    #[test]
    fn batch_set_canonical_reaches_all_entities() {
        let mut batch = BlockBatch {
            block: Block {
                block_hash: vec![1; 32],
                index_block_hash: vec![2; 32],
                parent_index_block_hash: vec![3; 32],
                parent_block_hash: vec![4; 32],
                parent_microblock: vec![0; 32],
                block_height: 2,
                burn_block_time: 1_700_000_000,
                canonical: true,
            },
            txs: vec![TxEntry {
                tx: Tx {
                    tx_id: vec![9; 32],
                    tx_index: 0,
                    index_block_hash: vec![2; 32],
                    block_hash: vec![1; 32],
                    block_height: 2,
                    burn_block_time: 1_700_000_000,
                    status: TxStatus::Success,
                    canonical: true,
                    post_conditions: vec![],
                    fee_rate: 180,
                    sender_address: "SP000000000000000000002Q6VF78".into(),
                    sponsored: false,
                    origin_hash_mode: 0,
                    payload: TxPayload::Coinbase { payload: vec![0; 32] },
                },
                events: vec![TxEvent::Stx(StxEvent {
                    event_index: 0,
                    tx_id: vec![9; 32],
                    tx_index: 0,
                    block_height: 2,
                    index_block_hash: vec![2; 32],
                    canonical: true,
                    event_type: AssetEventType::Mint,
                    sender: None,
                    recipient: Some("SP000000000000000000002Q6VF78".into()),
                    amount: 1000,
                })],
                contracts: vec![],
            }],
        };

        batch.set_canonical(false);
        assert!(!batch.block.canonical);
        assert!(!batch.txs[0].tx.canonical);
        match &batch.txs[0].events[0] {
            TxEvent::Stx(e) => assert!(!e.canonical),
            _ => unreachable!(),
        }
    }
}
