//! Node-message decoding.
//!
//! Converts one typed node message into a [`BlockBatch`]: the block header,
//! each transaction decoded from its binary wire form, and the execution
//! events attached to each transaction. Pure and deterministic; no I/O.
//!
//! The transaction wire layout:
//! `version ‖ chain_id ‖ auth_type ‖ origin condition ‖ [sponsor condition]
//! ‖ anchor_mode ‖ post_condition_mode ‖ post_conditions ‖ payload`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512_256};

use crate::address::{c32_address, Network};
use crate::error::DecodeError;
use crate::types::{
    AssetEventType, Block, BlockBatch, FtEvent, NftEvent, SmartContract, SmartContractLog,
    StxEvent, Tx, TxEntry, TxEvent, TxPayload, TxStatus,
};

// ─── Node messages ───────────────────────────────────────────────────────────

/// One block event as delivered by the node stream. Hashes are hex strings;
/// transaction bodies are hex-encoded wire bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBlockMessage {
    pub block_hash: String,
    pub index_block_hash: String,
    pub parent_index_block_hash: String,
    pub parent_block_hash: String,
    #[serde(default)]
    pub parent_microblock: String,
    pub block_height: u64,
    pub burn_block_time: u64,
    pub transactions: Vec<NodeTxMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTxMessage {
    /// Hex-encoded binary transaction.
    pub raw_tx: String,
    pub tx_index: u32,
    pub success: bool,
    #[serde(default)]
    pub events: Vec<NodeEvent>,
    /// Contract interface reported by the node for deploy transactions.
    #[serde(default)]
    pub contract_abi: Option<serde_json::Value>,
}

/// Execution events attached to a transaction, discriminated by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    StxAsset {
        event_index: u32,
        event_type: AssetEventType,
        sender: Option<String>,
        recipient: Option<String>,
        amount: u64,
    },
    FtAsset {
        event_index: u32,
        event_type: AssetEventType,
        asset_identifier: String,
        sender: Option<String>,
        recipient: Option<String>,
        amount: u128,
    },
    NftAsset {
        event_index: u32,
        event_type: AssetEventType,
        asset_identifier: String,
        sender: Option<String>,
        recipient: Option<String>,
        /// Hex-encoded serialized value identifying the token instance.
        value: String,
    },
    ContractLog {
        event_index: u32,
        contract_identifier: String,
        topic: String,
        /// Hex-encoded serialized log value.
        value: String,
    },
}

// ─── Wire constants ──────────────────────────────────────────────────────────

const AUTH_TYPE_STANDARD: u8 = 0x04;
const AUTH_TYPE_SPONSORED: u8 = 0x05;

const PRINCIPAL_STANDARD: u8 = 0x05;
const PRINCIPAL_CONTRACT: u8 = 0x06;

const PAYLOAD_TOKEN_TRANSFER: u8 = 0x00;
const PAYLOAD_SMART_CONTRACT: u8 = 0x01;
const PAYLOAD_CONTRACT_CALL: u8 = 0x02;
const PAYLOAD_POISON_MICROBLOCK: u8 = 0x03;
const PAYLOAD_COINBASE: u8 = 0x04;

const MEMO_LEN: usize = 34;
const MICROBLOCK_HEADER_LEN: usize = 1 + 2 + 32 + 32 + 65;
const CLARITY_DEPTH_LIMIT: u32 = 64;

// ─── Byte reader ─────────────────────────────────────────────────────────────

/// Offset-tracking reader over a raw transaction buffer. Every failure
/// reports the byte position it occurred at.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: n - (self.buf.len() - self.pos),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_hash160(&mut self) -> Result<[u8; 20], DecodeError> {
        let bytes = self.take(20)?;
        let mut raw = [0u8; 20];
        raw.copy_from_slice(bytes);
        Ok(raw)
    }

    /// Length-prefixed name: one length byte then that many ASCII bytes.
    fn read_name(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let offset = self.pos;
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::MalformedField {
            field,
            offset,
            reason: "name is not valid UTF-8".into(),
        })
    }
}

// ─── Event fingerprint ───────────────────────────────────────────────────────

/// Stable 16-byte event fingerprint:
/// `sha256(u32_be(event_index) ‖ tx_id)[16..32]`.
pub fn compute_event_id(event_index: u32, tx_id: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(event_index.to_be_bytes());
    hasher.update(tx_id);
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[16..32]);
    id
}

// ─── Transaction decoding ────────────────────────────────────────────────────

/// Fields recovered from one raw transaction body.
#[derive(Debug, Clone)]
pub struct DecodedTx {
    pub tx_id: Vec<u8>,
    pub sender_address: String,
    pub origin_hash_mode: u8,
    pub fee_rate: u64,
    pub sponsored: bool,
    pub post_conditions: Vec<u8>,
    pub payload: TxPayload,
}

/// Decode one binary transaction. The transaction id is the SHA-512/256
/// digest of the wire bytes.
pub fn decode_raw_tx(raw: &[u8], network: Network) -> Result<DecodedTx, DecodeError> {
    let mut reader = ByteReader::new(raw);

    let _version = reader.read_u8()?;
    let _chain_id = reader.read_u32()?;

    let auth_type = reader.read_u8()?;
    let sponsored = match auth_type {
        AUTH_TYPE_STANDARD => false,
        AUTH_TYPE_SPONSORED => true,
        other => {
            return Err(DecodeError::UnknownAuthType {
                auth_type: other,
                offset: reader.position() - 1,
            })
        }
    };

    let origin = read_spending_condition(&mut reader)?;
    if sponsored {
        // The sponsor pays; its keys are not part of the indexed record.
        read_spending_condition(&mut reader)?;
    }

    let version = network.address_version(origin.hash_mode).map_err(|_| {
        DecodeError::UnknownHashMode {
            hash_mode: origin.hash_mode,
            offset: origin.hash_mode_offset,
        }
    })?;
    let sender_address = c32_address(version, &origin.signer)?;

    let _anchor_mode = reader.read_u8()?;
    let post_conditions = read_post_conditions(&mut reader)?;
    let payload = read_payload(&mut reader, &sender_address)?;

    Ok(DecodedTx {
        tx_id: Sha512_256::digest(raw).to_vec(),
        sender_address,
        origin_hash_mode: origin.hash_mode,
        fee_rate: origin.fee_rate,
        sponsored,
        post_conditions,
        payload,
    })
}

struct SpendingCondition {
    hash_mode: u8,
    hash_mode_offset: usize,
    signer: [u8; 20],
    fee_rate: u64,
}

fn read_spending_condition(reader: &mut ByteReader<'_>) -> Result<SpendingCondition, DecodeError> {
    let hash_mode_offset = reader.position();
    let hash_mode = reader.read_u8()?;
    if hash_mode > 0x03 {
        return Err(DecodeError::UnknownHashMode {
            hash_mode,
            offset: hash_mode_offset,
        });
    }
    let signer = reader.read_hash160()?;
    let _nonce = reader.read_u64()?;
    let fee_rate = reader.read_u64()?;

    if hash_mode == 0x00 || hash_mode == 0x02 {
        // Single-sig: key encoding byte plus one recoverable signature.
        let _key_encoding = reader.read_u8()?;
        reader.take(65)?;
    } else {
        // Multi-sig: authorization field list then the signature threshold.
        let field_count = reader.read_u32()?;
        for _ in 0..field_count {
            let field_offset = reader.position();
            let field_id = reader.read_u8()?;
            match field_id {
                0x00 | 0x02 => {
                    reader.take(33)?;
                }
                0x01 => {
                    reader.take(65)?;
                }
                0x03 => {
                    reader.take(65)?;
                }
                other => {
                    return Err(DecodeError::MalformedField {
                        field: "authorization field",
                        offset: field_offset,
                        reason: format!("unknown field id {other:#04x}"),
                    })
                }
            }
        }
        let _signatures_required = reader.read_u16()?;
    }

    Ok(SpendingCondition {
        hash_mode,
        hash_mode_offset,
        signer,
        fee_rate,
    })
}

/// Parse the post-condition section just far enough to capture its
/// serialized bytes (mode byte excluded, count included).
fn read_post_conditions(reader: &mut ByteReader<'_>) -> Result<Vec<u8>, DecodeError> {
    let _mode = reader.read_u8()?;
    let start = reader.position();
    let count = reader.read_u32()?;
    for _ in 0..count {
        read_post_condition(reader)?;
    }
    Ok(reader.buf[start..reader.position()].to_vec())
}

fn read_post_condition(reader: &mut ByteReader<'_>) -> Result<(), DecodeError> {
    let type_offset = reader.position();
    let cond_type = reader.read_u8()?;
    read_post_condition_principal(reader)?;
    match cond_type {
        // STX: condition code then amount.
        0x00 => {
            reader.read_u8()?;
            reader.read_u64()?;
        }
        // Fungible: asset info, condition code, amount.
        0x01 => {
            read_asset_info(reader)?;
            reader.read_u8()?;
            reader.read_u64()?;
        }
        // Non-fungible: asset info, token instance value, condition code.
        0x02 => {
            read_asset_info(reader)?;
            skip_clarity_value(reader, 0)?;
            reader.read_u8()?;
        }
        other => {
            return Err(DecodeError::MalformedField {
                field: "post condition",
                offset: type_offset,
                reason: format!("unknown condition type {other:#04x}"),
            })
        }
    }
    Ok(())
}

fn read_post_condition_principal(reader: &mut ByteReader<'_>) -> Result<(), DecodeError> {
    let offset = reader.position();
    match reader.read_u8()? {
        // Origin principal carries no body.
        0x01 => Ok(()),
        0x02 => {
            reader.read_u8()?;
            reader.read_hash160()?;
            Ok(())
        }
        0x03 => {
            reader.read_u8()?;
            reader.read_hash160()?;
            reader.read_name("post condition contract name")?;
            Ok(())
        }
        other => Err(DecodeError::MalformedField {
            field: "post condition principal",
            offset,
            reason: format!("unknown principal type {other:#04x}"),
        }),
    }
}

fn read_asset_info(reader: &mut ByteReader<'_>) -> Result<(), DecodeError> {
    reader.read_u8()?;
    reader.read_hash160()?;
    reader.read_name("asset contract name")?;
    reader.read_name("asset name")?;
    Ok(())
}

/// Skip one serialized Clarity value, validating its structure.
fn skip_clarity_value(reader: &mut ByteReader<'_>, depth: u32) -> Result<(), DecodeError> {
    let offset = reader.position();
    if depth > CLARITY_DEPTH_LIMIT {
        return Err(DecodeError::MalformedField {
            field: "clarity value",
            offset,
            reason: "nesting depth limit exceeded".into(),
        });
    }
    match reader.read_u8()? {
        // int / uint
        0x00 | 0x01 => {
            reader.take(16)?;
        }
        // buffer
        0x02 => {
            let len = reader.read_u32()? as usize;
            reader.take(len)?;
        }
        // bool
        0x03 | 0x04 => {}
        // standard principal
        0x05 => {
            reader.read_u8()?;
            reader.read_hash160()?;
        }
        // contract principal
        0x06 => {
            reader.read_u8()?;
            reader.read_hash160()?;
            reader.read_name("clarity contract name")?;
        }
        // response ok / err
        0x07 | 0x08 => skip_clarity_value(reader, depth + 1)?,
        // optional none
        0x09 => {}
        // optional some
        0x0a => skip_clarity_value(reader, depth + 1)?,
        // list
        0x0b => {
            let count = reader.read_u32()?;
            for _ in 0..count {
                skip_clarity_value(reader, depth + 1)?;
            }
        }
        // tuple
        0x0c => {
            let count = reader.read_u32()?;
            for _ in 0..count {
                reader.read_name("tuple key")?;
                skip_clarity_value(reader, depth + 1)?;
            }
        }
        // string-ascii / string-utf8
        0x0d | 0x0e => {
            let len = reader.read_u32()? as usize;
            reader.take(len)?;
        }
        other => {
            return Err(DecodeError::MalformedField {
                field: "clarity value",
                offset,
                reason: format!("unknown value type {other:#04x}"),
            })
        }
    }
    Ok(())
}

fn read_payload(reader: &mut ByteReader<'_>, sender: &str) -> Result<TxPayload, DecodeError> {
    let type_offset = reader.position();
    let type_id = reader.read_u8()?;
    match type_id {
        PAYLOAD_TOKEN_TRANSFER => {
            let recipient = read_principal(reader)?;
            let amount = reader.read_u64()?;
            let memo = reader.take(MEMO_LEN)?.to_vec();
            Ok(TxPayload::TokenTransfer {
                recipient,
                amount,
                memo,
            })
        }
        PAYLOAD_SMART_CONTRACT => {
            let name = reader.read_name("contract name")?;
            let len = reader.read_u32()? as usize;
            let body_offset = reader.position();
            let body = reader.take(len)?;
            let source_code =
                String::from_utf8(body.to_vec()).map_err(|_| DecodeError::MalformedField {
                    field: "contract body",
                    offset: body_offset,
                    reason: "source is not valid UTF-8".into(),
                })?;
            Ok(TxPayload::SmartContract {
                contract_id: format!("{sender}.{name}"),
                source_code,
            })
        }
        PAYLOAD_CONTRACT_CALL => {
            let version = reader.read_u8()?;
            let hash = reader.read_hash160()?;
            let contract_name = reader.read_name("contract name")?;
            let function_name = reader.read_name("function name")?;
            let args_start = reader.position();
            let arg_count = reader.read_u32()?;
            for _ in 0..arg_count {
                skip_clarity_value(reader, 0)?;
            }
            let function_args = reader.buf[args_start..reader.position()].to_vec();
            let contract_address = c32_address(version, &hash)?;
            Ok(TxPayload::ContractCall {
                contract_id: format!("{contract_address}.{contract_name}"),
                function_name,
                function_args,
            })
        }
        PAYLOAD_POISON_MICROBLOCK => {
            let header_1 = reader.take(MICROBLOCK_HEADER_LEN)?.to_vec();
            let header_2 = reader.take(MICROBLOCK_HEADER_LEN)?.to_vec();
            Ok(TxPayload::PoisonMicroblock { header_1, header_2 })
        }
        PAYLOAD_COINBASE => Ok(TxPayload::Coinbase {
            payload: reader.take(32)?.to_vec(),
        }),
        other => Err(DecodeError::UnknownPayloadType {
            type_id: other,
            offset: type_offset,
        }),
    }
}

/// Standard (`version ‖ hash160`) or contract (`… ‖ name`) principal,
/// rendered as its textual address form.
fn read_principal(reader: &mut ByteReader<'_>) -> Result<String, DecodeError> {
    let offset = reader.position();
    match reader.read_u8()? {
        PRINCIPAL_STANDARD => {
            let version = reader.read_u8()?;
            let hash = reader.read_hash160()?;
            c32_address(version, &hash)
        }
        PRINCIPAL_CONTRACT => {
            let version = reader.read_u8()?;
            let hash = reader.read_hash160()?;
            let name = reader.read_name("principal contract name")?;
            Ok(format!("{}.{}", c32_address(version, &hash)?, name))
        }
        other => Err(DecodeError::MalformedField {
            field: "principal",
            offset,
            reason: format!("unknown principal type {other:#04x}"),
        }),
    }
}

// ─── Block message decoding ──────────────────────────────────────────────────

/// Decode one node message into a batch ready for ingestion. Any failure
/// rejects the whole message.
pub fn decode_block_message(
    msg: &NodeBlockMessage,
    network: Network,
) -> Result<BlockBatch, DecodeError> {
    let block = Block {
        block_hash: parse_hex("block_hash", &msg.block_hash)?,
        index_block_hash: parse_hex("index_block_hash", &msg.index_block_hash)?,
        parent_index_block_hash: parse_hex(
            "parent_index_block_hash",
            &msg.parent_index_block_hash,
        )?,
        parent_block_hash: parse_hex("parent_block_hash", &msg.parent_block_hash)?,
        parent_microblock: parse_hex("parent_microblock", &msg.parent_microblock)?,
        block_height: msg.block_height,
        burn_block_time: msg.burn_block_time,
        canonical: true,
    };

    let mut txs = Vec::with_capacity(msg.transactions.len());
    for tx_msg in &msg.transactions {
        let raw = parse_hex("raw_tx", &tx_msg.raw_tx)?;
        let decoded = decode_raw_tx(&raw, network)?;

        let tx = Tx {
            tx_id: decoded.tx_id.clone(),
            tx_index: tx_msg.tx_index,
            index_block_hash: block.index_block_hash.clone(),
            block_hash: block.block_hash.clone(),
            block_height: block.block_height,
            burn_block_time: block.burn_block_time,
            status: if tx_msg.success {
                TxStatus::Success
            } else {
                TxStatus::Failed
            },
            canonical: true,
            post_conditions: decoded.post_conditions,
            fee_rate: decoded.fee_rate,
            sender_address: decoded.sender_address,
            sponsored: decoded.sponsored,
            origin_hash_mode: decoded.origin_hash_mode,
            payload: decoded.payload.clone(),
        };

        let mut events = Vec::with_capacity(tx_msg.events.len());
        for event in &tx_msg.events {
            events.push(convert_event(event, &tx)?);
        }
        events.sort_by_key(TxEvent::event_index);

        let mut contracts = Vec::new();
        if let TxPayload::SmartContract {
            contract_id,
            source_code,
        } = &decoded.payload
        {
            contracts.push(SmartContract {
                tx_id: tx.tx_id.clone(),
                contract_id: contract_id.clone(),
                block_height: block.block_height,
                index_block_hash: block.index_block_hash.clone(),
                source_code: source_code.clone(),
                abi: tx_msg
                    .contract_abi
                    .as_ref()
                    .map(|abi| abi.to_string()),
                canonical: true,
            });
        }

        txs.push(TxEntry {
            tx,
            events,
            contracts,
        });
    }
    txs.sort_by_key(|entry| entry.tx.tx_index);

    Ok(BlockBatch { block, txs })
}

fn convert_event(event: &NodeEvent, tx: &Tx) -> Result<TxEvent, DecodeError> {
    let converted = match event {
        NodeEvent::StxAsset {
            event_index,
            event_type,
            sender,
            recipient,
            amount,
        } => TxEvent::Stx(StxEvent {
            event_index: *event_index,
            tx_id: tx.tx_id.clone(),
            tx_index: tx.tx_index,
            block_height: tx.block_height,
            index_block_hash: tx.index_block_hash.clone(),
            canonical: true,
            event_type: *event_type,
            sender: sender.clone(),
            recipient: recipient.clone(),
            amount: *amount,
        }),
        NodeEvent::FtAsset {
            event_index,
            event_type,
            asset_identifier,
            sender,
            recipient,
            amount,
        } => TxEvent::Ft(FtEvent {
            event_index: *event_index,
            tx_id: tx.tx_id.clone(),
            tx_index: tx.tx_index,
            block_height: tx.block_height,
            index_block_hash: tx.index_block_hash.clone(),
            canonical: true,
            event_type: *event_type,
            asset_identifier: asset_identifier.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            amount: *amount,
        }),
        NodeEvent::NftAsset {
            event_index,
            event_type,
            asset_identifier,
            sender,
            recipient,
            value,
        } => TxEvent::Nft(NftEvent {
            event_index: *event_index,
            tx_id: tx.tx_id.clone(),
            tx_index: tx.tx_index,
            block_height: tx.block_height,
            index_block_hash: tx.index_block_hash.clone(),
            canonical: true,
            event_type: *event_type,
            asset_identifier: asset_identifier.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            value: parse_hex("event value", value)?,
        }),
        NodeEvent::ContractLog {
            event_index,
            contract_identifier,
            topic,
            value,
        } => TxEvent::Log(SmartContractLog {
            event_index: *event_index,
            tx_id: tx.tx_id.clone(),
            tx_index: tx.tx_index,
            block_height: tx.block_height,
            index_block_hash: tx.index_block_hash.clone(),
            canonical: true,
            contract_identifier: contract_identifier.clone(),
            topic: topic.clone(),
            value: parse_hex("event value", value)?,
        }),
    };
    Ok(converted)
}

fn parse_hex(field: &'static str, value: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(trimmed).map_err(|source| DecodeError::InvalidHex { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{ADDRESS_VERSION_MAINNET_SINGLESIG, HASH_MODE_P2PKH};

    // Wire-format encoders used to exercise the decoder round trip.

    fn encode_tx(payload: &[u8], sponsored: bool, hash_mode: u8) -> Vec<u8> {
        let mut raw = vec![0x00];
        raw.extend_from_slice(&1u32.to_be_bytes()); // chain id
        raw.push(if sponsored { 0x05 } else { 0x04 });
        raw.extend_from_slice(&encode_singlesig_condition(hash_mode, [7u8; 20], 3, 180));
        if sponsored {
            raw.extend_from_slice(&encode_singlesig_condition(0x00, [8u8; 20], 1, 0));
        }
        raw.push(0x03); // anchor mode: any
        raw.push(0x01); // post condition mode: allow
        raw.extend_from_slice(&0u32.to_be_bytes()); // no post conditions
        raw.extend_from_slice(payload);
        raw
    }

    fn encode_singlesig_condition(hash_mode: u8, signer: [u8; 20], nonce: u64, fee: u64) -> Vec<u8> {
        let mut out = vec![hash_mode];
        out.extend_from_slice(&signer);
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&fee.to_be_bytes());
        out.push(0x00); // key encoding: compressed
        out.extend_from_slice(&[0u8; 65]);
        out
    }

    fn encode_standard_principal(version: u8, hash: [u8; 20]) -> Vec<u8> {
        let mut out = vec![PRINCIPAL_STANDARD, version];
        out.extend_from_slice(&hash);
        out
    }

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = vec![name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out
    }

    fn token_transfer_payload(amount: u64) -> Vec<u8> {
        let mut payload = vec![PAYLOAD_TOKEN_TRANSFER];
        payload.extend_from_slice(&encode_standard_principal(
            ADDRESS_VERSION_MAINNET_SINGLESIG,
            [9u8; 20],
        ));
        payload.extend_from_slice(&amount.to_be_bytes());
        payload.extend_from_slice(&[0u8; MEMO_LEN]);
        payload
    }

    #[test]
    fn decodes_token_transfer() {
        let raw = encode_tx(&token_transfer_payload(12_345), false, HASH_MODE_P2PKH);
        let decoded = decode_raw_tx(&raw, Network::Mainnet).unwrap();

        assert_eq!(decoded.fee_rate, 180);
        assert!(!decoded.sponsored);
        assert_eq!(decoded.origin_hash_mode, HASH_MODE_P2PKH);
        assert_eq!(
            decoded.sender_address,
            c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[7u8; 20]).unwrap()
        );
        match decoded.payload {
            TxPayload::TokenTransfer {
                recipient,
                amount,
                memo,
            } => {
                assert_eq!(amount, 12_345);
                assert_eq!(memo.len(), MEMO_LEN);
                assert_eq!(
                    recipient,
                    c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[9u8; 20]).unwrap()
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decodes_smart_contract_deploy() {
        let mut payload = vec![PAYLOAD_SMART_CONTRACT];
        payload.extend_from_slice(&encode_name("counter"));
        let body = b"(define-data-var count uint u0)";
        payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
        payload.extend_from_slice(body);

        let raw = encode_tx(&payload, false, HASH_MODE_P2PKH);
        let decoded = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        match decoded.payload {
            TxPayload::SmartContract {
                contract_id,
                source_code,
            } => {
                assert_eq!(contract_id, format!("{}.counter", decoded.sender_address));
                assert_eq!(source_code, "(define-data-var count uint u0)");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decodes_contract_call_with_args() {
        let mut payload = vec![PAYLOAD_CONTRACT_CALL];
        payload.push(ADDRESS_VERSION_MAINNET_SINGLESIG);
        payload.extend_from_slice(&[3u8; 20]);
        payload.extend_from_slice(&encode_name("pool"));
        payload.extend_from_slice(&encode_name("swap"));
        // two args: uint 7, buffer [0xAA, 0xBB]
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.push(0x01);
        payload.extend_from_slice(&{
            let mut v = [0u8; 16];
            v[15] = 7;
            v
        });
        payload.push(0x02);
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB]);

        let raw = encode_tx(&payload, false, HASH_MODE_P2PKH);
        let decoded = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        match decoded.payload {
            TxPayload::ContractCall {
                contract_id,
                function_name,
                function_args,
            } => {
                let expected =
                    c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[3u8; 20]).unwrap();
                assert_eq!(contract_id, format!("{expected}.pool"));
                assert_eq!(function_name, "swap");
                // count word plus the two serialized values
                assert_eq!(function_args.len(), 4 + 17 + 7);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decodes_coinbase_and_poison() {
        let mut coinbase = vec![PAYLOAD_COINBASE];
        coinbase.extend_from_slice(&[0x42; 32]);
        let raw = encode_tx(&coinbase, false, HASH_MODE_P2PKH);
        match decode_raw_tx(&raw, Network::Mainnet).unwrap().payload {
            TxPayload::Coinbase { payload } => assert_eq!(payload, vec![0x42; 32]),
            other => panic!("unexpected payload: {other:?}"),
        }

        let mut poison = vec![PAYLOAD_POISON_MICROBLOCK];
        poison.extend_from_slice(&[0x01; MICROBLOCK_HEADER_LEN]);
        poison.extend_from_slice(&[0x02; MICROBLOCK_HEADER_LEN]);
        let raw = encode_tx(&poison, false, HASH_MODE_P2PKH);
        match decode_raw_tx(&raw, Network::Mainnet).unwrap().payload {
            TxPayload::PoisonMicroblock { header_1, header_2 } => {
                assert_eq!(header_1.len(), MICROBLOCK_HEADER_LEN);
                assert_ne!(header_1, header_2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decodes_sponsored_tx() {
        let raw = encode_tx(&token_transfer_payload(1), true, HASH_MODE_P2PKH);
        let decoded = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        assert!(decoded.sponsored);
        // Sender comes from the origin condition, not the sponsor's.
        assert_eq!(
            decoded.sender_address,
            c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[7u8; 20]).unwrap()
        );
    }

    #[test]
    fn captures_post_conditions() {
        // One STX post condition: origin principal, sent-le, 500.
        let mut raw = vec![0x00];
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.push(0x04);
        raw.extend_from_slice(&encode_singlesig_condition(0x00, [7u8; 20], 0, 0));
        raw.push(0x03);
        raw.push(0x02); // deny mode
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.push(0x00); // STX condition
        raw.push(0x01); // origin principal
        raw.push(0x02); // condition code
        raw.extend_from_slice(&500u64.to_be_bytes());
        raw.extend_from_slice(&token_transfer_payload(1));

        let decoded = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        // count word + type + principal + code + amount
        assert_eq!(decoded.post_conditions.len(), 4 + 1 + 1 + 1 + 8);
        assert_eq!(&decoded.post_conditions[..4], &1u32.to_be_bytes());
    }

    #[test]
    fn rejects_unknown_payload_type() {
        let raw = encode_tx(&[0x09], false, HASH_MODE_P2PKH);
        match decode_raw_tx(&raw, Network::Mainnet) {
            Err(DecodeError::UnknownPayloadType { type_id: 0x09, offset }) => {
                assert_eq!(offset, raw.len() - 1);
            }
            other => panic!("expected UnknownPayloadType, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_auth_type() {
        let mut raw = vec![0x00];
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.push(0x06);
        assert!(matches!(
            decode_raw_tx(&raw, Network::Mainnet),
            Err(DecodeError::UnknownAuthType { auth_type: 0x06, .. })
        ));
    }

    #[test]
    fn truncated_input_reports_offset() {
        let full = encode_tx(&token_transfer_payload(1), false, HASH_MODE_P2PKH);
        let truncated = &full[..full.len() - 10];
        match decode_raw_tx(truncated, Network::Mainnet) {
            Err(DecodeError::UnexpectedEof { offset, needed }) => {
                assert!(offset <= truncated.len());
                assert!(needed > 0);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn tx_id_is_digest_of_wire_bytes() {
        let raw = encode_tx(&token_transfer_payload(1), false, HASH_MODE_P2PKH);
        let a = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        let b = decode_raw_tx(&raw, Network::Mainnet).unwrap();
        assert_eq!(a.tx_id, b.tx_id);
        assert_eq!(a.tx_id.len(), 32);

        let other = encode_tx(&token_transfer_payload(2), false, HASH_MODE_P2PKH);
        assert_ne!(a.tx_id, decode_raw_tx(&other, Network::Mainnet).unwrap().tx_id);
    }

    #[test]
    fn event_id_vectors() {
        let tx_id = [0x12u8; 32];
        assert_eq!(
            hex::encode(compute_event_id(0, &tx_id)),
            "e0e2ac436ccd967ddfaf8bdbe1037da3"
        );
        assert_eq!(
            hex::encode(compute_event_id(1, &tx_id)),
            "3c4fbf77832841480f5d625daff8377b"
        );
        assert_eq!(
            hex::encode(compute_event_id(7, &tx_id)),
            "47d8bf095958b3eebe21f3764fd397a0"
        );
    }

    #[test]
    fn event_ids_distinct_across_indexes() {
        let tx_id = [0xABu8; 32];
        let ids: Vec<_> = (0u32..64).map(|i| compute_event_id(i, &tx_id)).collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn block_message_decode_builds_batch() {
        let raw = encode_tx(&token_transfer_payload(777), false, HASH_MODE_P2PKH);
        let msg = NodeBlockMessage {
            block_hash: hex::encode([0xB1u8; 32]),
            index_block_hash: format!("0x{}", hex::encode([0xB2u8; 32])),
            parent_index_block_hash: hex::encode([0xB3u8; 32]),
            parent_block_hash: hex::encode([0xB4u8; 32]),
            parent_microblock: hex::encode([0u8; 32]),
            block_height: 5,
            burn_block_time: 1_700_000_000,
            transactions: vec![NodeTxMessage {
                raw_tx: hex::encode(&raw),
                tx_index: 0,
                success: true,
                events: vec![
                    NodeEvent::StxAsset {
                        event_index: 1,
                        event_type: AssetEventType::Transfer,
                        sender: Some("SP000000000000000000002Q6VF78".into()),
                        recipient: Some("ST000000000000000000002AMW42H".into()),
                        amount: 777,
                    },
                    NodeEvent::ContractLog {
                        event_index: 0,
                        contract_identifier: "SP000000000000000000002Q6VF78.pool".into(),
                        topic: "print".into(),
                        value: hex::encode([0x0c, 0x00, 0x00, 0x00, 0x00]),
                    },
                ],
                contract_abi: None,
            }],
        };

        let batch = decode_block_message(&msg, Network::Mainnet).unwrap();
        assert_eq!(batch.block.block_height, 5);
        assert_eq!(batch.block.index_block_hash, vec![0xB2u8; 32]);
        assert_eq!(batch.txs.len(), 1);
        assert_eq!(batch.txs[0].tx.status, TxStatus::Success);
        // Events come back sorted by event_index.
        let indexes: Vec<_> = batch.txs[0]
            .events
            .iter()
            .map(TxEvent::event_index)
            .collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn failed_tx_status_and_deploy_contract_row() {
        let mut payload = vec![PAYLOAD_SMART_CONTRACT];
        payload.extend_from_slice(&encode_name("token"));
        let body = b"(define-fungible-token token)";
        payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
        payload.extend_from_slice(body);
        let raw = encode_tx(&payload, false, HASH_MODE_P2PKH);

        let msg = NodeBlockMessage {
            block_hash: hex::encode([1u8; 32]),
            index_block_hash: hex::encode([2u8; 32]),
            parent_index_block_hash: hex::encode([3u8; 32]),
            parent_block_hash: hex::encode([4u8; 32]),
            parent_microblock: hex::encode([0u8; 32]),
            block_height: 9,
            burn_block_time: 1_700_000_100,
            transactions: vec![NodeTxMessage {
                raw_tx: hex::encode(&raw),
                tx_index: 0,
                success: false,
                events: vec![],
                contract_abi: Some(serde_json::json!({"functions": []})),
            }],
        };

        let batch = decode_block_message(&msg, Network::Mainnet).unwrap();
        assert_eq!(batch.txs[0].tx.status, TxStatus::Failed);
        assert_eq!(batch.txs[0].contracts.len(), 1);
        let contract = &batch.txs[0].contracts[0];
        assert!(contract.contract_id.ends_with(".token"));
        assert_eq!(contract.abi.as_deref(), Some(r#"{"functions":[]}"#));
    }
}
