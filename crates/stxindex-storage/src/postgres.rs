//! PostgreSQL storage backend.
//!
//! Persists blocks, transactions, events, and contracts through `sqlx`
//! with connection pooling. Writes run inside one transaction per block
//! batch, leased from the pool by [`PgWriter`]; reads run directly on the
//! pool and consider canonical rows only.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use stxindex_core::error::StoreError;
use stxindex_core::store::{
    FtBalance, IndexStore, NftHoldings, Page, StoreWriter, StxBalance, UpdatedCounts,
};
use stxindex_core::types::{
    AssetEventType, Block, ChainTip, FtEvent, NftEvent, SmartContract, SmartContractLog,
    StxEvent, Tx, TxEvent, TxPayload, TxStatus, TxTypeId,
};

use crate::migrations;

/// Entity tables toggled together with their block during reorg handling.
const ENTITY_TABLES: &[&str] = &[
    "txs",
    "stx_events",
    "ft_events",
    "nft_events",
    "contract_logs",
    "smart_contracts",
];

const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(10);
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

// ─── Connection options ──────────────────────────────────────────────────────

/// Pool options for the Postgres backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Per-acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: u64,
    /// Optional schema applied via `search_path` on every connection.
    pub schema: Option<String>,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            schema: None,
        }
    }
}

// ─── PostgresStore ───────────────────────────────────────────────────────────

/// PostgreSQL-backed store. Thread-safe and cheaply cloneable — wraps a
/// connection pool internally.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with default options and run pending up-migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    /// Connect with custom pool options and run pending up-migrations.
    ///
    /// Connection establishment is retried with a two-second backoff for
    /// up to ten seconds before giving up.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, StoreError> {
        let deadline = Instant::now() + CONNECT_RETRY_WINDOW;
        let pool = loop {
            match Self::build_pool(database_url, &opts).await {
                Ok(pool) => break pool,
                Err(err) if Instant::now() + CONNECT_BACKOFF < deadline => {
                    warn!(error = %err, "Postgres connect failed, retrying");
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Connection(err.to_string())),
            }
        };

        let store = Self { pool };
        let applied = migrations::migrate_up(&store.pool).await?;
        info!(applied, "PostgresStore connected and schema ready");
        Ok(store)
    }

    async fn build_pool(
        database_url: &str,
        opts: &PostgresOptions,
    ) -> Result<PgPool, sqlx::Error> {
        let mut builder = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(Duration::from_secs(opts.acquire_timeout_secs));

        if let Some(schema) = opts.schema.clone() {
            builder = builder.after_connect(move |conn, _meta| {
                let schema = schema.clone();
                Box::pin(async move {
                    conn.execute(format!("SET search_path TO {schema}").as_str())
                        .await?;
                    Ok(())
                })
            });
        }

        builder.connect(database_url).await
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn query_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Connection(err.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn block_from_row(row: &PgRow) -> Result<Block, StoreError> {
    Ok(Block {
        block_hash: try_get(row, "block_hash")?,
        index_block_hash: try_get(row, "index_block_hash")?,
        parent_index_block_hash: try_get(row, "parent_index_block_hash")?,
        parent_block_hash: try_get(row, "parent_block_hash")?,
        parent_microblock: try_get(row, "parent_microblock")?,
        block_height: try_get::<i64>(row, "block_height")? as u64,
        burn_block_time: try_get::<i64>(row, "burn_block_time")? as u64,
        canonical: try_get(row, "canonical")?,
    })
}

fn tx_from_row(row: &PgRow) -> Result<Tx, StoreError> {
    let type_raw = try_get::<i16>(row, "type_id")? as u8;
    let type_id = TxTypeId::from_u8(type_raw)
        .ok_or_else(|| StoreError::Query(format!("unknown tx type id {type_raw}")))?;

    let payload = match type_id {
        TxTypeId::TokenTransfer => TxPayload::TokenTransfer {
            recipient: required(row, "token_transfer_recipient_address")?,
            amount: required::<i64>(row, "token_transfer_amount")? as u64,
            memo: required(row, "token_transfer_memo")?,
        },
        TxTypeId::SmartContract => TxPayload::SmartContract {
            contract_id: required(row, "smart_contract_contract_id")?,
            source_code: required(row, "smart_contract_source_code")?,
        },
        TxTypeId::ContractCall => TxPayload::ContractCall {
            contract_id: required(row, "contract_call_contract_id")?,
            function_name: required(row, "contract_call_function_name")?,
            function_args: required(row, "contract_call_function_args")?,
        },
        TxTypeId::PoisonMicroblock => TxPayload::PoisonMicroblock {
            header_1: required(row, "poison_microblock_header_1")?,
            header_2: required(row, "poison_microblock_header_2")?,
        },
        TxTypeId::Coinbase => TxPayload::Coinbase {
            payload: required(row, "coinbase_payload")?,
        },
    };

    let status_raw = try_get::<i16>(row, "status")? as u8;
    Ok(Tx {
        tx_id: try_get(row, "tx_id")?,
        tx_index: try_get::<i32>(row, "tx_index")? as u32,
        index_block_hash: try_get(row, "index_block_hash")?,
        block_hash: try_get(row, "block_hash")?,
        block_height: try_get::<i64>(row, "block_height")? as u64,
        burn_block_time: try_get::<i64>(row, "burn_block_time")? as u64,
        status: TxStatus::from_u8(status_raw)
            .ok_or_else(|| StoreError::Query(format!("unknown tx status {status_raw}")))?,
        canonical: try_get(row, "canonical")?,
        post_conditions: try_get(row, "post_conditions")?,
        fee_rate: try_get::<i64>(row, "fee_rate")? as u64,
        sender_address: try_get(row, "sender_address")?,
        sponsored: try_get(row, "sponsored")?,
        origin_hash_mode: try_get::<i16>(row, "origin_hash_mode")? as u8,
        payload,
    })
}

fn try_get<'r, T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, StoreError> {
    row.try_get(column)
        .map_err(|e| StoreError::Query(format!("column {column}: {e}")))
}

fn required<'r, T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, StoreError> {
    try_get::<Option<T>>(row, column)?
        .ok_or_else(|| StoreError::Query(format!("column {column} unexpectedly NULL")))
}

fn asset_event_type(row: &PgRow) -> Result<AssetEventType, StoreError> {
    let raw = try_get::<i16>(row, "asset_event_type_id")? as u8;
    AssetEventType::from_u8(raw)
        .ok_or_else(|| StoreError::Query(format!("unknown asset event type {raw}")))
}

fn parse_numeric_u128(text: &str) -> Result<u128, StoreError> {
    text.parse::<u128>()
        .map_err(|e| StoreError::Query(format!("numeric column: {e}")))
}

// ─── IndexStore impl ─────────────────────────────────────────────────────────

const TX_COLUMNS: &str = "tx_id, index_block_hash, tx_index, block_hash, block_height, \
     burn_block_time, type_id, status, canonical, post_conditions, fee_rate, \
     sender_address, sponsored, origin_hash_mode, \
     token_transfer_recipient_address, token_transfer_amount, token_transfer_memo, \
     smart_contract_contract_id, smart_contract_source_code, \
     contract_call_contract_id, contract_call_function_name, contract_call_function_args, \
     poison_microblock_header_1, poison_microblock_header_2, coinbase_payload";

#[async_trait]
impl IndexStore for PostgresStore {
    type Writer = PgWriter;

    async fn begin(&self) -> Result<PgWriter, StoreError> {
        let tx = self.pool.begin().await.map_err(query_err)?;
        Ok(PgWriter { tx })
    }

    async fn get_block_by_hash(&self, block_hash: &[u8]) -> Result<Option<Block>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM blocks WHERE block_hash = $1 AND canonical = TRUE LIMIT 1",
        )
        .bind(block_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn list_blocks(&self, limit: u32, offset: u64) -> Result<Page<Block>, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE canonical = TRUE")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;

        let rows = sqlx::query(
            "SELECT * FROM blocks WHERE canonical = TRUE
             ORDER BY block_height DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(Page {
            rows: rows.iter().map(block_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
        })
    }

    async fn get_block_tx_ids(
        &self,
        index_block_hash: &[u8],
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows = sqlx::query(
            "SELECT tx_id FROM txs
             WHERE index_block_hash = $1 AND canonical = TRUE
             ORDER BY tx_index ASC",
        )
        .bind(index_block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        rows.iter().map(|r| try_get(r, "tx_id")).collect()
    }

    async fn get_tx_by_id(&self, tx_id: &[u8]) -> Result<Option<Tx>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM txs WHERE tx_id = $1 AND canonical = TRUE LIMIT 1"
        ))
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(tx_from_row).transpose()
    }

    async fn list_txs(
        &self,
        limit: u32,
        offset: u64,
        type_filter: Option<&[TxTypeId]>,
    ) -> Result<Page<Tx>, StoreError> {
        let type_ids: Vec<i16> = type_filter
            .unwrap_or(&[
                TxTypeId::TokenTransfer,
                TxTypeId::SmartContract,
                TxTypeId::ContractCall,
                TxTypeId::PoisonMicroblock,
                TxTypeId::Coinbase,
            ])
            .iter()
            .map(|t| *t as i16)
            .collect();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM txs WHERE canonical = TRUE AND type_id = ANY($1)",
        )
        .bind(&type_ids)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM txs
             WHERE canonical = TRUE AND type_id = ANY($1)
             ORDER BY block_height DESC, tx_index DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(&type_ids)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(Page {
            rows: rows.iter().map(tx_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
        })
    }

    async fn get_tx_events(
        &self,
        tx_id: &[u8],
        index_block_hash: &[u8],
    ) -> Result<Vec<TxEvent>, StoreError> {
        let mut events: Vec<TxEvent> = Vec::new();

        let rows = sqlx::query(
            "SELECT * FROM stx_events
             WHERE tx_id = $1 AND index_block_hash = $2 AND canonical = TRUE",
        )
        .bind(tx_id)
        .bind(index_block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        for row in &rows {
            events.push(TxEvent::Stx(StxEvent {
                event_index: try_get::<i32>(row, "event_index")? as u32,
                tx_id: try_get(row, "tx_id")?,
                tx_index: try_get::<i32>(row, "tx_index")? as u32,
                block_height: try_get::<i64>(row, "block_height")? as u64,
                index_block_hash: try_get(row, "index_block_hash")?,
                canonical: try_get(row, "canonical")?,
                event_type: asset_event_type(row)?,
                sender: try_get(row, "sender")?,
                recipient: try_get(row, "recipient")?,
                amount: try_get::<i64>(row, "amount")? as u64,
            }));
        }

        let rows = sqlx::query(
            "SELECT event_index, tx_id, index_block_hash, tx_index, block_height, canonical,
                    asset_event_type_id, asset_identifier, sender, recipient,
                    amount::text AS amount
             FROM ft_events
             WHERE tx_id = $1 AND index_block_hash = $2 AND canonical = TRUE",
        )
        .bind(tx_id)
        .bind(index_block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        for row in &rows {
            events.push(TxEvent::Ft(FtEvent {
                event_index: try_get::<i32>(row, "event_index")? as u32,
                tx_id: try_get(row, "tx_id")?,
                tx_index: try_get::<i32>(row, "tx_index")? as u32,
                block_height: try_get::<i64>(row, "block_height")? as u64,
                index_block_hash: try_get(row, "index_block_hash")?,
                canonical: try_get(row, "canonical")?,
                event_type: asset_event_type(row)?,
                asset_identifier: try_get(row, "asset_identifier")?,
                sender: try_get(row, "sender")?,
                recipient: try_get(row, "recipient")?,
                amount: parse_numeric_u128(&try_get::<String>(row, "amount")?)?,
            }));
        }

        let rows = sqlx::query(
            "SELECT * FROM nft_events
             WHERE tx_id = $1 AND index_block_hash = $2 AND canonical = TRUE",
        )
        .bind(tx_id)
        .bind(index_block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        for row in &rows {
            events.push(TxEvent::Nft(NftEvent {
                event_index: try_get::<i32>(row, "event_index")? as u32,
                tx_id: try_get(row, "tx_id")?,
                tx_index: try_get::<i32>(row, "tx_index")? as u32,
                block_height: try_get::<i64>(row, "block_height")? as u64,
                index_block_hash: try_get(row, "index_block_hash")?,
                canonical: try_get(row, "canonical")?,
                event_type: asset_event_type(row)?,
                asset_identifier: try_get(row, "asset_identifier")?,
                sender: try_get(row, "sender")?,
                recipient: try_get(row, "recipient")?,
                value: try_get(row, "value")?,
            }));
        }

        let rows = sqlx::query(
            "SELECT * FROM contract_logs
             WHERE tx_id = $1 AND index_block_hash = $2 AND canonical = TRUE",
        )
        .bind(tx_id)
        .bind(index_block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        for row in &rows {
            events.push(TxEvent::Log(SmartContractLog {
                event_index: try_get::<i32>(row, "event_index")? as u32,
                tx_id: try_get(row, "tx_id")?,
                tx_index: try_get::<i32>(row, "tx_index")? as u32,
                block_height: try_get::<i64>(row, "block_height")? as u64,
                index_block_hash: try_get(row, "index_block_hash")?,
                canonical: try_get(row, "canonical")?,
                contract_identifier: try_get(row, "contract_identifier")?,
                topic: try_get(row, "topic")?,
                value: try_get(row, "value")?,
            }));
        }

        events.sort_by_key(TxEvent::event_index);
        Ok(events)
    }

    async fn get_stx_balance(&self, address: &str) -> Result<StxBalance, StoreError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN sender = $1 THEN amount ELSE 0 END), 0)::text
                    AS total_sent,
                COALESCE(SUM(CASE WHEN recipient = $1 THEN amount ELSE 0 END), 0)::text
                    AS total_received
             FROM stx_events
             WHERE canonical = TRUE AND (sender = $1 OR recipient = $1)",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;

        let total_sent = parse_numeric_u128(&try_get::<String>(&row, "total_sent")?)?;
        let total_received = parse_numeric_u128(&try_get::<String>(&row, "total_received")?)?;
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
        let rows = sqlx::query(
            "SELECT asset_identifier,
                COALESCE(SUM(CASE WHEN sender = $1 THEN amount ELSE 0 END), 0)::text
                    AS total_sent,
                COALESCE(SUM(CASE WHEN recipient = $1 THEN amount ELSE 0 END), 0)::text
                    AS total_received
             FROM ft_events
             WHERE canonical = TRUE AND (sender = $1 OR recipient = $1)
             GROUP BY asset_identifier",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut balances = BTreeMap::new();
        for row in &rows {
            let total_sent = parse_numeric_u128(&try_get::<String>(row, "total_sent")?)?;
            let total_received = parse_numeric_u128(&try_get::<String>(row, "total_received")?)?;
            balances.insert(
                try_get::<String>(row, "asset_identifier")?,
                FtBalance {
                    balance: total_received as i128 - total_sent as i128,
                    total_sent,
                    total_received,
                },
            );
        }
        Ok(balances)
    }

    async fn get_nft_counts(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, NftHoldings>, StoreError> {
        let rows = sqlx::query(
            "SELECT asset_identifier,
                COALESCE(SUM(CASE WHEN sender = $1 THEN 1 ELSE 0 END), 0)::bigint
                    AS total_sent,
                COALESCE(SUM(CASE WHEN recipient = $1 THEN 1 ELSE 0 END), 0)::bigint
                    AS total_received
             FROM nft_events
             WHERE canonical = TRUE AND (sender = $1 OR recipient = $1)
             GROUP BY asset_identifier",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut counts = BTreeMap::new();
        for row in &rows {
            let total_sent = try_get::<i64>(row, "total_sent")? as u64;
            let total_received = try_get::<i64>(row, "total_received")? as u64;
            counts.insert(
                try_get::<String>(row, "asset_identifier")?,
                NftHoldings {
                    count: total_received as i64 - total_sent as i64,
                    total_sent,
                    total_received,
                },
            );
        }
        Ok(counts)
    }

    async fn get_address_txs(
        &self,
        address: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Page<Tx>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS}, COUNT(*) OVER () AS total FROM txs
             WHERE canonical = TRUE
               AND (sender_address = $1 OR token_transfer_recipient_address = $1)
             ORDER BY block_height DESC, tx_index DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(address)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        // The window count vanishes with an empty page, so an
        // out-of-range offset falls back to a plain count.
        let total = match rows.first() {
            Some(row) => try_get::<i64>(row, "total")? as u64,
            None => {
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM txs
                     WHERE canonical = TRUE
                       AND (sender_address = $1 OR token_transfer_recipient_address = $1)",
                )
                .bind(address)
                .fetch_one(&self.pool)
                .await
                .map_err(query_err)?;
                count as u64
            }
        };

        Ok(Page {
            rows: rows.iter().map(tx_from_row).collect::<Result<_, _>>()?,
            total,
        })
    }
}

// ─── PgWriter ────────────────────────────────────────────────────────────────

/// One ingestion transaction over a pooled connection.
pub struct PgWriter {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreWriter for PgWriter {
    async fn chain_tip(&mut self) -> Result<Option<ChainTip>, StoreError> {
        let row = sqlx::query(
            "SELECT block_height, block_hash, index_block_hash FROM blocks
             WHERE canonical = TRUE ORDER BY block_height DESC LIMIT 1",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(query_err)?;

        row.map(|row| {
            Ok(ChainTip {
                block_height: try_get::<i64>(&row, "block_height")? as u64,
                block_hash: try_get(&row, "block_hash")?,
                index_block_hash: try_get(&row, "index_block_hash")?,
            })
        })
        .transpose()
    }

    async fn blocks_at(
        &mut self,
        block_height: u64,
        index_block_hash: &[u8],
    ) -> Result<Vec<Block>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM blocks WHERE block_height = $1 AND index_block_hash = $2",
        )
        .bind(block_height as i64)
        .bind(index_block_hash)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn insert_block(&mut self, block: &Block) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO blocks
                (index_block_hash, block_hash, parent_index_block_hash, parent_block_hash,
                 parent_microblock, block_height, burn_block_time, canonical)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (index_block_hash) DO NOTHING",
        )
        .bind(&block.index_block_hash)
        .bind(&block.block_hash)
        .bind(&block.parent_index_block_hash)
        .bind(&block.parent_block_hash)
        .bind(&block.parent_microblock)
        .bind(block.block_height as i64)
        .bind(block.burn_block_time as i64)
        .bind(block.canonical)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_tx(&mut self, tx: &Tx) -> Result<u64, StoreError> {
        let mut tt_recipient = None;
        let mut tt_amount = None;
        let mut tt_memo = None;
        let mut sc_contract_id = None;
        let mut sc_source = None;
        let mut cc_contract_id = None;
        let mut cc_function = None;
        let mut cc_args = None;
        let mut poison_1 = None;
        let mut poison_2 = None;
        let mut coinbase = None;

        match &tx.payload {
            TxPayload::TokenTransfer {
                recipient,
                amount,
                memo,
            } => {
                tt_recipient = Some(recipient.as_str());
                tt_amount = Some(*amount as i64);
                tt_memo = Some(memo.as_slice());
            }
            TxPayload::SmartContract {
                contract_id,
                source_code,
            } => {
                sc_contract_id = Some(contract_id.as_str());
                sc_source = Some(source_code.as_str());
            }
            TxPayload::ContractCall {
                contract_id,
                function_name,
                function_args,
            } => {
                cc_contract_id = Some(contract_id.as_str());
                cc_function = Some(function_name.as_str());
                cc_args = Some(function_args.as_slice());
            }
            TxPayload::PoisonMicroblock { header_1, header_2 } => {
                poison_1 = Some(header_1.as_slice());
                poison_2 = Some(header_2.as_slice());
            }
            TxPayload::Coinbase { payload } => {
                coinbase = Some(payload.as_slice());
            }
        }

        let result = sqlx::query(
            "INSERT INTO txs
                (tx_id, index_block_hash, tx_index, block_hash, block_height,
                 burn_block_time, type_id, status, canonical, post_conditions, fee_rate,
                 sender_address, sponsored, origin_hash_mode,
                 token_transfer_recipient_address, token_transfer_amount, token_transfer_memo,
                 smart_contract_contract_id, smart_contract_source_code,
                 contract_call_contract_id, contract_call_function_name,
                 contract_call_function_args, poison_microblock_header_1,
                 poison_microblock_header_2, coinbase_payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
             ON CONFLICT (tx_id, index_block_hash) DO NOTHING",
        )
        .bind(&tx.tx_id)
        .bind(&tx.index_block_hash)
        .bind(tx.tx_index as i32)
        .bind(&tx.block_hash)
        .bind(tx.block_height as i64)
        .bind(tx.burn_block_time as i64)
        .bind(tx.type_id() as i16)
        .bind(tx.status as i16)
        .bind(tx.canonical)
        .bind(&tx.post_conditions)
        .bind(tx.fee_rate as i64)
        .bind(&tx.sender_address)
        .bind(tx.sponsored)
        .bind(tx.origin_hash_mode as i16)
        .bind(tt_recipient)
        .bind(tt_amount)
        .bind(tt_memo)
        .bind(sc_contract_id)
        .bind(sc_source)
        .bind(cc_contract_id)
        .bind(cc_function)
        .bind(cc_args)
        .bind(poison_1)
        .bind(poison_2)
        .bind(coinbase)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_stx_event(&mut self, event: &StxEvent) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO stx_events
                (event_index, tx_id, index_block_hash, tx_index, block_height, canonical,
                 asset_event_type_id, sender, recipient, amount)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (event_index, tx_id, index_block_hash) DO NOTHING",
        )
        .bind(event.event_index as i32)
        .bind(&event.tx_id)
        .bind(&event.index_block_hash)
        .bind(event.tx_index as i32)
        .bind(event.block_height as i64)
        .bind(event.canonical)
        .bind(event.event_type as i16)
        .bind(&event.sender)
        .bind(&event.recipient)
        .bind(event.amount as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_ft_event(&mut self, event: &FtEvent) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO ft_events
                (event_index, tx_id, index_block_hash, tx_index, block_height, canonical,
                 asset_event_type_id, asset_identifier, sender, recipient, amount)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::numeric)
             ON CONFLICT (event_index, tx_id, index_block_hash) DO NOTHING",
        )
        .bind(event.event_index as i32)
        .bind(&event.tx_id)
        .bind(&event.index_block_hash)
        .bind(event.tx_index as i32)
        .bind(event.block_height as i64)
        .bind(event.canonical)
        .bind(event.event_type as i16)
        .bind(&event.asset_identifier)
        .bind(&event.sender)
        .bind(&event.recipient)
        .bind(event.amount.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_nft_event(&mut self, event: &NftEvent) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO nft_events
                (event_index, tx_id, index_block_hash, tx_index, block_height, canonical,
                 asset_event_type_id, asset_identifier, sender, recipient, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (event_index, tx_id, index_block_hash) DO NOTHING",
        )
        .bind(event.event_index as i32)
        .bind(&event.tx_id)
        .bind(&event.index_block_hash)
        .bind(event.tx_index as i32)
        .bind(event.block_height as i64)
        .bind(event.canonical)
        .bind(event.event_type as i16)
        .bind(&event.asset_identifier)
        .bind(&event.sender)
        .bind(&event.recipient)
        .bind(&event.value)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_contract_log(&mut self, log: &SmartContractLog) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO contract_logs
                (event_index, tx_id, index_block_hash, tx_index, block_height, canonical,
                 contract_identifier, topic, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (event_index, tx_id, index_block_hash) DO NOTHING",
        )
        .bind(log.event_index as i32)
        .bind(&log.tx_id)
        .bind(&log.index_block_hash)
        .bind(log.tx_index as i32)
        .bind(log.block_height as i64)
        .bind(log.canonical)
        .bind(&log.contract_identifier)
        .bind(&log.topic)
        .bind(&log.value)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_smart_contract(
        &mut self,
        contract: &SmartContract,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO smart_contracts
                (tx_id, index_block_hash, contract_id, block_height, source_code, abi,
                 canonical)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (tx_id, index_block_hash, contract_id) DO NOTHING",
        )
        .bind(&contract.tx_id)
        .bind(&contract.index_block_hash)
        .bind(&contract.contract_id)
        .bind(contract.block_height as i64)
        .bind(&contract.source_code)
        .bind(&contract.abi)
        .bind(contract.canonical)
        .execute(&mut *self.tx)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn mark_entities_canonical(
        &mut self,
        index_block_hash: &[u8],
        canonical: bool,
    ) -> Result<UpdatedCounts, StoreError> {
        let mut counts = UpdatedCounts::default();
        for table in ENTITY_TABLES {
            let result = sqlx::query(&format!(
                "UPDATE {table} SET canonical = $2
                 WHERE index_block_hash = $1 AND canonical <> $2"
            ))
            .bind(index_block_hash)
            .bind(canonical)
            .execute(&mut *self.tx)
            .await
            .map_err(query_err)?;
            let affected = result.rows_affected();
            match *table {
                "txs" => counts.txs = affected,
                "stx_events" => counts.stx_events = affected,
                "ft_events" => counts.ft_events = affected,
                "nft_events" => counts.nft_events = affected,
                "contract_logs" => counts.contract_logs = affected,
                "smart_contracts" => counts.smart_contracts = affected,
                _ => {}
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
            let rows = sqlx::query("SELECT * FROM blocks WHERE index_block_hash = $1")
                .bind(&current)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(query_err)?;
            let block = match rows.len() {
                0 => {
                    return Err(StoreError::BlockNotFound {
                        index_block_hash: hex::encode(&current),
                    })
                }
                1 => block_from_row(&rows[0])?,
                found => {
                    return Err(StoreError::DuplicateRows {
                        index_block_hash: hex::encode(&current),
                        found,
                    })
                }
            };

            let restored = sqlx::query(
                "UPDATE blocks SET canonical = TRUE
                 WHERE index_block_hash = $1 AND canonical = FALSE",
            )
            .bind(&current)
            .execute(&mut *self.tx)
            .await
            .map_err(query_err)?;
            totals.blocks += restored.rows_affected();

            // Orphan whichever block currently holds this height.
            let siblings = sqlx::query(
                "SELECT index_block_hash FROM blocks
                 WHERE block_height = $1 AND canonical = TRUE AND index_block_hash <> $2",
            )
            .bind(block.block_height as i64)
            .bind(&current)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_err)?;
            for sibling in &siblings {
                let orphan: Vec<u8> = try_get(sibling, "index_block_hash")?;
                let flipped = sqlx::query(
                    "UPDATE blocks SET canonical = FALSE WHERE index_block_hash = $1",
                )
                .bind(&orphan)
                .execute(&mut *self.tx)
                .await
                .map_err(query_err)?;
                totals.blocks += flipped.rows_affected();
                let counts = self.mark_entities_canonical(&orphan, false).await?;
                debug!(
                    height = block.block_height,
                    orphan = %hex::encode(&orphan),
                    txs = counts.txs,
                    stx_events = counts.stx_events,
                    ft_events = counts.ft_events,
                    nft_events = counts.nft_events,
                    contract_logs = counts.contract_logs,
                    smart_contracts = counts.smart_contracts,
                    "Orphaned competing block"
                );
                totals.add(&counts);
            }

            let counts = self.mark_entities_canonical(&current, true).await?;
            totals.add(&counts);

            // Continue down the chain while the parent is also orphaned.
            let parent = sqlx::query(
                "SELECT * FROM blocks WHERE block_height = $1 AND index_block_hash = $2",
            )
            .bind(block.block_height as i64 - 1)
            .bind(&block.parent_index_block_hash)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_err)?;

            match parent {
                Some(row) => {
                    let parent = block_from_row(&row)?;
                    if parent.canonical {
                        break;
                    }
                    current = parent.index_block_hash;
                }
                None => break,
            }
        }

        Ok(totals)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(query_err)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(query_err)
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL environment variable to enable.
    // Example: DATABASE_URL=postgresql://localhost/stxindex_test cargo test

    use super::*;
    use stxindex_core::store::{IndexStore, StoreWriter};
    use stxindex_core::types::TxPayload;

    fn block(height: u64, seed: u8, parent_seed: u8) -> Block {
        Block {
            block_hash: vec![seed; 32],
            index_block_hash: vec![seed + 100; 32],
            parent_index_block_hash: vec![parent_seed + 100; 32],
            parent_block_hash: vec![parent_seed; 32],
            parent_microblock: vec![0; 32],
            block_height: height,
            burn_block_time: 1_700_000_000 + height,
            canonical: true,
        }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn insert_block_is_idempotent() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresStore::connect(&url).await.unwrap();

        let mut writer = store.begin().await.unwrap();
        let b = block(1, 1, 0);
        assert_eq!(writer.insert_block(&b).await.unwrap(), 1);
        assert_eq!(writer.insert_block(&b).await.unwrap(), 0);
        writer.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn tx_roundtrip_preserves_payload() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresStore::connect(&url).await.unwrap();

        let b = block(1, 1, 0);
        let tx = Tx {
            tx_id: vec![0x77; 32],
            tx_index: 0,
            index_block_hash: b.index_block_hash.clone(),
            block_hash: b.block_hash.clone(),
            block_height: 1,
            burn_block_time: b.burn_block_time,
            status: TxStatus::Success,
            canonical: true,
            post_conditions: vec![0, 0, 0, 0],
            fee_rate: 180,
            sender_address: "SP000000000000000000002Q6VF78".into(),
            sponsored: false,
            origin_hash_mode: 0,
            payload: TxPayload::TokenTransfer {
                recipient: "ST000000000000000000002AMW42H".into(),
                amount: 500,
                memo: vec![0; 34],
            },
        };

        let mut writer = store.begin().await.unwrap();
        writer.insert_block(&b).await.unwrap();
        writer.insert_tx(&tx).await.unwrap();
        writer.commit().await.unwrap();

        let read = store.get_tx_by_id(&tx.tx_id).await.unwrap().unwrap();
        assert_eq!(read.payload, tx.payload);
        assert_eq!(read.fee_rate, 180);
    }
}
