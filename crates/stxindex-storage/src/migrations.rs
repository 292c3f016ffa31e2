//! Schema migrations.
//!
//! Each migration is a named up/down SQL pair applied in order and
//! recorded in `schema_migrations`. Down-migrations are destructive and
//! refuse to run when the environment is production.

use sqlx::{Executor, PgPool, Row};
use tracing::{info, warn};

use stxindex_core::error::StoreError;

/// Deployment environment, selected by `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn allows_down_migrations(self) -> bool {
        !matches!(self, Self::Production)
    }
}

/// A directional migration.
pub struct Migration {
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_blocks",
        up: "CREATE TABLE IF NOT EXISTS blocks (
                index_block_hash        BYTEA    PRIMARY KEY,
                block_hash              BYTEA    NOT NULL,
                parent_index_block_hash BYTEA    NOT NULL,
                parent_block_hash       BYTEA    NOT NULL,
                parent_microblock       BYTEA    NOT NULL,
                block_height            BIGINT   NOT NULL,
                burn_block_time         BIGINT   NOT NULL,
                canonical               BOOLEAN  NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_height
                ON blocks(block_height DESC);
            CREATE INDEX IF NOT EXISTS idx_blocks_block_hash
                ON blocks(block_hash);",
        down: "DROP TABLE IF EXISTS blocks;",
    },
    Migration {
        name: "002_txs",
        up: "CREATE TABLE IF NOT EXISTS txs (
                tx_id                             BYTEA    NOT NULL,
                index_block_hash                  BYTEA    NOT NULL,
                tx_index                          INTEGER  NOT NULL,
                block_hash                        BYTEA    NOT NULL,
                block_height                      BIGINT   NOT NULL,
                burn_block_time                   BIGINT   NOT NULL,
                type_id                           SMALLINT NOT NULL,
                status                            SMALLINT NOT NULL,
                canonical                         BOOLEAN  NOT NULL,
                post_conditions                   BYTEA    NOT NULL,
                fee_rate                          BIGINT   NOT NULL,
                sender_address                    TEXT     NOT NULL,
                sponsored                         BOOLEAN  NOT NULL,
                origin_hash_mode                  SMALLINT NOT NULL,
                token_transfer_recipient_address  TEXT,
                token_transfer_amount             BIGINT,
                token_transfer_memo               BYTEA,
                smart_contract_contract_id        TEXT,
                smart_contract_source_code        TEXT,
                contract_call_contract_id         TEXT,
                contract_call_function_name       TEXT,
                contract_call_function_args       BYTEA,
                poison_microblock_header_1        BYTEA,
                poison_microblock_header_2        BYTEA,
                coinbase_payload                  BYTEA,
                PRIMARY KEY (tx_id, index_block_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_txs_block
                ON txs(index_block_hash, tx_index);
            CREATE INDEX IF NOT EXISTS idx_txs_sender
                ON txs(sender_address, block_height DESC);
            CREATE INDEX IF NOT EXISTS idx_txs_recipient
                ON txs(token_transfer_recipient_address, block_height DESC);",
        down: "DROP TABLE IF EXISTS txs;",
    },
    Migration {
        name: "003_stx_events",
        up: "CREATE TABLE IF NOT EXISTS stx_events (
                event_index       INTEGER  NOT NULL,
                tx_id             BYTEA    NOT NULL,
                index_block_hash  BYTEA    NOT NULL,
                tx_index          INTEGER  NOT NULL,
                block_height      BIGINT   NOT NULL,
                canonical         BOOLEAN  NOT NULL,
                asset_event_type_id SMALLINT NOT NULL,
                sender            TEXT,
                recipient         TEXT,
                amount            BIGINT   NOT NULL,
                PRIMARY KEY (event_index, tx_id, index_block_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_stx_events_sender ON stx_events(sender);
            CREATE INDEX IF NOT EXISTS idx_stx_events_recipient ON stx_events(recipient);
            CREATE INDEX IF NOT EXISTS idx_stx_events_block ON stx_events(index_block_hash);",
        down: "DROP TABLE IF EXISTS stx_events;",
    },
    Migration {
        name: "004_ft_events",
        up: "CREATE TABLE IF NOT EXISTS ft_events (
                event_index       INTEGER  NOT NULL,
                tx_id             BYTEA    NOT NULL,
                index_block_hash  BYTEA    NOT NULL,
                tx_index          INTEGER  NOT NULL,
                block_height      BIGINT   NOT NULL,
                canonical         BOOLEAN  NOT NULL,
                asset_event_type_id SMALLINT NOT NULL,
                asset_identifier  TEXT     NOT NULL,
                sender            TEXT,
                recipient         TEXT,
                amount            NUMERIC(78, 0) NOT NULL,
                PRIMARY KEY (event_index, tx_id, index_block_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_ft_events_sender ON ft_events(sender);
            CREATE INDEX IF NOT EXISTS idx_ft_events_recipient ON ft_events(recipient);
            CREATE INDEX IF NOT EXISTS idx_ft_events_block ON ft_events(index_block_hash);",
        down: "DROP TABLE IF EXISTS ft_events;",
    },
    Migration {
        name: "005_nft_events",
        up: "CREATE TABLE IF NOT EXISTS nft_events (
                event_index       INTEGER  NOT NULL,
                tx_id             BYTEA    NOT NULL,
                index_block_hash  BYTEA    NOT NULL,
                tx_index          INTEGER  NOT NULL,
                block_height      BIGINT   NOT NULL,
                canonical         BOOLEAN  NOT NULL,
                asset_event_type_id SMALLINT NOT NULL,
                asset_identifier  TEXT     NOT NULL,
                sender            TEXT,
                recipient         TEXT,
                value             BYTEA    NOT NULL,
                PRIMARY KEY (event_index, tx_id, index_block_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_nft_events_sender ON nft_events(sender);
            CREATE INDEX IF NOT EXISTS idx_nft_events_recipient ON nft_events(recipient);
            CREATE INDEX IF NOT EXISTS idx_nft_events_block ON nft_events(index_block_hash);",
        down: "DROP TABLE IF EXISTS nft_events;",
    },
    Migration {
        name: "006_contract_logs",
        up: "CREATE TABLE IF NOT EXISTS contract_logs (
                event_index       INTEGER  NOT NULL,
                tx_id             BYTEA    NOT NULL,
                index_block_hash  BYTEA    NOT NULL,
                tx_index          INTEGER  NOT NULL,
                block_height      BIGINT   NOT NULL,
                canonical         BOOLEAN  NOT NULL,
                contract_identifier TEXT   NOT NULL,
                topic             TEXT     NOT NULL,
                value             BYTEA    NOT NULL,
                PRIMARY KEY (event_index, tx_id, index_block_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_contract_logs_contract
                ON contract_logs(contract_identifier);
            CREATE INDEX IF NOT EXISTS idx_contract_logs_block
                ON contract_logs(index_block_hash);",
        down: "DROP TABLE IF EXISTS contract_logs;",
    },
    Migration {
        name: "007_smart_contracts",
        up: "CREATE TABLE IF NOT EXISTS smart_contracts (
                tx_id             BYTEA    NOT NULL,
                index_block_hash  BYTEA    NOT NULL,
                contract_id       TEXT     NOT NULL,
                block_height      BIGINT   NOT NULL,
                source_code       TEXT     NOT NULL,
                abi               TEXT,
                canonical         BOOLEAN  NOT NULL,
                PRIMARY KEY (tx_id, index_block_hash, contract_id)
            );
            CREATE INDEX IF NOT EXISTS idx_smart_contracts_contract_id
                ON smart_contracts(contract_id);
            CREATE INDEX IF NOT EXISTS idx_smart_contracts_block
                ON smart_contracts(index_block_hash);",
        down: "DROP TABLE IF EXISTS smart_contracts;",
    },
    Migration {
        name: "008_faucet_requests",
        up: "CREATE TABLE IF NOT EXISTS faucet_requests (
                id          BIGSERIAL PRIMARY KEY,
                currency    SMALLINT  NOT NULL,
                address     TEXT      NOT NULL,
                ip          TEXT      NOT NULL,
                occurred_at BIGINT    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_faucet_requests_address
                ON faucet_requests(address, occurred_at DESC);",
        down: "DROP TABLE IF EXISTS faucet_requests;",
    },
];

async fn ensure_migrations_table(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name       TEXT   PRIMARY KEY,
            applied_at BIGINT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Query(e.to_string()))?;
    Ok(())
}

async fn applied_names(pool: &PgPool) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query("SELECT name FROM schema_migrations ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

/// Apply all pending up-migrations in order.
pub async fn migrate_up(pool: &PgPool) -> Result<usize, StoreError> {
    ensure_migrations_table(pool).await?;
    let applied = applied_names(pool).await?;

    let mut count = 0;
    for migration in MIGRATIONS {
        if applied.iter().any(|name| name == migration.name) {
            continue;
        }
        // Executed as a raw script: each migration may hold several
        // statements, which prepared queries do not allow.
        pool.execute(migration.up)
            .await
            .map_err(|e| StoreError::Migration {
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;
        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES ($1, $2)")
            .bind(migration.name)
            .bind(chrono::Utc::now().timestamp())
            .execute(pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        info!(name = migration.name, "Applied migration");
        count += 1;
    }
    Ok(count)
}

/// Revert all applied migrations, newest first. Refused in production.
pub async fn migrate_down(pool: &PgPool, env: Environment) -> Result<usize, StoreError> {
    if !env.allows_down_migrations() {
        return Err(StoreError::DownMigrationForbidden);
    }
    ensure_migrations_table(pool).await?;
    let applied = applied_names(pool).await?;

    let mut count = 0;
    for migration in MIGRATIONS.iter().rev() {
        if !applied.iter().any(|name| name == migration.name) {
            continue;
        }
        warn!(name = migration.name, "Reverting migration");
        pool.execute(migration.down)
            .await
            .map_err(|e| StoreError::Migration {
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;
        sqlx::query("DELETE FROM schema_migrations WHERE name = $1")
            .bind(migration.name)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_migrations_gated_by_environment() {
        assert!(!Environment::Production.allows_down_migrations());
        assert!(Environment::Development.allows_down_migrations());
        assert!(Environment::Test.allows_down_migrations());
    }

    #[test]
    fn migration_names_are_ordered_and_unique() {
        let names: Vec<_> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn every_migration_has_a_down() {
        for migration in MIGRATIONS {
            assert!(migration.down.contains("DROP"), "{}", migration.name);
        }
    }
}
