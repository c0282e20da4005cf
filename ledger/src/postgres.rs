//! Postgres-backed store over the `cuentas` and `transacciones` tables.
//!
//! Schema (created outside this crate):
//!
//! ```sql
//! CREATE TABLE cuentas (
//!     id_cuenta INTEGER PRIMARY KEY,
//!     dni TEXT NOT NULL,
//!     saldo NUMERIC(10,2) DEFAULT 0.0
//! );
//! CREATE TABLE transacciones (
//!     id_transaccion SERIAL PRIMARY KEY,
//!     id_cuenta INTEGER NOT NULL REFERENCES cuentas,
//!     tipo_transaccion VARCHAR(50) NOT NULL,
//!     monto NUMERIC(10,2) NOT NULL,
//!     fecha TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! );
//! ```
//!
//! `fecha` is stored as UTC without a zone.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, instrument};

use shardledger_common::{AccountId, LedgerError, Result, TxId};

use crate::journal::{EntryType, LedgerEntry};
use crate::operation::PlannedOp;
use crate::store::LedgerStore;

fn data_access(err: sqlx::Error) -> LedgerError {
    LedgerError::DataAccess(err.to_string())
}

/// Ledger store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(data_access)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn balance(&self, account: AccountId) -> Result<Option<Decimal>> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT saldo::NUMERIC FROM cuentas WHERE id_cuenta = $1",
        )
        .bind(account.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(data_access)
    }

    #[instrument(skip(self, ops), fields(ops = ops.len()))]
    async fn apply(&self, tx_id: &TxId, ops: &[PlannedOp]) -> Result<Vec<LedgerEntry>> {
        let mut tx = self.pool.begin().await.map_err(data_access)?;
        let now = Utc::now();
        let mut written = Vec::with_capacity(ops.len());

        for op in ops {
            let updated = sqlx::query(
                "UPDATE cuentas SET saldo = saldo + $1 WHERE id_cuenta = $2",
            )
            .bind(op.signed_amount())
            .bind(op.account.value())
            .execute(&mut *tx)
            .await
            .map_err(data_access)?;

            if updated.rows_affected() != 1 {
                // Dropping `tx` rolls back the rows already touched.
                return Err(LedgerError::AccountNotFound(op.account));
            }

            let entry = LedgerEntry::new(op.account, op.kind, op.amount, Some(tx_id.clone()), now);
            sqlx::query(
                "INSERT INTO transacciones (id_cuenta, tipo_transaccion, monto, fecha) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(entry.account.value())
            .bind(entry.entry_type.as_str())
            .bind(entry.amount)
            .bind(entry.created_at.naive_utc())
            .execute(&mut *tx)
            .await
            .map_err(data_access)?;

            written.push(entry);
        }

        tx.commit().await.map_err(data_access)?;
        debug!(tx_id = %tx_id, entries = written.len(), "Committed to postgres");
        Ok(written)
    }

    async fn total_balance(&self) -> Result<Decimal> {
        let sum = sqlx::query_scalar::<_, Option<Decimal>>(
            "SELECT SUM(saldo)::NUMERIC FROM cuentas",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(data_access)?;
        Ok(sum.unwrap_or(Decimal::ZERO))
    }

    async fn entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT id_cuenta::BIGINT AS id_cuenta, tipo_transaccion, monto::NUMERIC AS monto, fecha::TIMESTAMP AS fecha \
             FROM transacciones WHERE id_cuenta = $1 ORDER BY fecha, id_transaccion",
        )
        .bind(account.value())
        .fetch_all(&self.pool)
        .await
        .map_err(data_access)?;

        rows.iter().map(journal_row).collect()
    }

    async fn history(&self, account: AccountId, limit: usize) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT id_cuenta::BIGINT AS id_cuenta, tipo_transaccion, monto::NUMERIC AS monto, fecha::TIMESTAMP AS fecha \
             FROM transacciones WHERE id_cuenta = $1 ORDER BY fecha DESC, id_transaccion DESC LIMIT $2",
        )
        .bind(account.value())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(data_access)?;

        rows.iter().map(journal_row).collect()
    }
}

fn journal_row(row: &PgRow) -> Result<LedgerEntry> {
    let kind: String = row.try_get("tipo_transaccion").map_err(data_access)?;
    let entry_type = kind.parse::<EntryType>().map_err(LedgerError::DataAccess)?;
    let id: i64 = row.try_get("id_cuenta").map_err(data_access)?;
    let amount: Decimal = row.try_get("monto").map_err(data_access)?;
    let fecha: NaiveDateTime = row.try_get("fecha").map_err(data_access)?;
    Ok(LedgerEntry {
        account: AccountId::new(id),
        entry_type,
        amount,
        tx_id: None,
        created_at: DateTime::from_naive_utc_and_offset(fecha, Utc),
    })
}
