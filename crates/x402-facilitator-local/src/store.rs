//! Idempotency stores: at most one settlement attempt per `paymentId`.
//!
//! A payment is *claimed* with an atomic insert-if-absent before anything touches
//! the rail. A failed settlement keeps its `paymentId` consumed, so a retry needs a
//! new payment. Only a claim whose settlement was rejected before anything was
//! signed is released.
//!
//! The stores are synchronous. The settlement engine calls them from
//! [`tokio::task::spawn_blocking`].

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use x402_types::proto::{SettleReceipt, SettlementMode};
use x402_types::timestamp::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Claimed, settlement in flight.
    Pending,
    Settled,
    Failed,
}

impl SettlementStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SettlementStatus::Pending),
            "settled" => Some(SettlementStatus::Settled),
            "failed" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub payment_id: String,
    pub status: SettlementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SettlementMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: UnixTimestamp,
}

impl SettlementRecord {
    fn pending(payment_id: &str, now: UnixTimestamp) -> Self {
        Self {
            payment_id: payment_id.to_string(),
            status: SettlementStatus::Pending,
            mode: None,
            tx_signature: None,
            slot: None,
            error: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Settlement store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt settlement record for {0}")]
    Corrupt(String),
    #[error("Settlement store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable record of settlement attempts.
///
/// Implementations must be thread-safe and make [`SettlementStore::claim`] atomic.
pub trait SettlementStore: Send + Sync {
    /// Records `payment_id` as pending if it was never seen.
    /// Returns `false` when it was already claimed.
    fn claim(&self, payment_id: &str, now: UnixTimestamp) -> Result<bool, StoreError>;

    fn complete(&self, receipt: &SettleReceipt, now: UnixTimestamp) -> Result<(), StoreError>;

    fn fail(&self, payment_id: &str, error: &str, now: UnixTimestamp) -> Result<(), StoreError>;

    /// Forgets a claim that is still pending. Settled and failed records stay.
    fn release(&self, payment_id: &str) -> Result<(), StoreError>;

    fn get(&self, payment_id: &str) -> Result<Option<SettlementRecord>, StoreError>;
}

/// Process-local store. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySettlementStore {
    records: DashMap<String, SettlementRecord>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettlementStore for InMemorySettlementStore {
    fn claim(&self, payment_id: &str, now: UnixTimestamp) -> Result<bool, StoreError> {
        match self.records.entry(payment_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(SettlementRecord::pending(payment_id, now));
                Ok(true)
            }
        }
    }

    fn complete(&self, receipt: &SettleReceipt, now: UnixTimestamp) -> Result<(), StoreError> {
        if let Some(mut record) = self.records.get_mut(&receipt.payment_id) {
            record.status = SettlementStatus::Settled;
            record.mode = Some(receipt.mode);
            record.tx_signature = Some(receipt.tx_signature.clone());
            record.slot = Some(receipt.slot);
            record.updated_at = now;
        }
        Ok(())
    }

    fn fail(&self, payment_id: &str, error: &str, now: UnixTimestamp) -> Result<(), StoreError> {
        if let Some(mut record) = self.records.get_mut(payment_id) {
            record.status = SettlementStatus::Failed;
            record.error = Some(error.to_string());
            record.updated_at = now;
        }
        Ok(())
    }

    fn release(&self, payment_id: &str) -> Result<(), StoreError> {
        self.records
            .remove_if(payment_id, |_, record| record.status == SettlementStatus::Pending);
        Ok(())
    }

    fn get(&self, payment_id: &str) -> Result<Option<SettlementRecord>, StoreError> {
        Ok(self.records.get(payment_id).map(|r| r.clone()))
    }
}

/// Store backed by a SQLite file. Survives restarts; the primary key makes the
/// claim atomic across processes sharing the file.
pub struct SqliteSettlementStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteSettlementStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settlements (
                payment_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                mode TEXT,
                tx_signature TEXT,
                slot INTEGER,
                error TEXT,
                updated_at INTEGER NOT NULL
            );",
        )?;
        tracing::info!(path = %path.as_ref().display(), "Opened settlement store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::error!("settlement store mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl SettlementStore for SqliteSettlementStore {
    fn claim(&self, payment_id: &str, now: UnixTimestamp) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT INTO settlements (payment_id, status, updated_at) VALUES (?1, 'pending', ?2)
             ON CONFLICT(payment_id) DO NOTHING",
            rusqlite::params![payment_id, now.as_secs() as i64],
        )?;
        Ok(inserted == 1)
    }

    fn complete(&self, receipt: &SettleReceipt, now: UnixTimestamp) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE settlements SET status = 'settled', mode = ?2, tx_signature = ?3, slot = ?4, updated_at = ?5
             WHERE payment_id = ?1",
            rusqlite::params![
                receipt.payment_id,
                receipt.mode.to_string(),
                receipt.tx_signature,
                receipt.slot as i64,
                now.as_secs() as i64
            ],
        )?;
        Ok(())
    }

    fn fail(&self, payment_id: &str, error: &str, now: UnixTimestamp) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE settlements SET status = 'failed', error = ?2, updated_at = ?3 WHERE payment_id = ?1",
            rusqlite::params![payment_id, error, now.as_secs() as i64],
        )?;
        Ok(())
    }

    fn release(&self, payment_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM settlements WHERE payment_id = ?1 AND status = 'pending'",
            [payment_id],
        )?;
        Ok(())
    }

    fn get(&self, payment_id: &str) -> Result<Option<SettlementRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT status, mode, tx_signature, slot, error, updated_at FROM settlements WHERE payment_id = ?1",
                [payment_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((status, mode, tx_signature, slot, error, updated_at)) = row else {
            return Ok(None);
        };
        let corrupt = || StoreError::Corrupt(payment_id.to_string());
        let status = SettlementStatus::parse(&status).ok_or_else(corrupt)?;
        let mode = match mode.as_deref() {
            None => None,
            Some("demo") => Some(SettlementMode::Demo),
            Some("real") => Some(SettlementMode::Real),
            Some(_) => return Err(corrupt()),
        };
        Ok(Some(SettlementRecord {
            payment_id: payment_id.to_string(),
            status,
            mode,
            tx_signature,
            slot: slot.map(|s| s as u64),
            error,
            updated_at: UnixTimestamp::from_secs(updated_at.max(0) as u64),
        }))
    }
}

/// Which store backs idempotency.
///
/// ```json
/// { "type": "sqlite", "path": "settlements.db" }
/// { "type": "memory" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Sqlite { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: PathBuf::from("settlements.db"),
        }
    }
}

impl StoreConfig {
    pub fn open(&self) -> Result<Box<dyn SettlementStore>, StoreError> {
        match self {
            StoreConfig::Memory => {
                tracing::warn!("Using in-memory settlement store, idempotency is lost on restart");
                Ok(Box::new(InMemorySettlementStore::new()))
            }
            StoreConfig::Sqlite { path } => Ok(Box::new(SqliteSettlementStore::open(path)?)),
        }
    }
}

impl<T: SettlementStore + ?Sized> SettlementStore for Box<T> {
    fn claim(&self, payment_id: &str, now: UnixTimestamp) -> Result<bool, StoreError> {
        (**self).claim(payment_id, now)
    }

    fn complete(&self, receipt: &SettleReceipt, now: UnixTimestamp) -> Result<(), StoreError> {
        (**self).complete(receipt, now)
    }

    fn fail(&self, payment_id: &str, error: &str, now: UnixTimestamp) -> Result<(), StoreError> {
        (**self).fail(payment_id, error, now)
    }

    fn release(&self, payment_id: &str) -> Result<(), StoreError> {
        (**self).release(payment_id)
    }

    fn get(&self, payment_id: &str) -> Result<Option<SettlementRecord>, StoreError> {
        (**self).get(payment_id)
    }
}
