//! Persistence seam for reconciler-owned records.
//!
//! Writes are atomic per record; the reconciler upserts a record after every
//! transition and never relies on multi-record transactions.

use crate::chain::TxHash;
use crate::entities::order_records::{
    FindOrderByTxHash, ListPendingOrderRecords, UpsertOrderRecord,
};
use crate::entities::recharge_addresses::{ListRechargeAddresses, UpsertRechargeAddress};
use crate::entities::recharge_records::{
    FindRechargeByTxHash, ListPendingRechargeRecords, UpsertRechargeRecord,
};
use crate::entities::watch_cursor::{LoadWatchCursor, SaveWatchCursor};
use crate::entities::withdraw_records::{
    FindWithdrawByTxHash, ListPendingWithdrawRecords, UpsertWithdrawRecord,
};
use crate::entities::{
    OrderRecord, RechargeAddress, RechargeRecord, RechargeState, Record, RecordRef,
    RowDecodeError, WithdrawRecord, WithdrawState, OrderState,
};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] RowDecodeError),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records that can still change: every non-terminal record, and terminal
    /// ones settled at or above `retain_from_height` (still retractable).
    async fn load_pending_records(&self, retain_from_height: i64)
    -> Result<Vec<Record>, StoreError>;

    async fn upsert_record(&self, record: &Record) -> Result<(), StoreError>;

    /// The record that consumed transfer `tx`, if any.
    async fn find_claim(&self, tx: &TxHash) -> Result<Option<RecordRef>, StoreError>;

    async fn recharge_addresses(&self) -> Result<Vec<RechargeAddress>, StoreError>;

    async fn upsert_recharge_address(&self, binding: &RechargeAddress) -> Result<(), StoreError>;

    /// Highest transfer height applied so far, if any.
    async fn watch_cursor(&self) -> Result<Option<i64>, StoreError>;

    /// Raise the watch cursor; lower heights are ignored.
    async fn save_watch_cursor(&self, height: i64) -> Result<(), StoreError>;
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordRef, Record>>,
    addresses: Mutex<Vec<RechargeAddress>>,
    cursor: Mutex<Option<i64>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: RecordRef) -> Option<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn claims(record: &Record, tx: &TxHash) -> bool {
    match record {
        Record::Order(r) => r.tx_hash.as_ref() == Some(tx),
        Record::Recharge(r) => r.tx_hash.as_ref() == Some(tx),
        Record::Withdraw(r) => {
            r.state == WithdrawState::Done && r.withdraw_hash.as_ref() == Some(tx)
        }
    }
}

fn is_pending(record: &Record, retain_from_height: i64) -> bool {
    let retained = |done_height: Option<i64>| done_height.is_some_and(|h| h >= retain_from_height);
    match record {
        Record::Order(r) => r.state != OrderState::Done || retained(r.done_height),
        Record::Recharge(r) => r.state == RechargeState::Create || retained(r.done_height),
        Record::Withdraw(r) => r.state == WithdrawState::Create || retained(r.done_height),
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_pending_records(
        &self,
        retain_from_height: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .values()
            .filter(|r| is_pending(r, retain_from_height))
            .cloned()
            .collect())
    }

    async fn upsert_record(&self, record: &Record) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn find_claim(&self, tx: &TxHash) -> Result<Option<RecordRef>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().find(|r| claims(r, tx)).map(Record::key))
    }

    async fn recharge_addresses(&self) -> Result<Vec<RechargeAddress>, StoreError> {
        Ok(self
            .addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn upsert_recharge_address(&self, binding: &RechargeAddress) -> Result<(), StoreError> {
        let mut addresses = self.addresses.lock().unwrap_or_else(PoisonError::into_inner);
        addresses.retain(|a| a.address != binding.address);
        addresses.push(binding.clone());
        Ok(())
    }

    async fn watch_cursor(&self) -> Result<Option<i64>, StoreError> {
        Ok(*self.cursor.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn save_watch_cursor(&self, height: i64) -> Result<(), StoreError> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        *cursor = Some(cursor.map_or(height, |h| h.max(height)));
        Ok(())
    }
}

/// Postgres-backed store.
pub struct PgRecordStore {
    db: DatabaseProcessor,
}

impl PgRecordStore {
    pub fn new(db: DatabaseProcessor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_pending_records(
        &self,
        retain_from_height: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::new();
        for row in self
            .db
            .process(ListPendingOrderRecords { retain_from_height })
            .await?
        {
            records.push(Record::Order(OrderRecord::try_from(row)?));
        }
        for row in self
            .db
            .process(ListPendingRechargeRecords { retain_from_height })
            .await?
        {
            records.push(Record::Recharge(RechargeRecord::try_from(row)?));
        }
        for row in self
            .db
            .process(ListPendingWithdrawRecords { retain_from_height })
            .await?
        {
            records.push(Record::Withdraw(WithdrawRecord::try_from(row)?));
        }
        Ok(records)
    }

    async fn upsert_record(&self, record: &Record) -> Result<(), StoreError> {
        match record.clone() {
            Record::Order(record) => self.db.process(UpsertOrderRecord { record }).await?,
            Record::Recharge(record) => self.db.process(UpsertRechargeRecord { record }).await?,
            Record::Withdraw(record) => self.db.process(UpsertWithdrawRecord { record }).await?,
        }
        Ok(())
    }

    async fn find_claim(&self, tx: &TxHash) -> Result<Option<RecordRef>, StoreError> {
        let tx_hash = tx.clone();
        if let Some(id) = self
            .db
            .process(FindOrderByTxHash {
                tx_hash: tx_hash.clone(),
            })
            .await?
        {
            return Ok(Some(RecordRef::Order(id)));
        }
        if let Some(id) = self
            .db
            .process(FindRechargeByTxHash {
                tx_hash: tx_hash.clone(),
            })
            .await?
        {
            return Ok(Some(RecordRef::Recharge(id)));
        }
        Ok(self
            .db
            .process(FindWithdrawByTxHash { tx_hash })
            .await?
            .map(RecordRef::Withdraw))
    }

    async fn recharge_addresses(&self) -> Result<Vec<RechargeAddress>, StoreError> {
        let rows = self.db.process(ListRechargeAddresses).await?;
        Ok(rows
            .into_iter()
            .map(RechargeAddress::try_from)
            .collect::<Result<_, _>>()?)
    }

    async fn upsert_recharge_address(&self, binding: &RechargeAddress) -> Result<(), StoreError> {
        self.db
            .process(UpsertRechargeAddress {
                binding: binding.clone(),
            })
            .await?;
        Ok(())
    }

    async fn watch_cursor(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.db.process(LoadWatchCursor).await?)
    }

    async fn save_watch_cursor(&self, height: i64) -> Result<(), StoreError> {
        self.db.process(SaveWatchCursor { height }).await?;
        Ok(())
    }
}
