use super::{Credit, RecordRef, RowDecodeError, TransitionError};
use crate::chain::{Address, TxHash};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i16)]
pub enum WithdrawState {
    Create = 0,
    Done = 1,
}

/// Payout from the service wallet to a user-chosen address.
///
/// `withdraw_hash` is the submitted payout transaction. It is not proof of
/// payment: the record only reaches `Done` once a transfer with that id is
/// observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRecord {
    pub order_id: Uuid,
    pub user_id: String,
    /// Sender of the observed payout.
    pub from_addr: Option<Address>,
    /// The user's custodial address being debited.
    pub to_addr: Address,
    pub withdraw_addr: Address,
    pub withdraw_hash: Option<TxHash>,
    pub value: TokenAmount,
    pub state: WithdrawState,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    pub done_height: Option<i64>,
    pub done_time: Option<OffsetDateTime>,
    /// Identity that authorized the payout.
    pub executor: String,
    pub msg: String,
}

/// A payout request as it arrives from the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWithdraw {
    pub order_id: Uuid,
    pub user_id: String,
    pub to_addr: Address,
    pub withdraw_addr: Address,
    pub value: TokenAmount,
    pub executor: String,
}

impl WithdrawRecord {
    pub fn open(request: NewWithdraw, created_height: i64, created_time: OffsetDateTime) -> Self {
        Self {
            order_id: request.order_id,
            user_id: request.user_id,
            from_addr: None,
            to_addr: request.to_addr,
            withdraw_addr: request.withdraw_addr,
            withdraw_hash: None,
            value: request.value,
            state: WithdrawState::Create,
            created_height,
            created_time,
            done_height: None,
            done_time: None,
            executor: request.executor,
            msg: String::new(),
        }
    }

    fn key(&self) -> RecordRef {
        RecordRef::Withdraw(self.order_id)
    }

    /// Store the hash of the submitted payout. Set once.
    pub fn set_payout_hash(&mut self, tx_hash: TxHash) -> Result<(), TransitionError> {
        if self.state != WithdrawState::Create || self.withdraw_hash.is_some() {
            return Err(TransitionError::new(self.key(), "set payout hash", self.state));
        }
        self.withdraw_hash = Some(tx_hash);
        self.msg.clear();
        Ok(())
    }

    pub fn record_payout_failure(&mut self, reason: &str) {
        self.msg = format!("payout failed: {reason}");
    }

    /// `Create → Done` once the payout transaction is observed.
    pub fn complete(&mut self, credit: Credit, now: OffsetDateTime) -> Result<(), TransitionError> {
        if self.state != WithdrawState::Create
            || self.withdraw_hash.as_ref() != Some(&credit.tx_hash)
        {
            return Err(TransitionError::new(self.key(), "complete", self.state));
        }
        self.state = WithdrawState::Done;
        self.from_addr = Some(credit.from);
        self.done_height = Some(credit.height);
        self.done_time = Some(now);
        self.msg.clear();
        Ok(())
    }

    /// `Done → Create` after the payout was retracted. The payout hash is
    /// kept so that re-inclusion of the same transaction completes it again.
    pub fn revert(&mut self) -> Result<(), TransitionError> {
        if self.state != WithdrawState::Done {
            return Err(TransitionError::new(self.key(), "revert", self.state));
        }
        self.state = WithdrawState::Create;
        self.from_addr = None;
        self.done_height = None;
        self.done_time = None;
        self.msg = "payout retracted by chain reorganization".to_string();
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WithdrawRecordRow {
    pub order_id: Uuid,
    pub user_id: String,
    pub from_addr: Option<String>,
    pub to_addr: String,
    pub withdraw_addr: String,
    pub withdraw_hash: Option<String>,
    pub value: String,
    pub state: WithdrawState,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    pub done_height: Option<i64>,
    pub done_time: Option<OffsetDateTime>,
    pub executor: String,
    pub msg: String,
}

impl TryFrom<WithdrawRecordRow> for WithdrawRecord {
    type Error = RowDecodeError;

    fn try_from(row: WithdrawRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            order_id: row.order_id,
            user_id: row.user_id,
            from_addr: row
                .from_addr
                .map(|a| a.parse())
                .transpose()
                .map_err(|e| RowDecodeError::new("from_addr", e))?,
            to_addr: row
                .to_addr
                .parse()
                .map_err(|e| RowDecodeError::new("to_addr", e))?,
            withdraw_addr: row
                .withdraw_addr
                .parse()
                .map_err(|e| RowDecodeError::new("withdraw_addr", e))?,
            withdraw_hash: row.withdraw_hash.map(TxHash::new),
            value: row
                .value
                .parse()
                .map_err(|e| RowDecodeError::new("value", e))?,
            state: row.state,
            created_height: row.created_height,
            created_time: row.created_time,
            done_height: row.done_height,
            done_time: row.done_time,
            executor: row.executor,
            msg: row.msg,
        })
    }
}

const WITHDRAW_COLUMNS: &str = "order_id, user_id, from_addr, to_addr, withdraw_addr, \
    withdraw_hash, value, state, created_height, created_time, done_height, done_time, \
    executor, msg";

#[derive(Debug, Clone)]
pub struct ListPendingWithdrawRecords {
    pub retain_from_height: i64,
}

impl Processor<ListPendingWithdrawRecords> for DatabaseProcessor {
    type Output = Vec<WithdrawRecordRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListPendingWithdrawRecords")]
    async fn process(
        &self,
        query: ListPendingWithdrawRecords,
    ) -> Result<Vec<WithdrawRecordRow>, sqlx::Error> {
        let sql = format!(
            "SELECT {WITHDRAW_COLUMNS} FROM withdraw_records \
             WHERE state = $1 OR done_height >= $2 \
             ORDER BY created_height, created_time"
        );
        sqlx::query_as::<_, WithdrawRecordRow>(&sql)
            .bind(WithdrawState::Create)
            .bind(query.retain_from_height)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct UpsertWithdrawRecord {
    pub record: WithdrawRecord,
}

impl Processor<UpsertWithdrawRecord> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertWithdrawRecord")]
    async fn process(&self, upsert: UpsertWithdrawRecord) -> Result<(), sqlx::Error> {
        let r = upsert.record;
        let sql = format!(
            "INSERT INTO withdraw_records ({WITHDRAW_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (order_id) DO UPDATE SET \
                from_addr = EXCLUDED.from_addr, \
                withdraw_hash = EXCLUDED.withdraw_hash, \
                state = EXCLUDED.state, \
                done_height = EXCLUDED.done_height, \
                done_time = EXCLUDED.done_time, \
                msg = EXCLUDED.msg"
        );
        sqlx::query(&sql)
            .bind(r.order_id)
            .bind(r.user_id)
            .bind(r.from_addr.map(|a| a.to_hex()))
            .bind(r.to_addr.to_hex())
            .bind(r.withdraw_addr.to_hex())
            .bind(r.withdraw_hash.map(|h| h.as_str().to_string()))
            .bind(r.value.to_string())
            .bind(r.state)
            .bind(r.created_height)
            .bind(r.created_time)
            .bind(r.done_height)
            .bind(r.done_time)
            .bind(r.executor)
            .bind(r.msg)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FindWithdrawByTxHash {
    pub tx_hash: TxHash,
}

impl Processor<FindWithdrawByTxHash> for DatabaseProcessor {
    type Output = Option<Uuid>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:FindWithdrawByTxHash")]
    async fn process(&self, query: FindWithdrawByTxHash) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT order_id FROM withdraw_records WHERE withdraw_hash = $1 AND state = $2",
        )
        .bind(query.tx_hash.as_str())
        .bind(WithdrawState::Done)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn withdraw() -> WithdrawRecord {
        WithdrawRecord::open(
            NewWithdraw {
                order_id: Uuid::nil(),
                user_id: "user-1".into(),
                to_addr: Address::new([0xbb; 20]),
                withdraw_addr: Address::new([0xcc; 20]),
                value: TokenAmount::from(40u64),
                executor: "admin".into(),
            },
            3,
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    fn payout(tx: &str) -> Credit {
        Credit {
            tx_hash: TxHash::new(tx),
            from: Address::new([0x11; 20]),
            value: TokenAmount::from(40u64),
            height: 12,
        }
    }

    #[test]
    fn test_completion_requires_the_submitted_hash() {
        let mut w = withdraw();
        assert!(w.complete(payout("p1"), OffsetDateTime::UNIX_EPOCH).is_err());
        w.set_payout_hash(TxHash::new("p1")).unwrap();
        assert!(w.set_payout_hash(TxHash::new("p2")).is_err());
        assert!(w.complete(payout("other"), OffsetDateTime::UNIX_EPOCH).is_err());
        w.complete(payout("p1"), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(w.state, WithdrawState::Done);
        assert_eq!(w.done_height, Some(12));
    }

    #[test]
    fn test_revert_keeps_payout_hash() {
        let mut w = withdraw();
        w.set_payout_hash(TxHash::new("p1")).unwrap();
        w.complete(payout("p1"), OffsetDateTime::UNIX_EPOCH).unwrap();
        w.revert().unwrap();
        assert_eq!(w.state, WithdrawState::Create);
        assert_eq!(w.withdraw_hash, Some(TxHash::new("p1")));
        w.complete(payout("p1"), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(w.state, WithdrawState::Done);
    }
}
