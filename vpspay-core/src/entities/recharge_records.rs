use super::{Credit, RecordRef, RowDecodeError, TransitionError};
use crate::chain::{Address, TxHash};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

/// Deposit into a user's custodial address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i16)]
pub enum RechargeState {
    Create = 0,
    Done = 1,
    /// Credit arrived with nothing pending for it. Terminal.
    Refund = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechargeRecord {
    pub order_id: Uuid,
    pub user_id: String,
    pub from_addr: Option<Address>,
    pub to_addr: Address,
    /// Credited amount; zero until a deposit is matched.
    pub value: TokenAmount,
    pub state: RechargeState,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    pub done_height: Option<i64>,
    pub done_time: Option<OffsetDateTime>,
    pub tx_hash: Option<TxHash>,
    pub msg: String,
}

impl RechargeRecord {
    pub fn new(
        order_id: Uuid,
        user_id: String,
        to_addr: Address,
        created_height: i64,
        created_time: OffsetDateTime,
    ) -> Self {
        Self {
            order_id,
            user_id,
            from_addr: None,
            to_addr,
            value: TokenAmount::ZERO,
            state: RechargeState::Create,
            created_height,
            created_time,
            done_height: None,
            done_time: None,
            tx_hash: None,
            msg: String::new(),
        }
    }

    fn key(&self) -> RecordRef {
        RecordRef::Recharge(self.order_id)
    }

    fn settle(
        &mut self,
        action: &'static str,
        target: RechargeState,
        credit: Credit,
        now: OffsetDateTime,
    ) -> Result<(), TransitionError> {
        if self.state != RechargeState::Create || self.tx_hash.is_some() {
            return Err(TransitionError::new(self.key(), action, self.state));
        }
        self.state = target;
        self.tx_hash = Some(credit.tx_hash);
        self.from_addr = Some(credit.from);
        self.value = credit.value;
        self.done_height = Some(credit.height);
        self.done_time = Some(now);
        Ok(())
    }

    /// `Create → Done`.
    pub fn complete(&mut self, credit: Credit, now: OffsetDateTime) -> Result<(), TransitionError> {
        self.settle("complete", RechargeState::Done, credit, now)?;
        self.msg.clear();
        Ok(())
    }

    /// `Create → Refund`: the deposit is held for reversal by an operator.
    pub fn refund(&mut self, credit: Credit, now: OffsetDateTime) -> Result<(), TransitionError> {
        self.settle("refund", RechargeState::Refund, credit, now)?;
        self.msg = "no pending recharge within the matching window".to_string();
        Ok(())
    }

    /// `Done → Create` after the crediting transfer was retracted.
    pub fn revert(&mut self) -> Result<TxHash, TransitionError> {
        if self.state != RechargeState::Done {
            return Err(TransitionError::new(self.key(), "revert", self.state));
        }
        let Some(tx_hash) = self.tx_hash.take() else {
            return Err(TransitionError::new(self.key(), "revert", self.state));
        };
        self.state = RechargeState::Create;
        self.from_addr = None;
        self.value = TokenAmount::ZERO;
        self.done_height = None;
        self.done_time = None;
        self.msg = format!("deposit {tx_hash} retracted by chain reorganization");
        Ok(tx_hash)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RechargeRecordRow {
    pub order_id: Uuid,
    pub user_id: String,
    pub from_addr: Option<String>,
    pub to_addr: String,
    pub value: String,
    pub state: RechargeState,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    pub done_height: Option<i64>,
    pub done_time: Option<OffsetDateTime>,
    pub tx_hash: Option<String>,
    pub msg: String,
}

impl TryFrom<RechargeRecordRow> for RechargeRecord {
    type Error = RowDecodeError;

    fn try_from(row: RechargeRecordRow) -> Result<Self, Self::Error> {
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
            value: row
                .value
                .parse()
                .map_err(|e| RowDecodeError::new("value", e))?,
            state: row.state,
            created_height: row.created_height,
            created_time: row.created_time,
            done_height: row.done_height,
            done_time: row.done_time,
            tx_hash: row.tx_hash.map(TxHash::new),
            msg: row.msg,
        })
    }
}

const RECHARGE_COLUMNS: &str = "order_id, user_id, from_addr, to_addr, value, state, \
    created_height, created_time, done_height, done_time, tx_hash, msg";

#[derive(Debug, Clone)]
/// Open recharges, plus settled ones still inside the retraction window.
pub struct ListPendingRechargeRecords {
    pub retain_from_height: i64,
}

impl Processor<ListPendingRechargeRecords> for DatabaseProcessor {
    type Output = Vec<RechargeRecordRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListPendingRechargeRecords")]
    async fn process(
        &self,
        query: ListPendingRechargeRecords,
    ) -> Result<Vec<RechargeRecordRow>, sqlx::Error> {
        let sql = format!(
            "SELECT {RECHARGE_COLUMNS} FROM recharge_records \
             WHERE state = $1 OR done_height >= $2 \
             ORDER BY created_height, created_time"
        );
        sqlx::query_as::<_, RechargeRecordRow>(&sql)
            .bind(RechargeState::Create)
            .bind(query.retain_from_height)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRechargeRecord {
    pub record: RechargeRecord,
}

impl Processor<UpsertRechargeRecord> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertRechargeRecord")]
    async fn process(&self, upsert: UpsertRechargeRecord) -> Result<(), sqlx::Error> {
        let r = upsert.record;
        let sql = format!(
            "INSERT INTO recharge_records ({RECHARGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (order_id) DO UPDATE SET \
                from_addr = EXCLUDED.from_addr, \
                value = EXCLUDED.value, \
                state = EXCLUDED.state, \
                done_height = EXCLUDED.done_height, \
                done_time = EXCLUDED.done_time, \
                tx_hash = EXCLUDED.tx_hash, \
                msg = EXCLUDED.msg"
        );
        sqlx::query(&sql)
            .bind(r.order_id)
            .bind(r.user_id)
            .bind(r.from_addr.map(|a| a.to_hex()))
            .bind(r.to_addr.to_hex())
            .bind(r.value.to_string())
            .bind(r.state)
            .bind(r.created_height)
            .bind(r.created_time)
            .bind(r.done_height)
            .bind(r.done_time)
            .bind(r.tx_hash.map(|h| h.as_str().to_string()))
            .bind(r.msg)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FindRechargeByTxHash {
    pub tx_hash: TxHash,
}

impl Processor<FindRechargeByTxHash> for DatabaseProcessor {
    type Output = Option<Uuid>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:FindRechargeByTxHash")]
    async fn process(&self, query: FindRechargeByTxHash) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT order_id FROM recharge_records WHERE tx_hash = $1")
            .bind(query.tx_hash.as_str())
            .fetch_optional(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recharge() -> RechargeRecord {
        RechargeRecord::new(
            Uuid::nil(),
            "user-1".into(),
            Address::new([0xbb; 20]),
            5,
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    fn credit(tx: &str, value: u64, height: i64) -> Credit {
        Credit {
            tx_hash: TxHash::new(tx),
            from: Address::ZERO,
            value: TokenAmount::from(value),
            height,
        }
    }

    #[test]
    fn test_complete_then_revert() {
        let mut r = recharge();
        r.complete(credit("tx2", 7, 9), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(r.state, RechargeState::Done);
        assert_eq!(r.value, TokenAmount::from(7u64));

        assert_eq!(r.revert().unwrap(), TxHash::new("tx2"));
        assert_eq!(r.state, RechargeState::Create);
        assert_eq!(r.tx_hash, None);
        assert_eq!(r.done_height, None);
        assert!(r.revert().is_err());
    }

    #[test]
    fn test_refund_is_terminal() {
        let mut r = recharge();
        r.refund(credit("tx3", 1, 9), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(r.state, RechargeState::Refund);
        assert!(r.revert().is_err());
        assert!(
            r.complete(credit("tx4", 1, 10), OffsetDateTime::UNIX_EPOCH)
                .is_err()
        );
    }
}
