use super::{RecordRef, RowDecodeError, TransitionError};
use crate::chain::{Address, TxHash};
use crate::framework::DatabaseProcessor;
use crate::provisioning::{InstanceSpec, ProvisionedInstance};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

/// Lifecycle of a VM purchase. Strictly forward-moving.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i16)]
pub enum OrderState {
    Created = 0,
    WaitingPayment = 1,
    BuyGoods = 2,
    Done = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub user_id: String,
    /// Payer, known once the payment is observed.
    pub from_addr: Option<Address>,
    /// Address the payment must be sent to.
    pub to_addr: Address,
    /// Expected payment amount.
    pub value: TokenAmount,
    pub state: OrderState,
    pub trade_price: Option<Decimal>,
    pub spec: InstanceSpec,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    /// Height of the paying transfer.
    pub done_height: Option<i64>,
    /// When provisioning completed.
    pub done_time: Option<OffsetDateTime>,
    pub vps_id: Option<String>,
    /// Transfer that paid for this order.
    pub tx_hash: Option<TxHash>,
    pub msg: String,
}

/// A purchase as it arrives from the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub order_id: Uuid,
    pub user_id: String,
    pub to_addr: Address,
    pub value: TokenAmount,
    pub spec: InstanceSpec,
}

impl OrderRecord {
    pub fn open(order: NewOrder, created_height: i64, created_time: OffsetDateTime) -> Self {
        Self {
            order_id: order.order_id,
            user_id: order.user_id,
            from_addr: None,
            to_addr: order.to_addr,
            value: order.value,
            state: OrderState::Created,
            trade_price: None,
            spec: order.spec,
            created_height,
            created_time,
            done_height: None,
            done_time: None,
            vps_id: None,
            tx_hash: None,
            msg: String::new(),
        }
    }

    fn key(&self) -> RecordRef {
        RecordRef::Order(self.order_id)
    }

    /// `Created → WaitingPayment`.
    pub fn await_payment(&mut self) -> Result<(), TransitionError> {
        if self.state != OrderState::Created {
            return Err(TransitionError::new(self.key(), "await payment", self.state));
        }
        self.state = OrderState::WaitingPayment;
        Ok(())
    }

    /// `WaitingPayment → BuyGoods`; records the paying transfer exactly once.
    pub fn mark_paid(
        &mut self,
        tx_hash: TxHash,
        from: Address,
        height: i64,
    ) -> Result<(), TransitionError> {
        if self.state != OrderState::WaitingPayment || self.tx_hash.is_some() {
            return Err(TransitionError::new(self.key(), "mark paid", self.state));
        }
        self.state = OrderState::BuyGoods;
        self.tx_hash = Some(tx_hash);
        self.from_addr = Some(from);
        self.done_height = Some(height);
        self.msg.clear();
        Ok(())
    }

    /// `BuyGoods → Done` after the instance is running.
    pub fn complete(
        &mut self,
        vps_id: String,
        trade_price: Decimal,
        now: OffsetDateTime,
    ) -> Result<(), TransitionError> {
        if self.state != OrderState::BuyGoods {
            return Err(TransitionError::new(self.key(), "complete", self.state));
        }
        self.state = OrderState::Done;
        self.vps_id = Some(vps_id);
        self.trade_price = Some(trade_price);
        self.done_time = Some(now);
        self.msg.clear();
        Ok(())
    }

    /// Provisioning failed; the order stays in `BuyGoods`. An instance the
    /// failed attempt already created is kept for the retry.
    pub fn record_provision_failure(
        &mut self,
        reason: &str,
        created: Option<&ProvisionedInstance>,
    ) {
        if let Some(instance) = created {
            self.vps_id = Some(instance.instance_id.clone());
            self.trade_price = Some(instance.trade_price);
        }
        self.msg = format!("provisioning failed: {reason}");
    }

    /// The instance an earlier provisioning attempt created, if any.
    pub fn created_instance(&self) -> Option<ProvisionedInstance> {
        self.vps_id.clone().map(|instance_id| ProvisionedInstance {
            instance_id,
            trade_price: self.trade_price.unwrap_or_default(),
        })
    }

    /// Undo `mark_paid` because the paying transfer was retracted.
    pub fn revert_payment(&mut self) -> Result<TxHash, TransitionError> {
        if self.state != OrderState::BuyGoods {
            return Err(TransitionError::new(self.key(), "revert payment", self.state));
        }
        let Some(tx_hash) = self.tx_hash.take() else {
            return Err(TransitionError::new(self.key(), "revert payment", self.state));
        };
        self.state = OrderState::WaitingPayment;
        self.from_addr = None;
        self.done_height = None;
        self.msg = format!("payment {tx_hash} retracted by chain reorganization");
        Ok(tx_hash)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRecordRow {
    pub order_id: Uuid,
    pub user_id: String,
    pub from_addr: Option<String>,
    pub to_addr: String,
    pub value: String,
    pub state: OrderState,
    pub trade_price: Option<Decimal>,
    pub spec: Json<InstanceSpec>,
    pub created_height: i64,
    pub created_time: OffsetDateTime,
    pub done_height: Option<i64>,
    pub done_time: Option<OffsetDateTime>,
    pub vps_id: Option<String>,
    pub tx_hash: Option<String>,
    pub msg: String,
}

impl TryFrom<OrderRecordRow> for OrderRecord {
    type Error = RowDecodeError;

    fn try_from(row: OrderRecordRow) -> Result<Self, Self::Error> {
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
            trade_price: row.trade_price,
            spec: row.spec.0,
            created_height: row.created_height,
            created_time: row.created_time,
            done_height: row.done_height,
            done_time: row.done_time,
            vps_id: row.vps_id,
            tx_hash: row.tx_hash.map(TxHash::new),
            msg: row.msg,
        })
    }
}

const ORDER_COLUMNS: &str = "order_id, user_id, from_addr, to_addr, value, state, trade_price, \
    spec, created_height, created_time, done_height, done_time, vps_id, tx_hash, msg";

#[derive(Debug, Clone)]
/// Orders that are not `Done`, plus `Done` orders whose payment is still
/// shallower than the retraction window.
pub struct ListPendingOrderRecords {
    pub retain_from_height: i64,
}

impl Processor<ListPendingOrderRecords> for DatabaseProcessor {
    type Output = Vec<OrderRecordRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListPendingOrderRecords")]
    async fn process(
        &self,
        query: ListPendingOrderRecords,
    ) -> Result<Vec<OrderRecordRow>, sqlx::Error> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM order_records \
             WHERE state <> $1 OR done_height >= $2 \
             ORDER BY created_height, created_time"
        );
        sqlx::query_as::<_, OrderRecordRow>(&sql)
            .bind(OrderState::Done)
            .bind(query.retain_from_height)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOrderRecord {
    pub record: OrderRecord,
}

impl Processor<UpsertOrderRecord> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertOrderRecord")]
    async fn process(&self, upsert: UpsertOrderRecord) -> Result<(), sqlx::Error> {
        let r = upsert.record;
        let sql = format!(
            "INSERT INTO order_records ({ORDER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (order_id) DO UPDATE SET \
                from_addr = EXCLUDED.from_addr, \
                state = EXCLUDED.state, \
                trade_price = EXCLUDED.trade_price, \
                done_height = EXCLUDED.done_height, \
                done_time = EXCLUDED.done_time, \
                vps_id = EXCLUDED.vps_id, \
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
            .bind(r.trade_price)
            .bind(Json(r.spec))
            .bind(r.created_height)
            .bind(r.created_time)
            .bind(r.done_height)
            .bind(r.done_time)
            .bind(r.vps_id)
            .bind(r.tx_hash.map(|h| h.as_str().to_string()))
            .bind(r.msg)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FindOrderByTxHash {
    pub tx_hash: TxHash,
}

impl Processor<FindOrderByTxHash> for DatabaseProcessor {
    type Output = Option<Uuid>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:FindOrderByTxHash")]
    async fn process(&self, query: FindOrderByTxHash) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT order_id FROM order_records WHERE tx_hash = $1")
            .bind(query.tx_hash.as_str())
            .fetch_optional(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> OrderRecord {
        OrderRecord::open(
            NewOrder {
                order_id: Uuid::nil(),
                user_id: "user-1".into(),
                to_addr: "0x00000000000000000000000000000000000000aa".parse().unwrap(),
                value: TokenAmount::from(100u64),
                spec: InstanceSpec::default(),
            },
            10,
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn test_happy_path_moves_forward_only() {
        let mut o = order();
        assert!(o.mark_paid(TxHash::new("tx1"), Address::ZERO, 11).is_err());
        o.await_payment().unwrap();
        assert!(o.await_payment().is_err());
        o.mark_paid(TxHash::new("tx1"), Address::ZERO, 11).unwrap();
        assert_eq!(o.state, OrderState::BuyGoods);
        assert_eq!(o.done_height, Some(11));
        assert!(o.mark_paid(TxHash::new("tx2"), Address::ZERO, 12).is_err());
        assert_eq!(o.tx_hash, Some(TxHash::new("tx1")));
        o.complete("i-1".into(), Decimal::new(1250, 2), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(o.state, OrderState::Done);
        assert!(o.revert_payment().is_err());
    }

    #[test]
    fn test_revert_clears_payment() {
        let mut o = order();
        o.await_payment().unwrap();
        o.mark_paid(TxHash::new("tx1"), Address::ZERO, 11).unwrap();
        let tx = o.revert_payment().unwrap();
        assert_eq!(tx, TxHash::new("tx1"));
        assert_eq!(o.state, OrderState::WaitingPayment);
        assert_eq!(o.tx_hash, None);
        assert_eq!(o.done_height, None);
    }

    #[test]
    fn test_failed_attempt_remembers_its_instance() {
        let mut o = order();
        o.await_payment().unwrap();
        o.mark_paid(TxHash::new("tx1"), Address::ZERO, 11).unwrap();
        o.record_provision_failure("quota exceeded", None);
        assert_eq!(o.created_instance(), None);

        let instance = ProvisionedInstance {
            instance_id: "i-1".into(),
            trade_price: Decimal::new(1250, 2),
        };
        o.record_provision_failure("start failed", Some(&instance));
        assert_eq!(o.state, OrderState::BuyGoods);
        assert_eq!(o.created_instance(), Some(instance));
        assert!(o.msg.contains("start failed"));
    }
}
