//! Reconciliation records and their lifecycle transitions.
//!
//! Each record type carries its own state machine. Transitions are methods
//! that check the current state and refuse to move backwards; the only
//! backward moves are the explicit `revert_*` compensations applied when a
//! funding transfer is retracted by a reorg.
//!
//! The Postgres query objects for each table live next to the record type and
//! are executed through [`DatabaseProcessor`](crate::framework::DatabaseProcessor).

pub mod order_records;
pub mod recharge_addresses;
pub mod recharge_records;
pub mod watch_cursor;
pub mod withdraw_records;

pub use order_records::{NewOrder, OrderRecord, OrderState};
pub use recharge_addresses::RechargeAddress;
pub use recharge_records::{RechargeRecord, RechargeState};
pub use withdraw_records::{NewWithdraw, WithdrawRecord, WithdrawState};

use crate::chain::{Address, TxHash};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

/// The observed transfer a record is being settled against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub tx_hash: TxHash,
    pub from: Address,
    pub value: TokenAmount,
    pub height: i64,
}

/// Any record owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Order(OrderRecord),
    Recharge(RechargeRecord),
    Withdraw(WithdrawRecord),
}

impl Record {
    pub fn key(&self) -> RecordRef {
        match self {
            Record::Order(r) => RecordRef::Order(r.order_id),
            Record::Recharge(r) => RecordRef::Recharge(r.order_id),
            Record::Withdraw(r) => RecordRef::Withdraw(r.order_id),
        }
    }
}

/// Identity of a record without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Order(Uuid),
    Recharge(Uuid),
    Withdraw(Uuid),
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Order(id) => write!(f, "order:{id}"),
            RecordRef::Recharge(id) => write!(f, "recharge:{id}"),
            RecordRef::Withdraw(id) => write!(f, "withdraw:{id}"),
        }
    }
}

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{record}: cannot {action} from state {state}")]
pub struct TransitionError {
    pub record: RecordRef,
    pub action: &'static str,
    pub state: String,
}

impl TransitionError {
    pub(crate) fn new(record: RecordRef, action: &'static str, state: impl fmt::Debug) -> Self {
        Self {
            record,
            action,
            state: format!("{state:?}"),
        }
    }
}

/// A stored row could not be turned back into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {column} in stored row: {reason}")]
pub struct RowDecodeError {
    pub column: &'static str,
    pub reason: String,
}

impl RowDecodeError {
    pub(crate) fn new(column: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            column,
            reason: reason.to_string(),
        }
    }
}
