//! Payloads carried on the bus, one type per topic.

use crate::chain::{Address, TxHash};
use crate::entities::{NewOrder, NewWithdraw};
use crate::provisioning::{ProvisionFailure, ProvisionedInstance};
use uuid::Uuid;
use vpspay_sdk::objects::{TokenAmount, TransferNotice};

/// A token transfer observed on the ledger (`transfer-watch`).
///
/// `removed == true` is a retraction: the block carrying `id` was reorganized
/// away and the transfer must be treated as not having happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub id: TxHash,
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
    pub observed_height: i64,
    pub removed: bool,
}

impl TransferEvent {
    pub fn to_notice(&self) -> TransferNotice {
        TransferNotice {
            id: self.id.to_string(),
            from: self.from.to_hex(),
            to: self.to.to_hex(),
            value: self.value,
            observed_height: self.observed_height,
            removed: self.removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Mint,
    Transfer,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Mint => write!(f, "mint"),
            TransferKind::Transfer => write!(f, "transfer"),
        }
    }
}

/// Outbound mint/transfer asked for by another component (`transfer-request`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: Uuid,
    pub kind: TransferKind,
    pub to: Address,
    pub amount: TokenAmount,
}

/// Answer to a [`TransferRequest`] with the same `request_id` (`transfer-response`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub request_id: Uuid,
    pub tx_hash: Option<TxHash>,
    pub error: Option<String>,
}

/// Mutations of reconciler-owned records requested from outside (`record-command`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordCommand {
    CreateOrder(NewOrder),
    /// `Created → WaitingPayment`.
    AwaitPayment { order_id: Uuid },
    /// The user claims to have paid with `tx_hash`; look it up on the ledger.
    PaymentReported { order_id: Uuid, tx_hash: TxHash },
    BindRechargeAddress { address: Address, user_id: String },
    OpenRecharge {
        order_id: Uuid,
        user_id: String,
        to: Address,
    },
    RequestWithdraw(NewWithdraw),
    RetryProvisioning { order_id: Uuid },
    RetryPayout { order_id: Uuid },
}

/// Result of side work dispatched by the reconciler (`effect-outcome`).
///
/// `attempt` lets the reconciler drop results of attempts it has since
/// invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectOutcome {
    Provisioned {
        order_id: Uuid,
        attempt: u64,
        result: Result<ProvisionedInstance, ProvisionFailure>,
    },
    PayoutSubmitted {
        order_id: Uuid,
        attempt: u64,
        result: Result<TxHash, String>,
    },
}
