//! Client for the external ledger.
//!
//! [`LedgerClient`] is the seam every other component talks through. None of
//! its calls retry; retry policy lives in the callers (the chain watcher
//! resubscribes, the executor surfaces submission errors unchanged).

pub mod rpc;
#[cfg(test)]
pub(crate) mod testing;
pub mod wire;

pub use rpc::RpcLedgerClient;

use crate::chain::{Address, TxHash};
use crate::events::TransferEvent;
use async_trait::async_trait;
use primitive_types::U256;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vpspay_sdk::objects::TokenAmount;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot reach ledger: {0}")]
    Connection(String),

    #[error("transfer subscription failed: {0}")]
    Subscription(String),

    #[error("transaction rejected: {0}")]
    Submission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("cannot decode ledger response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LedgerError::Decode(e.to_string())
        } else {
            LedgerError::Connection(e.to_string())
        }
    }
}

/// What a transfer subscription should deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFilter {
    /// Token contract emitting `Transfer` events.
    pub contract: Address,
    /// Only transfers to these addresses; empty means every transfer.
    pub recipients: Vec<Address>,
}

/// Outcome of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx: TxHash,
    pub height: i64,
    /// `0` on success.
    pub exit_code: i64,
    pub gas_used: u64,
    /// Token transfers emitted by the transaction.
    pub transfers: Vec<TransferEvent>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live transfer stream.
///
/// The stream yields `Err` once and then ends when the underlying connection
/// dies. Release it with [`TransferSubscription::unsubscribe`] before asking
/// for a new one; dropping it aborts the background reader.
pub struct TransferSubscription {
    id: String,
    events: mpsc::Receiver<Result<TransferEvent, LedgerError>>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TransferSubscription {
    pub fn new(
        id: String,
        events: mpsc::Receiver<Result<TransferEvent, LedgerError>>,
        cancel: Option<oneshot::Sender<()>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            events,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next transfer; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<TransferEvent, LedgerError>> {
        self.events.recv().await
    }

    pub async fn unsubscribe(mut self) {
        const GRACE: Duration = Duration::from_secs(5);

        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.events.close();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(GRACE, &mut task).await.is_err() {
                warn!(subscription = %self.id, "Subscription reader did not stop, aborting");
                task.abort();
            }
        }
        debug!(subscription = %self.id, "Transfer subscription released");
    }
}

impl Drop for TransferSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn subscribe_transfers(
        &self,
        filter: &TransferFilter,
    ) -> Result<TransferSubscription, LedgerError>;

    /// Transfers matching `filter` included in `[from_height, to_height]`.
    async fn transfers_in_range(
        &self,
        filter: &TransferFilter,
        from_height: i64,
        to_height: i64,
    ) -> Result<Vec<TransferEvent>, LedgerError>;

    async fn block_height(&self) -> Result<i64, LedgerError>;

    /// Token balance of `owner` at the tracked contract.
    async fn balance_of(&self, owner: Address) -> Result<TokenAmount, LedgerError>;

    async fn chain_id(&self) -> Result<u64, LedgerError>;

    async fn pending_nonce(&self, account: Address) -> Result<u64, LedgerError>;

    async fn gas_price(&self) -> Result<U256, LedgerError>;

    /// Broadcast a signed transaction; returns its hash once the node
    /// accepted it (not once it is mined).
    async fn submit_signed_transaction(&self, raw: &[u8]) -> Result<TxHash, LedgerError>;

    async fn lookup_receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError>;
}
