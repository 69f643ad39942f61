//! Hand-scripted [`LedgerClient`] for tests.

use super::{LedgerClient, LedgerError, Receipt, TransferFilter, TransferSubscription};
use crate::chain::{Address, TxHash, keccak256};
use crate::events::TransferEvent;
use async_trait::async_trait;
use primitive_types::U256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use vpspay_sdk::objects::TokenAmount;

type EventSender = mpsc::Sender<Result<TransferEvent, LedgerError>>;

/// One scripted answer to `subscribe_transfers`.
pub enum SubscribeStep {
    Fail(String),
    /// Open a stream that first yields these items and then stays open.
    Open(Vec<Result<TransferEvent, LedgerError>>),
}

#[derive(Default)]
pub struct ScriptedLedger {
    pub subscribe_script: Mutex<VecDeque<SubscribeStep>>,
    pub subscribe_calls: AtomicUsize,
    pub open_streams: Mutex<Vec<EventSender>>,
    pub logs: Mutex<Vec<TransferEvent>>,
    pub range_calls: Mutex<Vec<(i64, i64)>>,
    pub height: AtomicI64,
    pub balances: Mutex<HashMap<Address, TokenAmount>>,
    pub chain_id: AtomicU64,
    pub chain_id_calls: AtomicUsize,
    pub nonce: AtomicU64,
    pub submitted: Mutex<Vec<Vec<u8>>>,
    pub reject_submissions: Mutex<Option<String>>,
    pub receipts: Mutex<HashMap<TxHash, Receipt>>,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        let ledger = Self::default();
        ledger.chain_id.store(1337, Ordering::SeqCst);
        ledger
    }

    pub fn script(&self, steps: impl IntoIterator<Item = SubscribeStep>) {
        self.subscribe_script
            .lock()
            .unwrap()
            .extend(steps);
    }

    /// Number of streams that are still held open by a subscriber.
    pub fn live_streams(&self) -> usize {
        self.open_streams
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Push into the most recently opened stream.
    pub async fn push(&self, item: Result<TransferEvent, LedgerError>) {
        let tx = self.open_streams.lock().unwrap().last().cloned();
        if let Some(tx) = tx {
            let _ = tx.send(item).await;
        }
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn subscribe_transfers(
        &self,
        _filter: &TransferFilter,
    ) -> Result<TransferSubscription, LedgerError> {
        let n = self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.subscribe_script.lock().unwrap().pop_front();
        let items = match step {
            Some(SubscribeStep::Fail(reason)) => return Err(LedgerError::Connection(reason)),
            Some(SubscribeStep::Open(items)) => items,
            None => Vec::new(),
        };
        let (tx, rx) = mpsc::channel(64);
        for item in items {
            let _ = tx.try_send(item);
        }
        self.open_streams.lock().unwrap().push(tx);
        Ok(TransferSubscription::new(format!("sub-{n}"), rx, None, None))
    }

    async fn transfers_in_range(
        &self,
        _filter: &TransferFilter,
        from_height: i64,
        to_height: i64,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        self.range_calls.lock().unwrap().push((from_height, to_height));
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.observed_height >= from_height && e.observed_height <= to_height)
            .cloned()
            .collect())
    }

    async fn block_height(&self) -> Result<i64, LedgerError> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn balance_of(&self, owner: Address) -> Result<TokenAmount, LedgerError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.chain_id_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64, LedgerError> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn submit_signed_transaction(&self, raw: &[u8]) -> Result<TxHash, LedgerError> {
        if let Some(reason) = self.reject_submissions.lock().unwrap().clone() {
            return Err(LedgerError::Submission(reason));
        }
        self.submitted.lock().unwrap().push(raw.to_vec());
        self.nonce.fetch_add(1, Ordering::SeqCst);
        Ok(TxHash::from_digest(&keccak256(raw)))
    }

    async fn lookup_receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        self.receipts
            .lock()
            .unwrap()
            .get(tx)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("receipt of {tx}")))
    }
}
