//! Builds, signs and submits outbound token transactions.

use crate::chain::{Address, LegacyTransaction, LocalSigner, SignerError, TxHash, abi};
use crate::events::TransferKind;
use crate::ledger::{LedgerClient, LedgerError};
use async_trait::async_trait;
use primitive_types::U256;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use vpspay_sdk::objects::TokenAmount;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("refusing to send to the zero address")]
    InvalidAddress,

    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("submission rejected: {0}")]
    Submission(String),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for ExecutorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Submission(reason) => ExecutorError::Submission(reason),
            other => ExecutorError::Ledger(other),
        }
    }
}

/// Outbound mint/transfer.
///
/// The returned hash identifies the submitted transaction only; whether it
/// took effect is known once the corresponding transfer is observed.
#[async_trait]
pub trait OutboundExecutor: Send + Sync {
    async fn mint(&self, to: Address, amount: TokenAmount) -> Result<TxHash, ExecutorError>;

    async fn transfer(&self, to: Address, amount: TokenAmount) -> Result<TxHash, ExecutorError>;

    async fn execute(
        &self,
        kind: TransferKind,
        to: Address,
        amount: TokenAmount,
    ) -> Result<TxHash, ExecutorError> {
        match kind {
            TransferKind::Mint => self.mint(to, amount).await,
            TransferKind::Transfer => self.transfer(to, amount).await,
        }
    }
}

/// Executor calling the token contract with the process-held key.
pub struct TokenExecutor {
    ledger: Arc<dyn LedgerClient>,
    signer: LocalSigner,
    contract: Address,
    gas_limit: u64,
    /// Serializes nonce allocation between concurrent submissions.
    nonce_lock: Mutex<()>,
}

impl TokenExecutor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signer: LocalSigner,
        contract: Address,
        gas_limit: u64,
    ) -> Self {
        Self {
            ledger,
            signer,
            contract,
            gas_limit,
            nonce_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn submit_call(
        &self,
        kind: TransferKind,
        to: Address,
        amount: TokenAmount,
    ) -> Result<TxHash, ExecutorError> {
        if amount.is_zero() {
            return Err(ExecutorError::ZeroAmount);
        }
        if to == Address::ZERO {
            return Err(ExecutorError::InvalidAddress);
        }
        let data = match kind {
            TransferKind::Mint => abi::encode_mint(&to, &amount),
            TransferKind::Transfer => abi::encode_transfer(&to, &amount),
        };

        let _guard = self.nonce_lock.lock().await;
        let chain_id = self.ledger.chain_id().await?;
        let nonce = self.ledger.pending_nonce(self.signer.address()).await?;
        let gas_price = self.ledger.gas_price().await?;
        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            to: self.contract,
            value: U256::zero(),
            data,
        };
        let signed = self.signer.sign_transaction(&tx, chain_id)?;
        let tx_hash = self.ledger.submit_signed_transaction(&signed.raw).await?;
        if tx_hash != signed.hash {
            tracing::warn!(local = %signed.hash, node = %tx_hash, "Node reported a different transaction hash");
        }
        info!(%kind, %to, %amount, nonce, chain_id, %tx_hash, "Outbound transaction submitted");
        Ok(tx_hash)
    }
}

#[async_trait]
impl OutboundExecutor for TokenExecutor {
    #[instrument(skip(self), err)]
    async fn mint(&self, to: Address, amount: TokenAmount) -> Result<TxHash, ExecutorError> {
        self.submit_call(TransferKind::Mint, to, amount).await
    }

    #[instrument(skip(self), err)]
    async fn transfer(&self, to: Address, amount: TokenAmount) -> Result<TxHash, ExecutorError> {
        self.submit_call(TransferKind::Transfer, to, amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::keccak256;
    use crate::ledger::testing::ScriptedLedger;
    use std::sync::atomic::Ordering;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn executor(ledger: Arc<ScriptedLedger>) -> TokenExecutor {
        TokenExecutor::new(
            ledger,
            LocalSigner::from_hex(KEY).unwrap(),
            Address::new([0xcc; 20]),
            100_000,
        )
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected_before_building() {
        let ledger = Arc::new(ScriptedLedger::new());
        let executor = executor(ledger.clone());

        let err = executor
            .mint(Address::new([1; 20]), "0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ZeroAmount));
        let err = executor
            .transfer(Address::new([1; 20]), TokenAmount::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ZeroAmount));

        assert!(ledger.submitted.lock().unwrap().is_empty());
        assert_eq!(ledger.chain_id_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submits_signed_call_with_ledger_chain_id() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.chain_id.store(97, Ordering::SeqCst);
        let executor = executor(ledger.clone());

        let first = executor
            .transfer(Address::new([1; 20]), TokenAmount::from(10u64))
            .await
            .unwrap();
        let second = executor
            .mint(Address::new([1; 20]), TokenAmount::from(10u64))
            .await
            .unwrap();

        let submitted = ledger.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 2);
        assert_eq!(first, TxHash::from_digest(&keccak256(&submitted[0])));
        assert_ne!(first, second);
        assert_eq!(ledger.chain_id_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.nonce.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submission_rejection_is_surfaced() {
        let ledger = Arc::new(ScriptedLedger::new());
        *ledger.reject_submissions.lock().unwrap() = Some("insufficient funds".into());
        let executor = executor(ledger.clone());

        let err = executor
            .transfer(Address::new([1; 20]), TokenAmount::from(1u64))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Submission(ref r) if r == "insufficient funds"));
    }
}
