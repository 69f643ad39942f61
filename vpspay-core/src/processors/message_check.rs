//! Receipt lookup that feeds a transaction back into the transfer stream.

use crate::chain::TxHash;
use crate::events::EventBus;
use crate::ledger::{LedgerClient, LedgerError, Receipt};
use tracing::{info, warn};

/// Look up `tx` and, if it succeeded, republish its token transfers on
/// `transfer-watch` so they are reconciled like any observed transfer.
///
/// Used for payments a user reports but the subscription never delivered, and
/// to re-check submitted payouts after a restart.
pub async fn check_message(
    ledger: &dyn LedgerClient,
    bus: &EventBus,
    tx: &TxHash,
) -> Result<Receipt, LedgerError> {
    let receipt = ledger.lookup_receipt(tx).await?;
    if !receipt.succeeded() {
        warn!(%tx, exit_code = receipt.exit_code, "Transaction failed on chain, nothing to replay");
        return Ok(receipt);
    }
    for transfer in &receipt.transfers {
        let mut transfer = transfer.clone();
        transfer.removed = false;
        bus.publish(transfer);
    }
    info!(
        %tx,
        height = receipt.height,
        gas_used = receipt.gas_used,
        transfers = receipt.transfers.len(),
        "Transaction replayed from receipt"
    );
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Address;
    use crate::events::TransferEvent;
    use crate::ledger::testing::ScriptedLedger;
    use vpspay_sdk::objects::TokenAmount;

    fn receipt(tx: &str, exit_code: i64) -> Receipt {
        Receipt {
            tx: TxHash::new(tx),
            height: 12,
            exit_code,
            gas_used: 50_000,
            transfers: vec![TransferEvent {
                id: TxHash::new(tx),
                from: Address::new([0x11; 20]),
                to: Address::new([0xaa; 20]),
                value: TokenAmount::from(100u64),
                observed_height: 12,
                removed: false,
            }],
        }
    }

    #[tokio::test]
    async fn test_successful_receipt_is_republished() {
        let ledger = ScriptedLedger::new();
        ledger
            .receipts
            .lock()
            .unwrap()
            .insert(TxHash::new("tx1"), receipt("tx1", 0));
        let bus = EventBus::new();
        let mut watch = bus.subscribe::<TransferEvent>();

        check_message(&ledger, &bus, &TxHash::new("tx1")).await.unwrap();
        assert_eq!(watch.try_recv().unwrap().id, TxHash::new("tx1"));
    }

    #[tokio::test]
    async fn test_failed_or_missing_receipt_publishes_nothing() {
        let ledger = ScriptedLedger::new();
        ledger
            .receipts
            .lock()
            .unwrap()
            .insert(TxHash::new("tx1"), receipt("tx1", 1));
        let bus = EventBus::new();
        let mut watch = bus.subscribe::<TransferEvent>();

        let r = check_message(&ledger, &bus, &TxHash::new("tx1")).await.unwrap();
        assert!(!r.succeeded());
        assert!(matches!(
            check_message(&ledger, &bus, &TxHash::new("tx9")).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(watch.try_recv().is_none());
    }
}
