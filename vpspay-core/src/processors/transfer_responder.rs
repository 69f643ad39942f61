//! Transfer responder processor.
//!
//! Answers every `transfer-request` with a `transfer-response` carrying the
//! same request id. Each request is executed on its own task so a slow
//! submission does not hold back the next one.

use crate::events::{EventBus, Subscription, TransferRequest, TransferResponse};
use crate::executor::OutboundExecutor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct TransferResponder {
    executor: Arc<dyn OutboundExecutor>,
    bus: EventBus,
    requests: Subscription<TransferRequest>,
    in_flight: JoinSet<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransferResponder {
    pub fn new(
        executor: Arc<dyn OutboundExecutor>,
        bus: EventBus,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let requests = bus.subscribe::<TransferRequest>();
        Self {
            executor,
            bus,
            requests,
            in_flight: JoinSet::new(),
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Transfer responder started");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Transfer responder received shutdown signal");
                        break;
                    }
                }

                Some(request) = self.requests.recv() => {
                    self.spawn_request(request);
                }

                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Transfer request task panicked");
                    }
                }

                else => {
                    info!("Event bus closed");
                    break;
                }
            }
        }

        // Submissions already sent to the ledger still get their response.
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Transfer request task panicked");
            }
        }
        info!("Transfer responder shutdown complete");
    }

    fn spawn_request(&mut self, request: TransferRequest) {
        let executor = self.executor.clone();
        let bus = self.bus.clone();
        self.in_flight.spawn(async move {
            let TransferRequest {
                request_id,
                kind,
                to,
                amount,
            } = request;
            let response = match executor.execute(kind, to, amount).await {
                Ok(tx_hash) => {
                    info!(%request_id, %kind, %to, %amount, %tx_hash, "Transfer submitted");
                    TransferResponse {
                        request_id,
                        tx_hash: Some(tx_hash),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(%request_id, %kind, %to, %amount, error = %e, "Transfer request failed");
                    TransferResponse {
                        request_id,
                        tx_hash: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            if bus.publish(response) == 0 {
                warn!(%request_id, "Nobody is waiting for the transfer response");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, TxHash};
    use crate::events::{RequestError, TransferRequester};
    use crate::executor::ExecutorError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use vpspay_sdk::objects::TokenAmount;

    #[derive(Default)]
    struct FakeExecutor {
        minted: Mutex<Vec<(Address, TokenAmount)>>,
    }

    #[async_trait]
    impl OutboundExecutor for FakeExecutor {
        async fn mint(&self, to: Address, amount: TokenAmount) -> Result<TxHash, ExecutorError> {
            if amount.is_zero() {
                return Err(ExecutorError::ZeroAmount);
            }
            self.minted.lock().unwrap().push((to, amount));
            Ok(TxHash::new("0xmint"))
        }

        async fn transfer(&self, _to: Address, _amount: TokenAmount) -> Result<TxHash, ExecutorError> {
            Err(ExecutorError::Submission("nonce too low".into()))
        }
    }

    fn start(executor: Arc<FakeExecutor>) -> (EventBus, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let bus = EventBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let responder = TransferResponder::new(executor, bus.clone(), shutdown_rx);
        let handle = tokio::spawn(responder.run());
        (bus, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_request_is_answered_with_tx_hash() {
        let executor = Arc::new(FakeExecutor::default());
        let (bus, shutdown_tx, handle) = start(executor.clone());
        let requester = TransferRequester::new(bus, Duration::from_secs(5));
        let to = Address::new([0x42; 20]);

        let tx = requester.mint(to, TokenAmount::from(7u64)).await.unwrap();
        assert_eq!(tx, TxHash::new("0xmint"));
        assert_eq!(*executor.minted.lock().unwrap(), vec![(to, TokenAmount::from(7u64))]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_executor_errors_come_back_as_rejections() {
        let (bus, shutdown_tx, handle) = start(Arc::new(FakeExecutor::default()));
        let requester = TransferRequester::new(bus, Duration::from_secs(5));
        let to = Address::new([0x42; 20]);

        let err = requester.transfer(to, TokenAmount::from(1u64)).await.unwrap_err();
        assert!(matches!(err, RequestError::Rejected(msg) if msg.contains("nonce too low")));

        let err = requester.mint(to, TokenAmount::ZERO).await.unwrap_err();
        assert!(matches!(err, RequestError::Rejected(_)));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
