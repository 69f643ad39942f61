use super::bus::EventBus;
use super::types::{TransferKind, TransferRequest, TransferResponse};
use crate::chain::{Address, TxHash};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("no responder is subscribed to transfer requests")]
    NoResponder,
    #[error("no response for request {0} within the timeout")]
    Timeout(Uuid),
    #[error("event bus closed before request {0} was answered")]
    Closed(Uuid),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Synchronous-looking mint/transfer over the bus.
///
/// Publishes a [`TransferRequest`] and waits for the [`TransferResponse`]
/// carrying the same id. The hash returned is the submitted transaction, not
/// a confirmation.
pub struct TransferRequester {
    bus: EventBus,
    timeout: Duration,
}

impl TransferRequester {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub async fn mint(&self, to: Address, amount: TokenAmount) -> Result<TxHash, RequestError> {
        self.request(TransferKind::Mint, to, amount).await
    }

    pub async fn transfer(&self, to: Address, amount: TokenAmount) -> Result<TxHash, RequestError> {
        self.request(TransferKind::Transfer, to, amount).await
    }

    pub async fn request(
        &self,
        kind: TransferKind,
        to: Address,
        amount: TokenAmount,
    ) -> Result<TxHash, RequestError> {
        let request_id = Uuid::new_v4();
        // Subscribe before publishing so the response cannot be missed.
        let mut responses = self.bus.subscribe::<TransferResponse>();
        let delivered = self.bus.publish(TransferRequest {
            request_id,
            kind,
            to,
            amount,
        });
        if delivered == 0 {
            return Err(RequestError::NoResponder);
        }
        debug!(%request_id, %kind, %to, %amount, "Transfer request published");

        let wait = async {
            while let Some(response) = responses.recv().await {
                if response.request_id != request_id {
                    continue;
                }
                return match (response.tx_hash, response.error) {
                    (Some(tx_hash), _) => Ok(tx_hash),
                    (None, Some(error)) => Err(RequestError::Rejected(error)),
                    (None, None) => Err(RequestError::Rejected("empty response".to_string())),
                };
            }
            Err(RequestError::Closed(request_id))
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| RequestError::Timeout(request_id))?
    }
}
