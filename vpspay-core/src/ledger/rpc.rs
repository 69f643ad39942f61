//! [`LedgerClient`] over an Ethereum-compatible JSON-RPC node.
//!
//! Plain calls go over HTTP; the transfer stream is an `eth_subscribe("logs")`
//! WebSocket owned by a background reader task.

use super::wire::{
    RpcLog, RpcNotification, RpcReceipt, RpcRequest, RpcResponse, decode_hex, parse_quantity_i64,
    parse_quantity_u256, parse_quantity_u64, quantity, word_hex,
};
use super::{LedgerClient, LedgerError, Receipt, TransferFilter, TransferSubscription};
use crate::chain::{Address, TxHash, abi};
use crate::events::TransferEvent;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use primitive_types::U256;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use vpspay_sdk::objects::TokenAmount;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SUBSCRIPTION_BUFFER: usize = 256;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcLedgerClient {
    http_url: Url,
    ws_url: Url,
    contract: Address,
    http_client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    /// Connect and verify that the endpoint answers `eth_chainId`.
    pub async fn dial(http_url: Url, ws_url: Url, contract: Address) -> Result<Self, LedgerError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Connection(e.to_string()))?;
        let client = Self {
            http_url,
            ws_url,
            contract,
            http_client,
            next_id: AtomicU64::new(1),
        };
        let chain_id = client.chain_id().await?;
        info!(endpoint = %client.http_url, chain_id, contract = %contract, "Ledger connected");
        Ok(client)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http_client
            .post(self.http_url.clone())
            .json(&RpcRequest::new(id, method, params))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Connection(format!(
                "{method}: HTTP {status}: {body}"
            )));
        }
        let response: RpcResponse = response.json().await?;
        response.into_result()
    }

    async fn call_str(&self, method: &str, params: Value) -> Result<String, LedgerError> {
        match self.call(method, params).await? {
            Value::String(s) => Ok(s),
            other => Err(LedgerError::Decode(format!(
                "{method}: expected a string, got {other}"
            ))),
        }
    }

    fn log_filter(&self, filter: &TransferFilter) -> Value {
        let recipients: Vec<String> = filter
            .recipients
            .iter()
            .map(|a| word_hex(&a.to_word()))
            .collect();
        let to_topic = if recipients.is_empty() {
            Value::Null
        } else {
            json!(recipients)
        };
        json!({
            "address": filter.contract.to_hex(),
            "topics": [word_hex(&abi::transfer_event_topic()), Value::Null, to_topic],
        })
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn subscribe_transfers(
        &self,
        filter: &TransferFilter,
    ) -> Result<TransferSubscription, LedgerError> {
        let (mut ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(request_id, "eth_subscribe", json!(["logs", self.log_filter(filter)]));
        let text = serde_json::to_string(&request).map_err(|e| LedgerError::Decode(e.to_string()))?;
        ws.send(Message::Text(text))
            .await
            .map_err(|e| LedgerError::Subscription(e.to_string()))?;

        let subscription_id = await_subscription_id(&mut ws, request_id).await?;
        debug!(subscription = %subscription_id, "Transfer subscription opened");

        let (events_tx, events_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(read_subscription(
            ws,
            subscription_id.clone(),
            self.next_id.fetch_add(1, Ordering::Relaxed),
            events_tx,
            cancel_rx,
        ));
        Ok(TransferSubscription::new(
            subscription_id,
            events_rx,
            Some(cancel_tx),
            Some(task),
        ))
    }

    async fn transfers_in_range(
        &self,
        filter: &TransferFilter,
        from_height: i64,
        to_height: i64,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        let mut query = self.log_filter(filter);
        query["fromBlock"] = json!(quantity(from_height));
        query["toBlock"] = json!(quantity(to_height));
        let logs: Vec<RpcLog> = serde_json::from_value(self.call("eth_getLogs", json!([query])).await?)
            .map_err(|e| LedgerError::Decode(e.to_string()))?;
        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            match log.to_transfer_event() {
                Ok(transfer) => transfers.push(transfer),
                Err(e) => warn!(error = %e, "Skipping undecodable log"),
            }
        }
        Ok(transfers)
    }

    async fn block_height(&self) -> Result<i64, LedgerError> {
        parse_quantity_i64(&self.call_str("eth_blockNumber", json!([])).await?)
    }

    async fn balance_of(&self, owner: Address) -> Result<TokenAmount, LedgerError> {
        let data = format!("0x{}", hex::encode(abi::encode_balance_of(&owner)));
        let result = self
            .call_str(
                "eth_call",
                json!([{ "to": self.contract.to_hex(), "data": data }, "latest"]),
            )
            .await?;
        let word = decode_hex(&result)?;
        TokenAmount::from_be_slice(&word).map_err(|e| LedgerError::Decode(e.to_string()))
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        parse_quantity_u64(&self.call_str("eth_chainId", json!([])).await?)
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        parse_quantity_u64(
            &self
                .call_str("eth_getTransactionCount", json!([account.to_hex(), "pending"]))
                .await?,
        )
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        parse_quantity_u256(&self.call_str("eth_gasPrice", json!([])).await?)
    }

    async fn submit_signed_transaction(&self, raw: &[u8]) -> Result<TxHash, LedgerError> {
        let raw = format!("0x{}", hex::encode(raw));
        match self.call_str("eth_sendRawTransaction", json!([raw])).await {
            Ok(hash) => Ok(TxHash::new(hash)),
            Err(LedgerError::Rpc { code, message }) => {
                Err(LedgerError::Submission(format!("{message} (code {code})")))
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup_receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        let value = self
            .call("eth_getTransactionReceipt", json!([tx.as_str()]))
            .await?;
        if value.is_null() {
            return Err(LedgerError::NotFound(format!("receipt of {tx}")));
        }
        let receipt: RpcReceipt =
            serde_json::from_value(value).map_err(|e| LedgerError::Decode(e.to_string()))?;
        receipt.into_receipt(&self.contract)
    }
}

async fn await_subscription_id(ws: &mut WsStream, request_id: u64) -> Result<String, LedgerError> {
    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| LedgerError::Subscription(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(response) = serde_json::from_str::<RpcResponse>(&text) else {
            continue;
        };
        if response.id != Some(request_id) {
            continue;
        }
        return match response.into_result() {
            Ok(Value::String(id)) => Ok(id),
            Ok(other) => Err(LedgerError::Subscription(format!(
                "unexpected eth_subscribe result {other}"
            ))),
            Err(e) => Err(LedgerError::Subscription(e.to_string())),
        };
    }
    Err(LedgerError::Subscription(
        "connection closed before subscription was confirmed".into(),
    ))
}

/// Forward notifications until cancelled or the socket dies. A dead socket is
/// reported as one `Err` before the channel closes.
async fn read_subscription(
    mut ws: WsStream,
    subscription_id: String,
    unsubscribe_id: u64,
    events_tx: mpsc::Sender<Result<TransferEvent, LedgerError>>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut cancel_rx => {
                let request = RpcRequest::new(unsubscribe_id, "eth_unsubscribe", json!([subscription_id]));
                if let Ok(text) = serde_json::to_string(&request) {
                    let _ = ws.send(Message::Text(text)).await;
                }
                let _ = ws.close(None).await;
                debug!(subscription = %subscription_id, "Unsubscribed from transfers");
                return;
            }

            message = ws.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        let _ = events_tx
                            .send(Err(LedgerError::Subscription(format!("closed by node: {reason}"))))
                            .await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = events_tx.send(Err(LedgerError::Subscription(e.to_string()))).await;
                        return;
                    }
                    None => {
                        let _ = events_tx
                            .send(Err(LedgerError::Subscription("stream ended".into())))
                            .await;
                        return;
                    }
                };

                let Ok(notification) = serde_json::from_str::<RpcNotification>(&text) else {
                    continue;
                };
                if notification.method != "eth_subscription"
                    || notification.params.subscription != subscription_id
                {
                    continue;
                }
                let event = serde_json::from_value::<RpcLog>(notification.params.result)
                    .map_err(|e| LedgerError::Decode(e.to_string()))
                    .and_then(|log| log.to_transfer_event());
                match event {
                    Ok(event) => {
                        if events_tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(subscription = %subscription_id, error = %e, "Dropping undecodable notification"),
                }
            }
        }
    }
}
