//! JSON-RPC wire shapes and their conversion into domain values.

use super::{LedgerError, Receipt};
use crate::chain::{Address, TxHash, abi, address::strip_hex_prefix};
use crate::events::TransferEvent;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vpspay_sdk::objects::TokenAmount;

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// The `result` member, or the error the node returned instead.
    pub fn into_result(self) -> Result<Value, LedgerError> {
        if let Some(error) = self.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Frame pushed by the node on an open `eth_subscribe` stream.
#[derive(Debug, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    pub params: NotificationParams,
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub subscription: String,
    pub result: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// Decode an ERC-20 `Transfer(address,address,uint256)` log.
    pub fn to_transfer_event(&self) -> Result<TransferEvent, LedgerError> {
        let topic0 = self
            .topics
            .first()
            .ok_or_else(|| LedgerError::Decode("log without topics".into()))?;
        if decode_word(topic0)? != abi::transfer_event_topic() {
            return Err(LedgerError::Decode(format!(
                "log topic {topic0} is not a Transfer event"
            )));
        }
        if self.topics.len() < 3 {
            return Err(LedgerError::Decode(
                "Transfer log is missing indexed parties".into(),
            ));
        }
        let from = Address::from_word(&decode_word(&self.topics[1])?);
        let to = Address::from_word(&decode_word(&self.topics[2])?);
        let data = decode_hex(&self.data)?;
        let value =
            TokenAmount::from_be_slice(&data).map_err(|e| LedgerError::Decode(e.to_string()))?;
        let id = self
            .transaction_hash
            .as_deref()
            .map(TxHash::new)
            .ok_or_else(|| LedgerError::Decode("log without transaction hash".into()))?;
        let observed_height = match &self.block_number {
            Some(n) => parse_quantity_i64(n)?,
            None => return Err(LedgerError::Decode(format!("log of {id} has no block"))),
        };
        Ok(TransferEvent {
            id,
            from,
            to,
            value,
            observed_height,
            removed: self.removed,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: String,
    pub block_number: String,
    #[serde(default)]
    pub status: Option<String>,
    pub gas_used: String,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    /// Keep only transfers emitted by `contract`.
    pub fn into_receipt(self, contract: &Address) -> Result<Receipt, LedgerError> {
        let exit_code = match self.status.as_deref() {
            Some(status) if parse_quantity_u64(status)? == 1 => 0,
            Some(_) => 1,
            // Pre-byzantium receipts carry no status.
            None => 0,
        };
        let mut transfers = Vec::new();
        for log in &self.logs {
            let emitter: Address = log
                .address
                .parse()
                .map_err(|e: crate::chain::AddressParseError| LedgerError::Decode(e.to_string()))?;
            if emitter != *contract {
                continue;
            }
            if let Ok(transfer) = log.to_transfer_event() {
                transfers.push(transfer);
            }
        }
        Ok(Receipt {
            tx: TxHash::new(&self.transaction_hash),
            height: parse_quantity_i64(&self.block_number)?,
            exit_code,
            gas_used: parse_quantity_u64(&self.gas_used)?,
            transfers,
        })
    }
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(strip_hex_prefix(s)).map_err(|e| LedgerError::Decode(format!("{s:?}: {e}")))
}

fn decode_word(s: &str) -> Result<[u8; 32], LedgerError> {
    let bytes = decode_hex(s)?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::Decode(format!("{s:?} is not a 32-byte word")))
}

pub fn parse_quantity_u256(s: &str) -> Result<U256, LedgerError> {
    let digits = strip_hex_prefix(s);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|e| LedgerError::Decode(format!("{s:?}: {e}")))
}

pub fn parse_quantity_u64(s: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(strip_hex_prefix(s), 16)
        .map_err(|e| LedgerError::Decode(format!("{s:?}: {e}")))
}

pub fn parse_quantity_i64(s: &str) -> Result<i64, LedgerError> {
    i64::from_str_radix(strip_hex_prefix(s), 16)
        .map_err(|e| LedgerError::Decode(format!("{s:?}: {e}")))
}

pub fn quantity(n: i64) -> String {
    format!("0x{n:x}")
}

pub fn word_hex(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_log(removed: bool) -> RpcLog {
        RpcLog {
            address: "0x00000000000000000000000000000000000000cc".into(),
            topics: vec![
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".into(),
                "0x0000000000000000000000001111111111111111111111111111111111111111".into(),
                "0x00000000000000000000000000000000000000000000000000000000000000aa".into(),
            ],
            data: "0x0000000000000000000000000000000000000000000000000000000000000064".into(),
            block_number: Some("0x1b4".into()),
            transaction_hash: Some("0xABC".into()),
            removed,
        }
    }

    #[test]
    fn test_decodes_transfer_log() {
        let event = transfer_log(false).to_transfer_event().unwrap();
        assert_eq!(event.id, TxHash::new("0xabc"));
        assert_eq!(event.from, Address::new([0x11; 20]));
        assert_eq!(
            event.to,
            "0x00000000000000000000000000000000000000aa".parse().unwrap()
        );
        assert_eq!(event.value, TokenAmount::from(100u64));
        assert_eq!(event.observed_height, 436);
        assert!(!event.removed);
        assert!(transfer_log(true).to_transfer_event().unwrap().removed);
    }

    #[test]
    fn test_rejects_other_events() {
        let mut log = transfer_log(false);
        log.topics[0] =
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925".into();
        assert!(matches!(
            log.to_transfer_event(),
            Err(LedgerError::Decode(_))
        ));
    }

    #[test]
    fn test_receipt_status_and_foreign_logs() {
        let mut foreign = transfer_log(false);
        foreign.address = "0x00000000000000000000000000000000000000dd".into();
        let receipt = RpcReceipt {
            transaction_hash: "0xabc".into(),
            block_number: "0x10".into(),
            status: Some("0x1".into()),
            gas_used: "0x5208".into(),
            logs: vec![transfer_log(false), foreign],
        };
        let contract: Address = "0x00000000000000000000000000000000000000cc".parse().unwrap();
        let receipt = receipt.into_receipt(&contract).unwrap();
        assert!(receipt.succeeded());
        assert_eq!(receipt.height, 16);
        assert_eq!(receipt.gas_used, 21000);
        assert_eq!(receipt.transfers.len(), 1);
    }

    #[test]
    fn test_error_response_maps_to_rpc_error() {
        let response: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nonce too low"}}"#,
        )
        .unwrap();
        assert!(matches!(
            response.into_result(),
            Err(LedgerError::Rpc { code: -32000, .. })
        ));
    }
}
