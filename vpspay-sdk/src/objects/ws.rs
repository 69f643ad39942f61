//! WebSocket message types for the live transfer feed.
//!
//! The `GET /transfers/ws` endpoint upgrades to a WebSocket connection and
//! pushes one [`WsServerMessage`] JSON frame for every transfer the chain
//! watcher observes or retracts.

use serde::{Deserialize, Serialize};

use super::amount::TokenAmount;

/// A chain-observed transfer as seen by API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotice {
    /// Transaction hash that carried the transfer.
    pub id: String,
    pub from: String,
    pub to: String,
    pub value: TokenAmount,
    pub observed_height: i64,
    /// `true` when the block carrying this transfer was reorganized away.
    pub removed: bool,
}

/// Server-to-client WebSocket message.
///
/// ```json
/// {"type":"transfer","transfer":{ ... }}
/// {"type":"error","code":1011,"reason":"feed closed"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Transfer { transfer: TransferNotice },
    Error { code: u16, reason: String },
}

/// Well-known WebSocket close codes used by the transfer feed.
pub struct WsCloseCode;

impl WsCloseCode {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_frame_shape() {
        let msg = WsServerMessage::Transfer {
            transfer: TransferNotice {
                id: "0xabc".into(),
                from: "0x01".into(),
                to: "0x02".into(),
                value: TokenAmount::from(7u64),
                observed_height: 12,
                removed: false,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transfer");
        assert_eq!(json["transfer"]["value"], "7");
        assert_eq!(json["transfer"]["observed_height"], 12);
    }
}
