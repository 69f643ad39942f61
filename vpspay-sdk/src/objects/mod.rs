pub mod amount;
pub mod ws;

pub use amount::{AmountParseError, TokenAmount};
pub use ws::{TransferNotice, WsCloseCode, WsServerMessage};
