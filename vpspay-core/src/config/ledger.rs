//! Ledger endpoint configuration.

use crate::chain::Address;
use url::Url;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// JSON-RPC over HTTP, for calls and submissions.
    pub http_url: Url,
    /// JSON-RPC over WebSocket, for the transfer subscription.
    pub ws_url: Url,
    /// Token contract whose transfers are reconciled.
    pub contract_address: Address,
}
