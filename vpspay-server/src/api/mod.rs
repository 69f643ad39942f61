//! HTTP handlers.
//!
//! # Endpoints
//!
//! - `GET /transfers/ws` – WebSocket feed of observed and retracted transfers

use axum::{Router, routing::get};

use crate::state::AppState;

mod transfers;

pub fn router() -> Router<AppState> {
    Router::new().route("/transfers/ws", get(transfers::transfer_feed_ws))
}
