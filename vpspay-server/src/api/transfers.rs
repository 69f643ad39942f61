use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use vpspay_core::events::TransferEvent;
use vpspay_sdk::objects::{WsCloseCode, WsServerMessage};

use crate::state::AppState;

/// `GET /transfers/ws`: live transfer feed.
///
/// Every `transfer-watch` event published after the upgrade is pushed as a
/// [`WsServerMessage::Transfer`] frame. Nothing is replayed; a client that
/// reconnects only sees what happens from then on.
pub(super) async fn transfer_feed_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_transfer_ws(socket, state))
}

async fn handle_transfer_ws(mut socket: WebSocket, mut state: AppState) {
    if *state.shutdown.borrow() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    let mut transfers = state.bus.subscribe::<TransferEvent>();
    tracing::debug!(topic = %transfers.topic(), "WS: transfer feed client connected");

    loop {
        tokio::select! {
            event = transfers.recv() => {
                let Some(event) = event else {
                    let _ = send_json(
                        &mut socket,
                        &WsServerMessage::Error {
                            code: WsCloseCode::INTERNAL_ERROR,
                            reason: "feed closed".into(),
                        },
                    )
                    .await;
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: WsCloseCode::INTERNAL_ERROR,
                            reason: "feed closed".into(),
                        })))
                        .await;
                    return;
                };
                let msg = WsServerMessage::Transfer {
                    transfer: event.to_notice(),
                };
                if send_json(&mut socket, &msg).await.is_err() {
                    return;
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        tracing::debug!("WS: transfer feed client disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }

            changed = state.shutdown.changed() => {
                if changed.is_err() || *state.shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: WsCloseCode::NORMAL,
            reason: "server shutting down".into(),
        })))
        .await;
}

/// Serialize `value` as JSON and send it as a text WebSocket frame.
///
/// Returns `Err(())` if the send fails (client disconnected).
async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
