//! Application state shared across all request handlers.

use tokio::sync::watch;
use vpspay_core::events::EventBus;

/// Cheap to clone; the bus is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Engine event bus; WebSocket clients subscribe to `transfer-watch` here.
    pub bus: EventBus,
    /// Flips to `true` when the process is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(bus: EventBus, shutdown: watch::Receiver<bool>) -> Self {
        Self { bus, shutdown }
    }
}
