//! Long-running tasks of the engine.
//!
//! - `ChainWatcher`: subscribes to the ledger, emits `TransferEvent`
//! - `Reconciler`: consumes transfers, commands and effect outcomes, owns records
//! - `TransferResponder`: answers `TransferRequest` with `TransferResponse`
//! - `check_message`: replays a transaction receipt onto `transfer-watch`

pub mod chain_watcher;
pub mod message_check;
pub mod reconciler;
pub mod transfer_responder;

pub use chain_watcher::ChainWatcher;
pub use message_check::check_message;
pub use reconciler::{ReconcileError, Reconciler, ReconcilerDeps};
pub use transfer_responder::TransferResponder;
