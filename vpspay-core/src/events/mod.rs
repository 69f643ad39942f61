//! Event bus and the payloads that flow over it.
//!
//! # Event Flow
//!
//! 1. `ChainWatcher` publishes [`TransferEvent`] on `transfer-watch`
//! 2. `Reconciler` consumes `transfer-watch`, `record-command` and
//!    `effect-outcome`, and is the only writer of records
//! 3. Provisioning and payout run on spawned tasks and report back on
//!    `effect-outcome`
//! 4. `TransferResponder` answers `transfer-request` with `transfer-response`
//!
//! The bus keeps nothing. On restart the reconciler rebuilds its view from the
//! record store and the ledger, never from undelivered events.

pub mod bus;
pub mod request;
pub mod types;

pub use bus::{BusEvent, EventBus, EventTopic, Subscription, Topic};
pub use request::{RequestError, TransferRequester};
pub use types::{
    EffectOutcome, RecordCommand, TransferEvent, TransferKind, TransferRequest, TransferResponse,
};
