//! Reconciler processor.
//!
//! The Reconciler is responsible for:
//! - Receiving transfers (`transfer-watch`), commands (`record-command`) and
//!   effect results (`effect-outcome`)
//! - Advancing order, recharge and withdraw records through their lifecycles
//! - Persisting every changed record before dispatching its side effects
//! - Running provisioning, payouts and receipt checks on spawned tasks whose
//!   results come back over the bus
//!
//! It is the only writer of records. All transitions go through
//! [`RecordBook`], one event at a time.

pub mod book;

pub use book::{Applied, Claim, Effect, RecordBook, ReviewFlag};

use super::message_check::check_message;
use crate::chain::Address;
use crate::config::ReconcilerConfig;
use crate::entities::{OrderState, Record, RecordRef, TransitionError};
use crate::events::{EffectOutcome, EventBus, RecordCommand, Subscription, TransferEvent};
use crate::executor::OutboundExecutor;
use crate::ledger::{LedgerClient, LedgerError};
use crate::provisioning::{Provisioner, provision_order};
use crate::store::{RecordStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Transition(#[from] TransitionError),

    #[error("unknown record {0}")]
    UnknownRecord(RecordRef),

    #[error("{record} cannot be retried: {reason}")]
    NotRetryable { record: RecordRef, reason: String },

    #[error("recharge address {0} is bound to another user")]
    AddressInUse(Address),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("change not persisted, {dropped} effect(s) dropped: {source}")]
    Unpersisted { source: StoreError, dropped: usize },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Collaborators the reconciler dispatches work to.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub store: Arc<dyn RecordStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub provisioner: Arc<dyn Provisioner>,
    pub executor: Arc<dyn OutboundExecutor>,
    pub bus: EventBus,
}

pub struct Reconciler {
    book: RecordBook,
    deps: ReconcilerDeps,
    transfers: Subscription<TransferEvent>,
    commands: Subscription<RecordCommand>,
    outcomes: Subscription<EffectOutcome>,
    effects: JoinSet<()>,
    /// Highest transfer height applied and saved.
    cursor: Option<i64>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconciler {
    /// Subscribe to the bus, then rebuild state from the store and the ledger.
    ///
    /// Subscribing first means events published while loading are queued
    /// rather than lost.
    pub async fn bootstrap(
        deps: ReconcilerDeps,
        config: ReconcilerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ReconcileError> {
        let transfers = deps.bus.subscribe::<TransferEvent>();
        let commands = deps.bus.subscribe::<RecordCommand>();
        let outcomes = deps.bus.subscribe::<EffectOutcome>();

        let head = deps.ledger.block_height().await?;
        let retain_from = head.saturating_sub(config.confirmations);
        let records = deps.store.load_pending_records(retain_from).await?;
        let addresses = deps.store.recharge_addresses().await?;
        let cursor = deps.store.watch_cursor().await?;

        let stuck: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                Record::Order(o) if o.state == OrderState::BuyGoods => Some(o.order_id),
                _ => None,
            })
            .collect();
        for order_id in &stuck {
            warn!(%order_id, "Paid order is waiting for a provisioning retry");
        }

        info!(
            head,
            cursor = ?cursor,
            records = records.len(),
            recharge_addresses = addresses.len(),
            "Reconciler state restored"
        );
        let book = RecordBook::restore(config, head, records, addresses);

        Ok(Self {
            book,
            deps,
            transfers,
            commands,
            outcomes,
            effects: JoinSet::new(),
            cursor,
            shutdown_rx,
        })
    }

    pub fn book(&self) -> &RecordBook {
        &self.book
    }

    /// Height up to which transfers were applied before the last shutdown.
    pub fn watch_cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub async fn run(mut self) {
        info!("Reconciler started");

        // Payouts submitted before a restart may have been mined meanwhile.
        for tx in self.book.pending_payouts() {
            self.dispatch(Effect::CheckMessage { tx });
        }

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Reconciler received shutdown signal");
                        break;
                    }
                }

                Some(event) = self.transfers.recv() => {
                    if let Err(e) = self.handle_transfer(event).await {
                        error!(error = %e, "Failed to reconcile transfer");
                    }
                }

                Some(outcome) = self.outcomes.recv() => {
                    let applied = self.book.apply_outcome(outcome, OffsetDateTime::now_utc());
                    if let Err(e) = self.commit(applied).await {
                        error!(error = %e, "Failed to persist effect outcome");
                    }
                }

                Some(command) = self.commands.recv() => {
                    if let Err(e) = self.handle_command(command).await {
                        warn!(error = %e, "Record command rejected");
                    }
                }

                Some(joined) = self.effects.join_next(), if !self.effects.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Effect task panicked");
                    }
                }

                else => {
                    info!("Event bus closed");
                    break;
                }
            }
        }

        // In-flight effects finish on their own; their results have no reader.
        self.effects.detach_all();
        info!("Reconciler shutdown complete");
    }

    async fn handle_transfer(&mut self, event: TransferEvent) -> Result<(), ReconcileError> {
        let applied = match self.settled_claim(&event).await? {
            Some(owner) if event.removed => self.book.retract_settled(owner, &event),
            Some(owner) => {
                debug!(tx = %event.id, %owner, "Transfer already claimed in store");
                Applied::default()
            }
            None => self.book.apply_transfer(&event, OffsetDateTime::now_utc()),
        };
        self.commit(applied).await?;
        self.advance_cursor(&event).await
    }

    /// Claims of records settled and dropped from the book live only in the
    /// store.
    async fn settled_claim(
        &self,
        event: &TransferEvent,
    ) -> Result<Option<RecordRef>, ReconcileError> {
        if self.book.claim(&event.id).is_some() {
            return Ok(None);
        }
        Ok(self.deps.store.find_claim(&event.id).await?)
    }

    async fn advance_cursor(&mut self, event: &TransferEvent) -> Result<(), ReconcileError> {
        if event.removed || self.cursor.is_some_and(|h| h >= event.observed_height) {
            return Ok(());
        }
        self.deps
            .store
            .save_watch_cursor(event.observed_height)
            .await?;
        self.cursor = Some(event.observed_height);
        Ok(())
    }

    async fn handle_command(&mut self, command: RecordCommand) -> Result<(), ReconcileError> {
        let applied = self
            .book
            .apply_command(command, OffsetDateTime::now_utc())?;
        self.commit(applied).await
    }

    /// Persist, then dispatch. Effects of a change that failed to persist are
    /// dropped and logged; the record stays retryable by an operator.
    async fn commit(&mut self, applied: Applied) -> Result<(), ReconcileError> {
        if let Err(source) = self.persist(&applied).await {
            for effect in &applied.effects {
                error!(?effect, error = %source, "Effect dropped, its change was not persisted");
            }
            return Err(ReconcileError::Unpersisted {
                source,
                dropped: applied.effects.len(),
            });
        }
        for effect in applied.effects {
            self.dispatch(effect);
        }
        Ok(())
    }

    async fn persist(&self, applied: &Applied) -> Result<(), StoreError> {
        for binding in &applied.addresses {
            self.deps.store.upsert_recharge_address(binding).await?;
        }
        for record in &applied.records {
            self.deps.store.upsert_record(record).await?;
        }
        Ok(())
    }

    fn dispatch(&mut self, effect: Effect) {
        let deps = self.deps.clone();
        match effect {
            Effect::Provision {
                order_id,
                spec,
                instance,
                attempt,
            } => {
                debug!(%order_id, attempt, "Dispatching provisioning");
                self.effects.spawn(async move {
                    let result =
                        provision_order(deps.provisioner.as_ref(), order_id, &spec, instance).await;
                    deps.bus.publish(EffectOutcome::Provisioned {
                        order_id,
                        attempt,
                        result,
                    });
                });
            }
            Effect::Payout {
                withdraw_id,
                to,
                amount,
                attempt,
            } => {
                debug!(%withdraw_id, attempt, "Dispatching payout");
                self.effects.spawn(async move {
                    let result = deps
                        .executor
                        .transfer(to, amount)
                        .await
                        .map_err(|e| e.to_string());
                    deps.bus.publish(EffectOutcome::PayoutSubmitted {
                        order_id: withdraw_id,
                        attempt,
                        result,
                    });
                });
            }
            Effect::CheckMessage { tx } => {
                self.effects.spawn(async move {
                    if let Err(e) = check_message(deps.ledger.as_ref(), &deps.bus, &tx).await {
                        warn!(%tx, error = %e, "Receipt check failed");
                    }
                });
            }
        }
    }
}
