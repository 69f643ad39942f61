//! In-memory view of every record the reconciler may still change, and the
//! pure transition logic applied to it.
//!
//! Nothing here performs I/O. Each `apply_*` call returns the records that
//! changed (to be persisted) and the side effects to dispatch, which keeps
//! the single-writer task small and makes replay testable.

use super::ReconcileError;
use crate::chain::{Address, TxHash};
use crate::config::ReconcilerConfig;
use crate::entities::{
    Credit, NewOrder, NewWithdraw, OrderRecord, OrderState, RechargeAddress, RechargeRecord,
    RechargeState, Record, RecordRef, WithdrawRecord, WithdrawState,
};
use crate::events::{EffectOutcome, RecordCommand, TransferEvent};
use crate::provisioning::{InstanceSpec, ProvisionFailure, ProvisionedInstance};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpspay_sdk::objects::TokenAmount;

/// Transfers kept around in case the record they belong to shows up later
/// (a payout hash reported after its transfer was already observed).
const UNMATCHED_BUFFER: usize = 1024;

/// Review flags kept in memory; older ones remain in the logs.
const REVIEW_BUFFER: usize = 1024;

/// Who consumed a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Record(RecordRef),
    /// Matched more than one record; parked for an operator.
    ManualReview,
}

/// Something an operator has to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewFlag {
    pub tx: Option<TxHash>,
    pub record: Option<RecordRef>,
    pub reason: String,
}

/// Work the reconciler must hand to another task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Provision {
        order_id: Uuid,
        spec: InstanceSpec,
        /// Created by an earlier attempt; started instead of creating another.
        instance: Option<ProvisionedInstance>,
        attempt: u64,
    },
    Payout {
        withdraw_id: Uuid,
        to: Address,
        amount: TokenAmount,
        attempt: u64,
    },
    /// Look up a receipt and replay its transfers.
    CheckMessage { tx: TxHash },
}

/// Result of one `apply_*` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub records: Vec<Record>,
    pub addresses: Vec<RechargeAddress>,
    pub effects: Vec<Effect>,
    pub reviews: Vec<ReviewFlag>,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.addresses.is_empty()
            && self.effects.is_empty()
            && self.reviews.is_empty()
    }
}

pub struct RecordBook {
    config: ReconcilerConfig,
    head_height: i64,
    orders: HashMap<Uuid, OrderRecord>,
    recharges: HashMap<Uuid, RechargeRecord>,
    withdrawals: HashMap<Uuid, WithdrawRecord>,
    recharge_addresses: HashMap<Address, String>,
    claims: HashMap<TxHash, Claim>,
    /// Submitted payout hash → withdraw record still waiting for it.
    payout_index: HashMap<TxHash, Uuid>,
    provision_attempts: HashMap<Uuid, u64>,
    payout_attempts: HashMap<Uuid, u64>,
    /// Retracted transfer → height it was retracted at.
    retractions: HashMap<TxHash, i64>,
    unmatched: VecDeque<TransferEvent>,
    reviews: VecDeque<ReviewFlag>,
}

impl RecordBook {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            head_height: 0,
            orders: HashMap::new(),
            recharges: HashMap::new(),
            withdrawals: HashMap::new(),
            recharge_addresses: HashMap::new(),
            claims: HashMap::new(),
            payout_index: HashMap::new(),
            provision_attempts: HashMap::new(),
            payout_attempts: HashMap::new(),
            retractions: HashMap::new(),
            unmatched: VecDeque::new(),
            reviews: VecDeque::new(),
        }
    }

    /// Rebuild the book from persisted records.
    pub fn restore(
        config: ReconcilerConfig,
        head_height: i64,
        records: Vec<Record>,
        addresses: Vec<RechargeAddress>,
    ) -> Self {
        let mut book = Self::new(config);
        book.head_height = head_height;
        for binding in addresses {
            book.recharge_addresses
                .insert(binding.address, binding.user_id);
        }
        for record in records {
            book.insert(record);
        }
        book
    }

    fn insert(&mut self, record: Record) {
        match record {
            Record::Order(order) => {
                if let Some(tx) = &order.tx_hash {
                    self.claims
                        .insert(tx.clone(), Claim::Record(RecordRef::Order(order.order_id)));
                }
                self.orders.insert(order.order_id, order);
            }
            Record::Recharge(recharge) => {
                if let Some(tx) = &recharge.tx_hash {
                    self.claims.insert(
                        tx.clone(),
                        Claim::Record(RecordRef::Recharge(recharge.order_id)),
                    );
                }
                self.recharges.insert(recharge.order_id, recharge);
            }
            Record::Withdraw(withdraw) => {
                if let Some(tx) = &withdraw.withdraw_hash {
                    match withdraw.state {
                        WithdrawState::Done => {
                            self.claims.insert(
                                tx.clone(),
                                Claim::Record(RecordRef::Withdraw(withdraw.order_id)),
                            );
                        }
                        WithdrawState::Create => {
                            self.payout_index.insert(tx.clone(), withdraw.order_id);
                        }
                    }
                }
                self.withdrawals.insert(withdraw.order_id, withdraw);
            }
        }
    }

    pub fn head_height(&self) -> i64 {
        self.head_height
    }

    pub fn order(&self, id: Uuid) -> Option<&OrderRecord> {
        self.orders.get(&id)
    }

    pub fn recharge(&self, id: Uuid) -> Option<&RechargeRecord> {
        self.recharges.get(&id)
    }

    pub fn withdrawal(&self, id: Uuid) -> Option<&WithdrawRecord> {
        self.withdrawals.get(&id)
    }

    pub fn claim(&self, tx: &TxHash) -> Option<Claim> {
        self.claims.get(tx).copied()
    }

    /// Most recent review flags, oldest first.
    pub fn reviews(&self) -> impl ExactSizeIterator<Item = &ReviewFlag> {
        self.reviews.iter()
    }

    /// Payout hashes submitted but not yet observed.
    pub fn pending_payouts(&self) -> Vec<TxHash> {
        let mut hashes: Vec<TxHash> = self.payout_index.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    /// Every record, ordered by key.
    pub fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .orders
            .values()
            .cloned()
            .map(Record::Order)
            .chain(self.recharges.values().cloned().map(Record::Recharge))
            .chain(self.withdrawals.values().cloned().map(Record::Withdraw))
            .collect();
        records.sort_by_key(|r| r.key().to_string());
        records
    }

    /// Raise the known head height. Heights never go down.
    pub fn observe_height(&mut self, height: i64) {
        self.head_height = self.head_height.max(height);
    }

    fn is_final(&self, done_height: Option<i64>) -> bool {
        done_height.is_some_and(|h| self.head_height >= h.saturating_add(self.config.confirmations))
    }

    fn flag(
        &mut self,
        applied: &mut Applied,
        tx: Option<TxHash>,
        record: Option<RecordRef>,
        reason: String,
    ) {
        warn!(
            tx = %tx.as_ref().map_or("-", |t| t.as_str()),
            record = %record.map(|r| r.to_string()).unwrap_or_default(),
            %reason,
            "Flagged for manual review"
        );
        let flag = ReviewFlag { tx, record, reason };
        if self.reviews.len() >= REVIEW_BUFFER {
            self.reviews.pop_front();
        }
        self.reviews.push_back(flag.clone());
        applied.reviews.push(flag);
    }

    fn next_attempt(attempts: &mut HashMap<Uuid, u64>, id: Uuid) -> u64 {
        let attempt = attempts.entry(id).or_insert(0);
        *attempt += 1;
        *attempt
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Apply one observed transfer or retraction. When the head moves, records
    /// that became final are dropped from the book afterwards.
    pub fn apply_transfer(&mut self, event: &TransferEvent, now: OffsetDateTime) -> Applied {
        let head = self.head_height;
        self.observe_height(event.observed_height);
        let applied = if event.removed {
            self.retract(event)
        } else {
            self.apply_observed(event, now)
        };
        if self.head_height > head {
            self.prune_settled();
        }
        applied
    }

    /// Drop terminal records that no retraction can reach any more, together
    /// with their claims and attempt counters. The store still answers
    /// [`RecordStore::find_claim`](crate::store::RecordStore::find_claim) for
    /// their transfers.
    pub fn prune_settled(&mut self) -> usize {
        let (head, confirmations) = (self.head_height, self.config.confirmations);
        let settled = |done_height: Option<i64>| {
            done_height.is_some_and(|h| head >= h.saturating_add(confirmations))
        };
        let before = self.orders.len() + self.recharges.len() + self.withdrawals.len();
        let mut released: Vec<TxHash> = Vec::new();

        self.orders.retain(|order_id, order| {
            if order.state != OrderState::Done || !settled(order.done_height) {
                return true;
            }
            released.extend(order.tx_hash.clone());
            self.provision_attempts.remove(order_id);
            false
        });
        self.recharges.retain(|_, recharge| {
            if recharge.state == RechargeState::Create || !settled(recharge.done_height) {
                return true;
            }
            released.extend(recharge.tx_hash.clone());
            false
        });
        self.withdrawals.retain(|order_id, withdraw| {
            if withdraw.state != WithdrawState::Done || !settled(withdraw.done_height) {
                return true;
            }
            released.extend(withdraw.withdraw_hash.clone());
            self.payout_attempts.remove(order_id);
            false
        });
        for tx in &released {
            self.claims.remove(tx);
        }
        self.retractions
            .retain(|_, retracted_at| head < retracted_at.saturating_add(confirmations));

        let pruned = before - (self.orders.len() + self.recharges.len() + self.withdrawals.len());
        if pruned > 0 {
            debug!(pruned, head, "Dropped settled records from the book");
        }
        pruned
    }

    fn apply_observed(&mut self, event: &TransferEvent, now: OffsetDateTime) -> Applied {
        if let Some(&retracted_at) = self.retractions.get(&event.id) {
            if event.observed_height < retracted_at {
                debug!(tx = %event.id, "Ignoring transfer older than its retraction");
                return Applied::default();
            }
            self.retractions.remove(&event.id);
        }

        if let Some(claim) = self.claims.get(&event.id) {
            debug!(tx = %event.id, ?claim, "Transfer already applied");
            return Applied::default();
        }

        let mut applied = Applied::default();
        if let Some(withdraw_id) = self.payout_index.get(&event.id).copied() {
            self.settle_payout(withdraw_id, event, now, &mut applied);
            return applied;
        }
        if self.match_order(event, &mut applied) {
            return applied;
        }
        if self.recharge_addresses.contains_key(&event.to) {
            self.match_recharge(event, now, &mut applied);
            return applied;
        }

        debug!(tx = %event.id, to = %event.to, "Transfer matches no record");
        self.unmatched.retain(|t| t.id != event.id);
        if self.unmatched.len() >= UNMATCHED_BUFFER {
            self.unmatched.pop_front();
        }
        self.unmatched.push_back(event.clone());
        applied
    }

    fn settle_payout(
        &mut self,
        withdraw_id: Uuid,
        event: &TransferEvent,
        now: OffsetDateTime,
        applied: &mut Applied,
    ) {
        let Some(withdraw) = self.withdrawals.get(&withdraw_id) else {
            return;
        };
        if withdraw.withdraw_addr != event.to || withdraw.value != event.value {
            let reason = format!(
                "payout {} moved {} to {}, expected {} to {}",
                event.id, event.value, event.to, withdraw.value, withdraw.withdraw_addr
            );
            let key = RecordRef::Withdraw(withdraw_id);
            self.flag(applied, Some(event.id.clone()), Some(key), reason);
        }
        let Some(withdraw) = self.withdrawals.get_mut(&withdraw_id) else {
            return;
        };
        let credit = Credit {
            tx_hash: event.id.clone(),
            from: event.from,
            value: event.value,
            height: event.observed_height,
        };
        match withdraw.complete(credit, now) {
            Ok(()) => {
                info!(withdraw_id = %withdraw_id, tx = %event.id, "Withdraw completed");
                self.payout_index.remove(&event.id);
                self.claims.insert(
                    event.id.clone(),
                    Claim::Record(RecordRef::Withdraw(withdraw_id)),
                );
                applied.records.push(Record::Withdraw(withdraw.clone()));
            }
            Err(e) => warn!(error = %e, "Cannot settle payout"),
        }
    }

    /// Returns `true` if the transfer was consumed by an order.
    fn match_order(&mut self, event: &TransferEvent, applied: &mut Applied) -> bool {
        let mut candidates: Vec<Uuid> = self
            .orders
            .values()
            .filter(|o| {
                o.state == OrderState::WaitingPayment
                    && o.to_addr == event.to
                    && o.value == event.value
                    && o.created_height <= event.observed_height
            })
            .map(|o| o.order_id)
            .collect();
        candidates.sort();

        match candidates.as_slice() {
            [] => false,
            [order_id] => {
                let order_id = *order_id;
                let Some(order) = self.orders.get_mut(&order_id) else {
                    return false;
                };
                if let Err(e) = order.mark_paid(event.id.clone(), event.from, event.observed_height) {
                    warn!(error = %e, "Cannot mark order paid");
                    return false;
                }
                info!(%order_id, tx = %event.id, "Order paid, provisioning");
                let (spec, instance) = (order.spec.clone(), order.created_instance());
                applied.records.push(Record::Order(order.clone()));
                self.claims
                    .insert(event.id.clone(), Claim::Record(RecordRef::Order(order_id)));
                let attempt = Self::next_attempt(&mut self.provision_attempts, order_id);
                applied.effects.push(Effect::Provision {
                    order_id,
                    spec,
                    instance,
                    attempt,
                });
                true
            }
            many => {
                let many = many.to_vec();
                let reason = format!(
                    "transfer {} of {} to {} matches {} waiting orders",
                    event.id,
                    event.value,
                    event.to,
                    many.len()
                );
                for order_id in &many {
                    if let Some(order) = self.orders.get_mut(order_id) {
                        order.msg = format!("ambiguous payment {}: manual review", event.id);
                        applied.records.push(Record::Order(order.clone()));
                    }
                }
                self.claims.insert(event.id.clone(), Claim::ManualReview);
                self.flag(applied, Some(event.id.clone()), None, reason);
                true
            }
        }
    }

    fn match_recharge(&mut self, event: &TransferEvent, now: OffsetDateTime, applied: &mut Applied) {
        let window = self.config.matching_window;
        let credit = Credit {
            tx_hash: event.id.clone(),
            from: event.from,
            value: event.value,
            height: event.observed_height,
        };

        let pending = self
            .recharges
            .values()
            .filter(|r| {
                r.state == RechargeState::Create
                    && r.to_addr == event.to
                    && r.created_height <= event.observed_height
                    && event.observed_height - r.created_height <= window
            })
            .min_by_key(|r| (r.created_height, r.created_time, r.order_id))
            .map(|r| r.order_id);

        let record = match pending {
            Some(order_id) => {
                let Some(recharge) = self.recharges.get_mut(&order_id) else {
                    return;
                };
                if let Err(e) = recharge.complete(credit, now) {
                    warn!(error = %e, "Cannot complete recharge");
                    return;
                }
                info!(%order_id, tx = %event.id, value = %event.value, "Recharge credited");
                recharge.clone()
            }
            None => {
                let user_id = self
                    .recharge_addresses
                    .get(&event.to)
                    .cloned()
                    .unwrap_or_default();
                // Same transfer, same id: replays land on the same record.
                let order_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, event.id.as_str().as_bytes());
                let mut recharge =
                    RechargeRecord::new(order_id, user_id, event.to, event.observed_height, now);
                if let Err(e) = recharge.refund(credit, now) {
                    warn!(error = %e, "Cannot refund recharge");
                    return;
                }
                info!(%order_id, tx = %event.id, value = %event.value, "Unexpected deposit marked for refund");
                self.recharges.insert(order_id, recharge.clone());
                recharge
            }
        };
        self.claims.insert(
            event.id.clone(),
            Claim::Record(RecordRef::Recharge(record.order_id)),
        );
        applied.records.push(Record::Recharge(record));
    }

    fn retract(&mut self, event: &TransferEvent) -> Applied {
        let mut applied = Applied::default();
        let at = self
            .retractions
            .get(&event.id)
            .map_or(event.observed_height, |h| (*h).max(event.observed_height));
        self.retractions.insert(event.id.clone(), at);
        self.unmatched.retain(|t| t.id != event.id);

        let Some(claim) = self.claims.get(&event.id).copied() else {
            debug!(tx = %event.id, "Retraction for a transfer that was never applied");
            return applied;
        };

        match claim {
            Claim::ManualReview => {
                self.claims.remove(&event.id);
                self.flag(
                    &mut applied,
                    Some(event.id.clone()),
                    None,
                    format!("ambiguous transfer {} was retracted", event.id),
                );
            }
            Claim::Record(key @ RecordRef::Order(order_id)) => {
                let Some(order) = self.orders.get(&order_id) else {
                    return applied;
                };
                if order.state == OrderState::Done || self.is_final(order.done_height) {
                    self.hold_for_review(key, event, &mut applied);
                    return applied;
                }
                let Some(order) = self.orders.get_mut(&order_id) else {
                    return applied;
                };
                match order.revert_payment() {
                    Ok(tx) => {
                        info!(%order_id, %tx, "Order payment retracted, waiting for payment again");
                        applied.records.push(Record::Order(order.clone()));
                        self.claims.remove(&event.id);
                        // Invalidate any provisioning still in flight.
                        Self::next_attempt(&mut self.provision_attempts, order_id);
                    }
                    Err(e) => warn!(error = %e, "Cannot revert order"),
                }
            }
            Claim::Record(key @ RecordRef::Recharge(order_id)) => {
                let Some(recharge) = self.recharges.get(&order_id) else {
                    return applied;
                };
                if recharge.state == RechargeState::Refund || self.is_final(recharge.done_height) {
                    self.hold_for_review(key, event, &mut applied);
                    return applied;
                }
                let Some(recharge) = self.recharges.get_mut(&order_id) else {
                    return applied;
                };
                match recharge.revert() {
                    Ok(tx) => {
                        info!(%order_id, %tx, "Recharge retracted, open again");
                        applied.records.push(Record::Recharge(recharge.clone()));
                        self.claims.remove(&event.id);
                    }
                    Err(e) => warn!(error = %e, "Cannot revert recharge"),
                }
            }
            Claim::Record(key @ RecordRef::Withdraw(order_id)) => {
                let Some(withdraw) = self.withdrawals.get(&order_id) else {
                    return applied;
                };
                if self.is_final(withdraw.done_height) {
                    self.hold_for_review(key, event, &mut applied);
                    return applied;
                }
                let Some(withdraw) = self.withdrawals.get_mut(&order_id) else {
                    return applied;
                };
                match withdraw.revert() {
                    Ok(()) => {
                        info!(%order_id, tx = %event.id, "Payout retracted, waiting for re-inclusion");
                        applied.records.push(Record::Withdraw(withdraw.clone()));
                        self.claims.remove(&event.id);
                        self.payout_index.insert(event.id.clone(), order_id);
                    }
                    Err(e) => warn!(error = %e, "Cannot revert withdraw"),
                }
            }
        }
        applied
    }

    /// A retraction reached a record that may no longer move backwards.
    fn hold_for_review(&mut self, key: RecordRef, event: &TransferEvent, applied: &mut Applied) {
        let reason = format!("transfer {} was retracted after the record was settled", event.id);
        let note = format!("manual review: {reason}");
        let record = match key {
            RecordRef::Order(id) => self.orders.get_mut(&id).map(|r| {
                r.msg = note;
                Record::Order(r.clone())
            }),
            RecordRef::Recharge(id) => self.recharges.get_mut(&id).map(|r| {
                r.msg = note;
                Record::Recharge(r.clone())
            }),
            RecordRef::Withdraw(id) => self.withdrawals.get_mut(&id).map(|r| {
                r.msg = note;
                Record::Withdraw(r.clone())
            }),
        };
        applied.records.extend(record);
        self.flag(applied, Some(event.id.clone()), Some(key), reason);
    }

    /// A retraction reached a record already settled and dropped from the
    /// book. Only an operator can undo it.
    pub fn retract_settled(&mut self, owner: RecordRef, event: &TransferEvent) -> Applied {
        let mut applied = Applied::default();
        let reason = format!("transfer {} was retracted after the record was settled", event.id);
        self.flag(&mut applied, Some(event.id.clone()), Some(owner), reason);
        applied
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub fn apply_command(
        &mut self,
        command: RecordCommand,
        now: OffsetDateTime,
    ) -> Result<Applied, ReconcileError> {
        let mut applied = Applied::default();
        match command {
            RecordCommand::CreateOrder(order) => self.create_order(order, now, &mut applied),
            RecordCommand::AwaitPayment { order_id } => {
                let order = self
                    .orders
                    .get_mut(&order_id)
                    .ok_or(ReconcileError::UnknownRecord(RecordRef::Order(order_id)))?;
                order.await_payment()?;
                info!(%order_id, to = %order.to_addr, value = %order.value, "Order waiting for payment");
                applied.records.push(Record::Order(order.clone()));
            }
            RecordCommand::PaymentReported { order_id, tx_hash } => {
                let order = self
                    .orders
                    .get(&order_id)
                    .ok_or(ReconcileError::UnknownRecord(RecordRef::Order(order_id)))?;
                if self.claims.contains_key(&tx_hash) {
                    debug!(%order_id, tx = %tx_hash, "Reported payment already applied");
                } else if order.state != OrderState::WaitingPayment {
                    debug!(%order_id, state = ?order.state, "Reported payment for an order not waiting");
                } else {
                    applied.effects.push(Effect::CheckMessage { tx: tx_hash });
                }
            }
            RecordCommand::BindRechargeAddress { address, user_id } => {
                self.bind_address(address, user_id, &mut applied)?;
            }
            RecordCommand::OpenRecharge {
                order_id,
                user_id,
                to,
            } => {
                if self.recharges.contains_key(&order_id) {
                    debug!(%order_id, "Recharge already open");
                    return Ok(applied);
                }
                self.bind_address(to, user_id.clone(), &mut applied)?;
                let recharge =
                    RechargeRecord::new(order_id, user_id, to, self.head_height, now);
                info!(%order_id, %to, "Recharge opened");
                applied.records.push(Record::Recharge(recharge.clone()));
                self.recharges.insert(order_id, recharge);
            }
            RecordCommand::RequestWithdraw(request) => {
                self.request_withdraw(request, now, &mut applied)?;
            }
            RecordCommand::RetryProvisioning { order_id } => {
                let order = self
                    .orders
                    .get(&order_id)
                    .ok_or(ReconcileError::UnknownRecord(RecordRef::Order(order_id)))?;
                if order.state != OrderState::BuyGoods {
                    return Err(ReconcileError::NotRetryable {
                        record: RecordRef::Order(order_id),
                        reason: format!("order is {:?}", order.state),
                    });
                }
                let (spec, instance) = (order.spec.clone(), order.created_instance());
                let attempt = Self::next_attempt(&mut self.provision_attempts, order_id);
                info!(
                    %order_id,
                    attempt,
                    instance_id = instance.as_ref().map_or("-", |i| i.instance_id.as_str()),
                    "Retrying provisioning"
                );
                applied.effects.push(Effect::Provision {
                    order_id,
                    spec,
                    instance,
                    attempt,
                });
            }
            RecordCommand::RetryPayout { order_id } => {
                let withdraw = self
                    .withdrawals
                    .get(&order_id)
                    .ok_or(ReconcileError::UnknownRecord(RecordRef::Withdraw(order_id)))?;
                if withdraw.state != WithdrawState::Create || withdraw.withdraw_hash.is_some() {
                    return Err(ReconcileError::NotRetryable {
                        record: RecordRef::Withdraw(order_id),
                        reason: "payout already submitted".to_string(),
                    });
                }
                let (to, amount) = (withdraw.withdraw_addr, withdraw.value);
                let attempt = Self::next_attempt(&mut self.payout_attempts, order_id);
                info!(%order_id, attempt, "Retrying payout");
                applied.effects.push(Effect::Payout {
                    withdraw_id: order_id,
                    to,
                    amount,
                    attempt,
                });
            }
        }
        Ok(applied)
    }

    fn create_order(&mut self, order: NewOrder, now: OffsetDateTime, applied: &mut Applied) {
        if self.orders.contains_key(&order.order_id) {
            debug!(order_id = %order.order_id, "Order already exists");
            return;
        }
        let record = OrderRecord::open(order, self.head_height, now);
        info!(order_id = %record.order_id, user_id = %record.user_id, "Order created");
        applied.records.push(Record::Order(record.clone()));
        self.orders.insert(record.order_id, record);
    }

    fn bind_address(
        &mut self,
        address: Address,
        user_id: String,
        applied: &mut Applied,
    ) -> Result<(), ReconcileError> {
        match self.recharge_addresses.get(&address) {
            Some(owner) if *owner == user_id => Ok(()),
            Some(_) => Err(ReconcileError::AddressInUse(address)),
            None => {
                info!(%address, %user_id, "Recharge address bound");
                self.recharge_addresses.insert(address, user_id.clone());
                applied.addresses.push(RechargeAddress { address, user_id });
                Ok(())
            }
        }
    }

    fn request_withdraw(
        &mut self,
        request: NewWithdraw,
        now: OffsetDateTime,
        applied: &mut Applied,
    ) -> Result<(), ReconcileError> {
        if self.withdrawals.contains_key(&request.order_id) {
            debug!(order_id = %request.order_id, "Withdraw already requested");
            return Ok(());
        }
        if request.value.is_zero() {
            return Err(ReconcileError::ZeroAmount);
        }
        let record = WithdrawRecord::open(request, self.head_height, now);
        let order_id = record.order_id;
        let attempt = Self::next_attempt(&mut self.payout_attempts, order_id);
        info!(%order_id, to = %record.withdraw_addr, value = %record.value, executor = %record.executor, "Withdraw requested");
        applied.effects.push(Effect::Payout {
            withdraw_id: order_id,
            to: record.withdraw_addr,
            amount: record.value,
            attempt,
        });
        applied.records.push(Record::Withdraw(record.clone()));
        self.withdrawals.insert(order_id, record);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Effect outcomes
    // -----------------------------------------------------------------------

    pub fn apply_outcome(&mut self, outcome: EffectOutcome, now: OffsetDateTime) -> Applied {
        let mut applied = Applied::default();
        match outcome {
            EffectOutcome::Provisioned {
                order_id,
                attempt,
                result,
            } => self.provisioned(order_id, attempt, result, now, &mut applied),
            EffectOutcome::PayoutSubmitted {
                order_id,
                attempt,
                result,
            } => self.payout_submitted(order_id, attempt, result, now, &mut applied),
        }
        applied
    }

    fn provisioned(
        &mut self,
        order_id: Uuid,
        attempt: u64,
        result: Result<ProvisionedInstance, ProvisionFailure>,
        now: OffsetDateTime,
        applied: &mut Applied,
    ) {
        let key = RecordRef::Order(order_id);
        let current = self.provision_attempts.get(&order_id).copied();
        let state = self.orders.get(&order_id).map(|o| o.state);
        if current != Some(attempt) || state != Some(OrderState::BuyGoods) {
            let reason = match &result {
                Ok(instance) => format!(
                    "instance {} provisioned for an order no longer awaiting it",
                    instance.instance_id
                ),
                Err(ProvisionFailure {
                    instance: Some(instance),
                    reason,
                }) => format!(
                    "stale provisioning failure left instance {}: {reason}",
                    instance.instance_id
                ),
                Err(failure) => format!("stale provisioning failure: {failure}"),
            };
            self.flag(applied, None, Some(key), reason);
            return;
        }
        let Some(order) = self.orders.get_mut(&order_id) else {
            return;
        };
        match result {
            Ok(instance) => {
                match order.complete(instance.instance_id.clone(), instance.trade_price, now) {
                    Ok(()) => {
                        info!(%order_id, instance_id = %instance.instance_id, "Order done");
                        applied.records.push(Record::Order(order.clone()));
                    }
                    Err(e) => warn!(error = %e, "Cannot complete order"),
                }
            }
            Err(failure) => {
                warn!(
                    %order_id,
                    reason = %failure.reason,
                    instance_id = failure.instance.as_ref().map_or("-", |i| i.instance_id.as_str()),
                    "Provisioning failed, order left for retry"
                );
                order.record_provision_failure(&failure.reason, failure.instance.as_ref());
                applied.records.push(Record::Order(order.clone()));
            }
        }
    }

    fn payout_submitted(
        &mut self,
        order_id: Uuid,
        attempt: u64,
        result: Result<TxHash, String>,
        now: OffsetDateTime,
        applied: &mut Applied,
    ) {
        let key = RecordRef::Withdraw(order_id);
        if self.payout_attempts.get(&order_id).copied() != Some(attempt) {
            let reason = format!("stale payout outcome {result:?}");
            self.flag(applied, None, Some(key), reason);
            return;
        }
        let Some(withdraw) = self.withdrawals.get_mut(&order_id) else {
            return;
        };
        match result {
            Ok(tx) => {
                if let Err(e) = withdraw.set_payout_hash(tx.clone()) {
                    let reason = format!("second payout {tx} submitted: {e}");
                    self.flag(applied, Some(tx), Some(key), reason);
                    return;
                }
                info!(%order_id, %tx, "Payout submitted, waiting for it on chain");
                applied.records.push(Record::Withdraw(withdraw.clone()));
                self.payout_index.insert(tx.clone(), order_id);

                let seen = self.unmatched.iter().position(|t| t.id == tx);
                if let Some(event) = seen.and_then(|i| self.unmatched.remove(i)) {
                    self.settle_payout(order_id, &event, now, applied);
                }
            }
            Err(reason) => {
                warn!(%order_id, %reason, "Payout failed, withdraw left for retry");
                withdraw.record_payout_failure(&reason);
                applied.records.push(Record::Withdraw(withdraw.clone()));
            }
        }
    }
}
