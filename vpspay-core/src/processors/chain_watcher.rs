//! ChainWatcher processor.
//!
//! The ChainWatcher is responsible for:
//! - Holding a transfer subscription on the ledger
//! - Backfilling transfers missed while it was not subscribed
//! - Publishing every observed transfer (and every retraction) on `transfer-watch`
//! - Resubscribing with bounded, jittered backoff when the stream dies
//!
//! It never stops on its own; only the shutdown signal ends it.

use crate::config::WatcherConfig;
use crate::events::{EventBus, TransferEvent};
use crate::ledger::{LedgerClient, LedgerError, TransferFilter, TransferSubscription};
use crate::utils::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why the event loop left a subscription.
enum StreamEnd {
    Shutdown,
    Failed(LedgerError),
}

pub struct ChainWatcher {
    feed: TransferFeed,
    shutdown_rx: watch::Receiver<bool>,
}

/// Ledger side of the watcher: subscription, backfill and publishing.
struct TransferFeed {
    ledger: Arc<dyn LedgerClient>,
    bus: EventBus,
    filter: TransferFilter,
    config: WatcherConfig,
    /// Highest height seen so far; backfill restarts from here.
    last_height: Option<i64>,
}

impl ChainWatcher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        bus: EventBus,
        filter: TransferFilter,
        config: WatcherConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed: TransferFeed {
                ledger,
                bus,
                filter,
                config,
                last_height: None,
            },
            shutdown_rx,
        }
    }

    /// Start the first backfill at `height` instead of the configured start
    /// height. Heights below the configured start are never scanned.
    pub fn resume_from(mut self, height: i64) -> Self {
        self.feed.last_height = Some(height.max(self.feed.config.start_height));
        self
    }

    pub async fn run(mut self) {
        info!(contract = %self.feed.filter.contract, "ChainWatcher started");
        let mut backoff = Backoff::new(
            self.feed.config.backoff_base,
            self.feed.config.backoff_max,
        );

        loop {
            if self.is_shutting_down() {
                break;
            }

            let connected = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                result = self.feed.connect() => result,
            };

            let error = match connected {
                Ok(mut subscription) => {
                    backoff.reset();
                    info!(subscription = %subscription.id(), "Subscribed to transfers");

                    let end = self.stream(&mut subscription).await;
                    subscription.unsubscribe().await;
                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            let delay = backoff.next_delay();
            warn!(
                error = %error,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Transfer subscription lost, resubscribing"
            );
            if self.pause(delay).await {
                break;
            }
        }

        info!("ChainWatcher shutdown complete");
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn stream(&mut self, subscription: &mut TransferSubscription) -> StreamEnd {
        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || self.is_shutting_down() {
                        info!("ChainWatcher received shutdown signal");
                        return StreamEnd::Shutdown;
                    }
                }

                item = subscription.next() => match item {
                    Some(Ok(transfer)) => self.feed.publish(transfer),
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => {
                        return StreamEnd::Failed(LedgerError::Subscription(
                            "stream closed".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;

            changed = self.shutdown_rx.changed() => changed.is_err() || self.is_shutting_down(),
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

impl TransferFeed {
    /// Subscribe, then backfill up to the current head. Subscribing first
    /// leaves no gap; the overlap is deduplicated downstream.
    async fn connect(&mut self) -> Result<TransferSubscription, LedgerError> {
        let subscription = self.ledger.subscribe_transfers(&self.filter).await?;
        match self.backfill().await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                subscription.unsubscribe().await;
                Err(e)
            }
        }
    }

    async fn backfill(&mut self) -> Result<(), LedgerError> {
        let head = self.ledger.block_height().await?;
        let mut from = self.last_height.unwrap_or(self.config.start_height).max(0);
        let chunk = self.config.backfill_chunk.max(1);
        let mut published = 0usize;

        while from <= head {
            let to = (from + chunk - 1).min(head);
            let transfers = self
                .ledger
                .transfers_in_range(&self.filter, from, to)
                .await?;
            for transfer in transfers {
                self.publish(transfer);
                published += 1;
            }
            self.last_height = Some(self.last_height.unwrap_or(to).max(to));
            from = to + 1;
        }

        if published > 0 {
            info!(published, head, "Backfilled missed transfers");
        }
        Ok(())
    }

    fn publish(&mut self, transfer: TransferEvent) {
        if transfer.removed {
            info!(tx = %transfer.id, height = transfer.observed_height, "Transfer retracted by reorg");
        } else {
            debug!(
                tx = %transfer.id,
                from = %transfer.from,
                to = %transfer.to,
                value = %transfer.value,
                height = transfer.observed_height,
                "Transfer observed"
            );
            self.last_height = Some(
                self.last_height
                    .map_or(transfer.observed_height, |h| h.max(transfer.observed_height)),
            );
        }
        self.bus.publish(transfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, TxHash};
    use crate::ledger::testing::{ScriptedLedger, SubscribeStep};
    use std::sync::atomic::Ordering;
    use vpspay_sdk::objects::TokenAmount;

    fn transfer(id: &str, height: i64) -> TransferEvent {
        TransferEvent {
            id: TxHash::new(id),
            from: Address::new([0x11; 20]),
            to: Address::new([0xaa; 20]),
            value: TokenAmount::from(100u64),
            observed_height: height,
            removed: false,
        }
    }

    fn watcher(
        ledger: Arc<ScriptedLedger>,
        bus: EventBus,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ChainWatcher {
        ChainWatcher::new(
            ledger,
            bus,
            TransferFilter {
                contract: Address::new([0xcc; 20]),
                recipients: vec![],
            },
            WatcherConfig {
                start_height: 1,
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_secs(2),
                backfill_chunk: 4,
            },
            shutdown_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_retrying_until_subscribe_succeeds() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.script([
            SubscribeStep::Fail("connection refused".into()),
            SubscribeStep::Fail("connection refused".into()),
            SubscribeStep::Fail("connection refused".into()),
            SubscribeStep::Open(vec![Ok(transfer("tx1", 7))]),
        ]);
        let bus = EventBus::new();
        let mut events = bus.subscribe::<TransferEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher(ledger.clone(), bus, shutdown_rx).run());

        let event = events.recv().await.unwrap();
        assert_eq!(event.id, TxHash::new("tx1"));
        assert_eq!(ledger.subscribe_calls.load(Ordering::SeqCst), 4);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(ledger.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_releases_old_subscription() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.script([
            SubscribeStep::Open(vec![
                Ok(transfer("tx1", 3)),
                Err(LedgerError::Subscription("socket reset".into())),
            ]),
            SubscribeStep::Open(vec![Ok(transfer("tx2", 4))]),
        ]);
        let bus = EventBus::new();
        let mut events = bus.subscribe::<TransferEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher(ledger.clone(), bus, shutdown_rx).run());

        assert_eq!(events.recv().await.unwrap().id, TxHash::new("tx1"));
        assert_eq!(events.recv().await.unwrap().id, TxHash::new("tx2"));
        assert_eq!(ledger.subscribe_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.live_streams(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(ledger.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfills_in_chunks_before_streaming() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.height.store(9, Ordering::SeqCst);
        ledger
            .logs
            .lock()
            .unwrap()
            .extend([transfer("old1", 2), transfer("old2", 8)]);
        let bus = EventBus::new();
        let mut events = bus.subscribe::<TransferEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher(ledger.clone(), bus, shutdown_rx).run());

        assert_eq!(events.recv().await.unwrap().id, TxHash::new("old1"));
        assert_eq!(events.recv().await.unwrap().id, TxHash::new("old2"));
        assert_eq!(
            *ledger.range_calls.lock().unwrap(),
            vec![(1, 4), (5, 8), (9, 9)]
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_backfill_from_recovered_height() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.height.store(9, Ordering::SeqCst);
        ledger
            .logs
            .lock()
            .unwrap()
            .extend([transfer("old1", 2), transfer("old2", 8)]);
        let bus = EventBus::new();
        let mut events = bus.subscribe::<TransferEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = watcher(ledger.clone(), bus, shutdown_rx).resume_from(6);
        let handle = tokio::spawn(watcher.run());

        assert_eq!(events.recv().await.unwrap().id, TxHash::new("old2"));
        assert_eq!(*ledger.range_calls.lock().unwrap(), vec![(6, 9)]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_resume_height_never_precedes_start_height() {
        let ledger = Arc::new(ScriptedLedger::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = watcher(ledger, EventBus::new(), shutdown_rx).resume_from(-40);
        assert_eq!(watcher.feed.last_height, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retractions_are_forwarded() {
        let ledger = Arc::new(ScriptedLedger::new());
        let mut retracted = transfer("tx2", 5);
        retracted.removed = true;
        ledger.script([SubscribeStep::Open(vec![Ok(retracted)])]);
        let bus = EventBus::new();
        let mut events = bus.subscribe::<TransferEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher(ledger.clone(), bus, shutdown_rx).run());

        let event = events.recv().await.unwrap();
        assert!(event.removed);
        assert_eq!(event.id, TxHash::new("tx2"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
