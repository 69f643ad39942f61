//! In-process publish/subscribe router.
//!
//! Every topic is a [`Topic<E>`] carrying exactly one payload type, so a
//! subscriber can only ever receive the shape published on its topic.
//! Delivery is fire-and-forget: an event reaches the subscribers alive at
//! publish time and is not persisted anywhere.

use super::types::{EffectOutcome, RecordCommand, TransferEvent, TransferRequest, TransferResponse};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Names of the bus topics, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    TransferWatch,
    TransferRequest,
    TransferResponse,
    RecordCommand,
    EffectOutcome,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::TransferWatch => "transfer-watch",
            EventTopic::TransferRequest => "transfer-request",
            EventTopic::TransferResponse => "transfer-response",
            EventTopic::RecordCommand => "record-command",
            EventTopic::EffectOutcome => "effect-outcome",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TopicInner<E> {
    name: EventTopic,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<E>)>>,
}

impl<E> TopicInner<E> {
    fn remove(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
}

/// A single fan-out topic.
pub struct Topic<E> {
    inner: Arc<TopicInner<E>>,
}

impl<E: Clone> Topic<E> {
    pub fn new(name: EventTopic) -> Self {
        Self {
            inner: Arc::new(TopicInner {
                name,
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    ///
    /// The subscriber list is locked for the whole fan-out, so concurrent
    /// publishers are serialized and every subscriber sees the same order.
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        trace!(topic = %self.inner.name, delivered = subscribers.len(), "Event published");
        subscribers.len()
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription {
            id,
            topic: Arc::clone(&self.inner),
            rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receiving end of a topic. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    topic: Arc<TopicInner<E>>,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn topic(&self) -> EventTopic {
        self.topic.name
    }

    /// Next event in publish order. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.topic.remove(self.id);
    }
}

/// Payload types that have a topic on the [`EventBus`].
pub trait BusEvent: Clone + Send + 'static {
    fn topic(bus: &EventBus) -> &Topic<Self>;
}

struct Topics {
    transfer_watch: Topic<TransferEvent>,
    transfer_request: Topic<TransferRequest>,
    transfer_response: Topic<TransferResponse>,
    record_command: Topic<RecordCommand>,
    effect_outcome: Topic<EffectOutcome>,
}

/// The process-wide event bus. Cloning shares the same topics.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Topics>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Topics {
                transfer_watch: Topic::new(EventTopic::TransferWatch),
                transfer_request: Topic::new(EventTopic::TransferRequest),
                transfer_response: Topic::new(EventTopic::TransferResponse),
                record_command: Topic::new(EventTopic::RecordCommand),
                effect_outcome: Topic::new(EventTopic::EffectOutcome),
            }),
        }
    }

    pub fn publish<E: BusEvent>(&self, event: E) -> usize {
        E::topic(self).publish(event)
    }

    pub fn subscribe<E: BusEvent>(&self) -> Subscription<E> {
        E::topic(self).subscribe()
    }

    /// Release a subscription explicitly.
    pub fn unsubscribe<E>(&self, subscription: Subscription<E>) {
        drop(subscription);
    }

    pub fn subscriber_count<E: BusEvent>(&self) -> usize {
        E::topic(self).subscriber_count()
    }
}

impl BusEvent for TransferEvent {
    fn topic(bus: &EventBus) -> &Topic<Self> {
        &bus.topics.transfer_watch
    }
}

impl BusEvent for TransferRequest {
    fn topic(bus: &EventBus) -> &Topic<Self> {
        &bus.topics.transfer_request
    }
}

impl BusEvent for TransferResponse {
    fn topic(bus: &EventBus) -> &Topic<Self> {
        &bus.topics.transfer_response
    }
}

impl BusEvent for RecordCommand {
    fn topic(bus: &EventBus) -> &Topic<Self> {
        &bus.topics.record_command
    }
}

impl BusEvent for EffectOutcome {
    fn topic(bus: &EventBus) -> &Topic<Self> {
        &bus.topics.effect_outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, TxHash};
    use vpspay_sdk::objects::TokenAmount;

    fn transfer(id: &str) -> TransferEvent {
        TransferEvent {
            id: TxHash::new(id),
            from: Address::ZERO,
            to: Address::new([0xaa; 20]),
            value: TokenAmount::from(1u64),
            observed_height: 1,
            removed: false,
        }
    }

    #[test]
    fn test_fan_out_in_publish_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe::<TransferEvent>();
        let mut b = bus.subscribe::<TransferEvent>();

        assert_eq!(bus.publish(transfer("tx1")), 2);
        assert_eq!(bus.publish(transfer("tx2")), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.try_recv().unwrap().id, TxHash::new("tx1"));
            assert_eq!(sub.try_recv().unwrap().id, TxHash::new("tx2"));
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn test_only_live_subscribers_receive() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(transfer("early")), 0);

        let mut late = bus.subscribe::<TransferEvent>();
        assert!(late.try_recv().is_none());

        let gone = bus.subscribe::<TransferEvent>();
        bus.unsubscribe(gone);
        assert_eq!(bus.subscriber_count::<TransferEvent>(), 1);
        assert_eq!(bus.publish(transfer("tx1")), 1);
        assert_eq!(late.try_recv().unwrap().id, TxHash::new("tx1"));
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut responses = bus.subscribe::<TransferResponse>();
        bus.publish(transfer("tx1"));
        assert!(responses.try_recv().is_none());
        assert_eq!(responses.topic().as_str(), "transfer-response");
    }
}
