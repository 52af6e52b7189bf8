//! In-process broker with the same delivery contract as the MQTT binding: durable FIFO
//! queues, per-consumer prefetch, manual acknowledgments and redelivery of unacknowledged
//! messages when a consumer goes away.

use super::{
    validate_queue_name, BrokerError, Delivery, DeliveryTag, QueueConsumer, QueuePublisher,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    body: Bytes,
    delivered_before: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<DeliveryTag, StoredMessage>,
    notify: Arc<Notify>,
    consumers: usize,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_seq: u64,
    next_tag: DeliveryTag,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            declared: HashSet::new(),
        }
    }

    /// Declares the queue (idempotent) and attaches a consumer to it.
    pub fn consumer(&self, queue: &str, prefetch: u16) -> Result<MemoryConsumer, BrokerError> {
        validate_queue_name(queue)?;
        let mut state = self.lock();
        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.consumers += 1;
        let notify = entry.notify.clone();
        drop(state);
        Ok(MemoryConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            notify,
            in_flight: HashSet::new(),
            closed: false,
        })
    }

    pub fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        validate_queue_name(queue)?;
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Ready plus unacknowledged messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Bodies waiting for delivery, in delivery order.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Bytes> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.max_in_flight)
            .unwrap_or(0)
    }

    pub fn open_consumers(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // Every mutation below finishes before the guard drops, so a poisoned lock still holds
        // consistent queues.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UndeclaredQueue(queue.to_string()))?;
        entry.ready.push_back(StoredMessage {
            seq,
            body,
            delivered_before: false,
        });
        entry.notify.notify_one();
        Ok(())
    }

    fn try_deliver(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let tag = state.next_tag + 1;
        let entry = state.queues.get_mut(queue)?;
        let message = entry.ready.pop_front()?;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            redelivered: message.delivered_before,
        };
        entry.unacked.insert(
            tag,
            StoredMessage {
                delivered_before: true,
                ..message
            },
        );
        entry.max_in_flight = entry.max_in_flight.max(entry.unacked.len());
        if !entry.ready.is_empty() {
            entry.notify.notify_one();
        }
        state.next_tag = tag;
        Some(delivery)
    }

    fn settle(&self, queue: &str, tag: DeliveryTag) -> bool {
        let mut state = self.lock();
        state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
            .is_some()
    }

    fn release(&self, queue: &str, tags: &HashSet<DeliveryTag>) {
        let mut state = self.lock();
        let Some(entry) = state.queues.get_mut(queue) else {
            return;
        };
        entry.consumers = entry.consumers.saturating_sub(1);

        let mut returned: Vec<StoredMessage> = tags
            .iter()
            .filter_map(|tag| entry.unacked.remove(tag))
            .collect();
        if returned.is_empty() {
            return;
        }
        returned.sort_by_key(|m| m.seq);
        for message in returned.into_iter().rev() {
            entry.ready.push_front(message);
        }
        entry.notify.notify_one();
    }
}

pub struct MemoryPublisher {
    broker: MemoryBroker,
    declared: HashSet<String>,
}

impl QueuePublisher for MemoryPublisher {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.broker.declare_queue(queue)?;
        self.declared.insert(queue.to_string());
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        if !self.declared.contains(queue) {
            return Err(BrokerError::UndeclaredQueue(queue.to_string()));
        }
        self.broker.enqueue(queue, body)
    }

    async fn close(self) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    queue: String,
    prefetch: u16,
    notify: Arc<Notify>,
    in_flight: HashSet<DeliveryTag>,
    closed: bool,
}

impl MemoryConsumer {
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.broker.release(&self.queue, &self.in_flight);
        self.in_flight.clear();
    }
}

impl QueueConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        if self.in_flight.len() >= usize::from(self.prefetch) {
            return Err(BrokerError::PrefetchExhausted(self.prefetch));
        }
        loop {
            if let Some(delivery) = self.broker.try_deliver(&self.queue) {
                self.in_flight.insert(delivery.tag);
                return Ok(delivery);
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        if !self.in_flight.remove(&tag) || !self.broker.settle(&self.queue, tag) {
            return Err(BrokerError::UnknownDeliveryTag(tag));
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn close(mut self) -> Result<(), BrokerError> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
