use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    AckMode, Acker, Broker, BrokerError, ConsumeOptions, Consumer, Delivery, Message,
    QueueOptions,
};

/// In-process broker with AMQP default-exchange semantics.
///
/// Each queued message goes to exactly one consumer. Consumers are served
/// round-robin, skipping any whose prefetch credit is exhausted.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
}

struct Queue {
    options: QueueOptions,
    ready: VecDeque<Queued>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    had_consumer: bool,
}

struct Queued {
    message: Message,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    options: ConsumeOptions,
    sender: mpsc::UnboundedSender<Delivery>,
    unacked: BTreeMap<u64, Queued>,
}

impl ConsumerSlot {
    fn has_credit(&self) -> bool {
        match self.options.ack_mode {
            AckMode::Auto => true,
            AckMode::Manual => {
                self.options.prefetch == 0 || self.unacked.len() < self.options.prefetch as usize
            }
        }
    }
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        }
    }

    /// Removes a consumer and puts its unacknowledged messages back at the
    /// head of the queue, oldest first, marked redelivered.
    fn detach(&mut self, index: usize) {
        let slot = self.consumers.remove(index);
        self.cursor = 0;
        for (_, mut queued) in slot.unacked.into_iter().rev() {
            queued.redelivered = true;
            self.ready.push_front(queued);
        }
    }

    fn is_abandoned(&self) -> bool {
        self.options.auto_delete && self.had_consumer && self.consumers.is_empty()
    }

    fn next_consumer_with_credit(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&index| self.consumers[index].has_credit())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands ready messages to consumers until the queue or all credit runs out.
    fn dispatch(self: &Arc<Self>, name: &str, queue: &mut Queue) {
        while !queue.ready.is_empty() {
            let Some(index) = queue.next_consumer_with_credit() else {
                break;
            };
            queue.cursor = (index + 1) % queue.consumers.len();

            let Some(queued) = queue.ready.pop_front() else {
                break;
            };
            let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let slot = &mut queue.consumers[index];

            let acker: Option<Box<dyn Acker>> = match slot.options.ack_mode {
                AckMode::Manual => Some(Box::new(MemoryAcker {
                    shared: Arc::downgrade(self),
                    queue: name.to_string(),
                    consumer: slot.id,
                })),
                AckMode::Auto => None,
            };

            let delivery = Delivery::new(tag, queued.redelivered, queued.message.clone(), acker);
            if slot.options.ack_mode == AckMode::Manual {
                slot.unacked.insert(tag, queued);
            }

            if let Err(mpsc::error::SendError(delivery)) = slot.sender.send(delivery) {
                // Receiver is gone before its registration; treat it as cancelled
                log::debug!("Consumer {} on '{}' went away mid-dispatch", slot.id, name);
                slot.unacked.remove(&tag);
                queue.ready.push_front(Queued {
                    message: delivery.message,
                    redelivered: delivery.redelivered,
                });
                queue.detach(index);
            }
        }
    }

    /// Dispatches what `name` can deliver, then deletes it if it was an
    /// auto-delete queue that lost its last consumer.
    fn settle(self: &Arc<Self>, state: &mut State, name: &str) {
        let abandoned = match state.queues.get_mut(name) {
            Some(queue) => {
                self.dispatch(name, queue);
                queue.is_abandoned()
            }
            None => return,
        };

        if abandoned {
            log::debug!("Deleting auto-delete queue '{}'", name);
            state.queues.remove(name);
        }
    }

    fn ack(self: &Arc<Self>, queue_name: &str, consumer: u64, tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;

        let slot = queue
            .consumers
            .iter_mut()
            .find(|slot| slot.id == consumer)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        slot.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        self.settle(&mut state, queue_name);
        Ok(())
    }

    fn cancel(self: &Arc<Self>, queue_name: &str, consumer: u64) {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        if let Some(index) = queue.consumers.iter().position(|slot| slot.id == consumer) {
            let unacked = queue.consumers[index].unacked.len();
            if unacked > 0 {
                log::debug!(
                    "Requeueing {} unacknowledged message(s) from consumer {} on '{}'",
                    unacked,
                    consumer,
                    queue_name
                );
            }
            queue.detach(index);
        }

        self.settle(&mut state, queue_name);
    }
}

struct MemoryAcker {
    shared: Weak<Shared>,
    queue: String,
    consumer: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let shared = self.shared.upgrade().ok_or(BrokerError::Closed)?;
        shared.ack(&self.queue, self.consumer, delivery_tag)
    }
}

struct Registration {
    shared: Weak<Shared>,
    queue: String,
    consumer: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel(&self.queue, self.consumer);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages handed to consumers of `queue` and not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.unacked.len()).sum())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(name.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                log::debug!("Declared queue '{}' ({:?})", name, options);
                state.queues.insert(name.to_string(), Queue::new(options));
                Ok(())
            }
        }
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        self.declare_queue(&name, QueueOptions::ephemeral()).await?;
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Unroutable(queue.to_string()))?;

        target.ready.push_back(Queued {
            message,
            redelivered: false,
        });
        self.shared.settle(&mut state, queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        let mut state = self.shared.lock();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerSlot {
            id,
            options,
            sender,
            unacked: BTreeMap::new(),
        });
        target.had_consumer = true;
        self.shared.settle(&mut state, queue);

        let registration = Registration {
            shared: Arc::downgrade(&self.shared),
            queue: queue.to_string(),
            consumer: id,
        };
        Ok(Consumer::new(
            format!("ctag-{}", id),
            receiver,
            Box::new(registration),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "work";

    async fn broker_with_queue() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QUEUE, QueueOptions::durable())
            .await
            .unwrap();
        broker
    }

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec()).persistent()
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_unroutable() {
        let broker = MemoryBroker::new();
        let result = broker.publish("nowhere", message("x")).await;
        assert!(matches!(result, Err(BrokerError::Unroutable(_))));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_options_fails() {
        let broker = broker_with_queue().await;
        assert!(broker.declare_queue(QUEUE, QueueOptions::durable()).await.is_ok());
        assert!(matches!(
            broker.declare_queue(QUEUE, QueueOptions::ephemeral()).await,
            Err(BrokerError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer() {
        let broker = broker_with_queue().await;
        broker.publish(QUEUE, message("a")).await.unwrap();
        broker.publish(QUEUE, message("b")).await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), Some(2));

        let mut consumer = broker.consume(QUEUE, ConsumeOptions::auto()).await.unwrap();
        assert_eq!(consumer.recv().await.unwrap().message.body, b"a");
        assert_eq!(consumer.recv().await.unwrap().message.body, b"b");
        assert_eq!(broker.ready_count(QUEUE), Some(0));
    }

    #[tokio::test]
    async fn test_prefetch_one_holds_back_until_ack() {
        let broker = broker_with_queue().await;
        let mut consumer = broker
            .consume(QUEUE, ConsumeOptions::manual(1))
            .await
            .unwrap();

        broker.publish(QUEUE, message("first")).await.unwrap();
        broker.publish(QUEUE, message("second")).await.unwrap();

        let mut first = consumer.recv().await.unwrap();
        assert_eq!(first.message.body, b"first");
        assert_eq!(broker.ready_count(QUEUE), Some(1));
        assert_eq!(broker.unacked_count(QUEUE), Some(1));

        first.ack().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_eq!(second.message.body, b"second");
        assert_eq!(broker.ready_count(QUEUE), Some(0));
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = broker_with_queue().await;
        let mut consumer = broker
            .consume(QUEUE, ConsumeOptions::manual(1))
            .await
            .unwrap();
        broker.publish(QUEUE, message("x")).await.unwrap();

        let mut delivery = consumer.recv().await.unwrap();
        delivery.ack().await.unwrap();
        assert!(matches!(
            delivery.ack().await,
            Err(BrokerError::AlreadyAcknowledged(_))
        ));
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_after_consumer_drop() {
        let broker = broker_with_queue().await;
        let mut consumer = broker
            .consume(QUEUE, ConsumeOptions::manual(1))
            .await
            .unwrap();
        broker.publish(QUEUE, message("job")).await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert!(!delivery.redelivered);
        drop(delivery);
        drop(consumer);

        assert_eq!(broker.ready_count(QUEUE), Some(1));

        let mut replacement = broker
            .consume(QUEUE, ConsumeOptions::manual(1))
            .await
            .unwrap();
        let delivery = replacement.recv().await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.message.body, b"job");
    }

    #[tokio::test]
    async fn test_closed_receiver_requeues_all_unacked_work() {
        let broker = broker_with_queue().await;
        let consumer = broker
            .consume(QUEUE, ConsumeOptions::manual(2))
            .await
            .unwrap();
        // Receiver goes away while the registration is still alive
        let Consumer {
            mut deliveries,
            _registration: registration,
            ..
        } = consumer;

        broker.publish(QUEUE, message("first")).await.unwrap();
        let held = deliveries.recv().await.unwrap();
        assert_eq!(held.message.body, b"first");
        drop(deliveries);

        broker.publish(QUEUE, message("second")).await.unwrap();
        assert_eq!(broker.consumer_count(QUEUE), Some(0));
        assert_eq!(broker.ready_count(QUEUE), Some(2));

        let mut replacement = broker.consume(QUEUE, ConsumeOptions::auto()).await.unwrap();
        let first = replacement.recv().await.unwrap();
        assert_eq!(first.message.body, b"first");
        assert!(first.redelivered);
        let second = replacement.recv().await.unwrap();
        assert_eq!(second.message.body, b"second");

        drop(registration);
        assert_eq!(broker.consumer_count(QUEUE), Some(1));
    }

    #[tokio::test]
    async fn test_closed_receiver_deletes_reply_queue() {
        let broker = MemoryBroker::new();
        let name = broker.declare_reply_queue().await.unwrap();
        let consumer = broker.consume(&name, ConsumeOptions::auto()).await.unwrap();
        let Consumer {
            deliveries,
            _registration: registration,
            ..
        } = consumer;
        drop(deliveries);

        broker.publish(&name, message("reply")).await.unwrap();
        assert!(!broker.queue_exists(&name));

        drop(registration);
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn test_each_message_goes_to_exactly_one_consumer() {
        let broker = broker_with_queue().await;
        let mut a = broker.consume(QUEUE, ConsumeOptions::auto()).await.unwrap();
        let mut b = broker.consume(QUEUE, ConsumeOptions::auto()).await.unwrap();

        for i in 0..6 {
            broker.publish(QUEUE, message(&i.to_string())).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(a.recv().await.unwrap().message.body);
            seen.push(b.recv().await.unwrap().message.body);
        }
        seen.sort();
        let expected: Vec<Vec<u8>> = (0..6).map(|i| i.to_string().into_bytes()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_reply_queue_is_removed_with_last_consumer() {
        let broker = MemoryBroker::new();
        let name = broker.declare_reply_queue().await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let consumer = broker.consume(&name, ConsumeOptions::auto()).await.unwrap();
        assert!(broker.queue_exists(&name));
        drop(consumer);

        assert!(!broker.queue_exists(&name));
        assert!(matches!(
            broker.publish(&name, message("late")).await,
            Err(BrokerError::Unroutable(_))
        ));
    }

    #[tokio::test]
    async fn test_properties_survive_delivery() {
        let broker = broker_with_queue().await;
        let mut consumer = broker.consume(QUEUE, ConsumeOptions::auto()).await.unwrap();
        broker
            .publish(
                QUEUE,
                message("x").with_correlation_id("abc").with_reply_to("replies"),
            )
            .await
            .unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.properties().correlation_id.as_deref(), Some("abc"));
        assert_eq!(delivery.properties().reply_to.as_deref(), Some("replies"));
        assert!(delivery.properties().persistent);
    }
}
