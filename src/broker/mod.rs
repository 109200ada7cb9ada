//! Message transport used between callers and workers.
//!
//! The [`Broker`] trait mirrors the small slice of AMQP the RPC layer needs:
//! named queues, persistent publishes routed straight to a queue, and
//! consumers with a prefetch bound and manual or automatic acknowledgment.
//! [`AmqpBroker`] speaks it to a real broker; [`MemoryBroker`] keeps it
//! in-process for single-binary runs and tests.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No queue named '{0}' to route to")]
    Unroutable(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue '{0}' already declared with different options")]
    PreconditionFailed(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Delivery {0} was already acknowledged")]
    AlreadyAcknowledged(u64),

    #[error("Broker refused message for '{0}'")]
    Rejected(String),

    #[error("Broker connection closed")]
    Closed,

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Metadata carried next to the body, as AMQP basic properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Ask the broker to store the message durably.
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            properties: Properties::default(),
            body,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.properties.persistent = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Survives broker restarts and outlives its consumers.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private to one caller and removed with its last consumer.
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deliveries count against the prefetch bound until acknowledged.
    Manual,
    /// Deliveries are settled as soon as they are handed out.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries in flight; 0 means unbounded.
    pub prefetch: u16,
    pub ack_mode: AckMode,
}

impl ConsumeOptions {
    pub fn manual(prefetch: u16) -> Self {
        Self {
            prefetch,
            ack_mode: AckMode::Manual,
        }
    }

    pub fn auto() -> Self {
        Self {
            prefetch: 0,
            ack_mode: AckMode::Auto,
        }
    }
}

/// Settles a delivery with the broker that produced it.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub delivery_tag: u64,
    /// Set when the message was handed out before and never acknowledged.
    pub redelivered: bool,
    pub message: Message,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        message: Message,
        acker: Option<Box<dyn Acker>>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            message,
            acker,
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.message.properties
    }

    /// Acknowledges a manually acknowledged delivery.
    ///
    /// Fails for auto-ack deliveries and on a second call.
    pub async fn ack(&mut self) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Err(BrokerError::AlreadyAcknowledged(self.delivery_tag)),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.message.properties)
            .field("body_len", &self.message.body.len())
            .field("pending_ack", &self.acker.is_some())
            .finish()
    }
}

/// Stream of deliveries for one subscription.
///
/// Dropping the consumer cancels the subscription; its unacknowledged
/// deliveries go back to the queue.
pub struct Consumer {
    tag: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    // Dropped after `deliveries`, cancels the subscription on the broker side.
    _registration: Box<dyn Send + Sync>,
}

impl Consumer {
    pub fn new(
        tag: String,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        registration: Box<dyn Send + Sync>,
    ) -> Self {
        Self {
            tag,
            deliveries,
            _registration: registration,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Waits for the next delivery; `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Declares a server-named, exclusive, auto-deleting queue and returns its name.
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    /// Routes `message` to the queue called `queue`.
    ///
    /// Publishing is mandatory: a missing queue is an error rather than a silent drop.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError>;
}
