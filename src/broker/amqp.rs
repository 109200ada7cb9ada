//! [`Broker`] over AMQP 0-9-1, for callers and workers in separate processes.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    AckMode, Acker, Broker, BrokerError, ConsumeOptions, Consumer, Delivery, Message,
    Properties, QueueOptions,
};

/// AMQP `delivery_mode` for messages the broker writes to disk.
const PERSISTENT: u8 = 2;

/// Publishes on one confirm-mode channel; each consumer gets its own channel
/// so its prefetch bound applies to it alone.
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        // Confirms let publish report unroutable messages
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("Connected to AMQP broker");
        Ok(Self {
            connection: Arc::new(connection),
            channel,
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(name, declare_options(options), FieldTable::default())
            .await?;
        debug!("Declared queue '{}' ({:?})", name, options);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        // An empty name asks the server to pick one
        let queue = self
            .channel
            .queue_declare(
                "",
                declare_options(QueueOptions::ephemeral()),
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable(queue.to_string())),
            Confirmation::Nack(_) => Err(BrokerError::Rejected(queue.to_string())),
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        let channel = self.connection.create_channel().await?;
        if options.ack_mode == AckMode::Manual && options.prefetch > 0 {
            channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await?;
        }

        let tag = format!("ctag-{}", uuid::Uuid::new_v4().simple());
        let mut stream = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.ack_mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let ack_mode = options.ack_mode;
        let consumer_tag = tag.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!("Consumer {} stopped: {}", consumer_tag, e);
                        break;
                    }
                };

                let acker: Option<Box<dyn Acker>> = match ack_mode {
                    AckMode::Manual => Some(Box::new(AmqpAcker(delivery.acker))),
                    AckMode::Auto => None,
                };
                let message = Message {
                    properties: from_basic_properties(&delivery.properties),
                    body: delivery.data,
                };

                let forwarded =
                    Delivery::new(delivery.delivery_tag, delivery.redelivered, message, acker);
                if sender.send(forwarded).is_err() {
                    break;
                }
            }
        });

        let subscription = Subscription { channel, forwarder };
        Ok(Consumer::new(tag, receiver, Box::new(subscription)))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

/// Owns a consumer's channel. Closing it hands unacknowledged deliveries
/// back to the queue and lets an auto-delete queue go.
struct Subscription {
    channel: Channel,
    forwarder: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();

        let channel = self.channel.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = channel.close(200, "consumer dropped").await {
                        debug!("Closing consumer channel failed: {}", e);
                    }
                });
            }
            Err(_) => debug!("No runtime to close consumer channel; left to the connection"),
        }
    }
}

fn declare_options(options: QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

fn to_basic_properties(properties: &Properties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> Properties {
    Properties {
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: basic
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT),
    }
}
