//! Caller side of the RPC: publish one request, wait for its reply.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{Broker, ConsumeOptions, Consumer, Message, QueueOptions};
use crate::error::CallError;
use crate::registry::CorrelationRegistry;
use crate::wire::{decode_reply, encode_request, ImageDims, RawImage, WorkOutcome, WorkReply};

pub const DEFAULT_TASK_QUEUE: &str = "task_queue_laplacian";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub task_queue: String,
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Wall-clock timings of one successful call, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallTimings {
    /// From the start of `process` until the reply was decoded.
    pub overall_ms: f64,
    /// From publish until the matching reply arrived.
    pub round_trip_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub image: RawImage,
    pub kernel_elapsed_ms: f32,
    pub worker_total_ms: f64,
    pub timings: CallTimings,
}

/// Issues calls to the worker pool with at most one call outstanding.
///
/// Each client owns a private reply queue and a receiver task that does
/// nothing but match replies against the pending call.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: ClientConfig,
    reply_queue: String,
    registry: CorrelationRegistry,
    receiver: JoinHandle<()>,
}

impl RpcClient {
    pub async fn connect(broker: Arc<dyn Broker>, config: ClientConfig) -> Result<Self, CallError> {
        broker
            .declare_queue(&config.task_queue, QueueOptions::durable())
            .await?;
        let reply_queue = broker.declare_reply_queue().await?;
        let consumer = broker
            .consume(&reply_queue, ConsumeOptions::auto())
            .await?;

        let registry = CorrelationRegistry::new();
        let receiver = tokio::spawn(receive_replies(consumer, registry.clone()));

        info!(
            "RPC client ready: tasks -> '{}', replies <- '{}'",
            config.task_queue, reply_queue
        );

        Ok(Self {
            broker,
            config,
            reply_queue,
            registry,
            receiver,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends `image` to a worker and waits up to `timeout` for the reply.
    ///
    /// A worker-reported failure is still `Ok`; inspect [`WorkReply::outcome`].
    /// After [`CallError::TimedOut`] the work may still complete; its reply
    /// is then discarded.
    pub async fn call(&self, image: &RawImage, timeout: Duration) -> Result<WorkReply, CallError> {
        self.call_timed(image, timeout).await.map(|(reply, _)| reply)
    }

    async fn call_timed(
        &self,
        image: &RawImage,
        timeout: Duration,
    ) -> Result<(WorkReply, f64), CallError> {
        let body = encode_request(image)?;
        let pending = self.registry.begin_call()?;
        let correlation_id = pending.correlation_id().to_string();
        let dims = image.dims();

        let message = Message::new(body)
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(self.reply_queue.as_str())
            .persistent();

        info!(
            "Sending request {} ({}x{}x{})",
            correlation_id, dims.width(), dims.height(), dims.channels()
        );
        let sent = Instant::now();
        self.broker.publish(&self.config.task_queue, message).await?;

        debug!("Waiting for reply to {}", correlation_id);
        let reply_body = pending.await_reply(timeout).await.map_err(|e| {
            if let CallError::TimedOut(_) = e {
                warn!("Timed out waiting for reply to {}", correlation_id);
            }
            e
        })?;
        let round_trip_ms = sent.elapsed().as_secs_f64() * 1000.0;

        debug!("Received reply for {} after {:.2} ms", correlation_id, round_trip_ms);
        Ok((decode_reply(&reply_body)?, round_trip_ms))
    }

    /// Runs one image through a worker with the configured timeout.
    ///
    /// Worker-reported failures become [`CallError::WorkerDecode`] or
    /// [`CallError::WorkerProcessing`].
    pub async fn process(&self, image: &RawImage) -> Result<ProcessedImage, CallError> {
        let started = Instant::now();
        let (reply, round_trip_ms) = self.call_timed(image, self.config.call_timeout).await?;

        match reply.outcome {
            WorkOutcome::Processed {
                image,
                kernel_elapsed_ms,
            } => Ok(ProcessedImage {
                image,
                kernel_elapsed_ms,
                worker_total_ms: reply.worker_total_ms,
                timings: CallTimings {
                    overall_ms: started.elapsed().as_secs_f64() * 1000.0,
                    round_trip_ms,
                },
            }),
            WorkOutcome::DecodeFailed { failure, .. } => {
                warn!("Worker rejected request: {}", failure);
                Err(CallError::WorkerDecode(failure))
            }
            WorkOutcome::ProcessingFailed { .. } => {
                warn!("Worker reported a processing failure");
                Err(CallError::WorkerProcessing)
            }
        }
    }

    /// Loads an image file and processes it; load failures publish nothing.
    pub async fn process_file(&self, path: impl AsRef<Path>) -> Result<ProcessedImage, CallError> {
        let image = load_image(path)?;
        self.process(&image).await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        // Stopping the receiver drops its consumer, which deletes the reply queue
        self.receiver.abort();
    }
}

async fn receive_replies(mut consumer: Consumer, registry: CorrelationRegistry) {
    while let Some(mut delivery) = consumer.recv().await {
        let correlation_id = delivery.message.properties.correlation_id.take();
        registry.on_message(correlation_id.as_deref(), delivery.message.body);
    }
    debug!("Reply consumer {} closed", consumer.tag());
}

/// Decodes an image file into tightly packed 8-bit RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<RawImage, CallError> {
    let path = path.as_ref();
    let decoded = image::open(path)
        .map_err(|e| CallError::Load(format!("{}: {}", path.display(), e)))?;
    to_raw_rgb(decoded)
}

/// Same as [`load_image`] for an in-memory encoded image.
pub fn load_image_bytes(bytes: &[u8]) -> Result<RawImage, CallError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| CallError::Load(e.to_string()))?;
    to_raw_rgb(decoded)
}

fn to_raw_rgb(decoded: image::DynamicImage) -> Result<RawImage, CallError> {
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let dims = ImageDims::new(width, height, 3).map_err(|e| CallError::Load(e.to_string()))?;
    RawImage::new(dims, rgb.into_raw()).map_err(|e| CallError::Load(e.to_string()))
}

/// A fixed set of clients shared by concurrent callers.
///
/// Each client still carries one call at a time; callers wait for a free one.
pub struct ClientPool {
    clients: Vec<Mutex<RpcClient>>,
    next: AtomicUsize,
}

impl ClientPool {
    pub async fn connect(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        size: usize,
    ) -> Result<Self, CallError> {
        let mut clients = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let client = RpcClient::connect(Arc::clone(&broker), config.clone()).await?;
            clients.push(Mutex::new(client));
        }

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub async fn process(&self, image: &RawImage) -> Result<ProcessedImage, CallError> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();

        let free = (0..self.clients.len())
            .map(|offset| &self.clients[(start + offset) % self.clients.len()])
            .find_map(|client| client.try_lock().ok());

        let client = match free {
            Some(client) => client,
            None => self.clients[start].lock().await,
        };
        client.process(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn tiny_image() -> RawImage {
        RawImage::new(ImageDims::new(1, 1, 3).unwrap(), vec![1, 2, 3]).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.task_queue, "task_queue_laplacian");
        assert_eq!(config.call_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_connect_declares_queues() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(Arc::new(broker.clone()), ClientConfig::default())
            .await
            .unwrap();

        assert!(broker.queue_exists(DEFAULT_TASK_QUEUE));
        assert_eq!(broker.consumer_count(client.reply_queue()), Some(1));
    }

    #[tokio::test]
    async fn test_call_publishes_one_persistent_request() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(Arc::new(broker.clone()), ClientConfig::default())
            .await
            .unwrap();

        let result = client
            .call(&tiny_image(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CallError::TimedOut(_))));

        let mut tasks = broker
            .consume(DEFAULT_TASK_QUEUE, ConsumeOptions::auto())
            .await
            .unwrap();
        let delivery = tasks.recv().await.unwrap();
        assert!(delivery.properties().persistent);
        assert_eq!(
            delivery.properties().reply_to.as_deref(),
            Some(client.reply_queue())
        );
        assert!(delivery.properties().correlation_id.is_some());
        assert_eq!(broker.ready_count(DEFAULT_TASK_QUEUE), Some(0));
    }

    #[tokio::test]
    async fn test_dropping_client_removes_reply_queue() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(Arc::new(broker.clone()), ClientConfig::default())
            .await
            .unwrap();
        let reply_queue = client.reply_queue().to_string();

        drop(client);
        // Abort is observed on the next scheduler turn
        for _ in 0..100 {
            if !broker.queue_exists(&reply_queue) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!broker.queue_exists(&reply_queue));
    }

    #[test]
    fn test_load_image_bytes_rejects_garbage() {
        let result = load_image_bytes(b"definitely not an image");
        assert!(matches!(result, Err(CallError::Load(_))));
    }

    #[test]
    fn test_load_image_bytes_packs_rgb() {
        let mut png = Vec::new();
        let source = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        image::DynamicImage::ImageRgba8(source)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let raw = load_image_bytes(&png).unwrap();
        assert_eq!(raw.dims(), ImageDims::new(3, 2, 3).unwrap());
        assert_eq!(&raw.pixels()[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_load_image_missing_file() {
        let result = load_image("/nonexistent/definitely-missing.png");
        assert!(matches!(result, Err(CallError::Load(_))));
    }
}
