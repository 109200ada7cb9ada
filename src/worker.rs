//! Worker side of the RPC: one request at a time, exactly one reply each.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use kernels::ComputeKernel;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;

use crate::broker::{Broker, BrokerError, ConsumeOptions, Delivery, Message, QueueOptions};
use crate::client::DEFAULT_TASK_QUEUE;
use crate::wire::{decode_request, encode_reply, RawImage, WorkOutcome, WorkReply};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub task_queue: String,
    /// Unacknowledged requests the broker may push to this worker.
    pub prefetch: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            prefetch: 1,
        }
    }
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub replies_sent: u64,
    pub reply_failures: u64,
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    kernel: Arc<dyn ComputeKernel>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        kernel: Arc<dyn ComputeKernel>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            kernel,
            config,
        }
    }

    /// Consumes requests until `shutdown` resolves or the broker closes the consumer.
    ///
    /// A request already being handled when `shutdown` fires is finished first.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<WorkerStats, BrokerError> {
        self.broker
            .declare_queue(&self.config.task_queue, QueueOptions::durable())
            .await?;
        let mut consumer = self
            .broker
            .consume(
                &self.config.task_queue,
                ConsumeOptions::manual(self.config.prefetch),
            )
            .await?;

        info!(
            "[{}] Waiting for messages on '{}' (prefetch {})",
            self.config.name, self.config.task_queue, self.config.prefetch
        );

        let mut stats = WorkerStats::default();
        tokio::pin!(shutdown);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("[{}] Shutting down", self.config.name);
                    break;
                }
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!("[{}] Consumer closed by broker", self.config.name);
                        break;
                    }
                },
            };

            self.handle_delivery(delivery, &mut stats).await;
        }

        Ok(stats)
    }

    async fn handle_delivery(&self, mut delivery: Delivery, stats: &mut WorkerStats) {
        let received = Instant::now();
        stats.received += 1;

        let correlation_id = delivery.properties().correlation_id.clone();
        let reply_to = delivery.properties().reply_to.clone();
        let tag = correlation_id.clone().unwrap_or_else(|| "<none>".to_string());

        if delivery.redelivered {
            debug!("[{}] Request {} is a redelivery", self.config.name, tag);
        }

        let outcome = self.execute(&delivery.message.body, &tag).await;
        match outcome {
            WorkOutcome::Processed { .. } => stats.processed += 1,
            _ => stats.failed += 1,
        }

        match reply_to {
            Some(reply_to) => match self
                .send_reply(outcome, received, &reply_to, correlation_id)
                .await
            {
                Ok(worker_total_ms) => {
                    stats.replies_sent += 1;
                    info!(
                        "[{}] Sent response for {}. Total worker time: {:.2} ms",
                        self.config.name, tag, worker_total_ms
                    );
                }
                Err(e) => {
                    stats.reply_failures += 1;
                    // Still acknowledged below: the result is lost, not redelivered
                    error!(
                        "[{}] Error publishing response for {}: {}",
                        self.config.name, tag, e
                    );
                }
            },
            None => {
                stats.reply_failures += 1;
                warn!("[{}] Request {} has no reply_to; dropping reply", self.config.name, tag);
            }
        }

        if let Err(e) = delivery.ack().await {
            error!("[{}] Failed to acknowledge {}: {}", self.config.name, tag, e);
        }
    }

    /// Decodes and runs one request. Never fails: every problem becomes an outcome.
    async fn execute(&self, body: &[u8], tag: &str) -> WorkOutcome {
        let image = match decode_request(body) {
            Ok(image) => image,
            Err(rejected) => {
                warn!(
                    "[{}] Rejecting request {}: {}",
                    self.config.name, tag, rejected.failure
                );
                return WorkOutcome::DecodeFailed {
                    failure: rejected.failure,
                    declared: rejected.declared,
                };
            }
        };

        let dims = image.dims();
        info!(
            "[{}] Received task {} for image {}x{}x{}",
            self.config.name, tag, dims.width(), dims.height(), dims.channels()
        );

        // Kernels may block their thread (GPU read-back waits on the device),
        // so each call gets a thread of its own from the blocking pool.
        let kernel = Arc::clone(&self.kernel);
        let runtime = Handle::current();
        let started = Instant::now();
        let call = tokio::task::spawn_blocking(move || {
            runtime.block_on(kernel.process(
                image.pixels(),
                dims.width(),
                dims.height(),
                dims.channels(),
            ))
        });
        let result = call.await;
        let call_ms = started.elapsed().as_secs_f64() * 1000.0;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("[{}] Kernel failed for {}: {}", self.config.name, tag, e);
                return WorkOutcome::ProcessingFailed {
                    declared: Some(dims),
                };
            }
            Err(e) => {
                // Panicked, or cancelled by runtime shutdown
                error!("[{}] Kernel task aborted for {}: {}", self.config.name, tag, e);
                return WorkOutcome::ProcessingFailed {
                    declared: Some(dims),
                };
            }
        };

        info!(
            "[{}] Kernel call took {:.2} ms. Reported kernel time: {:.2} ms",
            self.config.name, call_ms, output.elapsed_ms
        );

        match RawImage::new(dims, output.pixels) {
            Ok(image) => WorkOutcome::Processed {
                image,
                kernel_elapsed_ms: output.elapsed_ms,
            },
            Err(e) => {
                error!("[{}] Kernel returned a bad buffer for {}: {}", self.config.name, tag, e);
                WorkOutcome::ProcessingFailed {
                    declared: Some(dims),
                }
            }
        }
    }

    /// Publishes the reply and returns the worker time it reported.
    ///
    /// The worker time is taken immediately before the reply is encoded and
    /// published, so it covers everything from receipt up to the publish.
    async fn send_reply(
        &self,
        outcome: WorkOutcome,
        received: Instant,
        reply_to: &str,
        correlation_id: Option<String>,
    ) -> anyhow::Result<f64> {
        let reply = WorkReply {
            outcome,
            worker_total_ms: received.elapsed().as_secs_f64() * 1000.0,
        };
        let mut message = Message::new(encode_reply(&reply)?);
        message.properties.correlation_id = correlation_id;
        self.broker.publish(reply_to, message).await?;
        Ok(reply.worker_total_ms)
    }
}
