//! # Laplacian RPC
//!
//! Offloads edge detection from callers to a pool of workers over a message
//! broker, behind a call that looks synchronous to the caller.
//!
//! ## How a call travels
//!
//! 1. [`client::RpcClient`] opens a call in its [`registry::CorrelationRegistry`],
//!    getting a fresh correlation id, and publishes a persistent request to the
//!    durable task queue with its private reply queue as `reply_to`.
//! 2. One [`worker::Worker`] (prefetch 1) receives it, runs the
//!    [`kernels::ComputeKernel`], publishes exactly one reply echoing the
//!    correlation id, and only then acknowledges the request.
//! 3. The client's receiver task matches the reply against the pending call and
//!    hands it over; replies for anything else are logged and dropped.
//!
//! ## Modules
//!
//! - [`broker`]: transport trait and the in-process [`broker::MemoryBroker`]
//! - [`wire`]: JSON message bodies and failure sentinels
//! - [`registry`]: single-slot reply correlation
//! - [`client`]: request dispatcher and client pool
//! - [`worker`]: worker dispatch loop
//! - [`handlers`]: HTTP endpoints
//! - [`error`]: call and HTTP error types
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kernels::LaplacianProcessor;
//! use laplacian_rpc::broker::MemoryBroker;
//! use laplacian_rpc::client::{ClientConfig, RpcClient};
//! use laplacian_rpc::worker::{Worker, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let kernel = Arc::new(LaplacianProcessor::new().await?);
//!
//!     let worker = Worker::new(broker.clone(), kernel, WorkerConfig::default());
//!     tokio::spawn(worker.run(std::future::pending()));
//!
//!     let client = RpcClient::connect(broker, ClientConfig::default()).await?;
//!     let processed = client.process_file("input.png").await?;
//!     println!("kernel took {:.2} ms", processed.kernel_elapsed_ms);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod wire;
pub mod worker;

pub use error::{CallError, Result, ServiceError};
