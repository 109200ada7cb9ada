use actix_web::{middleware, web, App, HttpServer};
use anyhow::bail;
use log::info;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use kernels::{ComputeKernel, LaplacianProcessor};
use laplacian_rpc::broker::{AmqpBroker, Broker, BrokerError, MemoryBroker};
use laplacian_rpc::client::{ClientConfig, ClientPool, DEFAULT_TASK_QUEUE};
use laplacian_rpc::handlers::{detect_edges, health_check};
use laplacian_rpc::worker::{Worker, WorkerConfig, WorkerStats};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = Config::from_env()?;

    info!("Initializing Laplacian RPC service");
    info!("Configuration: {:?}", config);

    let broker = connect_broker(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = if config.mode.runs_workers() {
        let kernel = initialize_kernel().await?;
        spawn_workers(&config, &broker, &kernel, &shutdown_rx)
    } else {
        Vec::new()
    };

    if config.mode.serves_http() {
        serve_http(&config, broker).await?;
        info!("Server stopped, draining workers");
    } else {
        info!("Running {} compute worker(s), Ctrl-C to stop", workers.len());
        tokio::signal::ctrl_c().await?;
        info!("Interrupted, draining workers");
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        match worker.await? {
            Ok(stats) => info!("Worker finished: {:?}", stats),
            Err(e) => log::error!("Worker stopped with error: {}", e),
        }
    }

    Ok(())
}

async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    match (&config.amqp_url, config.mode) {
        (Some(url), _) => {
            let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::connect(url).await?);
            Ok(broker)
        }
        (None, Mode::All) => {
            info!("AMQP_URL not set, using the in-process broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        (None, mode) => bail!("MODE={} needs AMQP_URL to reach the other side", mode),
    }
}

async fn serve_http(config: &Config, broker: Arc<dyn Broker>) -> anyhow::Result<()> {
    let clients = web::Data::new(
        ClientPool::connect(broker, config.client_config(), config.clients).await?,
    );

    info!("Starting server on {}:{}", config.host, config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(clients.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .wrap(middleware::DefaultHeaders::new().add(("X-Version", env!("CARGO_PKG_VERSION"))))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health_check))
                    .route("/detect-edges", web::post().to(detect_edges)),
            )
            .route("/health", web::get().to(health_check))
            .route("/detect-edges", web::post().to(detect_edges))
    })
    .bind((config.host.as_str(), config.port))?
    .workers(config.workers)
    .run()
    .await?;

    Ok(())
}

async fn initialize_kernel() -> anyhow::Result<Arc<dyn ComputeKernel>> {
    info!("Initializing Laplacian processor...");

    let processor = LaplacianProcessor::new().await.map_err(|e| {
        log::error!("Failed to create LaplacianProcessor: {}", e);
        e
    })?;

    let kernel: Arc<dyn ComputeKernel> = Arc::new(processor);
    Ok(kernel)
}

/// Starts the compute workers. Kernel calls run on the blocking pool, so they
/// proceed side by side even on actix's single-threaded runtime.
fn spawn_workers(
    config: &Config,
    broker: &Arc<dyn Broker>,
    kernel: &Arc<dyn ComputeKernel>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<Result<WorkerStats, BrokerError>>> {
    (0..config.compute_workers)
        .map(|index| {
            let worker = Worker::new(
                Arc::clone(broker),
                Arc::clone(kernel),
                WorkerConfig {
                    name: format!("worker-{}", index),
                    task_queue: config.task_queue.clone(),
                    prefetch: 1,
                },
            );

            let mut shutdown = shutdown.clone();
            tokio::spawn(worker.run(async move {
                let _ = shutdown.changed().await;
            }))
        })
        .collect()
}

/// Which halves of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// HTTP front and compute workers together.
    All,
    /// HTTP front only; workers run elsewhere.
    Api,
    /// Compute workers only.
    Worker,
}

impl Mode {
    fn serves_http(self) -> bool {
        matches!(self, Mode::All | Mode::Api)
    }

    fn runs_workers(self) -> bool {
        matches!(self, Mode::All | Mode::Worker)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Mode::All),
            "api" => Ok(Mode::Api),
            "worker" => Ok(Mode::Worker),
            other => bail!("Unknown MODE '{}', expected all, api or worker", other),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::All => "all",
            Mode::Api => "api",
            Mode::Worker => "worker",
        };
        f.write_str(name)
    }
}

struct Config {
    mode: Mode,
    amqp_url: Option<String>,
    host: String,
    port: u16,
    /// HTTP worker threads.
    workers: usize,
    /// Compute workers consuming the task queue in this process.
    compute_workers: usize,
    clients: usize,
    task_queue: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The AMQP URL may carry credentials
        f.debug_struct("Config")
            .field("mode", &self.mode)
            .field("amqp", &self.amqp_url.is_some())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("workers", &self.workers)
            .field("compute_workers", &self.compute_workers)
            .field("clients", &self.clients)
            .field("task_queue", &self.task_queue)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let count = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&v| v > 0)
        };
        let workers = count("WORKERS").unwrap_or_else(num_cpus::get);

        Ok(Self {
            mode: match std::env::var("MODE") {
                Ok(mode) => mode.parse()?,
                Err(_) => Mode::All,
            },
            amqp_url: std::env::var("AMQP_URL").ok().filter(|url| !url.is_empty()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            workers,
            compute_workers: count("COMPUTE_WORKERS").unwrap_or(1),
            clients: count("CLIENTS").unwrap_or(workers),
            task_queue: std::env::var("TASK_QUEUE").unwrap_or_else(|_| DEFAULT_TASK_QUEUE.to_string()),
            call_timeout: std::env::var("CALL_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(60)),
        })
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            task_queue: self.task_queue.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}
