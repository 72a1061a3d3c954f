//! Jobs Executor Service
//!
//! Consumes Fibonacci jobs through the reliable consumption pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (Fibonacci)
//!   ↓ (Consumer Group: workq-subscription)
//! RedisSubscription
//!   ↓ (one task per message, bounded)
//! ConsumptionPipeline<FibonacciHandler>
//!   ├─ duplicate → ACK
//!   ├─ failure   → republish with retry-count → ACK
//!   └─ exhausted → Redis Stream (Fibonacci-dlq) → ACK
//! ```
//!
//! ## Environment
//!
//! - `REDIS_URL` (required)
//! - `SUBSCRIPTION_NAME` (default `workq-subscription`), `CONSUMER_NAME`,
//!   `MAX_IN_FLIGHT` (default 16), `BATCH_SIZE` (default 10)
//! - `HEALTH_PORT` (default 8082)
//! - `FIBONACCI_*` pipeline overrides, e.g. `FIBONACCI_MAX_RETRIES`

pub mod fibonacci;

use axum::Router;
use consumer_pipeline::{
    health_router, init_metrics, ConsumptionPipeline, DeadLetterPolicy, DedupBackend,
    HealthState, IdempotencyPolicy, PipelineConfig, RedisBroker, RedisDedupStore,
    RedisSubscription, RetryPolicy, SubscriptionConfig,
};
use core_config::{
    env_or_default, env_parse, init_tracing, install_color_eyre, ConfigError, Environment,
    FromEnv, HealthServerConfig, RedisConfig,
};
use eyre::{Result, WrapErr};
use fibonacci::{FibonacciHandler, TOPIC};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const DEDUP_GAUGE_INTERVAL: Duration = Duration::from_secs(30);

/// Subscription settings for this executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub subscription: String,
    pub consumer_name: Option<String>,
    pub max_in_flight: usize,
    pub batch_size: usize,
}

impl FromEnv for ExecutorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let consumer_name = env_or_default("CONSUMER_NAME", "");
        Ok(Self {
            subscription: env_or_default("SUBSCRIPTION_NAME", "workq-subscription"),
            consumer_name: (!consumer_name.is_empty()).then_some(consumer_name),
            max_in_flight: env_parse("MAX_IN_FLIGHT", 16)?,
            batch_size: env_parse("BATCH_SIZE", 10)?,
        })
    }
}

impl ExecutorConfig {
    pub fn subscription_config(&self) -> SubscriptionConfig {
        let config = SubscriptionConfig::new(TOPIC, &self.subscription)
            .with_max_in_flight(self.max_in_flight)
            .with_batch_size(self.batch_size);
        match &self.consumer_name {
            Some(name) => config.with_consumer_name(name),
            None => config,
        }
    }
}

/// Pipeline settings the Fibonacci consumer ships with; `FIBONACCI_*` overrides them.
pub fn fibonacci_defaults() -> PipelineConfig {
    PipelineConfig::new()
        .with_retry(RetryPolicy::new(3).with_retry_delay(Duration::from_millis(1000)))
        .with_dead_letter(DeadLetterPolicy::default().with_topic(format!("{}-dlq", TOPIC)))
        .with_idempotency(IdempotencyPolicy::enabled().with_ttl(Duration::from_secs(3600)))
}

/// Connect to Redis, retrying with exponential backoff
async fn connect_with_retry(url: &str) -> redis::RedisResult<ConnectionManager> {
    let mut attempt = 1;
    loop {
        let result = async {
            let client = redis::Client::open(url)?;
            let manager = ConnectionManager::new(client).await?;
            let mut conn = manager.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(manager)
        }
        .await;

        match result {
            Ok(manager) => return Ok(manager),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                warn!(
                    attempt = attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Start the health and admin HTTP server
async fn start_health_server(state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app: Router = health_router(state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the jobs executor
///
/// 1. Sets up tracing and metrics
/// 2. Loads configuration and connects to Redis
/// 3. Builds the Fibonacci pipeline (shared dedup store if `FIBONACCI_DEDUP_BACKEND=redis`)
/// 4. Consumes until SIGINT/SIGTERM, then drains in-flight messages
pub async fn run() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);
    init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, environment = ?environment, "Starting jobs executor");

    let executor = ExecutorConfig::from_env().wrap_err("Failed to load executor configuration")?;
    let health_config =
        HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    let pipeline_config = PipelineConfig::from_env_or("FIBONACCI", fibonacci_defaults())
        .wrap_err("Failed to load pipeline configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let redis = connect_with_retry(&redis_config.url)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let broker = Arc::new(RedisBroker::new(redis.clone(), &executor.subscription));
    let idempotency = pipeline_config.idempotency.clone();

    let mut pipeline = ConsumptionPipeline::new(broker, TOPIC, FibonacciHandler, pipeline_config);
    if idempotency.enabled && idempotency.backend == DedupBackend::Redis {
        let prefix = format!("dedup:{}:{}", executor.subscription, TOPIC);
        info!(prefix = %prefix, "Using shared Redis dedup store");
        pipeline = pipeline.with_dedup_store(Arc::new(RedisDedupStore::new(
            redis.clone(),
            prefix,
            idempotency.ttl(),
        )));
    }
    let pipeline = Arc::new(pipeline);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(app_name, app_version, TOPIC)
        .with_redis(redis.clone())
        .with_dlq_topic(pipeline.dead_letter_topic())
        .with_dedup_store(pipeline.dedup_store().cloned());
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    let gauge_pipeline = Arc::clone(&pipeline);
    let mut gauge_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEDUP_GAUGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    gauge_pipeline.dedup_size().await;
                }
                _ = async { gauge_shutdown.wait_for(|stopping| *stopping).await.is_ok() } => break,
            }
        }
    });

    let subscription_config = executor.subscription_config();
    info!(
        topic = %subscription_config.topic,
        subscription = %subscription_config.subscription,
        consumer = %subscription_config.consumer_name,
        max_in_flight = subscription_config.max_in_flight,
        dlq_topic = pipeline.dead_letter_topic().unwrap_or("disabled"),
        "Executor configuration loaded"
    );

    RedisSubscription::new(redis, subscription_config)
        .run(pipeline.clone(), shutdown_rx)
        .await
        .wrap_err("Subscription failed")?;

    info!("Jobs executor stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
