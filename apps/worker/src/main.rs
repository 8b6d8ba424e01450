//! Tollgate task producer daemon.
//!
//! Keeps one durable queue per platform filled from the system of record,
//! without flooding it and without re-publishing tasks consumers have not drained.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tollgate_application::{QueueBackpressure, RefillService};
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{TaskBuffer, queue_name};
use tollgate_infrastructure::{AmqpBroker, PostgresTaskSource};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    amqp_url: String,
    service: String,
    platforms: Vec<String>,
    task_query: String,
    block_size: usize,
    block_count: usize,
    poll_interval_ms: u64,
    idle_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    let broker = AmqpBroker::connect(config.amqp_url.as_str()).await?;
    let (shutdown_sender, shutdown_receiver) = watch::channel(false);

    let mut loops = JoinSet::new();
    for platform in &config.platforms {
        let service = build_refill_service(
            &config,
            &broker,
            pool.clone(),
            platform.as_str(),
            shutdown_receiver.clone(),
        )
        .await?;
        loops.spawn(run_refill_loop(
            service,
            Duration::from_millis(config.idle_backoff_ms),
            shutdown_receiver.clone(),
        ));
    }

    info!(
        service = %config.service,
        platforms = %config.platforms.join(","),
        block_size = config.block_size,
        block_count = config.block_count,
        poll_interval_ms = config.poll_interval_ms,
        "tollgate-worker started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(error = %error, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        }
        _ = wait_for_loops(&mut loops) => {
            warn!("every refill loop exited");
        }
    }

    let _ = shutdown_sender.send(true);
    wait_for_loops(&mut loops).await;
    broker.close().await?;
    pool.close().await;
    info!("tollgate-worker stopped");

    Ok(())
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Unavailable(format!("failed to connect to database: {error}")))
}

async fn build_refill_service(
    config: &WorkerConfig,
    broker: &AmqpBroker,
    pool: PgPool,
    platform: &str,
    shutdown: watch::Receiver<bool>,
) -> AppResult<RefillService> {
    let queue = broker
        .task_queue(queue_name(config.service.as_str(), platform)?)
        .await?;
    let source = PostgresTaskSource::new(pool, config.task_query.as_str(), platform);
    let backpressure =
        QueueBackpressure::new(Arc::new(queue), Duration::from_millis(config.poll_interval_ms))
            .with_shutdown(shutdown);

    Ok(RefillService::new(
        Arc::new(source),
        backpressure,
        TaskBuffer::new(config.block_size, config.block_count)?,
    ))
}

async fn run_refill_loop(
    service: RefillService,
    idle_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let backoff = match service.run_cycle().await {
            Ok(outcome) if outcome.published > 0 => continue,
            Ok(_) => idle_backoff,
            Err(AppError::ShuttingDown) => break,
            Err(error) => {
                warn!(
                    queue = %service.queue_name(),
                    error = %error,
                    "refill cycle failed"
                );
                error.retry_after().unwrap_or(idle_backoff)
            }
        };

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }

    info!(queue = %service.queue_name(), "refill loop stopped");
}

async fn wait_for_loops(loops: &mut JoinSet<()>) {
    while let Some(joined) = loops.join_next().await {
        if let Err(error) = joined {
            warn!(error = %error, "refill loop panicked");
        }
    }
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let amqp_url = required_env("AMQP_URL")?;
        let service = env::var("TASK_SERVICE")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "match_history".to_owned());
        let platforms = parse_platforms(required_env("TASK_PLATFORMS")?.as_str())?;
        let task_query = required_env("TASK_QUERY")?;
        let block_size = parse_env_usize("BUFFER_BLOCK_SIZE", 500)?;
        let block_count = parse_env_usize("BUFFER_BLOCK_COUNT", 16)?;
        let poll_interval_ms = parse_env_u64("QUEUE_POLL_INTERVAL_MS", 2000)?;
        let idle_backoff_ms = parse_env_u64("IDLE_BACKOFF_MS", 10_000)?;

        if block_size == 0 || block_count == 0 {
            return Err(AppError::Validation(
                "BUFFER_BLOCK_SIZE and BUFFER_BLOCK_COUNT must be greater than zero".to_owned(),
            ));
        }

        if poll_interval_ms == 0 {
            return Err(AppError::Validation(
                "QUEUE_POLL_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            amqp_url,
            service,
            platforms,
            task_query,
            block_size,
            block_count,
            poll_interval_ms,
            idle_backoff_ms,
        })
    }
}

fn parse_platforms(value: &str) -> AppResult<Vec<String>> {
    let mut platforms = Vec::new();
    for platform in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let platform = platform.to_ascii_uppercase();
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }

    if platforms.is_empty() {
        return Err(AppError::Validation(
            "TASK_PLATFORMS must list at least one platform".to_owned(),
        ));
    }

    Ok(platforms)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use tollgate_core::AppError;

    use super::parse_platforms;

    #[test]
    fn platforms_are_trimmed_uppercased_and_deduplicated() {
        let platforms = parse_platforms(" euw1,NA1,, euw1 ,kr").unwrap_or_default();

        assert_eq!(platforms, vec!["EUW1", "NA1", "KR"]);
    }

    #[test]
    fn an_empty_platform_list_is_rejected() {
        assert!(matches!(
            parse_platforms(" , "),
            Err(AppError::Validation(_))
        ));
    }
}
