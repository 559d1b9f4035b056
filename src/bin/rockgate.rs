//! rockgate: gRPC proxy server for RocketMQ-style brokers
//!
//! Concentrates broker producer/consumer state behind a uniform RPC
//! surface so polyglot clients get messaging semantics without embedding
//! the native SDK.
//!
//! ## Architecture
//! ```text
//! [Client] -> [rockgate gRPC] -> [registries] -> [broker]
//!     ^                              |
//!     |                              v
//!     +----- ReceiveMessages <- [bounded buffer] <- broker callback
//! ```
//!
//! ## Configuration
//! Bare environment variables; see `ProxyConfig` for the full list:
//! - GRPC_PORT: proxy service port (default: 50051)
//! - METRICS_PORT: metrics/health HTTP port (default: 8080)
//! - MESSAGE_BUFFER_SIZE: per-consumer buffer capacity (default: 1000)
//! - ROCKGATE_LOG: tracing filter (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rockgate::broker::InMemoryBroker;
use rockgate::proto::rocket_mq_proxy_server::RocketMqProxyServer;
use rockgate::registry::ConsumerRegistrySettings;
use rockgate::sweeper::CleanupScheduler;
use rockgate::{ConsumerRegistry, ProducerRegistry, ProxyConfig, ProxyMetrics, ProxyService};

/// Send and receive message size limit.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ROCKGATE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ProxyConfig::load()?;
    info!(
        grpc_port = config.grpc_port,
        max_concurrent = config.max_concurrent,
        message_buffer = config.message_buffer_size,
        "Starting rockgate proxy server"
    );
    info!(
        producer_pool = config.producer_pool_size,
        consumer_pool = config.consumer_pool_size,
        worker_pool = config.worker_pool_size,
        batch_size = config.batch_size,
        broker_log_level = %config.rocketmq_log_level,
        "Broker tuning parameters"
    );

    let metrics = Arc::new(ProxyMetrics::new());
    let _rate_tracker = Arc::clone(&metrics).spawn_rate_tracker();

    if config.enable_metrics {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        let http_metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = rockgate::http::serve(http_metrics, addr, std::future::pending()).await
            {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let connector = Arc::new(InMemoryBroker::new());
    let producers = Arc::new(ProducerRegistry::new(
        connector.clone(),
        Arc::clone(&metrics),
    ));
    let consumers = Arc::new(ConsumerRegistry::new(
        connector,
        Arc::clone(&metrics),
        ConsumerRegistrySettings::from_config(&config),
    ));

    let scheduler = CleanupScheduler::new(Arc::clone(&producers), Arc::clone(&consumers));
    let sweeper_stop = scheduler.stop_token();
    let _cleanup_tasks = scheduler.spawn();

    let service = ProxyService::new(
        Arc::clone(&producers),
        Arc::clone(&consumers),
        Arc::clone(&metrics),
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.grpc_port).parse()?;

    // Create health reporter
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    info!(%addr, metrics_port = config.metrics_port, "rockgate gRPC server listening");

    Server::builder()
        .max_concurrent_streams(config.max_concurrent)
        .timeout(config.read_timeout)
        .add_service(health_service)
        .add_service(
            RocketMqProxyServer::new(service)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(addr, shutdown_signal(producers, consumers, sweeper_stop))
        .await?;

    info!("rockgate shut down cleanly");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, then run the shutdown cascade: every broker
/// producer first, then every broker consumer, each exactly once.
async fn shutdown_signal(
    producers: Arc<ProducerRegistry>,
    consumers: Arc<ConsumerRegistry>,
    sweeper_stop: CancellationToken,
) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down, cleaning up all broker resources");
    sweeper_stop.cancel();
    producers.shutdown_all().await;
    consumers.shutdown_all().await;
    info!("All broker resources cleaned up, stopping gRPC server");
}
